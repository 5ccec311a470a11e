use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use super::{DomainType, Entity};

/// Weighted descriptor attached to a resolved entity by the upstream insight call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CulturalTag {
    pub tag_id: String,
    pub name: String,
    #[serde(default)]
    pub applicable_types: BTreeSet<DomainType>,
    #[serde(default)]
    pub subtype: Option<String>,
    /// Affinity in `[0, 1]`
    pub affinity: f64,
}

/// Deduplicated tag aggregate, keyed by case-insensitive name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CulturalTheme {
    pub tag_id: String,
    pub name: String,
    pub applicable_types: BTreeSet<DomainType>,
    #[serde(default)]
    pub subtype: Option<String>,
    pub affinity: f64,
}

impl From<CulturalTag> for CulturalTheme {
    fn from(tag: CulturalTag) -> Self {
        Self {
            tag_id: tag.tag_id,
            name: tag.name,
            applicable_types: tag.applicable_types,
            subtype: tag.subtype,
            affinity: tag.affinity.clamp(0.0, 1.0),
        }
    }
}

impl CulturalTheme {
    /// Folds another tag with the same name into this theme.
    ///
    /// Keeps the highest affinity (and the tag id that carried it) and the union
    /// of applicable types.
    fn absorb(&mut self, tag: CulturalTag) {
        let affinity = tag.affinity.clamp(0.0, 1.0);
        if affinity > self.affinity {
            self.affinity = affinity;
            self.tag_id = tag.tag_id;
            if tag.subtype.is_some() {
                self.subtype = tag.subtype;
            }
        }
        self.applicable_types.extend(tag.applicable_types);
    }
}

/// Merges tags into themes: one theme per case-insensitive name, sorted by
/// affinity descending (ties broken by name for a stable order).
pub fn merge_themes<I>(tags: I) -> Vec<CulturalTheme>
where
    I: IntoIterator<Item = CulturalTag>,
{
    let mut by_name: HashMap<String, CulturalTheme> = HashMap::new();

    for tag in tags {
        let key = tag.name.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        match by_name.get_mut(&key) {
            Some(theme) => theme.absorb(tag),
            None => {
                by_name.insert(key, CulturalTheme::from(tag));
            }
        }
    }

    let mut themes: Vec<CulturalTheme> = by_name.into_values().collect();
    themes.sort_by(|a, b| {
        b.affinity
            .partial_cmp(&a.affinity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    themes
}

/// Taste profile extracted from the request's input entities
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TasteProfile {
    pub input_entities: Vec<Entity>,
    pub themes: Vec<CulturalTheme>,
}

impl TasteProfile {
    pub fn new(input_entities: Vec<Entity>, tags: Vec<CulturalTag>) -> Self {
        Self {
            input_entities,
            themes: merge_themes(tags),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.themes.is_empty()
    }

    /// Highest-affinity themes, at most `count`
    pub fn top_themes(&self, count: usize) -> &[CulturalTheme] {
        &self.themes[..self.themes.len().min(count)]
    }

    pub fn theme_by_tag_id(&self, tag_id: &str) -> Option<&CulturalTheme> {
        self.themes.iter().find(|theme| theme.tag_id == tag_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(id: &str, name: &str, affinity: f64, types: &[DomainType]) -> CulturalTag {
        CulturalTag {
            tag_id: id.to_string(),
            name: name.to_string(),
            applicable_types: types.iter().copied().collect(),
            subtype: None,
            affinity,
        }
    }

    #[test]
    fn test_merge_themes_keeps_max_affinity_and_union_of_types() {
        let themes = merge_themes(vec![
            tag("t1", "Melancholy", 0.4, &[DomainType::Movie]),
            tag("t2", "melancholy", 0.9, &[DomainType::Book]),
            tag("t3", "MELANCHOLY ", 0.6, &[DomainType::Movie, DomainType::Place]),
        ]);

        assert_eq!(themes.len(), 1);
        let theme = &themes[0];
        assert_eq!(theme.affinity, 0.9);
        assert_eq!(theme.tag_id, "t2");
        assert_eq!(
            theme.applicable_types,
            [DomainType::Movie, DomainType::Book, DomainType::Place]
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn test_merge_themes_sorted_by_affinity_descending() {
        let themes = merge_themes(vec![
            tag("a", "Atmospheric", 0.5, &[]),
            tag("b", "Experimental", 0.95, &[]),
            tag("c", "Dystopian", 0.7, &[]),
        ]);

        let names: Vec<&str> = themes.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Experimental", "Dystopian", "Atmospheric"]);
    }

    #[test]
    fn test_merge_themes_skips_blank_names_and_clamps_affinity() {
        let themes = merge_themes(vec![tag("a", "  ", 0.5, &[]), tag("b", "Noir", 1.7, &[])]);
        assert_eq!(themes.len(), 1);
        assert_eq!(themes[0].affinity, 1.0);
    }

    #[test]
    fn test_top_themes_bounded_by_length() {
        let profile = TasteProfile::new(vec![], vec![tag("a", "Noir", 0.5, &[])]);
        assert_eq!(profile.top_themes(8).len(), 1);
        assert!(TasteProfile::default().top_themes(3).is_empty());
    }
}
