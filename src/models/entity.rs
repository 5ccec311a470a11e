use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt::Display, str::FromStr};

const URN_PREFIX: &str = "urn:entity:";

/// Kind of cultural entity understood by the upstream graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DomainType {
    Artist,
    Album,
    Movie,
    TvShow,
    Book,
    Podcast,
    VideoGame,
    Place,
    Destination,
    Brand,
    Person,
}

impl DomainType {
    pub const ALL: [DomainType; 11] = [
        DomainType::Artist,
        DomainType::Album,
        DomainType::Movie,
        DomainType::TvShow,
        DomainType::Book,
        DomainType::Podcast,
        DomainType::VideoGame,
        DomainType::Place,
        DomainType::Destination,
        DomainType::Brand,
        DomainType::Person,
    ];

    /// Canonical wire name (e.g. `tv_show`)
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainType::Artist => "artist",
            DomainType::Album => "album",
            DomainType::Movie => "movie",
            DomainType::TvShow => "tv_show",
            DomainType::Book => "book",
            DomainType::Podcast => "podcast",
            DomainType::VideoGame => "video_game",
            DomainType::Place => "place",
            DomainType::Destination => "destination",
            DomainType::Brand => "brand",
            DomainType::Person => "person",
        }
    }

    /// Human readable label used in templated text
    pub fn label(&self) -> &'static str {
        match self {
            DomainType::Artist => "artist",
            DomainType::Album => "album",
            DomainType::Movie => "movie",
            DomainType::TvShow => "TV show",
            DomainType::Book => "book",
            DomainType::Podcast => "podcast",
            DomainType::VideoGame => "video game",
            DomainType::Place => "place",
            DomainType::Destination => "destination",
            DomainType::Brand => "brand",
            DomainType::Person => "person",
        }
    }

    /// Upstream type URN (e.g. `urn:entity:tv_show`)
    pub fn urn(&self) -> String {
        format!("{}{}", URN_PREFIX, self.as_str())
    }
}

impl Display for DomainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DomainType {
    type Err = String;

    /// Accepts canonical names, common aliases and upstream URNs
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        let name = normalized
            .strip_prefix(URN_PREFIX)
            .unwrap_or(&normalized)
            .replace(['-', ' '], "_");

        match name.as_str() {
            "artist" | "music" | "musician" | "band" => Ok(DomainType::Artist),
            "album" => Ok(DomainType::Album),
            "movie" | "film" | "movies" => Ok(DomainType::Movie),
            "tv_show" | "tv" | "show" | "tvshow" | "series" | "tv_series" => Ok(DomainType::TvShow),
            "book" | "books" => Ok(DomainType::Book),
            "podcast" => Ok(DomainType::Podcast),
            "video_game" | "videogame" | "game" => Ok(DomainType::VideoGame),
            "place" | "restaurant" | "restaurants" | "venue" => Ok(DomainType::Place),
            "destination" | "travel" => Ok(DomainType::Destination),
            "brand" => Ok(DomainType::Brand),
            "person" | "people" => Ok(DomainType::Person),
            _ => Err(format!("Unknown domain type: {}", s)),
        }
    }
}

impl TryFrom<String> for DomainType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DomainType> for String {
    fn from(domain: DomainType) -> Self {
        domain.as_str().to_string()
    }
}

/// A named cultural entity, resolved against the upstream graph once `id` is set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub domain_type: DomainType,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Entity {
    pub fn new(name: impl Into<String>, domain_type: DomainType) -> Self {
        Self {
            id: None,
            name: name.into(),
            domain_type,
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.id.as_deref().is_some_and(|id| !id.trim().is_empty())
    }
}
