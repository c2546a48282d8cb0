use crate::config::BUNDLE_TYPE;
use crate::error::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Entity types the source platform uses for relationships themselves.
const RELATIONSHIP_TYPES: &[&str] = &[
    "stix_relation",
    "stix_relation_embedded",
    "relation_embedded",
    "stix_sighting",
    "relationship",
    "sighting",
];

pub fn is_relationship_type(entity_type: &str) -> bool {
    RELATIONSHIP_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(entity_type))
}

/// Endpoint of a relationship as listed by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
    pub entity_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntity {
    pub id: String,
    pub entity_type: String,
    /// Pagination ordering key
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub observable_value: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub from: Option<EntityRef>,
    #[serde(default)]
    pub to: Option<EntityRef>,
}

impl SourceEntity {
    /// True when either endpoint is itself a relationship.
    pub fn targets_relationship(&self) -> bool {
        [&self.from, &self.to]
            .into_iter()
            .flatten()
            .any(|end| is_relationship_type(&end.entity_type))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
    pub global_count: u64,
}

/// One page of a stage's entity listing, ordered by ascending `created_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub entities: Vec<SourceEntity>,
    pub pagination: PageInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "type")]
    pub kind: String,
    pub objects: Vec<Value>,
}

impl Bundle {
    pub fn new(objects: Vec<Value>) -> Self {
        Self {
            kind: BUNDLE_TYPE.to_string(),
            objects,
        }
    }
}

/// Envelope the ingestion workers expect on the push queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishMessage {
    pub job_id: Option<String>,
    pub applicant_id: Option<String>,
    /// Base64 of the serialized bundle
    pub content: String,
}

impl PublishMessage {
    pub fn from_bundle(bundle: &Bundle) -> Result<Self> {
        let json = serde_json::to_vec(bundle)?;
        Ok(Self {
            job_id: None,
            applicant_id: None,
            content: STANDARD.encode(json),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
