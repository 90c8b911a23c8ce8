use serde::{Deserialize, Serialize};

/// Knowledge-base node categories. Stored as lowercase text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Model,
    Company,
    Framework,
    Hardware,
    Benchmark,
    Paper,
    Product,
    Concept,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Model => "model",
            EntityType::Company => "company",
            EntityType::Framework => "framework",
            EntityType::Hardware => "hardware",
            EntityType::Benchmark => "benchmark",
            EntityType::Paper => "paper",
            EntityType::Product => "product",
            EntityType::Concept => "concept",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "model" => Some(EntityType::Model),
            "company" => Some(EntityType::Company),
            "framework" => Some(EntityType::Framework),
            "hardware" => Some(EntityType::Hardware),
            "benchmark" => Some(EntityType::Benchmark),
            "paper" => Some(EntityType::Paper),
            "product" => Some(EntityType::Product),
            "concept" => Some(EntityType::Concept),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssertionType {
    Fact,
    Opinion,
    Prediction,
    Recommendation,
    Anecdote,
}

impl AssertionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssertionType::Fact => "fact",
            AssertionType::Opinion => "opinion",
            AssertionType::Prediction => "prediction",
            AssertionType::Recommendation => "recommendation",
            AssertionType::Anecdote => "anecdote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fact" => Some(AssertionType::Fact),
            "opinion" => Some(AssertionType::Opinion),
            "prediction" => Some(AssertionType::Prediction),
            "recommendation" => Some(AssertionType::Recommendation),
            "anecdote" => Some(AssertionType::Anecdote),
            _ => None,
        }
    }
}

/// The only mutable field of a stored assertion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Unverified,
    Verified,
    Disputed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Unverified => "unverified",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Disputed => "disputed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "unverified" => Some(VerificationStatus::Unverified),
            "verified" => Some(VerificationStatus::Verified),
            "disputed" => Some(VerificationStatus::Disputed),
            _ => None,
        }
    }
}

/// One ingested transcript document. Created once per `source_id`; metadata
/// may be backfilled later but segments are never rewritten through it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Episode {
    pub id: i64,
    pub source_id: String,
    pub title: String,
    pub show: Option<String>,
    pub participants: Vec<String>,
    pub published_at: Option<String>,
    pub url: Option<String>,
    pub raw_text: Option<String>,
    pub created_at: String,
}

/// Ordered unit of speech. `fingerprint` is unique across the library, so
/// re-parsing identical text resolves to the existing row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub id: i64,
    pub episode_id: i64,
    pub idx: i64,
    pub speaker: Option<String>,
    pub start_secs: Option<i64>,
    pub end_secs: Option<i64>,
    pub link: Option<String>,
    pub text: String,
    pub fingerprint: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    pub id: i64,
    pub episode_id: i64,
    pub name: String,
    pub summary: Option<String>,
    pub start_segment_id: i64,
    pub end_segment_id: i64,
    pub created_at: String,
}

/// Cross-episode knowledge-base node. `canonical_name` is the
/// case-normalized form and is globally unique; `display_name` preserves the
/// casing first seen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: i64,
    pub entity_type: EntityType,
    pub canonical_name: String,
    pub display_name: String,
    pub aliases: Vec<String>,
    pub first_seen_episode_id: Option<i64>,
    pub last_seen_episode_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assertion {
    pub id: i64,
    pub entity_id: i64,
    pub episode_id: i64,
    pub assertion_type: AssertionType,
    pub statement: String,
    pub speaker: Option<String>,
    pub confidence: f64,
    pub verification_priority: f64,
    pub verification_status: VerificationStatus,
    pub segment_ids: Vec<i64>,
    pub evidence_quote: Option<String>,
    pub fingerprint: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TechCard {
    pub id: i64,
    pub entity_id: i64,
    pub definition: Option<String>,
    pub key_points: Vec<String>,
    pub comparisons: Vec<String>,
    pub recent_summary: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: i64,
    pub episode_id: i64,
    pub topic_id: Option<i64>,
    pub start_segment_id: i64,
    pub end_segment_id: i64,
    pub text: String,
    pub token_est: i64,
    pub fingerprint: String,
    pub created_at: String,
}

/// Non-fatal diagnostic attached to batch summaries instead of being printed
/// or raised. Codes follow the same family naming as `AppError`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestWarning {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
}

impl IngestWarning {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Parsed transcript unit before storage; ids and fingerprints are assigned
/// by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentDraft {
    pub speaker: Option<String>,
    pub start_secs: Option<i64>,
    pub end_secs: Option<i64>,
    pub link: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicDraft {
    pub name: String,
    pub summary: Option<String>,
    pub start_segment_id: i64,
    pub end_segment_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityDraft {
    pub name: String,
    pub entity_type: EntityType,
    pub aliases: Vec<String>,
}

/// Candidate claim from the extraction capability. References the entity by
/// name (resolution happens at upsert time) and segments by stored id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssertionDraft {
    pub entity_name: String,
    pub assertion_type: AssertionType,
    pub statement: String,
    pub speaker: Option<String>,
    pub confidence: f64,
    pub verification_priority: f64,
    pub segment_ids: Vec<i64>,
    pub evidence_quote: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CardDraft {
    pub entity_name: String,
    pub definition: Option<String>,
    pub key_points: Vec<String>,
    pub comparisons: Vec<String>,
    pub recent_summary: Option<String>,
}

/// One extraction pass worth of candidates for a single episode.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractionBatch {
    pub topics: Vec<TopicDraft>,
    pub entities: Vec<EntityDraft>,
    pub assertions: Vec<AssertionDraft>,
    pub cards: Vec<CardDraft>,
}
