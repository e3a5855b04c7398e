#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(value).map(Self)
            }
        }
    };
}

ulid_id!(AgentId);
ulid_id!(NodeId);
ulid_id!(ModelId);
ulid_id!(ExecutionId);
ulid_id!(ConnectionId);
ulid_id!(RecordId);

/// Verified tenant scope supplied by the caller. Token validation is an
/// external collaborator; by the time a request reaches the engine this
/// data is trusted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TenantContext {
    pub tenant_id: String,
    pub environment: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Model,
    Tool,
}

impl NodeKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Tool => "tool",
        }
    }

    /// # Errors
    /// Returns an error for an unknown kind string.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "model" => Ok(Self::Model),
            "tool" => Ok(Self::Tool),
            _ => Err(anyhow!("unknown node kind: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Processing,
    Success,
    Failed,
    FailedModel,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::FailedModel => "failed_model",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing)
    }

    /// # Errors
    /// Returns an error for an unknown status string.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "failed_model" => Ok(Self::FailedModel),
            _ => Err(anyhow!("unknown execution status: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Failed,
    Error,
    Crash,
}

impl RecordStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Crash => "crash",
        }
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Error | Self::Crash)
    }

    /// # Errors
    /// Returns an error for an unknown status string.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "error" => Ok(Self::Error),
            "crash" => Ok(Self::Crash),
            _ => Err(anyhow!("unknown record status: {value}")),
        }
    }
}

/// Grid cell for visual layout. Cosmetic only; no correctness property
/// depends on positions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Agent {
    pub agent_id: AgentId,
    pub tenant_id: String,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ModelRecord {
    pub model_id: ModelId,
    pub provider: String,
    pub problem_type: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AgentNode {
    pub node_id: NodeId,
    pub agent_id: AgentId,
    pub name: String,
    pub slug: String,
    pub kind: NodeKind,
    pub position: Position,
    #[serde(default)]
    pub config: Value,
    pub model_id: Option<ModelId>,
    pub tool_type: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AgentConnection {
    pub connection_id: ConnectionId,
    pub agent_id: AgentId,
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    pub input_name: String,
    pub output_name: String,
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ErrorDetails {
    pub message: String,
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Execution {
    pub execution_id: ExecutionId,
    pub agent_id: AgentId,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub input: Value,
    pub output: Option<Value>,
    pub duration_ms: Option<i64>,
    pub error_details: Option<ErrorDetails>,
    pub external_correlation_id: Option<String>,
    pub started_at: Option<DateTimeUtc>,
    pub ended_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
}

/// What a node-execution record is about. The two streams of the original
/// store (model-keyed and node-keyed logs) become one tagged union so every
/// consumer matches exhaustively instead of probing optional fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", tag = "subject_type")]
pub enum RecordSubject {
    Node { node_id: NodeId },
    Model { model_id: ModelId },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NodeExecutionRecord {
    pub record_id: RecordId,
    pub execution_id: ExecutionId,
    #[serde(flatten)]
    pub subject: RecordSubject,
    pub status: RecordStatus,
    #[serde(default)]
    pub output: Value,
    pub created_at: DateTimeUtc,
}

/// A persisted record plus its store-assigned monotonic sequence. The
/// sequence, not the wall-clock timestamp, orders records within an
/// execution; timestamps can collide or skew across distributed writers.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordRow {
    pub record_seq: i64,
    pub record: NodeExecutionRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExecutionSummary {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    pub duration_ms: Option<i64>,
}

/// Caller-visible error taxonomy. Store faults stay opaque `anyhow` chains;
/// everything else is matchable so transports can map variants to statuses.
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("execution {execution_id} already ended with status {status}")]
    ExecutionAlreadyEnded {
        execution_id: ExecutionId,
        status: &'static str,
    },
    #[error("model {model_id} is bound to {count} nodes in agent {agent_id}; tip resolution requires exactly one")]
    AmbiguousModelBinding {
        model_id: ModelId,
        agent_id: AgentId,
        count: usize,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// The four casing variants any inbound identifier may arrive in. The
/// declaring side (config import, AI-generated config) and the reporting
/// side (instrumented code re-deriving the identifier) do not agree on
/// casing, so every slug lookup matches against the whole set.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SlugForms {
    pub literal: String,
    pub camel: String,
    pub lower: String,
    pub lower_camel: String,
}

impl SlugForms {
    /// Candidate set for a slug lookup, deduplicated, literal first.
    #[must_use]
    pub fn candidates(&self) -> Vec<String> {
        let mut out = vec![self.literal.clone()];
        for form in [&self.camel, &self.lower, &self.lower_camel] {
            if !out.contains(form) {
                out.push(form.clone());
            }
        }
        out
    }
}

/// Derive all four slug forms from a free-text identifier. Pure and total:
/// always returns four strings, some of which may coincide.
#[must_use]
pub fn normalize_forms(identifier: &str) -> SlugForms {
    let literal = identifier.trim().to_string();
    let words = split_words(&literal);

    let camel: String = words.iter().map(|word| capitalize(word)).collect();
    let lower: String = words.iter().map(|word| word.to_lowercase()).collect();
    let mut lower_camel = camel.clone();
    if let Some(first) = lower_camel.get(..1) {
        let lowered = first.to_lowercase();
        lower_camel.replace_range(..1, &lowered);
    }

    SlugForms {
        literal,
        camel,
        lower,
        lower_camel,
    }
}

/// Canonical stored form of a slug: lowerCamelCase.
#[must_use]
pub fn canonical_slug(identifier: &str) -> String {
    normalize_forms(identifier).lower_camel
}

fn split_words(identifier: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_was_lower = false;

    for ch in identifier.chars() {
        if ch.is_whitespace() || matches!(ch, '-' | '_' | '.' | '/') {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_was_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_was_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_was_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.push(ch);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => {
            first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
        }
        None => String::new(),
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}
