#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConfigId(pub Ulid);

impl ConfigId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ConfigId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConfigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PipelineId(pub Ulid);

impl PipelineId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for PipelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine error taxonomy. Rule evaluation and chain building never raise;
/// everything that can fail a caller-visible operation is one of these.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum GovernanceError {
    #[error("unknown stage '{stage}'")]
    UnknownStage { stage: String },
    #[error("stage '{stage}' already completed")]
    StageAlreadyCompleted { stage: String },
    #[error("stale pipeline state: expected version {expected}, found {actual}")]
    StaleState { expected: i64, actual: i64 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no active workflow config for agency '{agency}' client '{client}'")]
    ConfigNotFound { agency: String, client: String },
    #[error("agent call '{agent}.{action}' failed: {message}")]
    AgentCallFailure {
        agent: String,
        action: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl StageStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Active,
    Completed,
}

impl PipelineStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl PriorityLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FlagSeverity {
    Low,
    Medium,
    High,
}

impl FlagSeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceEventType {
    ConfigPackRegistered,
    PipelineCreated,
    AutoApproved,
    StageAdvanced,
    StageBlocked,
    StageUnblocked,
    PipelineCompleted,
    EscalationTriggered,
    RunStarted,
    AgentInvoked,
    RunFinished,
    Warning,
}

impl GovernanceEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigPackRegistered => "config_pack_registered",
            Self::PipelineCreated => "pipeline_created",
            Self::AutoApproved => "auto_approved",
            Self::StageAdvanced => "stage_advanced",
            Self::StageBlocked => "stage_blocked",
            Self::StageUnblocked => "stage_unblocked",
            Self::PipelineCompleted => "pipeline_completed",
            Self::EscalationTriggered => "escalation_triggered",
            Self::RunStarted => "run_started",
            Self::AgentInvoked => "agent_invoked",
            Self::RunFinished => "run_finished",
            Self::Warning => "warning",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "config_pack_registered" => Some(Self::ConfigPackRegistered),
            "pipeline_created" => Some(Self::PipelineCreated),
            "auto_approved" => Some(Self::AutoApproved),
            "stage_advanced" => Some(Self::StageAdvanced),
            "stage_blocked" => Some(Self::StageBlocked),
            "stage_unblocked" => Some(Self::StageUnblocked),
            "pipeline_completed" => Some(Self::PipelineCompleted),
            "escalation_triggered" => Some(Self::EscalationTriggered),
            "run_started" => Some(Self::RunStarted),
            "agent_invoked" => Some(Self::AgentInvoked),
            "run_finished" => Some(Self::RunFinished),
            "warning" => Some(Self::Warning),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SkipRule {
    pub condition: String,
    pub skip_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RoutingRule {
    pub condition: String,
    pub add_steps: Vec<String>,
}

/// Administrator-authored approval configuration scoped to an
/// (agency, client, optional brand) relationship. The engine only reads these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    pub config_id: ConfigId,
    pub agency_id: String,
    pub client_id: String,
    #[serde(default)]
    pub brand_id: Option<String>,
    pub approval_chain: Vec<String>,
    #[serde(default)]
    pub parallel_approvals: bool,
    #[serde(default)]
    pub skip_preapproval: bool,
    pub escalation_timeout_hours: f64,
    #[serde(default)]
    pub auto_approve_low_risk: bool,
    #[serde(default)]
    pub require_compliance_review: bool,
    #[serde(default)]
    pub require_legal_review: bool,
    #[serde(default)]
    pub skip_logic: Vec<SkipRule>,
    #[serde(default)]
    pub conditional_routing: Vec<RoutingRule>,
    pub priority: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}

fn default_true() -> bool {
    true
}

/// Static reviewer-role reference data; chain entries must resolve to one.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RoleArchetype {
    pub role_id: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Ephemeral attribute map evaluated against skip/routing conditions.
/// Built fresh per evaluation from persisted submission data, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionContext {
    pub risk_score: f64,
    pub requestor_role: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    pub name: String,
    pub assignees: Vec<String>,
    pub status: StageStatus,
    pub estimated_duration_hours: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<DateTimeUtc>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<DateTimeUtc>,
}

/// One approval pipeline instance per document/submission. Mutated on every
/// stage transition through the store's versioned update; archived on
/// completion, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalPipeline {
    pub pipeline_id: PipelineId,
    pub document_id: String,
    pub enterprise_id: String,
    pub current_stage: Option<String>,
    pub stages: Vec<Stage>,
    pub progress_percentage: u8,
    pub bottleneck_detected: bool,
    pub escalation_triggered: bool,
    pub priority_level: PriorityLevel,
    pub sla_hours: f64,
    pub parallel_approvals: bool,
    pub escalation_timeout_hours: f64,
    pub status: PipelineStatus,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<DateTimeUtc>,
}

impl ApprovalPipeline {
    #[must_use]
    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|stage| stage.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RiskFlag {
    pub severity: FlagSeverity,
    pub code: String,
    pub message: String,
    pub source: String,
}

/// One entry of a sandbox run's execution log; immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTaskResult {
    pub agent: String,
    pub action: String,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub confidence: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: DateTimeUtc,
}

/// Aggregate of one agent-orchestration execution. Created at run start,
/// finalized exactly once at run end, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxRun {
    pub run_id: RunId,
    pub policy_id: String,
    pub enterprise_id: String,
    pub scenario: Value,
    pub status: RunStatus,
    pub validation_passed: bool,
    pub compliance_score: f64,
    pub risk_flags: Vec<RiskFlag>,
    pub ai_insights: Vec<String>,
    pub agent_metadata: Value,
    pub overall_confidence: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<DateTimeUtc>,
}

/// Full request/response record for one agent invocation, persisted for audit
/// whether the call succeeded or failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentCallRecord {
    pub call_id: Ulid,
    pub agent: String,
    pub action: String,
    pub request_json: Value,
    pub request_hash: String,
    pub response_json: Value,
    pub response_hash: String,
    pub latency_ms: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: DateTimeUtc,
    pub status: String,
    pub error_text: Option<String>,
}

/// Audit event. Events for one entity form a hash chain: each event's
/// `prev_event_hash` is the `event_hash` of the entity's previous event.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GovernanceEvent {
    pub event_id: Ulid,
    pub event_type: GovernanceEventType,
    pub entity_id: String,
    pub enterprise_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: DateTimeUtc,
    pub actor_type: String,
    pub actor_id: String,
    pub payload_json: Value,
    pub payload_hash: String,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventRow {
    pub event_seq: i64,
    pub event: GovernanceEvent,
}

/// Administrator-authored bundle of role archetypes plus the workflow configs
/// scoped to them, as loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigPack {
    pub pack_name: String,
    pub pack_version: String,
    pub normalization_version: u32,
    pub roles: Vec<RoleArchetype>,
    pub configs: Vec<WorkflowConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigPackEnvelope {
    pub source_format: String,
    pub source_yaml_hash: String,
    pub normalized_hash: String,
    pub pack: ConfigPack,
    pub normalized_json: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConfigPackSnapshotRecord {
    pub pack_hash: String,
    pub source_format: String,
    pub source_yaml_hash: String,
    pub normalized_json: Value,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
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

/// Format a timestamp as RFC3339.
///
/// # Errors
/// Returns an error for timestamps outside the RFC3339 range.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 value: {err}"))
}

/// Parse an RFC3339 timestamp.
///
/// # Errors
/// Returns an error for malformed input.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 timestamp: {err}"))
}
