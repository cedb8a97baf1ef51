#![forbid(unsafe_code)]

use anyhow::Result;
use governance_center_domain::{
    AgentCallRecord, AgentTaskResult, ApprovalPipeline, ConfigId, ConfigPackSnapshotRecord,
    EventRow, GovernanceEvent, PipelineId, RunId, RunStatus, SandboxRun, WorkflowConfig,
};

/// Abstract transactional store + audit sink the engine is written against.
/// Resolver, state machine, and sandbox orchestration all take this
/// capability instead of a concrete client, so tests run on a scratch
/// database and the host can supply its own persistence.
pub trait GovernanceStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn upsert_config_pack_snapshot(
        &self,
        pack_hash: &str,
        source_format: &str,
        source_yaml_hash: &str,
        normalized_json: &serde_json::Value,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_config_pack_snapshot(&self, pack_hash: &str) -> Result<Option<ConfigPackSnapshotRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn upsert_config(&self, pack_hash: &str, config: &WorkflowConfig) -> Result<()>;

    /// Active configs for an (agency, client) scope, any brand. Precedence is
    /// the resolver's concern, not the store's.
    #[allow(clippy::missing_errors_doc)]
    fn list_active_configs(&self, agency_id: &str, client_id: &str) -> Result<Vec<WorkflowConfig>>;

    #[allow(clippy::missing_errors_doc)]
    fn set_config_active(&self, config_id: ConfigId, active: bool) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_pipeline(&self, pipeline: &ApprovalPipeline) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_pipeline(&self, pipeline_id: PipelineId) -> Result<Option<ApprovalPipeline>>;

    /// Persist a mutated pipeline if and only if the stored row still carries
    /// `expected_version`; bumps the version on success. A lost race fails
    /// with `GovernanceError::StaleState` and writes nothing.
    #[allow(clippy::missing_errors_doc)]
    fn update_pipeline(&self, pipeline: &ApprovalPipeline, expected_version: i64) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_pipelines(&self) -> Result<Vec<ApprovalPipeline>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_run(&self, run: &SandboxRun) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> Result<Option<SandboxRun>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self) -> Result<Vec<SandboxRun>>;

    /// Finalization happens exactly once per run; the stored row is replaced
    /// with the aggregated result and an `ended_at` timestamp.
    #[allow(clippy::missing_errors_doc)]
    fn finalize_run(&self, run: &SandboxRun, status: RunStatus) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_task_result(&self, run_id: RunId, result: &AgentTaskResult) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn list_task_results(&self, run_id: RunId) -> Result<Vec<AgentTaskResult>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_agent_call(&self, run_id: RunId, call: &AgentCallRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_event(&self, event: &GovernanceEvent) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn list_events_for_entity(&self, entity_id: &str) -> Result<Vec<EventRow>>;

    /// Hash of the most recent event for an entity, for chain threading.
    #[allow(clippy::missing_errors_doc)]
    fn last_event_hash(&self, entity_id: &str) -> Result<Option<String>>;
}
