#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use governance_center_domain::{
    format_rfc3339, now_utc, parse_rfc3339, AgentCallRecord, AgentTaskResult, ApprovalPipeline,
    ConfigId, ConfigPackSnapshotRecord, EventRow, GovernanceError, GovernanceEvent,
    GovernanceEventType, PipelineId, PipelineStatus, PriorityLevel, RunId, RunStatus, SandboxRun,
    Stage, StageStatus, TaskStatus, WorkflowConfig,
};
use governance_center_store_core::GovernanceStore;
use rusqlite::{params, Connection, OptionalExtension};
use ulid::Ulid;

const STORE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config_pack_snapshots (
  pack_hash TEXT PRIMARY KEY,
  source_format TEXT NOT NULL,
  source_yaml_hash TEXT NOT NULL,
  normalized_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_configs (
  config_id TEXT PRIMARY KEY,
  pack_hash TEXT NOT NULL,
  agency_id TEXT NOT NULL,
  client_id TEXT NOT NULL,
  brand_id TEXT,
  priority INTEGER NOT NULL,
  is_active INTEGER NOT NULL CHECK (is_active IN (0,1)),
  created_at TEXT NOT NULL,
  config_json TEXT NOT NULL,
  FOREIGN KEY (pack_hash) REFERENCES config_pack_snapshots(pack_hash)
);

CREATE TABLE IF NOT EXISTS pipelines (
  pipeline_id TEXT PRIMARY KEY,
  document_id TEXT NOT NULL,
  enterprise_id TEXT NOT NULL,
  current_stage TEXT,
  progress_percentage INTEGER NOT NULL CHECK (progress_percentage BETWEEN 0 AND 100),
  bottleneck_detected INTEGER NOT NULL CHECK (bottleneck_detected IN (0,1)),
  escalation_triggered INTEGER NOT NULL CHECK (escalation_triggered IN (0,1)),
  priority_level TEXT NOT NULL CHECK (priority_level IN ('low','medium','high','critical')),
  sla_hours REAL NOT NULL,
  parallel_approvals INTEGER NOT NULL CHECK (parallel_approvals IN (0,1)),
  escalation_timeout_hours REAL NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('active','completed')),
  version INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  completed_at TEXT
);

CREATE TABLE IF NOT EXISTS pipeline_stages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  pipeline_id TEXT NOT NULL,
  stage_index INTEGER NOT NULL,
  name TEXT NOT NULL,
  assignees_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','in_progress','completed','blocked')),
  estimated_duration_hours REAL NOT NULL,
  started_at TEXT,
  completed_at TEXT,
  UNIQUE(pipeline_id, stage_index),
  FOREIGN KEY (pipeline_id) REFERENCES pipelines(pipeline_id)
);

CREATE TABLE IF NOT EXISTS sandbox_runs (
  run_id TEXT PRIMARY KEY,
  policy_id TEXT NOT NULL,
  enterprise_id TEXT NOT NULL,
  scenario_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
  validation_passed INTEGER NOT NULL CHECK (validation_passed IN (0,1)),
  compliance_score REAL NOT NULL,
  risk_flags_json TEXT NOT NULL,
  ai_insights_json TEXT NOT NULL,
  agent_metadata_json TEXT NOT NULL,
  overall_confidence REAL NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT
);

CREATE TABLE IF NOT EXISTS agent_task_results (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  agent TEXT NOT NULL,
  action TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('completed','failed')),
  result_json TEXT,
  error_text TEXT,
  confidence REAL,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES sandbox_runs(run_id)
);

CREATE TABLE IF NOT EXISTS agent_calls (
  call_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  agent TEXT NOT NULL,
  action TEXT NOT NULL,
  request_json TEXT NOT NULL,
  request_hash TEXT NOT NULL,
  response_json TEXT NOT NULL,
  response_hash TEXT NOT NULL,
  latency_ms INTEGER,
  started_at TEXT NOT NULL,
  ended_at TEXT NOT NULL,
  status TEXT NOT NULL,
  error_text TEXT,
  FOREIGN KEY (run_id) REFERENCES sandbox_runs(run_id)
);

CREATE TABLE IF NOT EXISTS governance_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  event_type TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  enterprise_id TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  actor_type TEXT NOT NULL,
  actor_id TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  payload_hash TEXT NOT NULL,
  prev_event_hash TEXT,
  event_hash TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_configs_scope ON workflow_configs(agency_id, client_id, is_active);
CREATE INDEX IF NOT EXISTS idx_stages_pipeline ON pipeline_stages(pipeline_id, stage_index);
CREATE INDEX IF NOT EXISTS idx_task_results_run ON agent_task_results(run_id, id);
CREATE INDEX IF NOT EXISTS idx_agent_calls_run ON agent_calls(run_id, started_at);
CREATE INDEX IF NOT EXISTS idx_events_entity_seq ON governance_events(entity_id, event_seq);

CREATE TRIGGER IF NOT EXISTS trg_governance_events_no_update
BEFORE UPDATE ON governance_events
BEGIN
  SELECT RAISE(FAIL, 'governance_events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_governance_events_no_delete
BEFORE DELETE ON governance_events
BEGIN
  SELECT RAISE(FAIL, 'governance_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_agent_task_results_no_update
BEFORE UPDATE ON agent_task_results
BEGIN
  SELECT RAISE(FAIL, 'agent_task_results is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_agent_task_results_no_delete
BEFORE DELETE ON agent_task_results
BEGIN
  SELECT RAISE(FAIL, 'agent_task_results is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_agent_calls_no_update
BEFORE UPDATE ON agent_calls
BEGIN
  SELECT RAISE(FAIL, 'agent_calls is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_agent_calls_no_delete
BEFORE DELETE ON agent_calls
BEGIN
  SELECT RAISE(FAIL, 'agent_calls is append-only');
END;
";

pub struct SqliteGovernanceStore {
    conn: Connection,
}

impl SqliteGovernanceStore {
    /// Open or create a `SQLite` governance database and configure pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }
}

impl GovernanceStore for SqliteGovernanceStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply governance schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STORE_SCHEMA_VERSION, now],
            )
            .context("failed to record governance migration")?;

        tracing::debug!(version = STORE_SCHEMA_VERSION, "governance schema ready");
        Ok(())
    }

    fn upsert_config_pack_snapshot(
        &self,
        pack_hash: &str,
        source_format: &str,
        source_yaml_hash: &str,
        normalized_json: &serde_json::Value,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO config_pack_snapshots(
                    pack_hash, source_format, source_yaml_hash, normalized_json, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(pack_hash) DO UPDATE SET
                    source_format = excluded.source_format,
                    source_yaml_hash = excluded.source_yaml_hash,
                    normalized_json = excluded.normalized_json",
                params![
                    pack_hash,
                    source_format,
                    source_yaml_hash,
                    serde_json::to_string(normalized_json)?,
                    format_rfc3339(now_utc())?,
                ],
            )
            .context("failed to upsert config pack snapshot")?;
        Ok(())
    }

    fn get_config_pack_snapshot(&self, pack_hash: &str) -> Result<Option<ConfigPackSnapshotRecord>> {
        let row: Option<(String, String, String, String)> = self
            .conn
            .query_row(
                "SELECT pack_hash, source_format, source_yaml_hash, normalized_json
                 FROM config_pack_snapshots WHERE pack_hash = ?1",
                params![pack_hash],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .context("failed to read config pack snapshot")?;

        row.map(|(pack_hash, source_format, source_yaml_hash, normalized_json)| {
            Ok(ConfigPackSnapshotRecord {
                pack_hash,
                source_format,
                source_yaml_hash,
                normalized_json: serde_json::from_str(&normalized_json)
                    .context("invalid config_pack_snapshots.normalized_json")?,
            })
        })
        .transpose()
    }

    fn upsert_config(&self, pack_hash: &str, config: &WorkflowConfig) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO workflow_configs(
                    config_id, pack_hash, agency_id, client_id, brand_id,
                    priority, is_active, created_at, config_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(config_id) DO UPDATE SET
                    pack_hash = excluded.pack_hash,
                    agency_id = excluded.agency_id,
                    client_id = excluded.client_id,
                    brand_id = excluded.brand_id,
                    priority = excluded.priority,
                    is_active = excluded.is_active,
                    created_at = excluded.created_at,
                    config_json = excluded.config_json",
                params![
                    config.config_id.to_string(),
                    pack_hash,
                    config.agency_id,
                    config.client_id,
                    config.brand_id,
                    config.priority,
                    bool_to_sql(config.is_active),
                    format_rfc3339(config.created_at)?,
                    serde_json::to_string(config)?,
                ],
            )
            .context("failed to upsert workflow config")?;
        Ok(())
    }

    fn list_active_configs(&self, agency_id: &str, client_id: &str) -> Result<Vec<WorkflowConfig>> {
        let mut stmt = self.conn.prepare(
            "SELECT config_json FROM workflow_configs
             WHERE agency_id = ?1 AND client_id = ?2 AND is_active = 1
             ORDER BY config_id",
        )?;
        let mut rows = stmt.query(params![agency_id, client_id])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let config_json: String = row.get(0)?;
            out.push(
                serde_json::from_str(&config_json)
                    .context("invalid workflow_configs.config_json")?,
            );
        }
        Ok(out)
    }

    fn set_config_active(&self, config_id: ConfigId, active: bool) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE workflow_configs SET is_active = ?2,
                     config_json = json_set(config_json, '$.is_active', json(?3))
                 WHERE config_id = ?1",
                params![
                    config_id.to_string(),
                    bool_to_sql(active),
                    if active { "true" } else { "false" },
                ],
            )
            .context("failed to update config activation")?;
        if changed == 0 {
            return Err(anyhow!("config {config_id} not found"));
        }
        Ok(())
    }

    fn insert_pipeline(&self, pipeline: &ApprovalPipeline) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO pipelines(
                    pipeline_id, document_id, enterprise_id, current_stage,
                    progress_percentage, bottleneck_detected, escalation_triggered,
                    priority_level, sla_hours, parallel_approvals, escalation_timeout_hours,
                    status, version, created_at, updated_at, completed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    pipeline.pipeline_id.to_string(),
                    pipeline.document_id,
                    pipeline.enterprise_id,
                    pipeline.current_stage,
                    i64::from(pipeline.progress_percentage),
                    bool_to_sql(pipeline.bottleneck_detected),
                    bool_to_sql(pipeline.escalation_triggered),
                    pipeline.priority_level.as_str(),
                    pipeline.sla_hours,
                    bool_to_sql(pipeline.parallel_approvals),
                    pipeline.escalation_timeout_hours,
                    pipeline.status.as_str(),
                    pipeline.version,
                    format_rfc3339(pipeline.created_at)?,
                    format_rfc3339(pipeline.updated_at)?,
                    pipeline.completed_at.map(format_rfc3339).transpose()?,
                ],
            )
            .context("failed to insert pipeline")?;

        self.insert_stages(pipeline)?;
        Ok(())
    }

    fn get_pipeline(&self, pipeline_id: PipelineId) -> Result<Option<ApprovalPipeline>> {
        let row: Option<PipelineRow> = self
            .conn
            .query_row(
                "SELECT pipeline_id, document_id, enterprise_id, current_stage,
                        progress_percentage, bottleneck_detected, escalation_triggered,
                        priority_level, sla_hours, parallel_approvals, escalation_timeout_hours,
                        status, version, created_at, updated_at, completed_at
                 FROM pipelines WHERE pipeline_id = ?1",
                params![pipeline_id.to_string()],
                read_pipeline_row,
            )
            .optional()
            .context("failed to read pipeline")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let stages = self.read_stages(pipeline_id)?;
        Ok(Some(pipeline_from_row(row, stages)?))
    }

    fn update_pipeline(&self, pipeline: &ApprovalPipeline, expected_version: i64) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE pipelines SET
                    current_stage = ?3,
                    progress_percentage = ?4,
                    bottleneck_detected = ?5,
                    escalation_triggered = ?6,
                    status = ?7,
                    version = ?8,
                    updated_at = ?9,
                    completed_at = ?10
                 WHERE pipeline_id = ?1 AND version = ?2",
                params![
                    pipeline.pipeline_id.to_string(),
                    expected_version,
                    pipeline.current_stage,
                    i64::from(pipeline.progress_percentage),
                    bool_to_sql(pipeline.bottleneck_detected),
                    bool_to_sql(pipeline.escalation_triggered),
                    pipeline.status.as_str(),
                    expected_version + 1,
                    format_rfc3339(pipeline.updated_at)?,
                    pipeline.completed_at.map(format_rfc3339).transpose()?,
                ],
            )
            .context("failed to update pipeline")?;

        if changed == 0 {
            let actual: Option<i64> = self
                .conn
                .query_row(
                    "SELECT version FROM pipelines WHERE pipeline_id = ?1",
                    params![pipeline.pipeline_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to read pipeline version")?;
            let Some(actual) = actual else {
                return Err(anyhow!("pipeline {} not found", pipeline.pipeline_id));
            };
            tracing::debug!(
                pipeline_id = %pipeline.pipeline_id,
                expected = expected_version,
                actual,
                "pipeline update lost optimistic-concurrency race"
            );
            return Err(GovernanceError::StaleState {
                expected: expected_version,
                actual,
            }
            .into());
        }

        self.conn
            .execute(
                "DELETE FROM pipeline_stages WHERE pipeline_id = ?1",
                params![pipeline.pipeline_id.to_string()],
            )
            .context("failed to clear pipeline stages")?;
        self.insert_stages(pipeline)?;
        Ok(())
    }

    fn list_pipelines(&self) -> Result<Vec<ApprovalPipeline>> {
        let mut stmt = self.conn.prepare(
            "SELECT pipeline_id, document_id, enterprise_id, current_stage,
                    progress_percentage, bottleneck_detected, escalation_triggered,
                    priority_level, sla_hours, parallel_approvals, escalation_timeout_hours,
                    status, version, created_at, updated_at, completed_at
             FROM pipelines ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], read_pipeline_row)
            .context("failed to list pipelines")?;

        let mut out = Vec::new();
        for row in rows {
            let row = row?;
            let pipeline_id = parse_pipeline_id(&row.pipeline_id)?;
            let stages = self.read_stages(pipeline_id)?;
            out.push(pipeline_from_row(row, stages)?);
        }
        Ok(out)
    }

    fn insert_run(&self, run: &SandboxRun) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sandbox_runs(
                    run_id, policy_id, enterprise_id, scenario_json, status,
                    validation_passed, compliance_score, risk_flags_json,
                    ai_insights_json, agent_metadata_json, overall_confidence,
                    started_at, ended_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    run.run_id.to_string(),
                    run.policy_id,
                    run.enterprise_id,
                    serde_json::to_string(&run.scenario)?,
                    run.status.as_str(),
                    bool_to_sql(run.validation_passed),
                    run.compliance_score,
                    serde_json::to_string(&run.risk_flags)?,
                    serde_json::to_string(&run.ai_insights)?,
                    serde_json::to_string(&run.agent_metadata)?,
                    run.overall_confidence,
                    format_rfc3339(run.started_at)?,
                    run.ended_at.map(format_rfc3339).transpose()?,
                ],
            )
            .context("failed to insert sandbox run")?;
        Ok(())
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<SandboxRun>> {
        let row: Option<RunRow> = self
            .conn
            .query_row(
                "SELECT run_id, policy_id, enterprise_id, scenario_json, status,
                        validation_passed, compliance_score, risk_flags_json,
                        ai_insights_json, agent_metadata_json, overall_confidence,
                        started_at, ended_at
                 FROM sandbox_runs WHERE run_id = ?1",
                params![run_id.to_string()],
                read_run_row,
            )
            .optional()
            .context("failed to read sandbox run")?;

        row.map(run_from_row).transpose()
    }

    fn list_runs(&self) -> Result<Vec<SandboxRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, policy_id, enterprise_id, scenario_json, status,
                    validation_passed, compliance_score, risk_flags_json,
                    ai_insights_json, agent_metadata_json, overall_confidence,
                    started_at, ended_at
             FROM sandbox_runs ORDER BY started_at",
        )?;
        let rows = stmt
            .query_map([], read_run_row)
            .context("failed to list sandbox runs")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(run_from_row(row?)?);
        }
        Ok(out)
    }

    fn finalize_run(&self, run: &SandboxRun, status: RunStatus) -> Result<()> {
        let ended_at = run.ended_at.unwrap_or_else(now_utc);
        let changed = self
            .conn
            .execute(
                "UPDATE sandbox_runs SET
                    status = ?2,
                    validation_passed = ?3,
                    compliance_score = ?4,
                    risk_flags_json = ?5,
                    ai_insights_json = ?6,
                    agent_metadata_json = ?7,
                    overall_confidence = ?8,
                    ended_at = ?9
                 WHERE run_id = ?1 AND ended_at IS NULL",
                params![
                    run.run_id.to_string(),
                    status.as_str(),
                    bool_to_sql(run.validation_passed),
                    run.compliance_score,
                    serde_json::to_string(&run.risk_flags)?,
                    serde_json::to_string(&run.ai_insights)?,
                    serde_json::to_string(&run.agent_metadata)?,
                    run.overall_confidence,
                    format_rfc3339(ended_at)?,
                ],
            )
            .context("failed to finalize sandbox run")?;
        if changed == 0 {
            return Err(anyhow!(
                "sandbox run {} not found or already finalized",
                run.run_id
            ));
        }
        Ok(())
    }

    fn append_task_result(&self, run_id: RunId, result: &AgentTaskResult) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO agent_task_results(
                    run_id, agent, action, status, result_json, error_text,
                    confidence, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run_id.to_string(),
                    result.agent,
                    result.action,
                    result.status.as_str(),
                    result
                        .result
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    result.error,
                    result.confidence,
                    format_rfc3339(result.recorded_at)?,
                ],
            )
            .context("failed to append agent task result")?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_task_results(&self, run_id: RunId) -> Result<Vec<AgentTaskResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent, action, status, result_json, error_text, confidence, recorded_at
             FROM agent_task_results WHERE run_id = ?1 ORDER BY id",
        )?;
        let mut rows = stmt.query(params![run_id.to_string()])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let status_raw: String = row.get(2)?;
            let result_json: Option<String> = row.get(3)?;
            let recorded_at_raw: String = row.get(6)?;
            out.push(AgentTaskResult {
                agent: row.get(0)?,
                action: row.get(1)?,
                status: TaskStatus::parse(&status_raw)
                    .ok_or_else(|| anyhow!("invalid task status: {status_raw}"))?,
                result: result_json
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()
                    .context("invalid agent_task_results.result_json")?,
                error: row.get(4)?,
                confidence: row.get(5)?,
                recorded_at: parse_rfc3339(&recorded_at_raw)?,
            });
        }
        Ok(out)
    }

    fn append_agent_call(&self, run_id: RunId, call: &AgentCallRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO agent_calls(
                    call_id, run_id, agent, action, request_json, request_hash,
                    response_json, response_hash, latency_ms, started_at, ended_at,
                    status, error_text
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    call.call_id.to_string(),
                    run_id.to_string(),
                    call.agent,
                    call.action,
                    serde_json::to_string(&call.request_json)?,
                    call.request_hash,
                    serde_json::to_string(&call.response_json)?,
                    call.response_hash,
                    call.latency_ms.map(i64::try_from).transpose()?,
                    format_rfc3339(call.started_at)?,
                    format_rfc3339(call.ended_at)?,
                    call.status,
                    call.error_text,
                ],
            )
            .context("failed to append agent call")?;
        Ok(())
    }

    fn append_event(&self, event: &GovernanceEvent) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO governance_events(
                    event_id, event_type, entity_id, enterprise_id,
                    occurred_at, recorded_at, actor_type, actor_id,
                    payload_json, payload_hash, prev_event_hash, event_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    event.event_id.to_string(),
                    event.event_type.as_str(),
                    event.entity_id,
                    event.enterprise_id,
                    format_rfc3339(event.occurred_at)?,
                    format_rfc3339(event.recorded_at)?,
                    event.actor_type,
                    event.actor_id,
                    serde_json::to_string(&event.payload_json)?,
                    event.payload_hash,
                    event.prev_event_hash,
                    event.event_hash,
                ],
            )
            .context("failed to append governance event")?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_events_for_entity(&self, entity_id: &str) -> Result<Vec<EventRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_seq, event_id, event_type, entity_id, enterprise_id,
                    occurred_at, recorded_at, actor_type, actor_id,
                    payload_json, payload_hash, prev_event_hash, event_hash
             FROM governance_events WHERE entity_id = ?1 ORDER BY event_seq",
        )?;
        let mut rows = stmt.query(params![entity_id])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let event_seq: i64 = row.get(0)?;
            let event_id_raw: String = row.get(1)?;
            let event_type_raw: String = row.get(2)?;
            let occurred_at_raw: String = row.get(5)?;
            let recorded_at_raw: String = row.get(6)?;
            let payload_json_raw: String = row.get(9)?;
            out.push(EventRow {
                event_seq,
                event: GovernanceEvent {
                    event_id: Ulid::from_str(&event_id_raw)
                        .map_err(|err| anyhow!("invalid event_id ULID: {err}"))?,
                    event_type: GovernanceEventType::parse(&event_type_raw)
                        .ok_or_else(|| anyhow!("invalid event type: {event_type_raw}"))?,
                    entity_id: row.get(3)?,
                    enterprise_id: row.get(4)?,
                    occurred_at: parse_rfc3339(&occurred_at_raw)?,
                    recorded_at: parse_rfc3339(&recorded_at_raw)?,
                    actor_type: row.get(7)?,
                    actor_id: row.get(8)?,
                    payload_json: serde_json::from_str(&payload_json_raw)
                        .context("invalid governance_events.payload_json")?,
                    payload_hash: row.get(10)?,
                    prev_event_hash: row.get(11)?,
                    event_hash: row.get(12)?,
                },
            });
        }
        Ok(out)
    }

    fn last_event_hash(&self, entity_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT event_hash FROM governance_events
                 WHERE entity_id = ?1 ORDER BY event_seq DESC LIMIT 1",
                params![entity_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read last event hash")
    }
}

impl SqliteGovernanceStore {
    fn insert_stages(&self, pipeline: &ApprovalPipeline) -> Result<()> {
        for (index, stage) in pipeline.stages.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT INTO pipeline_stages(
                        pipeline_id, stage_index, name, assignees_json, status,
                        estimated_duration_hours, started_at, completed_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        pipeline.pipeline_id.to_string(),
                        i64::try_from(index)
                            .map_err(|_| anyhow!("stage_index too large for sqlite"))?,
                        stage.name,
                        serde_json::to_string(&stage.assignees)?,
                        stage.status.as_str(),
                        stage.estimated_duration_hours,
                        stage.started_at.map(format_rfc3339).transpose()?,
                        stage.completed_at.map(format_rfc3339).transpose()?,
                    ],
                )
                .context("failed to insert pipeline stage")?;
        }
        Ok(())
    }

    fn read_stages(&self, pipeline_id: PipelineId) -> Result<Vec<Stage>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, assignees_json, status, estimated_duration_hours,
                    started_at, completed_at
             FROM pipeline_stages WHERE pipeline_id = ?1 ORDER BY stage_index",
        )?;
        let mut rows = stmt.query(params![pipeline_id.to_string()])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let assignees_json: String = row.get(1)?;
            let status_raw: String = row.get(2)?;
            let started_at_raw: Option<String> = row.get(4)?;
            let completed_at_raw: Option<String> = row.get(5)?;
            out.push(Stage {
                name: row.get(0)?,
                assignees: serde_json::from_str(&assignees_json)
                    .context("invalid pipeline_stages.assignees_json")?,
                status: StageStatus::parse(&status_raw)
                    .ok_or_else(|| anyhow!("invalid stage status: {status_raw}"))?,
                estimated_duration_hours: row.get(3)?,
                started_at: started_at_raw.as_deref().map(parse_rfc3339).transpose()?,
                completed_at: completed_at_raw.as_deref().map(parse_rfc3339).transpose()?,
            });
        }
        Ok(out)
    }
}

struct PipelineRow {
    pipeline_id: String,
    document_id: String,
    enterprise_id: String,
    current_stage: Option<String>,
    progress_percentage: i64,
    bottleneck_detected: i64,
    escalation_triggered: i64,
    priority_level: String,
    sla_hours: f64,
    parallel_approvals: i64,
    escalation_timeout_hours: f64,
    status: String,
    version: i64,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

fn read_pipeline_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PipelineRow> {
    Ok(PipelineRow {
        pipeline_id: row.get(0)?,
        document_id: row.get(1)?,
        enterprise_id: row.get(2)?,
        current_stage: row.get(3)?,
        progress_percentage: row.get(4)?,
        bottleneck_detected: row.get(5)?,
        escalation_triggered: row.get(6)?,
        priority_level: row.get(7)?,
        sla_hours: row.get(8)?,
        parallel_approvals: row.get(9)?,
        escalation_timeout_hours: row.get(10)?,
        status: row.get(11)?,
        version: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        completed_at: row.get(15)?,
    })
}

fn pipeline_from_row(row: PipelineRow, stages: Vec<Stage>) -> Result<ApprovalPipeline> {
    Ok(ApprovalPipeline {
        pipeline_id: parse_pipeline_id(&row.pipeline_id)?,
        document_id: row.document_id,
        enterprise_id: row.enterprise_id,
        current_stage: row.current_stage,
        stages,
        progress_percentage: u8::try_from(row.progress_percentage)
            .map_err(|_| anyhow!("invalid progress_percentage: {}", row.progress_percentage))?,
        bottleneck_detected: row.bottleneck_detected == 1,
        escalation_triggered: row.escalation_triggered == 1,
        priority_level: PriorityLevel::parse(&row.priority_level)
            .ok_or_else(|| anyhow!("invalid priority_level: {}", row.priority_level))?,
        sla_hours: row.sla_hours,
        parallel_approvals: row.parallel_approvals == 1,
        escalation_timeout_hours: row.escalation_timeout_hours,
        status: PipelineStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("invalid pipeline status: {}", row.status))?,
        version: row.version,
        created_at: parse_rfc3339(&row.created_at)?,
        updated_at: parse_rfc3339(&row.updated_at)?,
        completed_at: row.completed_at.as_deref().map(parse_rfc3339).transpose()?,
    })
}

struct RunRow {
    run_id: String,
    policy_id: String,
    enterprise_id: String,
    scenario_json: String,
    status: String,
    validation_passed: i64,
    compliance_score: f64,
    risk_flags_json: String,
    ai_insights_json: String,
    agent_metadata_json: String,
    overall_confidence: f64,
    started_at: String,
    ended_at: Option<String>,
}

fn read_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        run_id: row.get(0)?,
        policy_id: row.get(1)?,
        enterprise_id: row.get(2)?,
        scenario_json: row.get(3)?,
        status: row.get(4)?,
        validation_passed: row.get(5)?,
        compliance_score: row.get(6)?,
        risk_flags_json: row.get(7)?,
        ai_insights_json: row.get(8)?,
        agent_metadata_json: row.get(9)?,
        overall_confidence: row.get(10)?,
        started_at: row.get(11)?,
        ended_at: row.get(12)?,
    })
}

fn run_from_row(row: RunRow) -> Result<SandboxRun> {
    Ok(SandboxRun {
        run_id: parse_run_id(&row.run_id)?,
        policy_id: row.policy_id,
        enterprise_id: row.enterprise_id,
        scenario: serde_json::from_str(&row.scenario_json)
            .context("invalid sandbox_runs.scenario_json")?,
        status: RunStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("invalid run status: {}", row.status))?,
        validation_passed: row.validation_passed == 1,
        compliance_score: row.compliance_score,
        risk_flags: serde_json::from_str(&row.risk_flags_json)
            .context("invalid sandbox_runs.risk_flags_json")?,
        ai_insights: serde_json::from_str(&row.ai_insights_json)
            .context("invalid sandbox_runs.ai_insights_json")?,
        agent_metadata: serde_json::from_str(&row.agent_metadata_json)
            .context("invalid sandbox_runs.agent_metadata_json")?,
        overall_confidence: row.overall_confidence,
        started_at: parse_rfc3339(&row.started_at)?,
        ended_at: row.ended_at.as_deref().map(parse_rfc3339).transpose()?,
    })
}

fn parse_pipeline_id(raw: &str) -> Result<PipelineId> {
    Ulid::from_str(raw)
        .map(PipelineId)
        .map_err(|err| anyhow!("invalid pipeline_id ULID: {err}"))
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    Ulid::from_str(raw)
        .map(RunId)
        .map_err(|err| anyhow!("invalid run_id ULID: {err}"))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

#[cfg(test)]
mod tests {
    use super::SqliteGovernanceStore;
    use governance_center_domain::{
        now_utc, ApprovalPipeline, GovernanceError, PipelineId, PipelineStatus, PriorityLevel,
        Stage, StageStatus,
    };
    use governance_center_store_core::GovernanceStore;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "governance-store-test-{}-{}.sqlite",
            name,
            ulid::Ulid::new()
        ))
    }

    fn fixture_pipeline() -> ApprovalPipeline {
        let now = now_utc();
        ApprovalPipeline {
            pipeline_id: PipelineId::new(),
            document_id: "doc-1".to_string(),
            enterprise_id: "ent-1".to_string(),
            current_stage: Some("team_lead".to_string()),
            stages: vec![
                Stage {
                    name: "team_lead".to_string(),
                    assignees: vec!["user-1".to_string()],
                    status: StageStatus::InProgress,
                    estimated_duration_hours: 8.0,
                    started_at: Some(now),
                    completed_at: None,
                },
                Stage {
                    name: "compliance_reviewer".to_string(),
                    assignees: Vec::new(),
                    status: StageStatus::Pending,
                    estimated_duration_hours: 24.0,
                    started_at: None,
                    completed_at: None,
                },
            ],
            progress_percentage: 50,
            bottleneck_detected: false,
            escalation_triggered: false,
            priority_level: PriorityLevel::Medium,
            sla_hours: 72.0,
            parallel_approvals: false,
            escalation_timeout_hours: 48.0,
            status: PipelineStatus::Active,
            version: 1,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[test]
    fn pipeline_round_trips_through_sqlite() {
        let store = SqliteGovernanceStore::open(&temp_db_path("roundtrip"));
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());

        let pipeline = fixture_pipeline();
        assert!(store.insert_pipeline(&pipeline).is_ok());

        let loaded = store.get_pipeline(pipeline.pipeline_id);
        assert!(loaded.is_ok());
        let loaded = loaded
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(loaded.stages.len(), 2);
        assert_eq!(loaded.current_stage.as_deref(), Some("team_lead"));
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn stale_version_update_is_rejected() {
        let store = SqliteGovernanceStore::open(&temp_db_path("stale"));
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());

        let mut pipeline = fixture_pipeline();
        assert!(store.insert_pipeline(&pipeline).is_ok());

        pipeline.progress_percentage = 100;
        assert!(store.update_pipeline(&pipeline, 1).is_ok());

        // Same expected version again: the first update bumped it to 2.
        let second = store.update_pipeline(&pipeline, 1);
        assert!(second.is_err());
        let err = match second {
            Err(err) => err,
            Ok(()) => unreachable!(),
        };
        assert_eq!(
            err.downcast_ref::<GovernanceError>(),
            Some(&GovernanceError::StaleState {
                expected: 1,
                actual: 2
            })
        );
    }

    #[test]
    fn governance_events_are_append_only() {
        let store = SqliteGovernanceStore::open(&temp_db_path("append-only"));
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());

        let event = governance_center_domain::GovernanceEvent {
            event_id: ulid::Ulid::new(),
            event_type: governance_center_domain::GovernanceEventType::PipelineCreated,
            entity_id: "doc-1".to_string(),
            enterprise_id: "ent-1".to_string(),
            occurred_at: now_utc(),
            recorded_at: now_utc(),
            actor_type: "system".to_string(),
            actor_id: "engine".to_string(),
            payload_json: serde_json::json!({"stages": 2}),
            payload_hash: "hash".to_string(),
            prev_event_hash: None,
            event_hash: "event-hash".to_string(),
        };
        assert!(store.append_event(&event).is_ok());

        let hash = store.last_event_hash("doc-1");
        assert!(hash.is_ok());
        assert_eq!(
            hash.unwrap_or_else(|_| unreachable!()),
            Some("event-hash".to_string())
        );

        let events = store.list_events_for_entity("doc-1");
        assert!(events.is_ok());
        assert_eq!(events.unwrap_or_else(|_| unreachable!()).len(), 1);
    }
}
