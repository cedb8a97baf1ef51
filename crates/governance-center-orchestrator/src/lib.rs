#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use governance_center_agents::{AgentBackend, AgentTaskRequest};
use governance_center_domain::{
    format_rfc3339, hash_json, now_utc, AgentTaskResult, ApprovalPipeline, ConfigId, DateTimeUtc,
    EventRow, FlagSeverity, GovernanceError, GovernanceEvent, GovernanceEventType, PipelineId,
    PipelineStatus, PriorityLevel, RiskFlag, RunId, RunStatus, SandboxRun, Stage, StageStatus,
    SubmissionContext, TaskStatus, WorkflowConfig,
};
use governance_center_rules::{build_chain, ChainBuildResult, COMPLIANCE_REVIEWER};
use governance_center_store_core::GovernanceStore;
use governance_center_workflow::resolve_config;
use serde_json::{json, Map, Value};
use ulid::Ulid;

/// Roles of the hard-coded fallback chain used when no active config matches
/// an (agency, client) scope.
pub const DEFAULT_CHAIN: [&str; 2] = ["team_lead", COMPLIANCE_REVIEWER];

const DEFAULT_ESCALATION_TIMEOUT_HOURS: f64 = 72.0;
const ENGINE_VERSION: &str = "governance-center.v0";

/// Whether a sandbox step's failure aborts the run or is only recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Fatal,
    Advisory,
}

#[derive(Debug, Clone, Copy)]
struct StepSpec {
    agent: &'static str,
    action: &'static str,
    policy: FailurePolicy,
}

/// The four analysis steps of a sandbox run, in execution order. Only the
/// simulation step is fatal: without its output there is nothing to score or
/// monitor, while the other three degrade to recorded failures.
const SANDBOX_STEPS: [StepSpec; 4] = [
    StepSpec {
        agent: "policy",
        action: "validate",
        policy: FailurePolicy::Advisory,
    },
    StepSpec {
        agent: "sandbox",
        action: "simulate",
        policy: FailurePolicy::Fatal,
    },
    StepSpec {
        agent: "compliance-scoring",
        action: "score",
        policy: FailurePolicy::Advisory,
    },
    StepSpec {
        agent: "monitoring",
        action: "detect_anomalies",
        policy: FailurePolicy::Advisory,
    },
];

/// Cooperative cancellation for a sandbox run. Checked between steps; a
/// cancelled run skips the remaining steps, is finalized as failed, and still
/// emits its terminal governance event.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub priority_level: PriorityLevel,
    pub sla_hours: f64,
    /// Reviewer user ids per role; roles without an entry start unassigned.
    pub assignees: BTreeMap<String, Vec<String>>,
    /// Per-role overrides for the built-in stage duration estimates.
    pub stage_hours: BTreeMap<String, f64>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            priority_level: PriorityLevel::Medium,
            sla_hours: 120.0,
            assignees: BTreeMap::default(),
            stage_hours: BTreeMap::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartApprovalRequest {
    pub document_id: String,
    pub agency_id: String,
    pub client_id: String,
    pub brand_id: Option<String>,
    pub enterprise_id: String,
    pub context: SubmissionContext,
    pub options: PipelineOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalOutcome {
    pub config_id: Option<ConfigId>,
    pub config_source: String,
    pub chain: ChainBuildResult,
    pub pipeline: Option<ApprovalPipeline>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub steps_total: usize,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub compliance_score: f64,
    pub overall_confidence: f64,
}

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub run_id: Option<RunId>,
    /// Backend parameters forwarded verbatim to every agent call
    /// (endpoint url, timeout_ms, headers for the HTTP backend).
    pub agent_params: Value,
    pub cancel: Option<CancelFlag>,
    pub engine_version: String,
    /// Workspace and user on whose behalf the run executes; recorded in the
    /// run's governance events when present.
    pub workspace_id: Option<String>,
    pub user_id: Option<String>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            run_id: None,
            agent_params: Value::Object(Map::default()),
            cancel: None,
            engine_version: ENGINE_VERSION.to_string(),
            workspace_id: None,
            user_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub entity_id: String,
    pub events: usize,
    pub chain_valid: bool,
}

/// The approval pipeline state machine. Every mutation goes through the
/// store's versioned update, so two concurrent advances on the same pipeline
/// cannot both win; the loser sees `StaleState` and must reload.
pub struct PipelineEngine<'a> {
    store: &'a dyn GovernanceStore,
}

impl<'a> PipelineEngine<'a> {
    #[must_use]
    pub fn new(store: &'a dyn GovernanceStore) -> Self {
        Self { store }
    }

    /// Resolve the effective config for the submission, build its chain, and
    /// initialize a pipeline. Falls back to the default chain when no config
    /// matches. Exactly one governance event records the outcome, whichever
    /// branch is taken.
    ///
    /// # Errors
    /// Returns an error when the store rejects a read or write.
    pub fn start_approval(&self, request: &StartApprovalRequest) -> Result<ApprovalOutcome> {
        let configs = self
            .store
            .list_active_configs(&request.agency_id, &request.client_id)?;
        let resolved = resolve_config(
            &configs,
            &request.agency_id,
            &request.client_id,
            request.brand_id.as_deref(),
        );

        let (config, config_source) = match resolved {
            Some(config) => (config.clone(), "resolved".to_string()),
            None => {
                tracing::debug!(
                    agency = %request.agency_id,
                    client = %request.client_id,
                    "no active config matched, using default chain"
                );
                (
                    default_workflow_config(&request.agency_id, &request.client_id),
                    "default".to_string(),
                )
            }
        };
        let config_id = resolved.map(|config| config.config_id);

        let chain = build_chain(&config, &request.context);

        if chain.auto_approved {
            record_event(
                self.store,
                GovernanceEventType::AutoApproved,
                &request.document_id,
                &request.enterprise_id,
                "system",
                "pipeline_engine",
                json!({
                    "document_id": request.document_id,
                    "config_id": config_id.map(|id| id.to_string()),
                    "config_source": config_source,
                    "bypassed_chain": chain.skipped,
                    "risk_score": request.context.risk_score,
                }),
            )?;
            return Ok(ApprovalOutcome {
                config_id,
                config_source,
                chain,
                pipeline: None,
            });
        }

        let pipeline = self.create_pipeline(request, &config, &chain, &config_source, config_id)?;
        Ok(ApprovalOutcome {
            config_id,
            config_source,
            chain,
            pipeline: Some(pipeline),
        })
    }

    fn create_pipeline(
        &self,
        request: &StartApprovalRequest,
        config: &WorkflowConfig,
        chain: &ChainBuildResult,
        config_source: &str,
        config_id: Option<ConfigId>,
    ) -> Result<ApprovalPipeline> {
        let now = now_utc();
        let stages = build_stages(
            &chain.steps,
            config.parallel_approvals,
            &request.options,
            now,
        );
        let no_review_required = stages.is_empty();
        let stage_count = stages.len();

        let pipeline = ApprovalPipeline {
            pipeline_id: PipelineId::new(),
            document_id: request.document_id.clone(),
            enterprise_id: request.enterprise_id.clone(),
            current_stage: stages.first().map(|stage| stage.name.clone()),
            stages,
            progress_percentage: if no_review_required {
                100
            } else {
                progress_for(0, stage_count)
            },
            bottleneck_detected: false,
            escalation_triggered: false,
            priority_level: request.options.priority_level,
            sla_hours: request.options.sla_hours,
            parallel_approvals: config.parallel_approvals,
            escalation_timeout_hours: config.escalation_timeout_hours,
            status: if no_review_required {
                PipelineStatus::Completed
            } else {
                PipelineStatus::Active
            },
            version: 1,
            created_at: now,
            updated_at: now,
            completed_at: no_review_required.then_some(now),
        };

        self.store.insert_pipeline(&pipeline)?;
        tracing::info!(
            pipeline_id = %pipeline.pipeline_id,
            document_id = %pipeline.document_id,
            stages = stage_count,
            "approval pipeline created"
        );

        record_event(
            self.store,
            GovernanceEventType::PipelineCreated,
            &request.document_id,
            &request.enterprise_id,
            "system",
            "pipeline_engine",
            json!({
                "pipeline_id": pipeline.pipeline_id.to_string(),
                "config_id": config_id.map(|id| id.to_string()),
                "config_source": config_source,
                "steps": chain.steps,
                "skipped": chain.skipped,
                "added": chain.added,
                "no_review_required": no_review_required,
                "parallel_approvals": config.parallel_approvals,
            }),
        )?;

        Ok(pipeline)
    }

    /// Move a pipeline from one stage to the next. Not idempotent by design:
    /// a stage name is consumed once transitioned, and advancing onto an
    /// already-completed stage is rejected instead of silently re-running.
    ///
    /// # Errors
    /// `UnknownStage` when `to_stage` is not part of the chain (pipeline left
    /// unchanged), `StageAlreadyCompleted` on a re-entrant call, `StaleState`
    /// when a concurrent advance won the version race.
    pub fn advance(
        &self,
        pipeline_id: PipelineId,
        from_stage: &str,
        to_stage: &str,
    ) -> Result<ApprovalPipeline> {
        let mut pipeline = self
            .store
            .get_pipeline(pipeline_id)?
            .ok_or_else(|| anyhow!("pipeline {pipeline_id} not found"))?;
        let expected_version = pipeline.version;
        let now = now_utc();

        let Some(to_index) = pipeline.stage_index(to_stage) else {
            return Err(GovernanceError::UnknownStage {
                stage: to_stage.to_string(),
            }
            .into());
        };
        if pipeline.stages[to_index].status == StageStatus::Completed {
            return Err(GovernanceError::StageAlreadyCompleted {
                stage: to_stage.to_string(),
            }
            .into());
        }

        if let Some(from_index) = pipeline.stage_index(from_stage) {
            if pipeline.stages[from_index].status == StageStatus::InProgress {
                pipeline.stages[from_index].status = StageStatus::Completed;
                pipeline.stages[from_index].completed_at = Some(now);
            }
        }

        pipeline.stages[to_index].status = StageStatus::InProgress;
        if pipeline.stages[to_index].started_at.is_none() {
            pipeline.stages[to_index].started_at = Some(now);
        }
        pipeline.current_stage = Some(to_stage.to_string());
        pipeline.progress_percentage = progress_for(to_index, pipeline.stages.len());
        pipeline.updated_at = now;

        let completed = pipeline
            .stages
            .iter()
            .all(|stage| stage.status == StageStatus::Completed);
        if completed {
            pipeline.status = PipelineStatus::Completed;
            pipeline.completed_at = Some(now);
            pipeline.progress_percentage = 100;
        }

        self.store.update_pipeline(&pipeline, expected_version)?;
        pipeline.version = expected_version + 1;

        record_event(
            self.store,
            GovernanceEventType::StageAdvanced,
            &pipeline.document_id,
            &pipeline.enterprise_id,
            "system",
            "pipeline_engine",
            json!({
                "pipeline_id": pipeline.pipeline_id.to_string(),
                "from_stage": from_stage,
                "to_stage": to_stage,
                "progress_percentage": pipeline.progress_percentage,
            }),
        )?;

        if completed {
            record_event(
                self.store,
                GovernanceEventType::PipelineCompleted,
                &pipeline.document_id,
                &pipeline.enterprise_id,
                "system",
                "pipeline_engine",
                json!({
                    "pipeline_id": pipeline.pipeline_id.to_string(),
                    "completed_at": format_rfc3339(now)?,
                }),
            )?;
        }

        Ok(pipeline)
    }

    /// Sign off a stage without moving to a successor: the terminal
    /// transition for the last stage of a chain, and the per-stage sign-off
    /// under parallel approvals. Completing the final open stage archives
    /// the pipeline.
    ///
    /// # Errors
    /// `UnknownStage` for a name outside the chain, `StageAlreadyCompleted`
    /// on a re-entrant call, `StaleState` on a lost version race.
    pub fn complete_stage(
        &self,
        pipeline_id: PipelineId,
        stage: &str,
    ) -> Result<ApprovalPipeline> {
        let mut pipeline = self
            .store
            .get_pipeline(pipeline_id)?
            .ok_or_else(|| anyhow!("pipeline {pipeline_id} not found"))?;
        let expected_version = pipeline.version;
        let now = now_utc();

        let Some(index) = pipeline.stage_index(stage) else {
            return Err(GovernanceError::UnknownStage {
                stage: stage.to_string(),
            }
            .into());
        };
        if pipeline.stages[index].status == StageStatus::Completed {
            return Err(GovernanceError::StageAlreadyCompleted {
                stage: stage.to_string(),
            }
            .into());
        }

        pipeline.stages[index].status = StageStatus::Completed;
        pipeline.stages[index].completed_at = Some(now);
        pipeline.progress_percentage = progress_for(index, pipeline.stages.len());
        pipeline.updated_at = now;

        let completed = pipeline
            .stages
            .iter()
            .all(|candidate| candidate.status == StageStatus::Completed);
        if completed {
            pipeline.status = PipelineStatus::Completed;
            pipeline.completed_at = Some(now);
            pipeline.progress_percentage = 100;
        }

        self.store.update_pipeline(&pipeline, expected_version)?;
        pipeline.version = expected_version + 1;

        record_event(
            self.store,
            GovernanceEventType::StageAdvanced,
            &pipeline.document_id,
            &pipeline.enterprise_id,
            "system",
            "pipeline_engine",
            json!({
                "pipeline_id": pipeline.pipeline_id.to_string(),
                "stage": stage,
                "completed_stage": true,
                "progress_percentage": pipeline.progress_percentage,
            }),
        )?;

        if completed {
            record_event(
                self.store,
                GovernanceEventType::PipelineCompleted,
                &pipeline.document_id,
                &pipeline.enterprise_id,
                "system",
                "pipeline_engine",
                json!({
                    "pipeline_id": pipeline.pipeline_id.to_string(),
                    "completed_at": format_rfc3339(now)?,
                }),
            )?;
        }

        Ok(pipeline)
    }

    /// External "missing information" signal on a stage.
    ///
    /// # Errors
    /// `UnknownStage` when the stage is not part of the chain; store errors
    /// otherwise.
    pub fn block_stage(&self, pipeline_id: PipelineId, stage: &str) -> Result<ApprovalPipeline> {
        self.set_block_state(pipeline_id, stage, true)
    }

    /// Clears a block: a stage that had started resumes in progress,
    /// otherwise it returns to pending.
    ///
    /// # Errors
    /// `UnknownStage` when the stage is not part of the chain; store errors
    /// otherwise.
    pub fn unblock_stage(&self, pipeline_id: PipelineId, stage: &str) -> Result<ApprovalPipeline> {
        self.set_block_state(pipeline_id, stage, false)
    }

    fn set_block_state(
        &self,
        pipeline_id: PipelineId,
        stage: &str,
        blocked: bool,
    ) -> Result<ApprovalPipeline> {
        let mut pipeline = self
            .store
            .get_pipeline(pipeline_id)?
            .ok_or_else(|| anyhow!("pipeline {pipeline_id} not found"))?;
        let expected_version = pipeline.version;

        let Some(index) = pipeline.stage_index(stage) else {
            return Err(GovernanceError::UnknownStage {
                stage: stage.to_string(),
            }
            .into());
        };

        if blocked {
            if pipeline.stages[index].status == StageStatus::Completed {
                return Err(GovernanceError::StageAlreadyCompleted {
                    stage: stage.to_string(),
                }
                .into());
            }
            pipeline.stages[index].status = StageStatus::Blocked;
        } else if pipeline.stages[index].status == StageStatus::Blocked {
            pipeline.stages[index].status = if pipeline.stages[index].started_at.is_some() {
                StageStatus::InProgress
            } else {
                StageStatus::Pending
            };
        }
        pipeline.updated_at = now_utc();

        self.store.update_pipeline(&pipeline, expected_version)?;
        pipeline.version = expected_version + 1;

        record_event(
            self.store,
            if blocked {
                GovernanceEventType::StageBlocked
            } else {
                GovernanceEventType::StageUnblocked
            },
            &pipeline.document_id,
            &pipeline.enterprise_id,
            "system",
            "pipeline_engine",
            json!({
                "pipeline_id": pipeline.pipeline_id.to_string(),
                "stage": stage,
            }),
        )?;

        Ok(pipeline)
    }

    /// Recompute bottleneck/escalation flags against wall-clock time and
    /// persist them when they change. Newly triggered escalation emits its
    /// governance event.
    ///
    /// # Errors
    /// Returns an error when the pipeline is missing or the store rejects
    /// the update.
    pub fn refresh_flags(
        &self,
        pipeline_id: PipelineId,
        now: DateTimeUtc,
    ) -> Result<ApprovalPipeline> {
        let mut pipeline = self
            .store
            .get_pipeline(pipeline_id)?
            .ok_or_else(|| anyhow!("pipeline {pipeline_id} not found"))?;
        let expected_version = pipeline.version;

        let bottlenecks = bottleneck_stages(&pipeline, now);
        let escalated = escalated_stages(&pipeline, now);
        let newly_escalated = !escalated.is_empty() && !pipeline.escalation_triggered;

        let bottleneck_detected = !bottlenecks.is_empty();
        let escalation_triggered = pipeline.escalation_triggered || !escalated.is_empty();
        if bottleneck_detected == pipeline.bottleneck_detected
            && escalation_triggered == pipeline.escalation_triggered
        {
            return Ok(pipeline);
        }

        pipeline.bottleneck_detected = bottleneck_detected;
        pipeline.escalation_triggered = escalation_triggered;
        pipeline.updated_at = now_utc();
        self.store.update_pipeline(&pipeline, expected_version)?;
        pipeline.version = expected_version + 1;

        if newly_escalated {
            tracing::warn!(
                pipeline_id = %pipeline.pipeline_id,
                stages = ?escalated,
                "escalation timeout exceeded"
            );
            record_event(
                self.store,
                GovernanceEventType::EscalationTriggered,
                &pipeline.document_id,
                &pipeline.enterprise_id,
                "system",
                "pipeline_engine",
                json!({
                    "pipeline_id": pipeline.pipeline_id.to_string(),
                    "stages": escalated,
                    "escalation_timeout_hours": pipeline.escalation_timeout_hours,
                }),
            )?;
        }

        Ok(pipeline)
    }
}

/// Stages currently in progress longer than their own duration estimate.
#[must_use]
pub fn bottleneck_stages(pipeline: &ApprovalPipeline, now: DateTimeUtc) -> Vec<String> {
    pipeline
        .stages
        .iter()
        .filter(|stage| {
            stage.status == StageStatus::InProgress
                && stage.started_at.is_some_and(|started_at| {
                    hours_between(started_at, now) > stage.estimated_duration_hours
                })
        })
        .map(|stage| stage.name.clone())
        .collect()
}

/// Stages currently in progress longer than the pipeline's hard SLA timeout.
#[must_use]
pub fn escalated_stages(pipeline: &ApprovalPipeline, now: DateTimeUtc) -> Vec<String> {
    pipeline
        .stages
        .iter()
        .filter(|stage| {
            stage.status == StageStatus::InProgress
                && stage.started_at.is_some_and(|started_at| {
                    hours_between(started_at, now) > pipeline.escalation_timeout_hours
                })
        })
        .map(|stage| stage.name.clone())
        .collect()
}

/// `now` plus the estimated hours of every stage from the current one to the
/// end of the chain that has not completed yet. `None` for finished or empty
/// pipelines.
#[must_use]
pub fn estimated_completion(pipeline: &ApprovalPipeline, now: DateTimeUtc) -> Option<DateTimeUtc> {
    let current = pipeline.current_stage.as_deref()?;
    let current_index = pipeline.stage_index(current)?;
    let remaining_hours: f64 = pipeline
        .stages
        .iter()
        .skip(current_index)
        .filter(|stage| stage.status != StageStatus::Completed)
        .map(|stage| stage.estimated_duration_hours)
        .sum();
    if pipeline.status == PipelineStatus::Completed {
        return None;
    }
    Some(now + time::Duration::seconds_f64(remaining_hours * 3600.0))
}

fn hours_between(earlier: DateTimeUtc, later: DateTimeUtc) -> f64 {
    (later - earlier).as_seconds_f64() / 3600.0
}

fn progress_for(index: usize, len: usize) -> u8 {
    if len == 0 {
        return 100;
    }
    let pct = (100 * (index + 1) + len / 2) / len;
    u8::try_from(pct).unwrap_or(100)
}

fn build_stages(
    steps: &[String],
    parallel_approvals: bool,
    options: &PipelineOptions,
    now: DateTimeUtc,
) -> Vec<Stage> {
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    steps
        .iter()
        .enumerate()
        .map(|(index, role)| {
            let occurrence = seen.entry(role.as_str()).or_insert(0);
            *occurrence += 1;
            // Duplicate roles in a chain are legal; stage names stay unique
            // by suffixing repeat occurrences.
            let name = if *occurrence > 1 {
                format!("{role} #{occurrence}")
            } else {
                role.clone()
            };
            let in_first_wave = parallel_approvals || index == 0;
            Stage {
                name,
                assignees: options.assignees.get(role).cloned().unwrap_or_default(),
                status: if in_first_wave {
                    StageStatus::InProgress
                } else {
                    StageStatus::Pending
                },
                estimated_duration_hours: options
                    .stage_hours
                    .get(role)
                    .copied()
                    .unwrap_or_else(|| default_stage_hours(role)),
                started_at: in_first_wave.then_some(now),
                completed_at: None,
            }
        })
        .collect()
}

fn default_stage_hours(role: &str) -> f64 {
    match role {
        "team_lead" => 8.0,
        "brand_manager" | "creative_director" => 12.0,
        "compliance_reviewer" | "legal_counsel" => 24.0,
        _ => 12.0,
    }
}

fn default_workflow_config(agency_id: &str, client_id: &str) -> WorkflowConfig {
    WorkflowConfig {
        config_id: ConfigId::new(),
        agency_id: agency_id.to_string(),
        client_id: client_id.to_string(),
        brand_id: None,
        approval_chain: DEFAULT_CHAIN.iter().map(ToString::to_string).collect(),
        parallel_approvals: false,
        skip_preapproval: false,
        escalation_timeout_hours: DEFAULT_ESCALATION_TIMEOUT_HOURS,
        auto_approve_low_risk: false,
        require_compliance_review: false,
        require_legal_review: false,
        skip_logic: Vec::new(),
        conditional_routing: Vec::new(),
        priority: 0,
        is_active: true,
        created_at: now_utc(),
    }
}

/// Runs the four-step analysis pipeline against one policy/scenario pair.
/// Steps execute strictly in sequence; independent runs share no state and
/// are fully parallel.
pub struct SandboxOrchestrator<'a> {
    store: &'a dyn GovernanceStore,
    backend: &'a dyn AgentBackend,
}

impl<'a> SandboxOrchestrator<'a> {
    #[must_use]
    pub fn new(store: &'a dyn GovernanceStore, backend: &'a dyn AgentBackend) -> Self {
        Self { store, backend }
    }

    /// Execute a sandbox run and persist its full execution log. A failed run
    /// is an `Ok` summary with `status = failed` and a partial log; `Err` is
    /// reserved for store failures.
    ///
    /// # Errors
    /// Returns an error when run/event persistence fails.
    #[allow(clippy::too_many_lines)]
    pub fn run_sandbox(
        &self,
        policy_id: &str,
        policy: &Value,
        scenario: &Value,
        enterprise_id: &str,
        options: &SandboxOptions,
    ) -> Result<SandboxSummary> {
        let run_id = options.run_id.unwrap_or_default();
        let started_at = now_utc();

        let mut run = SandboxRun {
            run_id,
            policy_id: policy_id.to_string(),
            enterprise_id: enterprise_id.to_string(),
            scenario: scenario.clone(),
            status: RunStatus::Running,
            validation_passed: true,
            compliance_score: 0.0,
            risk_flags: Vec::new(),
            ai_insights: Vec::new(),
            agent_metadata: Value::Object(Map::default()),
            overall_confidence: 0.0,
            started_at,
            ended_at: None,
        };
        self.store.insert_run(&run)?;

        record_event(
            self.store,
            GovernanceEventType::RunStarted,
            &run_id.to_string(),
            enterprise_id,
            "system",
            "sandbox_orchestrator",
            json!({
                "policy_id": policy_id,
                "engine_version": options.engine_version,
                "backend": self.backend.backend_name(),
                "workspace_id": options.workspace_id,
                "user_id": options.user_id,
            }),
        )?;

        let mut prior_outputs = Map::new();
        let mut confidences: Vec<f64> = Vec::new();
        let mut steps_completed = 0_usize;
        let mut steps_failed = 0_usize;
        let mut steps_executed = 0_usize;
        let mut cancelled = false;
        let mut fatal_failure = false;

        for (step_index, step) in SANDBOX_STEPS.iter().enumerate() {
            if options
                .cancel
                .as_ref()
                .is_some_and(CancelFlag::is_cancelled)
            {
                cancelled = true;
                break;
            }
            steps_executed += 1;

            let mut payload = Map::new();
            payload.insert("policy".to_string(), policy.clone());
            payload.insert("scenario".to_string(), scenario.clone());
            for (key, value) in &prior_outputs {
                payload.insert(key.clone(), value.clone());
            }
            let payload = Value::Object(payload);

            let input_hash = hash_json(&json!({
                "policy_id": policy_id,
                "agent": step.agent,
                "action": step.action,
                "payload": payload,
            }))?;

            let request = AgentTaskRequest {
                run_id,
                agent: step.agent.to_string(),
                action: step.action.to_string(),
                policy_id: policy_id.to_string(),
                enterprise_id: enterprise_id.to_string(),
                payload,
                params: options.agent_params.clone(),
                input_hash,
            };

            // A backend can fail two ways: an in-protocol failure (`Ok` with
            // a call record marked failed, e.g. an HTTP error status) or a
            // transport-level `Err` with no response to record. Both feed the
            // same per-step failure policy; only the former leaves a call
            // record behind.
            let step_result = match self.backend.invoke(&request) {
                Ok(invocation) => {
                    self.store.append_agent_call(run_id, &invocation.call)?;
                    if invocation.call.status == "succeeded" {
                        Ok(invocation)
                    } else {
                        Err(invocation
                            .call
                            .error_text
                            .clone()
                            .unwrap_or_else(|| "agent call failed".to_string()))
                    }
                }
                Err(err) => Err(err.to_string()),
            };

            match step_result {
                Ok(invocation) => {
                    self.store.append_task_result(
                        run_id,
                        &AgentTaskResult {
                            agent: step.agent.to_string(),
                            action: step.action.to_string(),
                            status: TaskStatus::Completed,
                            result: Some(invocation.result.clone()),
                            error: None,
                            confidence: invocation.confidence,
                            recorded_at: now_utc(),
                        },
                    )?;
                    record_event(
                        self.store,
                        GovernanceEventType::AgentInvoked,
                        &run_id.to_string(),
                        enterprise_id,
                        "agent",
                        step.agent,
                        json!({
                            "action": step.action,
                            "status": "completed",
                            "confidence": invocation.confidence,
                            "response_hash": invocation.call.response_hash,
                        }),
                    )?;

                    if let Some(confidence) = invocation.confidence {
                        confidences.push(confidence);
                    }
                    steps_completed += 1;
                    apply_step_result(&mut run, &mut prior_outputs, step_index, &invocation.result);
                }
                Err(message) => {
                    let failure = GovernanceError::AgentCallFailure {
                        agent: step.agent.to_string(),
                        action: step.action.to_string(),
                        message,
                    };
                    tracing::warn!(
                        run_id = %run_id,
                        agent = step.agent,
                        action = step.action,
                        fatal = step.policy == FailurePolicy::Fatal,
                        "sandbox step failed"
                    );
                    self.store.append_task_result(
                        run_id,
                        &AgentTaskResult {
                            agent: step.agent.to_string(),
                            action: step.action.to_string(),
                            status: TaskStatus::Failed,
                            result: None,
                            error: Some(failure.to_string()),
                            confidence: None,
                            recorded_at: now_utc(),
                        },
                    )?;
                    record_event(
                        self.store,
                        GovernanceEventType::AgentInvoked,
                        &run_id.to_string(),
                        enterprise_id,
                        "agent",
                        step.agent,
                        json!({
                            "action": step.action,
                            "status": "failed",
                            "error": failure.to_string(),
                        }),
                    )?;

                    steps_failed += 1;
                    if step_index == 0 {
                        run.validation_passed = false;
                    }
                    if step.policy == FailurePolicy::Fatal {
                        fatal_failure = true;
                        break;
                    }
                }
            }
        }

        run.overall_confidence = if confidences.is_empty() {
            0.0
        } else {
            let count = u32::try_from(confidences.len()).unwrap_or(u32::MAX);
            confidences.iter().sum::<f64>() / f64::from(count)
        };
        run.agent_metadata = json!({
            "engine_version": options.engine_version,
            "backend": self.backend.backend_name(),
            "steps_executed": steps_executed,
            "cancelled": cancelled,
        });
        run.ended_at = Some(now_utc());

        let status = if fatal_failure || cancelled {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        run.status = status;
        self.store.finalize_run(&run, status)?;

        record_event(
            self.store,
            GovernanceEventType::RunFinished,
            &run_id.to_string(),
            enterprise_id,
            "system",
            "sandbox_orchestrator",
            json!({
                "status": status.as_str(),
                "steps_completed": steps_completed,
                "steps_failed": steps_failed,
                "cancelled": cancelled,
                "compliance_score": run.compliance_score,
                "overall_confidence": run.overall_confidence,
            }),
        )?;

        Ok(SandboxSummary {
            run_id,
            status,
            steps_total: SANDBOX_STEPS.len(),
            steps_completed,
            steps_failed,
            compliance_score: run.compliance_score,
            overall_confidence: run.overall_confidence,
        })
    }

    /// Reconstruct and verify the governance-event hash chain for an entity.
    ///
    /// # Errors
    /// Returns an error when event rows cannot be read.
    pub fn replay_audit(&self, entity_id: &str) -> Result<ReplayReport> {
        let events = self.store.list_events_for_entity(entity_id)?;
        let mut prev: Option<String> = None;
        for row in &events {
            if row.event.prev_event_hash != prev {
                return Ok(ReplayReport {
                    entity_id: entity_id.to_string(),
                    events: events.len(),
                    chain_valid: false,
                });
            }
            prev = Some(row.event.event_hash.clone());
        }

        Ok(ReplayReport {
            entity_id: entity_id.to_string(),
            events: events.len(),
            chain_valid: true,
        })
    }
}

fn apply_step_result(
    run: &mut SandboxRun,
    prior_outputs: &mut Map<String, Value>,
    step_index: usize,
    result: &Value,
) {
    match step_index {
        0 => {
            run.validation_passed = result.get("valid").and_then(Value::as_bool).unwrap_or(true);
            prior_outputs.insert("validation".to_string(), result.clone());
        }
        1 => {
            if let Some(score) = result.get("compliance_score").and_then(Value::as_f64) {
                run.compliance_score = score;
            }
            run.risk_flags
                .extend(flags_from_value(result.get("risk_flags"), "sandbox.simulate"));
            run.ai_insights.extend(insights_from(result));
            prior_outputs.insert("simulation".to_string(), result.clone());
        }
        2 => {
            if let Some(score) = result.get("compliance_score").and_then(Value::as_f64) {
                run.compliance_score = score;
            }
            run.ai_insights.extend(insights_from(result));
            prior_outputs.insert("scoring".to_string(), result.clone());
        }
        _ => {
            run.risk_flags.extend(flags_from_value(
                result.get("anomalies"),
                "monitoring.detect_anomalies",
            ));
            run.ai_insights.extend(insights_from(result));
            prior_outputs.insert("monitoring".to_string(), result.clone());
        }
    }
}

fn flags_from_value(value: Option<&Value>, default_source: &str) -> Vec<RiskFlag> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| RiskFlag {
            severity: item
                .get("severity")
                .and_then(Value::as_str)
                .and_then(FlagSeverity::parse)
                .unwrap_or(FlagSeverity::Medium),
            code: item
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unclassified")
                .to_string(),
            message: item
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            source: item
                .get("source")
                .and_then(Value::as_str)
                .unwrap_or(default_source)
                .to_string(),
        })
        .collect()
}

fn insights_from(result: &Value) -> Vec<String> {
    result
        .get("recommendations")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Append one governance event, threading the entity's hash chain through
/// the store. This is the single emission path: no engine operation returns
/// before its event is recorded.
///
/// # Errors
/// Returns an error when hashing or persistence fails.
#[allow(clippy::too_many_arguments)]
pub fn record_event(
    store: &dyn GovernanceStore,
    event_type: GovernanceEventType,
    entity_id: &str,
    enterprise_id: &str,
    actor_type: &str,
    actor_id: &str,
    payload_json: Value,
) -> Result<EventRow> {
    let occurred_at = now_utc();
    let recorded_at = now_utc();
    let payload_hash = hash_json(&payload_json)?;
    let event_id = Ulid::new();
    let prev_event_hash = store.last_event_hash(entity_id)?;

    let material = json!({
        "event_id": event_id.to_string(),
        "event_type": event_type.as_str(),
        "entity_id": entity_id,
        "enterprise_id": enterprise_id,
        "occurred_at": format_rfc3339(occurred_at)?,
        "recorded_at": format_rfc3339(recorded_at)?,
        "actor_type": actor_type,
        "actor_id": actor_id,
        "payload_hash": payload_hash,
        "prev_event_hash": prev_event_hash,
    });
    let event_hash = hash_json(&material)?;

    let event = GovernanceEvent {
        event_id,
        event_type,
        entity_id: entity_id.to_string(),
        enterprise_id: enterprise_id.to_string(),
        occurred_at,
        recorded_at,
        actor_type: actor_type.to_string(),
        actor_id: actor_id.to_string(),
        payload_json,
        payload_hash,
        prev_event_hash,
        event_hash,
    };

    let event_seq = store.append_event(&event)?;
    Ok(EventRow { event_seq, event })
}

#[cfg(test)]
mod tests {
    use super::{
        bottleneck_stages, estimated_completion, CancelFlag, PipelineEngine, PipelineOptions,
        SandboxOptions, SandboxOrchestrator, StartApprovalRequest,
    };
    use governance_center_agents::{AgentBackend, AgentInvocation, AgentTaskRequest, MockAgentBackend};
    use governance_center_domain::{
        now_utc, ConfigId, GovernanceError, GovernanceEventType, PipelineStatus, RunStatus,
        StageStatus, SubmissionContext, TaskStatus, WorkflowConfig,
    };
    use governance_center_store_core::GovernanceStore;
    use governance_center_store_sqlite::SqliteGovernanceStore;
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, BTreeSet};
    use time::Duration;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "governance-orchestrator-test-{}-{}.sqlite",
            name,
            ulid::Ulid::new()
        ))
    }

    fn open_store(name: &str) -> SqliteGovernanceStore {
        let store = SqliteGovernanceStore::open(&temp_db_path(name));
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        store
    }

    fn fixture_config(chain: &[&str]) -> WorkflowConfig {
        WorkflowConfig {
            config_id: ConfigId::new(),
            agency_id: "agency-a".to_string(),
            client_id: "client-b".to_string(),
            brand_id: None,
            approval_chain: chain.iter().map(ToString::to_string).collect(),
            parallel_approvals: false,
            skip_preapproval: false,
            escalation_timeout_hours: 72.0,
            auto_approve_low_risk: false,
            require_compliance_review: false,
            require_legal_review: false,
            skip_logic: Vec::new(),
            conditional_routing: Vec::new(),
            priority: 5,
            is_active: true,
            created_at: now_utc(),
        }
    }

    fn seed_config(store: &SqliteGovernanceStore, config: &WorkflowConfig) {
        assert!(store
            .upsert_config_pack_snapshot("test-pack", "yaml", "source-hash", &json!({}))
            .is_ok());
        assert!(store.upsert_config("test-pack", config).is_ok());
    }

    fn fixture_request(document_id: &str, risk_score: f64) -> StartApprovalRequest {
        StartApprovalRequest {
            document_id: document_id.to_string(),
            agency_id: "agency-a".to_string(),
            client_id: "client-b".to_string(),
            brand_id: None,
            enterprise_id: "ent-1".to_string(),
            context: SubmissionContext {
                risk_score,
                requestor_role: "analyst".to_string(),
                attributes: BTreeMap::default(),
            },
            options: PipelineOptions::default(),
        }
    }

    struct FailingBackend {
        inner: MockAgentBackend,
        fail: BTreeSet<(String, String)>,
    }

    impl FailingBackend {
        fn failing_on(pairs: &[(&str, &str)]) -> Self {
            Self {
                inner: MockAgentBackend::new(),
                fail: pairs
                    .iter()
                    .map(|(agent, action)| ((*agent).to_string(), (*action).to_string()))
                    .collect(),
            }
        }
    }

    impl AgentBackend for FailingBackend {
        fn backend_name(&self) -> &'static str {
            "scripted"
        }

        fn invoke(&self, request: &AgentTaskRequest) -> anyhow::Result<AgentInvocation> {
            if self
                .fail
                .contains(&(request.agent.clone(), request.action.clone()))
            {
                return Err(anyhow::anyhow!("scripted failure"));
            }
            self.inner.invoke(request)
        }
    }

    #[test]
    fn advance_on_four_stage_chain_reaches_fifty_percent() {
        let store = open_store("advance");
        seed_config(
            &store,
            &fixture_config(&[
                "initial_review",
                "technical_validation",
                "compliance_reviewer",
                "legal_counsel",
            ]),
        );

        let engine = PipelineEngine::new(&store);
        let outcome = engine.start_approval(&fixture_request("doc-1", 0.5));
        assert!(outcome.is_ok());
        let outcome = outcome.unwrap_or_else(|_| unreachable!());
        let pipeline = outcome.pipeline.unwrap_or_else(|| unreachable!());
        assert_eq!(pipeline.progress_percentage, 25);

        let advanced = engine.advance(
            pipeline.pipeline_id,
            "initial_review",
            "technical_validation",
        );
        assert!(advanced.is_ok());
        let advanced = advanced.unwrap_or_else(|_| unreachable!());

        assert_eq!(advanced.progress_percentage, 50);
        assert_eq!(
            advanced.current_stage.as_deref(),
            Some("technical_validation")
        );
        assert_eq!(advanced.stages[0].status, StageStatus::Completed);
        assert!(advanced.stages[0].completed_at.is_some());
        assert_eq!(advanced.stages[1].status, StageStatus::InProgress);
        assert_eq!(advanced.version, 2);
    }

    #[test]
    fn advance_to_unknown_stage_leaves_pipeline_unchanged() {
        let store = open_store("unknown-stage");
        seed_config(&store, &fixture_config(&["initial_review", "legal_counsel"]));

        let engine = PipelineEngine::new(&store);
        let outcome = engine.start_approval(&fixture_request("doc-1", 0.5));
        assert!(outcome.is_ok());
        let pipeline = outcome
            .unwrap_or_else(|_| unreachable!())
            .pipeline
            .unwrap_or_else(|| unreachable!());

        let result = engine.advance(pipeline.pipeline_id, "initial_review", "ghost_stage");
        assert!(result.is_err());
        let err = match result {
            Err(err) => err,
            Ok(_) => unreachable!(),
        };
        assert_eq!(
            err.downcast_ref::<GovernanceError>(),
            Some(&GovernanceError::UnknownStage {
                stage: "ghost_stage".to_string()
            })
        );

        let reloaded = store.get_pipeline(pipeline.pipeline_id);
        assert!(reloaded.is_ok());
        let reloaded = reloaded
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(reloaded, pipeline);
    }

    #[test]
    fn re_entrant_advance_onto_completed_stage_is_rejected() {
        let store = open_store("re-entrant");
        seed_config(
            &store,
            &fixture_config(&["initial_review", "technical_validation", "legal_counsel"]),
        );

        let engine = PipelineEngine::new(&store);
        let outcome = engine.start_approval(&fixture_request("doc-1", 0.5));
        assert!(outcome.is_ok());
        let pipeline = outcome
            .unwrap_or_else(|_| unreachable!())
            .pipeline
            .unwrap_or_else(|| unreachable!());

        assert!(engine
            .advance(
                pipeline.pipeline_id,
                "initial_review",
                "technical_validation"
            )
            .is_ok());
        assert!(engine
            .advance(
                pipeline.pipeline_id,
                "technical_validation",
                "legal_counsel"
            )
            .is_ok());

        let replay = engine.advance(
            pipeline.pipeline_id,
            "initial_review",
            "technical_validation",
        );
        assert!(replay.is_err());
        let err = match replay {
            Err(err) => err,
            Ok(_) => unreachable!(),
        };
        assert_eq!(
            err.downcast_ref::<GovernanceError>(),
            Some(&GovernanceError::StageAlreadyCompleted {
                stage: "technical_validation".to_string()
            })
        );
    }

    #[test]
    fn completing_the_last_stage_archives_the_pipeline() {
        let store = open_store("complete");
        seed_config(&store, &fixture_config(&["initial_review", "legal_counsel"]));

        let engine = PipelineEngine::new(&store);
        let outcome = engine.start_approval(&fixture_request("doc-1", 0.5));
        assert!(outcome.is_ok());
        let pipeline = outcome
            .unwrap_or_else(|_| unreachable!())
            .pipeline
            .unwrap_or_else(|| unreachable!());

        let advanced = engine.advance(pipeline.pipeline_id, "initial_review", "legal_counsel");
        assert!(advanced.is_ok());
        let advanced = advanced.unwrap_or_else(|_| unreachable!());
        assert_eq!(advanced.stages[1].status, StageStatus::InProgress);

        let finished = engine.complete_stage(pipeline.pipeline_id, "legal_counsel");
        assert!(finished.is_ok());
        let finished = finished.unwrap_or_else(|_| unreachable!());

        assert_eq!(finished.progress_percentage, 100);
        assert!(finished.completed_at.is_some());
        assert!(finished
            .stages
            .iter()
            .all(|stage| stage.status == StageStatus::Completed));

        let events = store.list_events_for_entity("doc-1");
        assert!(events.is_ok());
        let events = events.unwrap_or_else(|_| unreachable!());
        assert!(events
            .iter()
            .any(|row| row.event.event_type == GovernanceEventType::PipelineCompleted));
    }

    #[test]
    fn blocked_stage_resumes_where_it_left_off() {
        let store = open_store("block");
        seed_config(&store, &fixture_config(&["team_lead", "legal_counsel"]));

        let engine = PipelineEngine::new(&store);
        let outcome = engine.start_approval(&fixture_request("doc-7", 0.5));
        assert!(outcome.is_ok());
        let pipeline = outcome
            .unwrap_or_else(|_| unreachable!())
            .pipeline
            .unwrap_or_else(|| unreachable!());

        // team_lead already started, legal_counsel has not.
        let blocked = engine.block_stage(pipeline.pipeline_id, "team_lead");
        assert!(blocked.is_ok());
        let blocked = blocked.unwrap_or_else(|_| unreachable!());
        assert_eq!(blocked.stages[0].status, StageStatus::Blocked);

        let resumed = engine.unblock_stage(pipeline.pipeline_id, "team_lead");
        assert!(resumed.is_ok());
        let resumed = resumed.unwrap_or_else(|_| unreachable!());
        assert_eq!(resumed.stages[0].status, StageStatus::InProgress);

        let blocked = engine.block_stage(pipeline.pipeline_id, "legal_counsel");
        assert!(blocked.is_ok());
        let resumed = engine.unblock_stage(pipeline.pipeline_id, "legal_counsel");
        assert!(resumed.is_ok());
        let resumed = resumed.unwrap_or_else(|_| unreachable!());
        assert_eq!(resumed.stages[1].status, StageStatus::Pending);

        let events = store.list_events_for_entity("doc-7");
        assert!(events.is_ok());
        let events = events.unwrap_or_else(|_| unreachable!());
        assert!(events
            .iter()
            .any(|row| row.event.event_type == GovernanceEventType::StageBlocked));
        assert!(events
            .iter()
            .any(|row| row.event.event_type == GovernanceEventType::StageUnblocked));
    }

    #[test]
    fn parallel_approvals_start_every_stage_in_progress() {
        let store = open_store("parallel");
        let mut config = fixture_config(&["team_lead", "compliance_reviewer", "legal_counsel"]);
        config.parallel_approvals = true;
        seed_config(&store, &config);

        let engine = PipelineEngine::new(&store);
        let outcome = engine.start_approval(&fixture_request("doc-8", 0.5));
        assert!(outcome.is_ok());
        let pipeline = outcome
            .unwrap_or_else(|_| unreachable!())
            .pipeline
            .unwrap_or_else(|| unreachable!());

        assert!(pipeline
            .stages
            .iter()
            .all(|stage| stage.status == StageStatus::InProgress));
        assert!(pipeline
            .stages
            .iter()
            .all(|stage| stage.started_at.is_some()));

        // Each stage is signed off individually; the last sign-off archives.
        for stage in ["team_lead", "compliance_reviewer"] {
            assert!(engine.complete_stage(pipeline.pipeline_id, stage).is_ok());
        }
        let finished = engine.complete_stage(pipeline.pipeline_id, "legal_counsel");
        assert!(finished.is_ok());
        let finished = finished.unwrap_or_else(|_| unreachable!());
        assert_eq!(finished.progress_percentage, 100);
        assert!(finished.completed_at.is_some());
    }

    #[test]
    fn default_chain_is_used_when_no_config_matches() {
        let store = open_store("default-chain");
        let engine = PipelineEngine::new(&store);

        let outcome = engine.start_approval(&fixture_request("doc-9", 0.5));
        assert!(outcome.is_ok());
        let outcome = outcome.unwrap_or_else(|_| unreachable!());

        assert_eq!(outcome.config_source, "default");
        assert!(outcome.config_id.is_none());
        let pipeline = outcome.pipeline.unwrap_or_else(|| unreachable!());
        let names: Vec<&str> = pipeline
            .stages
            .iter()
            .map(|stage| stage.name.as_str())
            .collect();
        assert_eq!(names, vec!["team_lead", "compliance_reviewer"]);
    }

    #[test]
    fn auto_approval_emits_event_and_creates_no_pipeline() {
        let store = open_store("auto-approve");
        let mut config = fixture_config(&["team_lead", "compliance_reviewer"]);
        config.auto_approve_low_risk = true;
        seed_config(&store, &config);

        let engine = PipelineEngine::new(&store);
        let outcome = engine.start_approval(&fixture_request("doc-2", 0.1));
        assert!(outcome.is_ok());
        let outcome = outcome.unwrap_or_else(|_| unreachable!());

        assert!(outcome.pipeline.is_none());
        assert!(outcome.chain.auto_approved);
        assert_eq!(
            outcome.chain.skipped,
            vec!["team_lead".to_string(), "compliance_reviewer".to_string()]
        );

        let events = store.list_events_for_entity("doc-2");
        assert!(events.is_ok());
        let events = events.unwrap_or_else(|_| unreachable!());
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].event.event_type,
            GovernanceEventType::AutoApproved
        );
    }

    #[test]
    fn empty_chain_archives_immediately_without_auto_approval() {
        let store = open_store("no-review");
        seed_config(&store, &fixture_config(&[]));

        let engine = PipelineEngine::new(&store);
        let outcome = engine.start_approval(&fixture_request("doc-6", 0.9));
        assert!(outcome.is_ok());
        let outcome = outcome.unwrap_or_else(|_| unreachable!());

        assert!(!outcome.chain.auto_approved);
        let pipeline = outcome.pipeline.unwrap_or_else(|| unreachable!());
        assert!(pipeline.stages.is_empty());
        assert_eq!(pipeline.status, PipelineStatus::Completed);
        assert_eq!(pipeline.progress_percentage, 100);
        assert!(pipeline.completed_at.is_some());

        let events = store.list_events_for_entity("doc-6");
        assert!(events.is_ok());
        let events = events.unwrap_or_else(|_| unreachable!());
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].event.event_type,
            GovernanceEventType::PipelineCreated
        );
        assert_eq!(
            events[0].event.payload_json.get("no_review_required"),
            Some(&serde_json::Value::Bool(true))
        );
    }

    #[test]
    fn flags_refresh_detects_bottleneck_then_escalation() {
        let store = open_store("flags");
        seed_config(&store, &fixture_config(&["team_lead", "legal_counsel"]));

        let engine = PipelineEngine::new(&store);
        let outcome = engine.start_approval(&fixture_request("doc-3", 0.5));
        assert!(outcome.is_ok());
        let pipeline = outcome
            .unwrap_or_else(|_| unreachable!())
            .pipeline
            .unwrap_or_else(|| unreachable!());

        // team_lead estimate is 8h; past it but inside the 72h SLA.
        let later = now_utc() + Duration::hours(10);
        assert_eq!(bottleneck_stages(&pipeline, later), vec!["team_lead"]);
        let refreshed = engine.refresh_flags(pipeline.pipeline_id, later);
        assert!(refreshed.is_ok());
        let refreshed = refreshed.unwrap_or_else(|_| unreachable!());
        assert!(refreshed.bottleneck_detected);
        assert!(!refreshed.escalation_triggered);

        let much_later = now_utc() + Duration::hours(80);
        let escalated = engine.refresh_flags(pipeline.pipeline_id, much_later);
        assert!(escalated.is_ok());
        assert!(escalated.unwrap_or_else(|_| unreachable!()).escalation_triggered);

        let events = store.list_events_for_entity("doc-3");
        assert!(events.is_ok());
        let events = events.unwrap_or_else(|_| unreachable!());
        assert!(events
            .iter()
            .any(|row| row.event.event_type == GovernanceEventType::EscalationTriggered));
    }

    #[test]
    fn estimated_completion_sums_remaining_stage_hours() {
        let store = open_store("estimate");
        seed_config(&store, &fixture_config(&["team_lead", "legal_counsel"]));

        let engine = PipelineEngine::new(&store);
        let outcome = engine.start_approval(&fixture_request("doc-4", 0.5));
        assert!(outcome.is_ok());
        let pipeline = outcome
            .unwrap_or_else(|_| unreachable!())
            .pipeline
            .unwrap_or_else(|| unreachable!());

        let now = now_utc();
        let estimate = estimated_completion(&pipeline, now);
        // 8h for team_lead + 24h for legal_counsel.
        assert_eq!(estimate, Some(now + Duration::hours(32)));
    }

    #[test]
    fn sandbox_run_succeeds_with_full_execution_log() {
        let store = open_store("sandbox-ok");
        let backend = MockAgentBackend::new();
        let orchestrator = SandboxOrchestrator::new(&store, &backend);

        let summary = orchestrator.run_sandbox(
            "policy-1",
            &json!({"name": "AI usage policy"}),
            &json!({"tool_type": "chatbot", "use_case": "ad_copy"}),
            "ent-1",
            &SandboxOptions::default(),
        );
        assert!(summary.is_ok());
        let summary = summary.unwrap_or_else(|_| unreachable!());

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.steps_completed, 4);
        assert_eq!(summary.steps_failed, 0);

        let log = store.list_task_results(summary.run_id);
        assert!(log.is_ok());
        let log = log.unwrap_or_else(|_| unreachable!());
        assert_eq!(log.len(), 4);
        assert!(log.iter().all(|entry| entry.status == TaskStatus::Completed));

        let mean: f64 = log
            .iter()
            .filter_map(|entry| entry.confidence)
            .sum::<f64>()
            / 4.0;
        assert!((summary.overall_confidence - mean).abs() < 1e-9);

        let entity = summary.run_id.to_string();
        let events = store.list_events_for_entity(&entity);
        assert!(events.is_ok());
        let events = events.unwrap_or_else(|_| unreachable!());
        // run_started + 4 agent_invoked + run_finished
        assert_eq!(events.len(), 6);

        let report = orchestrator.replay_audit(&entity);
        assert!(report.is_ok());
        assert!(report.unwrap_or_else(|_| unreachable!()).chain_valid);
    }

    #[test]
    fn simulation_failure_aborts_the_run_after_two_log_entries() {
        let store = open_store("sandbox-fatal");
        let backend = FailingBackend::failing_on(&[("sandbox", "simulate")]);
        let orchestrator = SandboxOrchestrator::new(&store, &backend);

        let summary = orchestrator.run_sandbox(
            "policy-1",
            &json!({}),
            &json!({"tool_type": "chatbot"}),
            "ent-1",
            &SandboxOptions::default(),
        );
        assert!(summary.is_ok());
        let summary = summary.unwrap_or_else(|_| unreachable!());

        assert_eq!(summary.status, RunStatus::Failed);

        let log = store.list_task_results(summary.run_id);
        assert!(log.is_ok());
        let log = log.unwrap_or_else(|_| unreachable!());
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].agent, "policy");
        assert_eq!(log[0].status, TaskStatus::Completed);
        assert_eq!(log[1].agent, "sandbox");
        assert_eq!(log[1].status, TaskStatus::Failed);

        // The terminal governance event is recorded even on the fatal path.
        let events = store.list_events_for_entity(&summary.run_id.to_string());
        assert!(events.is_ok());
        let events = events.unwrap_or_else(|_| unreachable!());
        assert!(events
            .iter()
            .any(|row| row.event.event_type == GovernanceEventType::RunFinished));

        let run = store.get_run(summary.run_id);
        assert!(run.is_ok());
        let run = run
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn scoring_failure_falls_back_to_the_simulation_score() {
        let store = open_store("sandbox-advisory");
        let backend = FailingBackend::failing_on(&[("compliance-scoring", "score")]);
        let orchestrator = SandboxOrchestrator::new(&store, &backend);

        let summary = orchestrator.run_sandbox(
            "policy-1",
            &json!({}),
            &json!({"tool_type": "chatbot"}),
            "ent-1",
            &SandboxOptions::default(),
        );
        assert!(summary.is_ok());
        let summary = summary.unwrap_or_else(|_| unreachable!());

        assert_eq!(summary.status, RunStatus::Completed);

        let log = store.list_task_results(summary.run_id);
        assert!(log.is_ok());
        let log = log.unwrap_or_else(|_| unreachable!());
        assert_eq!(log.len(), 4);
        assert_eq!(log[2].agent, "compliance-scoring");
        assert_eq!(log[2].status, TaskStatus::Failed);

        let simulation_score = log[1]
            .result
            .as_ref()
            .and_then(|result| result.get("compliance_score"))
            .and_then(Value::as_f64);
        assert!(simulation_score.is_some());
        assert_eq!(Some(summary.compliance_score), simulation_score);
    }

    /// Backend that answers the monitoring step with a call record marked
    /// failed, the way the HTTP backend reports an endpoint error status.
    struct EndpointErrorBackend {
        inner: MockAgentBackend,
    }

    impl AgentBackend for EndpointErrorBackend {
        fn backend_name(&self) -> &'static str {
            "endpoint-error"
        }

        fn invoke(&self, request: &AgentTaskRequest) -> anyhow::Result<AgentInvocation> {
            let mut invocation = self.inner.invoke(request)?;
            if request.agent == "monitoring" {
                invocation.call.status = "failed".to_string();
                invocation.call.error_text = Some("http status 502".to_string());
                invocation.result = Value::Null;
                invocation.confidence = None;
            }
            Ok(invocation)
        }
    }

    #[test]
    fn endpoint_error_marks_the_step_failed_instead_of_aborting_the_run() {
        let store = open_store("sandbox-endpoint");
        let backend = EndpointErrorBackend {
            inner: MockAgentBackend::new(),
        };
        let orchestrator = SandboxOrchestrator::new(&store, &backend);

        let summary = orchestrator.run_sandbox(
            "policy-1",
            &json!({}),
            &json!({"tool_type": "chatbot"}),
            "ent-1",
            &SandboxOptions::default(),
        );
        assert!(summary.is_ok());
        let summary = summary.unwrap_or_else(|_| unreachable!());

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.steps_failed, 1);

        let log = store.list_task_results(summary.run_id);
        assert!(log.is_ok());
        let log = log.unwrap_or_else(|_| unreachable!());
        assert_eq!(log.len(), 4);
        assert_eq!(log[3].agent, "monitoring");
        assert_eq!(log[3].status, TaskStatus::Failed);
        assert!(log[3]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("http status 502")));
    }

    #[test]
    fn cancelled_run_is_finalized_failed_with_partial_log() {
        let store = open_store("sandbox-cancel");
        let backend = MockAgentBackend::new();
        let orchestrator = SandboxOrchestrator::new(&store, &backend);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let options = SandboxOptions {
            cancel: Some(cancel),
            ..SandboxOptions::default()
        };

        let summary = orchestrator.run_sandbox(
            "policy-1",
            &json!({}),
            &json!({}),
            "ent-1",
            &options,
        );
        assert!(summary.is_ok());
        let summary = summary.unwrap_or_else(|_| unreachable!());

        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.steps_completed, 0);

        let events = store.list_events_for_entity(&summary.run_id.to_string());
        assert!(events.is_ok());
        let events = events.unwrap_or_else(|_| unreachable!());
        assert!(events
            .iter()
            .any(|row| row.event.event_type == GovernanceEventType::RunFinished));
    }
}
