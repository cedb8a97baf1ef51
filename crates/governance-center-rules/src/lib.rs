#![forbid(unsafe_code)]

use governance_center_domain::{SubmissionContext, WorkflowConfig};
use serde::Serialize;

pub const COMPLIANCE_REVIEWER: &str = "compliance_reviewer";
pub const LEGAL_COUNSEL: &str = "legal_counsel";
pub const PREAPPROVAL_REVIEWER: &str = "preapproval_reviewer";

/// Risk score below which `auto_approve_low_risk` short-circuits the chain.
pub const AUTO_APPROVE_RISK_CEILING: f64 = 0.3;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
}

impl CompareOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Eq => "==",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            ">=" => Some(Self::Ge),
            "<=" => Some(Self::Le),
            "==" => Some(Self::Eq),
            _ => None,
        }
    }
}

/// A parsed skip/routing condition. The language is exactly two matched
/// shapes; anything that does not parse evaluates to false (fail-closed),
/// so a malformed rule can never grant a skip or an extra route.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Condition {
    RoleEquals { role: String },
    RiskCompare { op: CompareOp, value: f64 },
}

/// Parse one condition string. Recognized shapes:
/// `requestor_role == '<value>'` (single or double quotes) and
/// `risk_score <op> <number>` with op one of `>`, `<`, `>=`, `<=`, `==`.
#[must_use]
pub fn parse_condition(raw: &str) -> Option<Condition> {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("requestor_role") {
        let rest = rest.trim_start().strip_prefix("==")?.trim();
        let role = parse_quoted(rest)?;
        if role.is_empty() {
            return None;
        }
        return Some(Condition::RoleEquals {
            role: role.to_string(),
        });
    }

    if let Some(rest) = trimmed.strip_prefix("risk_score") {
        let rest = rest.trim_start();
        // Two-character operators first so `>` does not shadow `>=`.
        for op_text in [">=", "<=", "==", ">", "<"] {
            if let Some(number) = rest.strip_prefix(op_text) {
                let op = CompareOp::parse(op_text)?;
                let value: f64 = number.trim().parse().ok()?;
                return Some(Condition::RiskCompare { op, value });
            }
        }
        return None;
    }

    None
}

fn parse_quoted(value: &str) -> Option<&str> {
    let inner = value
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
        .or_else(|| {
            value
                .strip_prefix('"')
                .and_then(|rest| rest.strip_suffix('"'))
        })?;
    Some(inner)
}

/// Evaluate a parsed condition against a submission context. Pure and
/// deterministic: the same (condition, context) pair always yields the same
/// boolean, and evaluation never errors.
#[must_use]
pub fn evaluate(condition: &Condition, context: &SubmissionContext) -> bool {
    match condition {
        Condition::RoleEquals { role } => context.requestor_role == *role,
        Condition::RiskCompare { op, value } => match op {
            CompareOp::Gt => context.risk_score > *value,
            CompareOp::Lt => context.risk_score < *value,
            CompareOp::Ge => context.risk_score >= *value,
            CompareOp::Le => context.risk_score <= *value,
            CompareOp::Eq => (context.risk_score - *value).abs() < f64::EPSILON,
        },
    }
}

/// Parse-and-evaluate convenience for raw rule text. Malformed input is
/// "condition not satisfied", never an error.
#[must_use]
pub fn evaluate_raw(raw: &str, context: &SubmissionContext) -> bool {
    parse_condition(raw).is_some_and(|condition| evaluate(&condition, context))
}

/// A skip/routing rule with its condition parsed once at compile time.
/// `condition` is `None` when the raw text did not match a known shape.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompiledRule {
    pub raw: String,
    pub condition: Option<Condition>,
    pub steps: Vec<String>,
}

impl CompiledRule {
    #[must_use]
    pub fn holds(&self, context: &SubmissionContext) -> bool {
        self.condition
            .as_ref()
            .is_some_and(|condition| evaluate(condition, context))
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CompiledRules {
    pub skip: Vec<CompiledRule>,
    pub routing: Vec<CompiledRule>,
}

/// Parse every rule condition in a config once, ahead of evaluation.
#[must_use]
pub fn compile_rules(config: &WorkflowConfig) -> CompiledRules {
    CompiledRules {
        skip: config
            .skip_logic
            .iter()
            .map(|rule| CompiledRule {
                raw: rule.condition.clone(),
                condition: parse_condition(&rule.condition),
                steps: rule.skip_steps.clone(),
            })
            .collect(),
        routing: config
            .conditional_routing
            .iter()
            .map(|rule| CompiledRule {
                raw: rule.condition.clone(),
                condition: parse_condition(&rule.condition),
                steps: rule.add_steps.clone(),
            })
            .collect(),
    }
}

/// The effective approval chain for one submission, plus the audit trail of
/// how it differs from the configured base chain. `skipped` and `added` are
/// cumulative: a role removed by one rule and re-added by a later rule
/// appears in both, which approval-history displays rely on.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChainBuildResult {
    pub steps: Vec<String>,
    pub skipped: Vec<String>,
    pub added: Vec<String>,
    pub auto_approved: bool,
}

/// Build the effective chain for `context` under `config`.
#[must_use]
pub fn build_chain(config: &WorkflowConfig, context: &SubmissionContext) -> ChainBuildResult {
    let rules = compile_rules(config);
    build_chain_compiled(config, &rules, context)
}

/// Rule application order is load-bearing: skips run before routing so a
/// routing rule can re-add a role a skip removed, mandatory reviews append
/// after both, and the auto-approve check runs last so the returned
/// `skipped` names the chain that was bypassed.
#[must_use]
pub fn build_chain_compiled(
    config: &WorkflowConfig,
    rules: &CompiledRules,
    context: &SubmissionContext,
) -> ChainBuildResult {
    let mut steps = config.approval_chain.clone();
    let mut skipped: Vec<String> = Vec::new();
    let mut added: Vec<String> = Vec::new();

    if config.skip_preapproval {
        remove_role(&mut steps, PREAPPROVAL_REVIEWER, &mut skipped);
    }

    for rule in &rules.skip {
        if !rule.holds(context) {
            continue;
        }
        for role in &rule.steps {
            remove_role(&mut steps, role, &mut skipped);
        }
    }

    for rule in &rules.routing {
        if !rule.holds(context) {
            continue;
        }
        for role in &rule.steps {
            steps.push(role.clone());
            added.push(role.clone());
        }
    }

    if config.require_compliance_review && !steps.iter().any(|role| role == COMPLIANCE_REVIEWER) {
        steps.push(COMPLIANCE_REVIEWER.to_string());
        added.push(COMPLIANCE_REVIEWER.to_string());
    }

    if config.require_legal_review && !steps.iter().any(|role| role == LEGAL_COUNSEL) {
        steps.push(LEGAL_COUNSEL.to_string());
        added.push(LEGAL_COUNSEL.to_string());
    }

    if config.auto_approve_low_risk && context.risk_score < AUTO_APPROVE_RISK_CEILING {
        return ChainBuildResult {
            steps: Vec::new(),
            skipped: steps,
            added: Vec::new(),
            auto_approved: true,
        };
    }

    ChainBuildResult {
        steps,
        skipped,
        added,
        auto_approved: false,
    }
}

fn remove_role(steps: &mut Vec<String>, role: &str, skipped: &mut Vec<String>) {
    let before = steps.len();
    steps.retain(|step| step != role);
    for _ in 0..(before - steps.len()) {
        skipped.push(role.to_string());
    }
}
