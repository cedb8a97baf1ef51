#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use governance_center_domain::{
    ensure_non_empty, hash_bytes, hash_json, ConfigId, ConfigPack, ConfigPackEnvelope,
    GovernanceError, RoleArchetype, WorkflowConfig,
};
use governance_center_rules::{parse_condition, COMPLIANCE_REVIEWER, LEGAL_COUNSEL};

const NORMALIZATION_VERSION: u32 = 1;

/// Non-fatal validation finding. Malformed conditions are warnings, not
/// errors: they fail-closed at evaluation, so an operator typo can only ever
/// withhold a skip or a route, never grant one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub config_id: ConfigId,
    pub message: String,
}

/// Load a config pack from disk and normalize it into canonical form.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, validated, or
/// normalized.
pub fn load_config_pack_from_path(path: &Path) -> Result<ConfigPackEnvelope> {
    let content = fs::read_to_string(path)?;
    normalize_config_pack_yaml(&content)
}

/// Normalize config-pack YAML into deterministic canonical JSON + hash.
///
/// # Errors
/// Returns an error when YAML parsing, validation, or serialization fails.
pub fn normalize_config_pack_yaml(yaml: &str) -> Result<ConfigPackEnvelope> {
    let source_yaml_hash = hash_bytes(yaml.as_bytes());
    let mut pack: ConfigPack = serde_yaml::from_str(yaml)
        .map_err(|err| GovernanceError::InvalidConfig(format!("invalid config pack YAML: {err}")))?;

    validate_config_pack(&pack).map_err(|err| GovernanceError::InvalidConfig(err.to_string()))?;
    normalize_config_pack(&mut pack);
    validate_config_pack(&pack).map_err(|err| GovernanceError::InvalidConfig(err.to_string()))?;

    let normalized_json = serde_json::to_value(&pack)?;
    let normalized_hash = hash_json(&normalized_json)?;

    Ok(ConfigPackEnvelope {
        source_format: "yaml".to_string(),
        source_yaml_hash,
        normalized_hash,
        pack,
        normalized_json,
    })
}

/// Structural validation of a config pack before it is persisted/activated.
/// Referential integrity (every chain entry resolves to a role archetype)
/// and contradictory skip/routing pairs are hard errors; unparseable
/// conditions are returned as warnings.
///
/// # Errors
/// Returns an error describing the first structural defect found.
pub fn validate_config_pack(pack: &ConfigPack) -> Result<Vec<ValidationWarning>> {
    ensure_non_empty("pack_name", &pack.pack_name)?;
    ensure_non_empty("pack_version", &pack.pack_version)?;

    let mut role_ids = BTreeSet::new();
    for role in &pack.roles {
        validate_role(role)?;
        if !role_ids.insert(role.role_id.clone()) {
            return Err(anyhow!("duplicate role_id: {}", role.role_id));
        }
    }

    let role_id_set: BTreeSet<&str> = pack.roles.iter().map(|role| role.role_id.as_str()).collect();

    let mut warnings = Vec::new();
    let mut config_ids = BTreeSet::new();
    for config in &pack.configs {
        if !config_ids.insert(config.config_id) {
            return Err(anyhow!("duplicate config_id: {}", config.config_id));
        }
        validate_config(config, &role_id_set, &mut warnings)?;
    }

    Ok(warnings)
}

fn validate_role(role: &RoleArchetype) -> Result<()> {
    ensure_non_empty("role_id", &role.role_id)?;
    ensure_non_empty("display_name", &role.display_name)?;
    Ok(())
}

fn validate_config(
    config: &WorkflowConfig,
    role_ids: &BTreeSet<&str>,
    warnings: &mut Vec<ValidationWarning>,
) -> Result<()> {
    ensure_non_empty("agency_id", &config.agency_id)?;
    ensure_non_empty("client_id", &config.client_id)?;
    if let Some(brand_id) = &config.brand_id {
        ensure_non_empty("brand_id", brand_id)?;
    }

    if config.escalation_timeout_hours <= 0.0 {
        return Err(anyhow!(
            "config {} escalation_timeout_hours MUST be positive",
            config.config_id
        ));
    }
    if config.priority < 0 {
        return Err(anyhow!(
            "config {} priority MUST be non-negative",
            config.config_id
        ));
    }

    for role in &config.approval_chain {
        require_known_role(config, role_ids, role, "approval_chain")?;
    }
    for rule in &config.skip_logic {
        for role in &rule.skip_steps {
            require_known_role(config, role_ids, role, "skip_logic")?;
        }
        if parse_condition(&rule.condition).is_none() {
            warnings.push(ValidationWarning {
                config_id: config.config_id,
                message: format!(
                    "skip_logic condition '{}' matches no known shape and will never fire",
                    rule.condition
                ),
            });
        }
    }
    for rule in &config.conditional_routing {
        for role in &rule.add_steps {
            require_known_role(config, role_ids, role, "conditional_routing")?;
        }
        if parse_condition(&rule.condition).is_none() {
            warnings.push(ValidationWarning {
                config_id: config.config_id,
                message: format!(
                    "conditional_routing condition '{}' matches no known shape and will never fire",
                    rule.condition
                ),
            });
        }
    }

    if config.require_compliance_review {
        require_known_role(config, role_ids, COMPLIANCE_REVIEWER, "require_compliance_review")?;
    }
    if config.require_legal_review {
        require_known_role(config, role_ids, LEGAL_COUNSEL, "require_legal_review")?;
    }

    detect_contradictory_routing(config)?;

    Ok(())
}

fn require_known_role(
    config: &WorkflowConfig,
    role_ids: &BTreeSet<&str>,
    role: &str,
    location: &str,
) -> Result<()> {
    if !role_ids.contains(role) {
        return Err(anyhow!(
            "config {} {location} references unknown role {role}",
            config.config_id
        ));
    }
    Ok(())
}

/// A skip rule and a routing rule with the identical condition string that
/// share a step would remove and re-add the step on every matching
/// submission. That is always an authoring mistake, so the pack is rejected.
fn detect_contradictory_routing(config: &WorkflowConfig) -> Result<()> {
    for skip_rule in &config.skip_logic {
        let skip_steps: BTreeSet<&str> =
            skip_rule.skip_steps.iter().map(String::as_str).collect();
        for routing_rule in &config.conditional_routing {
            if skip_rule.condition != routing_rule.condition {
                continue;
            }
            if let Some(role) = routing_rule
                .add_steps
                .iter()
                .find(|role| skip_steps.contains(role.as_str()))
            {
                return Err(anyhow!(
                    "config {} has contradictory routing: condition '{}' both skips and adds {role}",
                    config.config_id,
                    skip_rule.condition
                ));
            }
        }
    }
    Ok(())
}

fn normalize_config_pack(pack: &mut ConfigPack) {
    pack.normalization_version = NORMALIZATION_VERSION;

    pack.roles
        .sort_by(|lhs, rhs| lhs.role_id.cmp(&rhs.role_id));
    for role in &mut pack.roles {
        role.role_id = role.role_id.trim().to_string();
        role.display_name = role.display_name.trim().to_string();
    }

    // Config order inside the pack is canonicalized by id; precedence between
    // configs is decided at resolve time, not by file order. Rule order inside
    // a config is semantic and left untouched.
    pack.configs.sort_by_key(|config| config.config_id);
    for config in &mut pack.configs {
        config.agency_id = config.agency_id.trim().to_string();
        config.client_id = config.client_id.trim().to_string();
        config.brand_id = config
            .brand_id
            .take()
            .map(|brand| brand.trim().to_string());
    }
}

/// Select the single effective config for an (agency, client, brand?) scope.
///
/// Candidates are the active configs whose agency and client match and whose
/// brand scope is either null (all brands under the client) or the requested
/// brand. Precedence: priority desc, then brand specificity desc (a config
/// pinned to the requested brand outranks a null-brand config at equal
/// priority), then `created_at` desc. Returns `None` when nothing matches;
/// the caller falls back to the default chain rather than failing.
#[must_use]
pub fn resolve_config<'a>(
    configs: &'a [WorkflowConfig],
    agency_id: &str,
    client_id: &str,
    brand_id: Option<&str>,
) -> Option<&'a WorkflowConfig> {
    let mut candidates: Vec<&WorkflowConfig> = configs
        .iter()
        .filter(|config| {
            config.is_active
                && config.agency_id == agency_id
                && config.client_id == client_id
                && match (&config.brand_id, brand_id) {
                    (None, _) => true,
                    (Some(scoped), Some(requested)) => scoped == requested,
                    (Some(_), None) => false,
                }
        })
        .collect();

    candidates.sort_by(|lhs, rhs| {
        let lhs_key = (
            lhs.priority,
            brand_specificity(lhs, brand_id),
            lhs.created_at,
        );
        let rhs_key = (
            rhs.priority,
            brand_specificity(rhs, brand_id),
            rhs.created_at,
        );
        rhs_key
            .cmp(&lhs_key)
            .then_with(|| lhs.config_id.cmp(&rhs.config_id))
    });

    candidates.first().copied()
}

fn brand_specificity(config: &WorkflowConfig, brand_id: Option<&str>) -> u8 {
    match (&config.brand_id, brand_id) {
        (Some(scoped), Some(requested)) if scoped == requested => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_config_pack_yaml, resolve_config, validate_config_pack};
    use governance_center_domain::{
        now_utc, ConfigId, ConfigPack, WorkflowConfig,
    };
    use time::Duration;
    use ulid::Ulid;

    const PACK_YAML: &str = r#"
pack_name: acme-governance
pack_version: v1
normalization_version: 0
roles:
  - role_id: team_lead
    display_name: Team Lead
  - role_id: compliance_reviewer
    display_name: Compliance Reviewer
configs:
  - config_id: 01ARZ3NDEKTSV4RRFFQ69G5FAV
    agency_id: agency-a
    client_id: client-b
    approval_chain: [team_lead, compliance_reviewer]
    escalation_timeout_hours: 48.0
    require_compliance_review: true
    skip_logic:
      - condition: "requestor_role == 'creative_director'"
        skip_steps: [team_lead]
    priority: 10
    created_at: "2026-01-10T00:00:00Z"
"#;

    fn fixture_config(priority: i64, brand_id: Option<&str>) -> WorkflowConfig {
        WorkflowConfig {
            config_id: ConfigId(Ulid::new()),
            agency_id: "agency-a".to_string(),
            client_id: "client-b".to_string(),
            brand_id: brand_id.map(ToString::to_string),
            approval_chain: vec!["team_lead".to_string()],
            parallel_approvals: false,
            skip_preapproval: false,
            escalation_timeout_hours: 24.0,
            auto_approve_low_risk: false,
            require_compliance_review: false,
            require_legal_review: false,
            skip_logic: Vec::new(),
            conditional_routing: Vec::new(),
            priority,
            is_active: true,
            created_at: now_utc(),
        }
    }

    #[test]
    fn normalize_hash_is_stable() {
        let first = normalize_config_pack_yaml(PACK_YAML);
        let second = normalize_config_pack_yaml(PACK_YAML);
        assert!(first.is_ok());
        assert!(second.is_ok());
        match (first, second) {
            (Ok(first), Ok(second)) => assert_eq!(first.normalized_hash, second.normalized_hash),
            _ => unreachable!(),
        }
    }

    #[test]
    fn unknown_chain_role_is_rejected() {
        let yaml = PACK_YAML.replace("approval_chain: [team_lead,", "approval_chain: [ghost_role,");
        let result = normalize_config_pack_yaml(&yaml);
        assert!(result.is_err());
    }

    #[test]
    fn contradictory_routing_is_rejected() {
        let envelope = normalize_config_pack_yaml(PACK_YAML);
        assert!(envelope.is_ok());
        let mut pack: ConfigPack = match envelope {
            Ok(envelope) => envelope.pack,
            Err(_) => unreachable!(),
        };
        pack.configs[0]
            .conditional_routing
            .push(governance_center_domain::RoutingRule {
                condition: "requestor_role == 'creative_director'".to_string(),
                add_steps: vec!["team_lead".to_string()],
            });
        assert!(validate_config_pack(&pack).is_err());
    }

    #[test]
    fn unparseable_condition_is_a_warning_not_an_error() {
        let envelope = normalize_config_pack_yaml(PACK_YAML);
        assert!(envelope.is_ok());
        let mut pack: ConfigPack = match envelope {
            Ok(envelope) => envelope.pack,
            Err(_) => unreachable!(),
        };
        pack.configs[0].skip_logic[0].condition = "tool_type == 'chatbot'".to_string();
        let warnings = validate_config_pack(&pack);
        assert!(warnings.is_ok());
        let warnings = warnings.unwrap_or_else(|_| unreachable!());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("tool_type"));
    }

    #[test]
    fn brand_specific_config_outranks_null_brand_at_equal_priority() {
        let null_brand = fixture_config(5, None);
        let brand_specific = fixture_config(5, Some("brand-x"));
        let expected = brand_specific.config_id;
        let configs = vec![null_brand, brand_specific];

        let resolved = resolve_config(&configs, "agency-a", "client-b", Some("brand-x"));
        assert_eq!(resolved.map(|config| config.config_id), Some(expected));
    }

    #[test]
    fn higher_priority_beats_brand_specificity() {
        let null_brand = fixture_config(9, None);
        let brand_specific = fixture_config(5, Some("brand-x"));
        let expected = null_brand.config_id;
        let configs = vec![null_brand, brand_specific];

        let resolved = resolve_config(&configs, "agency-a", "client-b", Some("brand-x"));
        assert_eq!(resolved.map(|config| config.config_id), Some(expected));
    }

    #[test]
    fn newest_config_wins_at_equal_priority_and_specificity() {
        let mut older = fixture_config(5, None);
        older.created_at = now_utc() - Duration::hours(2);
        let newer = fixture_config(5, None);
        let expected = newer.config_id;
        let configs = vec![older, newer];

        let resolved = resolve_config(&configs, "agency-a", "client-b", None);
        assert_eq!(resolved.map(|config| config.config_id), Some(expected));
    }

    #[test]
    fn inactive_and_foreign_brand_configs_never_match() {
        let mut inactive = fixture_config(9, None);
        inactive.is_active = false;
        let other_brand = fixture_config(5, Some("brand-y"));
        let configs = vec![inactive, other_brand];

        assert!(resolve_config(&configs, "agency-a", "client-b", Some("brand-x")).is_none());
        assert!(resolve_config(&configs, "agency-a", "client-b", None).is_none());
    }
}
