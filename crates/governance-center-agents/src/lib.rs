#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use governance_center_domain::{hash_json, now_utc, AgentCallRecord, RunId};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use ulid::Ulid;

/// One opaque analysis call: `(agent, action, payload)` in, structured result
/// or failure out. Backends are the engine's only suspension point.
pub trait AgentBackend {
    fn backend_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn invoke(&self, request: &AgentTaskRequest) -> Result<AgentInvocation>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentTaskRequest {
    pub run_id: RunId,
    pub agent: String,
    pub action: String,
    pub policy_id: String,
    pub enterprise_id: String,
    pub payload: Value,
    pub params: Value,
    pub input_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentInvocation {
    pub call: AgentCallRecord,
    pub result: Value,
    pub confidence: Option<f64>,
}

/// Deterministic offline backend: every output is derived from a SHA-256 of
/// the request, so repeated runs over the same input produce byte-identical
/// results. Used by tests and sandbox demos without a model endpoint.
#[derive(Debug, Clone)]
pub struct MockAgentBackend {
    adapter_version: String,
}

impl Default for MockAgentBackend {
    fn default() -> Self {
        Self {
            adapter_version: "mock.v1".to_string(),
        }
    }
}

impl MockAgentBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn digest(&self, request: &AgentTaskRequest) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(request.input_hash.as_bytes());
        hasher.update(request.agent.as_bytes());
        hasher.update(request.action.as_bytes());
        hasher.update(self.adapter_version.as_bytes());
        hasher.finalize().into()
    }
}

fn unit_fraction(digest: &[u8; 32], index: usize) -> f64 {
    f64::from(digest[index % digest.len()]) / 255.0
}

impl AgentBackend for MockAgentBackend {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn invoke(&self, request: &AgentTaskRequest) -> Result<AgentInvocation> {
        let started_at = now_utc();
        let digest = self.digest(request);
        let token = hex::encode(digest);
        let request_json = build_request_json(request, self.backend_name(), &self.adapter_version);
        let request_hash = hash_json(&request_json)?;

        let (result, confidence) = match (request.agent.as_str(), request.action.as_str()) {
            ("policy", "validate") => {
                let checked = 3 + (usize::from(digest[4]) % 5);
                (
                    json!({
                        "valid": true,
                        "issues": [],
                        "checked_rules": checked,
                    }),
                    0.80 + 0.15 * unit_fraction(&digest, 0),
                )
            }
            ("sandbox", "simulate") => {
                let score = 0.35 + 0.60 * unit_fraction(&digest, 1);
                let mut risk_flags = Vec::new();
                if score < 0.60 {
                    risk_flags.push(json!({
                        "severity": "high",
                        "code": "policy_gap",
                        "message": "simulated scenario falls below compliance floor",
                        "source": "sandbox.simulate",
                    }));
                }
                (
                    json!({
                        "compliance_score": score,
                        "risk_flags": risk_flags,
                        "recommendations": [
                            format!("tighten disclosure checks for scenario {}", &token[..8]),
                        ],
                    }),
                    0.70 + 0.25 * unit_fraction(&digest, 2),
                )
            }
            ("compliance-scoring", "score") => {
                let base = request
                    .payload
                    .get("simulation")
                    .and_then(|simulation| simulation.get("compliance_score"))
                    .and_then(Value::as_f64)
                    .unwrap_or_else(|| 0.35 + 0.60 * unit_fraction(&digest, 1));
                let refined = (base + 0.10 * unit_fraction(&digest, 3) - 0.05).clamp(0.0, 1.0);
                (
                    json!({
                        "compliance_score": refined,
                        "recommendations": ["document reviewer sign-off for medium-risk tools"],
                    }),
                    0.75 + 0.20 * unit_fraction(&digest, 4),
                )
            }
            ("monitoring", "detect_anomalies") => {
                let mut anomalies = Vec::new();
                if unit_fraction(&digest, 5) > 0.65 {
                    anomalies.push(json!({
                        "severity": "medium",
                        "code": "usage_spike",
                        "message": "tool invocation volume deviates from the scenario baseline",
                    }));
                }
                (
                    json!({
                        "anomalies": anomalies,
                        "recommendations": ["enable weekly usage reports"],
                    }),
                    0.65 + 0.30 * unit_fraction(&digest, 6),
                )
            }
            (agent, action) => {
                return Err(anyhow!(
                    "mock backend has no handler for '{agent}.{action}'"
                ));
            }
        };

        let response_json = json!({
            "deterministic_token": token,
            "result": result,
            "confidence": confidence,
        });
        let response_hash = hash_json(&response_json)?;
        let ended_at = now_utc();

        let base_len = request
            .agent
            .len()
            .saturating_add(request.action.len());
        let base_len_u64 = u64::try_from(base_len).unwrap_or(u64::MAX);
        let latency_ms = Some(5 + (base_len_u64 % 17));

        let call = AgentCallRecord {
            call_id: Ulid::new(),
            agent: request.agent.clone(),
            action: request.action.clone(),
            request_json,
            request_hash,
            response_json,
            response_hash,
            latency_ms,
            started_at,
            ended_at,
            status: "succeeded".to_string(),
            error_text: None,
        };

        Ok(AgentInvocation {
            call,
            result,
            confidence: Some(confidence),
        })
    }
}

/// HTTP JSON backend for a hosted agent endpoint. The per-call timeout comes
/// from `params.timeout_ms`; a timeout surfaces as a transport failure and is
/// treated by the caller exactly like the step's documented failure policy.
/// An endpoint error status returns `Ok` with the call record marked failed,
/// so the attempt stays auditable; only transport failures are `Err`.
#[derive(Debug, Clone)]
pub struct HttpJsonAgentBackend {
    adapter_version: String,
}

impl Default for HttpJsonAgentBackend {
    fn default() -> Self {
        Self {
            adapter_version: "http_json.v1".to_string(),
        }
    }
}

impl HttpJsonAgentBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AgentBackend for HttpJsonAgentBackend {
    fn backend_name(&self) -> &'static str {
        "http_json"
    }

    fn invoke(&self, request: &AgentTaskRequest) -> Result<AgentInvocation> {
        let config = HttpAgentConfig::from_params(&request.params)?;
        let started_at = now_utc();
        let request_json = build_request_json(request, self.backend_name(), &self.adapter_version);
        let request_hash = hash_json(&request_json)?;

        let outbound_json = json!({
            "agent": request.agent,
            "action": request.action,
            "request": request_json,
        });

        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build();

        let mut req = agent
            .request("POST", &config.url)
            .set("content-type", "application/json");
        for (header, value) in &config.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &config.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        let (status, error_text, status_code, body_json) = match req.send_json(&outbound_json) {
            Ok(response) => {
                let code = response.status();
                let body: Value = response.into_json()?;
                ("succeeded".to_string(), None, code, body)
            }
            Err(ureq::Error::Status(code, response)) => {
                let body = match response.into_json::<Value>() {
                    Ok(value) => value,
                    Err(_) => Value::Null,
                };
                (
                    "failed".to_string(),
                    Some(format!("http status {code}")),
                    code,
                    body,
                )
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("http transport failure: {err}"));
            }
        };

        let response_json = json!({
            "status_code": status_code,
            "body": body_json,
        });
        let response_hash = hash_json(&response_json)?;
        let ended_at = now_utc();
        let latency_ms = {
            let millis = (ended_at - started_at).whole_milliseconds();
            if millis <= 0 {
                Some(0)
            } else {
                u64::try_from(millis).ok()
            }
        };

        // An HTTP-status failure still yields a full call record; the
        // endpoint's error body is the response, and no result or confidence
        // is reported.
        let (result, confidence) = if status == "succeeded" {
            (
                body_json
                    .get("result")
                    .cloned()
                    .unwrap_or_else(|| body_json.clone()),
                body_json.get("confidence").and_then(Value::as_f64),
            )
        } else {
            (Value::Null, None)
        };

        let call = AgentCallRecord {
            call_id: Ulid::new(),
            agent: request.agent.clone(),
            action: request.action.clone(),
            request_json: outbound_json,
            request_hash,
            response_json,
            response_hash,
            latency_ms,
            started_at,
            ended_at,
            status,
            error_text,
        };

        Ok(AgentInvocation {
            call,
            result,
            confidence,
        })
    }
}

fn build_request_json(request: &AgentTaskRequest, backend_name: &str, adapter_version: &str) -> Value {
    json!({
        "backend_name": backend_name,
        "adapter_version": adapter_version,
        "run_id": request.run_id.to_string(),
        "agent": request.agent,
        "action": request.action,
        "policy_id": request.policy_id,
        "enterprise_id": request.enterprise_id,
        "payload": request.payload,
        "input_hash": request.input_hash,
    })
}

#[derive(Debug, Clone)]
struct HttpAgentConfig {
    url: String,
    timeout_ms: u64,
    headers: BTreeMap<String, String>,
    auth_bearer_token: Option<String>,
}

impl HttpAgentConfig {
    fn from_params(params: &Value) -> Result<Self> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("http_json backend requires params.url"))?
            .to_string();

        let timeout_ms = params
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(30_000);

        let mut headers = BTreeMap::new();
        if let Some(raw_headers) = params.get("headers") {
            let obj = raw_headers
                .as_object()
                .ok_or_else(|| anyhow!("params.headers must be an object"))?;
            for (key, value) in obj {
                let str_value = value.as_str().ok_or_else(|| {
                    anyhow!("params.headers values must be strings, key='{key}'")
                })?;
                headers.insert(key.clone(), str_value.to_string());
            }
        }

        let auth_bearer_token = if let Some(env_name) =
            params.get("auth_bearer_env").and_then(Value::as_str)
        {
            Some(std::env::var(env_name).map_err(|_| {
                anyhow!("missing env var '{env_name}' required by params.auth_bearer_env")
            })?)
        } else {
            None
        };

        Ok(Self {
            url,
            timeout_ms,
            headers,
            auth_bearer_token,
        })
    }
}
