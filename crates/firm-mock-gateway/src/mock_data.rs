//! Static fixtures served by the mock gateway.

use serde::Serialize;
use serde_json::Value;

pub const METHODS: &[&str] = &[
    "agents.list",
    "services.list",
    "incidents.list",
    "releases.list",
    "policy.decisions",
    "health",
];

pub const EVENTS: &[&str] = &["tick"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: &'static str,
    pub name: &'static str,
    pub role: &'static str,
    pub status: &'static str,
    pub current_task: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: &'static str,
    pub owner: &'static str,
    pub tier: u8,
    pub health: &'static str,
    pub p99_latency_ms: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: &'static str,
    pub service: &'static str,
    pub severity: &'static str,
    pub status: &'static str,
    pub title: &'static str,
    pub assignee: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub id: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub stage: &'static str,
    pub approved_by: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub id: &'static str,
    pub agent: &'static str,
    pub action: &'static str,
    pub verdict: &'static str,
    pub rule: &'static str,
}

pub fn agents() -> Vec<Agent> {
    vec![
        Agent {
            id: "agent-sre-1",
            name: "Sentinel",
            role: "sre",
            status: "active",
            current_task: Some("INC-2041"),
        },
        Agent {
            id: "agent-rel-1",
            name: "Shipwright",
            role: "release-manager",
            status: "active",
            current_task: Some("REL-588"),
        },
        Agent {
            id: "agent-sec-1",
            name: "Warden",
            role: "security",
            status: "idle",
            current_task: None,
        },
        Agent {
            id: "agent-fin-1",
            name: "Ledger",
            role: "finops",
            status: "paused",
            current_task: None,
        },
    ]
}

pub fn services() -> Vec<Service> {
    vec![
        Service {
            id: "checkout-api",
            owner: "payments",
            tier: 1,
            health: "degraded",
            p99_latency_ms: 840,
        },
        Service {
            id: "catalog",
            owner: "storefront",
            tier: 1,
            health: "healthy",
            p99_latency_ms: 120,
        },
        Service {
            id: "search-indexer",
            owner: "discovery",
            tier: 2,
            health: "healthy",
            p99_latency_ms: 310,
        },
        Service {
            id: "billing-batch",
            owner: "payments",
            tier: 3,
            health: "down",
            p99_latency_ms: 0,
        },
    ]
}

pub fn incidents() -> Vec<Incident> {
    vec![
        Incident {
            id: "INC-2041",
            service: "checkout-api",
            severity: "sev2",
            status: "open",
            title: "Elevated 5xx on payment authorization",
            assignee: Some("agent-sre-1"),
        },
        Incident {
            id: "INC-2039",
            service: "billing-batch",
            severity: "sev3",
            status: "open",
            title: "Nightly invoice job failed",
            assignee: None,
        },
        Incident {
            id: "INC-2033",
            service: "catalog",
            severity: "sev4",
            status: "resolved",
            title: "Stale product images in EU region",
            assignee: Some("agent-sre-1"),
        },
    ]
}

pub fn releases() -> Vec<Release> {
    vec![
        Release {
            id: "REL-588",
            service: "catalog",
            version: "2024.11.3",
            stage: "canary",
            approved_by: Some("agent-rel-1"),
        },
        Release {
            id: "REL-587",
            service: "checkout-api",
            version: "7.12.0",
            stage: "blocked",
            approved_by: None,
        },
        Release {
            id: "REL-585",
            service: "search-indexer",
            version: "1.40.2",
            stage: "complete",
            approved_by: Some("agent-rel-1"),
        },
    ]
}

pub fn policy_decisions() -> Vec<PolicyDecision> {
    vec![
        PolicyDecision {
            id: "POL-9001",
            agent: "agent-rel-1",
            action: "deploy checkout-api 7.12.0",
            verdict: "deny",
            rule: "no-deploy-during-open-sev2",
        },
        PolicyDecision {
            id: "POL-9000",
            agent: "agent-sre-1",
            action: "restart checkout-api pods",
            verdict: "allow",
            rule: "sre-may-restart-tier1",
        },
        PolicyDecision {
            id: "POL-8998",
            agent: "agent-fin-1",
            action: "scale down billing-batch",
            verdict: "escalate",
            rule: "finops-changes-need-human",
        },
    ]
}

/// Serve a read-only method. `None` means the method is unknown. `health`
/// is answered by the server itself.
pub fn lookup(method: &str, params: &Value) -> Option<Value> {
    let value = match method {
        "agents.list" => to_value(filter_by(agents(), params, "status", |a| a.status)),
        "services.list" => to_value(filter_by(services(), params, "health", |s| s.health)),
        "incidents.list" => to_value(filter_by(incidents(), params, "status", |i| i.status)),
        "releases.list" => to_value(filter_by(releases(), params, "stage", |r| r.stage)),
        "policy.decisions" => to_value(filter_by(policy_decisions(), params, "verdict", |d| {
            d.verdict
        })),
        _ => return None,
    };
    Some(value)
}

fn filter_by<T>(
    items: Vec<T>,
    params: &Value,
    key: &str,
    field: impl Fn(&T) -> &'static str,
) -> Vec<T> {
    match params.get(key).and_then(Value::as_str) {
        Some(want) => items.into_iter().filter(|item| field(item) == want).collect(),
        None => items,
    }
}

fn to_value<T: Serialize>(items: Vec<T>) -> Value {
    serde_json::to_value(items).unwrap_or(Value::Null)
}
