//! # Integration Dispatch
//!
//! Integration hooks route events to named downstream services (payments,
//! repository, oauth, …). A fixed built-in table ships with the engine and
//! cannot be edited or deleted; tenants add their own hooks on top. Every
//! attempt (success, HTTP failure, or missing service binding) writes one
//! dispatch-log row, so the fan-out is fully auditable.
//!
//! Dispatches run concurrently per event and outside the commit boundary:
//! the executor never waits for them, and no outcome here fails the
//! triggering request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::ident;
use crate::types::{
    from_millis, now, DispatchEntry, DispatchStatus, EventRecord, IntegrationHook, Service,
};

// =============================================================================
// Headers
// =============================================================================

/// Event type header on outbound integration requests.
pub const EVENT_HEADER: &str = "x-morph-event";

/// Entity id header.
pub const ENTITY_HEADER: &str = "x-morph-entity";

/// Base verb header.
pub const VERB_HEADER: &str = "x-morph-verb";

/// Hook id header (tenant `ihook_…` or `builtin:…`).
pub const HOOK_HEADER: &str = "x-morph-hook";

// =============================================================================
// Built-in Hook Table
// =============================================================================

/// The fixed built-in routes: (entity type, verb, service, method).
///
/// Not tenant-editable, cannot be deleted, exposed read-only alongside
/// tenant hooks.
const BUILTIN: &[(&str, &str, Service, &str)] = &[
    ("Contact", "qualify", Service::Payments, "POST /customers/sync"),
    ("Contact", "create", Service::Payments, "POST /customers/sync"),
    ("Deal", "close", Service::Payments, "POST /subscriptions/create"),
    ("Issue", "create", Service::Repo, "POST /issues/create"),
    ("Issue", "update", Service::Repo, "POST /issues/update"),
    ("Issue", "close", Service::Repo, "POST /issues/close"),
];

/// The built-in table as hook records, ids `builtin:{SERVICE}:{method}`.
pub fn builtin_hooks() -> Vec<IntegrationHook> {
    BUILTIN
        .iter()
        .map(|(entity_type, verb, service, method)| IntegrationHook {
            id: format!("builtin:{}:{}", service.as_str(), method),
            entity_type: (*entity_type).to_string(),
            verb: (*verb).to_string(),
            service: *service,
            method: (*method).to_string(),
            config: None,
            active: true,
            created_at: from_millis(0),
        })
        .collect()
}

// =============================================================================
// Service Bindings
// =============================================================================

/// Read-only registry of service base URLs, constructed with the engine.
///
/// A tenant kernel without a binding for some service still matches hooks
/// against events; the dispatch simply records a "not available" error row.
#[derive(Debug, Clone, Default)]
pub struct ServiceBindings {
    bindings: HashMap<Service, String>,
}

impl ServiceBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration of one service base URL.
    pub fn with(mut self, service: Service, base_url: impl Into<String>) -> Self {
        self.bindings.insert(service, base_url.into());
        self
    }

    pub fn get(&self, service: Service) -> Option<&str> {
        self.bindings.get(&service).map(String::as_str)
    }
}

// =============================================================================
// Matching and Method Parsing
// =============================================================================

/// A hook matches an event when both sides match (exact or `*`). Inactive
/// hooks never match.
pub fn hook_matches(hook: &IntegrationHook, event: &EventRecord) -> bool {
    hook.active
        && (hook.entity_type == "*" || hook.entity_type == event.entity_type)
        && (hook.verb == "*" || hook.verb == event.verb)
}

/// Parses `"{HTTP-verb} {path}"`. A bare path defaults to POST; the verb is
/// uppercased.
pub fn parse_method(method: &str) -> (String, String) {
    let mut parts = method.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(verb), Some(path)) => (verb.to_uppercase(), path.to_string()),
        (Some(path), None) => ("POST".to_string(), path.to_string()),
        _ => ("POST".to_string(), "/".to_string()),
    }
}

/// The JSON body integration services receive.
pub fn build_payload(event: &EventRecord, context: &str) -> Value {
    json!({
        "event": event.to_json(),
        "entityType": event.entity_type,
        "entityId": event.entity_id,
        "verb": event.verb,
        "conjugation": event.conjugation,
        "before": event.before,
        "after": event.after,
        "data": event.data,
        "context": context,
        "timestamp": event.timestamp,
    })
}

// =============================================================================
// Dispatch
// =============================================================================

/// Sends one event to one hook's service and produces the dispatch-log row.
async fn dispatch_one(
    client: &Client,
    bindings: &ServiceBindings,
    hook: &IntegrationHook,
    event: &EventRecord,
    context: &str,
) -> DispatchEntry {
    let started = Instant::now();
    let entry = |status: DispatchStatus, status_code: Option<u16>, error: Option<String>| {
        DispatchEntry {
            id: ident::dispatch_id(),
            event_id: event.id.clone(),
            hook_id: hook.id.clone(),
            service: hook.service,
            method: hook.method.clone(),
            status,
            status_code,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: now(),
        }
    };

    let base_url = match bindings.get(hook.service) {
        Some(base_url) => base_url,
        None => {
            // Not a failure of the event; the log row is the whole outcome.
            return entry(
                DispatchStatus::Error,
                None,
                Some(format!("Service binding '{}' not available", hook.service)),
            );
        }
    };

    let (verb, path) = parse_method(&hook.method);
    let method = Method::from_bytes(verb.as_bytes()).unwrap_or(Method::POST);
    let url = format!("{}{}", base_url.trim_end_matches('/'), path);

    let mut request = client
        .request(method.clone(), &url)
        .header(EVENT_HEADER, &event.event_type)
        .header(ENTITY_HEADER, &event.entity_id)
        .header(VERB_HEADER, &event.verb)
        .header(HOOK_HEADER, &hook.id);
    // GET and HEAD carry no body.
    if method != Method::GET && method != Method::HEAD {
        request = request.json(&build_payload(event, context));
    }

    match request.send().await {
        Ok(response) => {
            let code = response.status().as_u16();
            if response.status().is_success() {
                debug!(hook = %hook.id, url = %url, status = code, "integration dispatched");
                entry(DispatchStatus::Success, Some(code), None)
            } else {
                warn!(hook = %hook.id, url = %url, status = code, "integration rejected");
                entry(DispatchStatus::Error, Some(code), Some(format!("HTTP {}", code)))
            }
        }
        Err(err) => {
            warn!(hook = %hook.id, url = %url, error = %err, "integration dispatch failed");
            entry(DispatchStatus::Error, err.status().map(|s| s.as_u16()), Some(err.to_string()))
        }
    }
}

/// Dispatches one event to every matching hook (built-ins plus tenant rows)
/// concurrently (up to `limit` in flight), returning the dispatch-log rows
/// to persist.
pub async fn dispatch_all(
    client: Client,
    bindings: Arc<ServiceBindings>,
    tenant_hooks: Vec<IntegrationHook>,
    event: EventRecord,
    context: String,
    limit: usize,
) -> Vec<DispatchEntry> {
    let builtins = builtin_hooks();
    let matching: Vec<IntegrationHook> = builtins
        .into_iter()
        .chain(tenant_hooks.into_iter())
        .filter(|hook| hook_matches(hook, &event))
        .collect();

    if matching.is_empty() {
        return Vec::new();
    }
    debug!(event = %event.id, hooks = matching.len(), "dispatching integrations");
    stream::iter(matching.into_iter().map(|hook| {
        let client = client.clone();
        let bindings = bindings.clone();
        let event = event.clone();
        let context = context.clone();
        async move { dispatch_one(&client, &bindings, &hook, &event, &context).await }
    }))
    .buffer_unordered(limit.max(1))
    .collect()
    .await
}

// =============================================================================
// Tests
// =============================================================================
