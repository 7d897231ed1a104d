//! # Domain Types for MorphDB
//!
//! Core types for the entity/event kernel: versions and sequences (newtypes),
//! entities and their snapshot form, events, subscriptions, integration
//! hooks, dispatch-log entries, and the response envelope.
//!
//! ## Newtypes
//!
//! [`Version`] and [`Sequence`] both wrap `u64`, but they are distinct types:
//! a version counts committed mutations of an entity, a sequence numbers
//! events within an entity's log. The two agree by construction (every
//! mutation appends exactly one event), and keeping them as separate types
//! means that agreement is an invariant we check, not an accident we rely on.
//!
//! ## Snapshots
//!
//! The API representation of an entity is its *snapshot*: the user payload
//! (which always carries the row's `id` and `type`) merged with `$`-prefixed
//! meta keys (`$version`, `$createdAt`, `$updatedAt`, `$context`, and
//! `$deletedAt` when set). Time travel folds snapshots; the field differ
//! compares only keys not prefixed with `$`.

use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::conjugate::Conjugation;
use crate::error::Error;

// =============================================================================
// Versions and Sequences
// =============================================================================

/// An entity's version: 1-based, incremented on every committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// The version of a freshly created entity.
    pub const FIRST: Version = Version(1);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// The version after one more mutation.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A per-entity event sequence number: contiguous from 1 in commit order.
///
/// Invariant: the sequence of an emitted event equals the version of the
/// entity that mutation produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    /// The first sequence in any entity's log.
    pub const FIRST: Sequence = Sequence(1);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Time Helpers
// =============================================================================

/// Current UTC time, truncated to millisecond precision (the storage grain).
pub fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

/// Converts a timestamp to the Unix-millisecond form stored in SQLite.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Converts stored Unix milliseconds back into a timestamp.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// RFC-3339 rendering used in snapshots and event JSON.
pub fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// =============================================================================
// Entities
// =============================================================================

/// Meta-fields stripped from update patches and verb payloads.
///
/// The caller may echo these back, but they can never be overwritten through
/// a patch.
pub const RESERVED_FIELDS: &[&str] = &["id", "type", "context", "createdAt", "version"];

/// Removes reserved meta-fields from a patch in place.
pub fn strip_reserved(patch: &mut Map<String, Value>) {
    for field in RESERVED_FIELDS {
        patch.remove(*field);
    }
}

/// A stored entity of some noun type.
///
/// The `data` payload is an opaque JSON object; by invariant it always
/// carries the same `id` and `type` as the row itself.
#[derive(Debug, Clone)]
pub struct Entity {
    /// Opaque id, `{noun-lowercased}_{short-id}`.
    pub id: String,
    /// The noun this entity belongs to (PascalCase).
    pub entity_type: String,
    /// The user payload, including its `id`/`type` keys.
    pub data: Map<String, Value>,
    /// 1-based, equal to the count of committed mutations.
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once by soft delete; never cleared.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Tenant context string captured at creation.
    pub context: String,
}

impl Entity {
    /// True once the entity has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The snapshot form: payload merged with `$`-prefixed meta keys.
    ///
    /// This is both the API representation and the `before`/`after` shape
    /// stored on events.
    pub fn snapshot(&self) -> Value {
        let mut out = self.data.clone();
        out.insert("id".to_string(), Value::String(self.id.clone()));
        out.insert("type".to_string(), Value::String(self.entity_type.clone()));
        out.insert("$version".to_string(), json!(self.version.as_raw()));
        out.insert("$createdAt".to_string(), Value::String(to_rfc3339(self.created_at)));
        out.insert("$updatedAt".to_string(), Value::String(to_rfc3339(self.updated_at)));
        out.insert("$context".to_string(), Value::String(self.context.clone()));
        if let Some(deleted_at) = self.deleted_at {
            out.insert("$deletedAt".to_string(), Value::String(to_rfc3339(deleted_at)));
        }
        Value::Object(out)
    }
}

// =============================================================================
// Events
// =============================================================================

/// An immutable record of one verb execution on one entity.
///
/// Serialized with camelCase keys; the webhook body is exactly this JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Opaque id, `evt_…`.
    pub id: String,
    /// Composite type, `{EntityType}.{verb}`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    /// The base (action-form) verb.
    pub verb: String,
    pub conjugation: Conjugation,
    /// The verb payload, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Snapshot before the mutation (`None` for create).
    pub before: Option<Value>,
    /// Snapshot after the mutation (`None` for delete).
    pub after: Option<Value>,
    /// Per-entity monotonic sequence, 1-based.
    pub sequence: Sequence,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// The webhook/CDC wire form.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("event serialization is infallible")
    }
}

// =============================================================================
// List Queries
// =============================================================================

/// Parameters for `list`: equality filter, one-pair sort, pagination.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Flat `{field: value}` equality filter, AND-combined. A null value
    /// matches rows where the field is absent or null.
    pub filter: Option<Map<String, Value>>,
    /// `(field, dir)` with dir `1` (ascending) or `-1` (descending).
    /// Invalid expressions fall back to `createdAt DESC`.
    pub sort: Option<(String, i64)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Hard cap on page size.
pub const LIST_LIMIT_MAX: u64 = 1_000;

/// Default page size.
pub const LIST_LIMIT_DEFAULT: u64 = 100;

impl ListQuery {
    /// The effective limit: capped at 1,000, default 100.
    pub fn effective_limit(&self) -> u64 {
        self.limit.unwrap_or(LIST_LIMIT_DEFAULT).min(LIST_LIMIT_MAX)
    }

    /// The effective offset: default 0.
    pub fn effective_offset(&self) -> u64 {
        self.offset.unwrap_or(0)
    }

    /// Parses a JSON sort expression (`{"stage": 1}` or `{"$createdAt": -1}`)
    /// into a `(field, dir)` pair. Anything else yields `None` and the
    /// caller falls back to `createdAt DESC`.
    pub fn parse_sort(value: &Value) -> Option<(String, i64)> {
        let obj = value.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        let (field, dir) = obj.iter().next()?;
        let dir = dir.as_i64()?;
        if dir != 1 && dir != -1 {
            return None;
        }
        Some((field.clone(), dir))
    }
}

/// One page of entities plus the pagination meta the envelope carries.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub entities: Vec<Entity>,
    /// Count of non-deleted entities matching the same filter (not the
    /// unfiltered table).
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
    pub has_more: bool,
}

impl ListPage {
    /// The `meta` object for the response envelope.
    pub fn meta(&self) -> Value {
        json!({
            "total": self.total,
            "limit": self.limit,
            "offset": self.offset,
            "hasMore": self.has_more,
        })
    }
}

// =============================================================================
// Event Queries
// =============================================================================

/// Parameters for the event log query (ordered by `timestamp DESC`).
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Only events strictly after this timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Entity-type filter.
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub verb: Option<String>,
    pub limit: Option<u64>,
}

impl EventQuery {
    pub fn effective_limit(&self) -> u64 {
        self.limit.unwrap_or(LIST_LIMIT_DEFAULT).min(LIST_LIMIT_MAX)
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// How a subscription wants events delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMode {
    /// Signed POST to the endpoint. The only mode the dispatcher delivers.
    Webhook,
    /// Stored for the (out-of-scope) websocket transport.
    Websocket,
}

impl SubscriptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionMode::Webhook => "webhook",
            SubscriptionMode::Websocket => "websocket",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "webhook" => Ok(SubscriptionMode::Webhook),
            "websocket" => Ok(SubscriptionMode::Websocket),
            other => Err(Error::BadInput(format!("unknown subscription mode '{}'", other))),
        }
    }
}

/// A registered event subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Opaque id, `sub_…`.
    pub id: String,
    /// Event-type pattern: `*` or `{entity}.{verb}` with `*` wildcards.
    pub pattern: String,
    pub mode: SubscriptionMode,
    pub endpoint: String,
    /// HMAC secret; when present, deliveries carry a signature header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Integration Hooks
// =============================================================================

/// A downstream service a hook can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Service {
    Payments,
    Repo,
    Integrations,
    Oauth,
    Events,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Payments => "PAYMENTS",
            Service::Repo => "REPO",
            Service::Integrations => "INTEGRATIONS",
            Service::Oauth => "OAUTH",
            Service::Events => "EVENTS",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "PAYMENTS" => Ok(Service::Payments),
            "REPO" => Ok(Service::Repo),
            "INTEGRATIONS" => Ok(Service::Integrations),
            "OAUTH" => Ok(Service::Oauth),
            "EVENTS" => Ok(Service::Events),
            other => Err(Error::BadInput(format!("unknown service '{}'", other))),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An integration route: events matching (`entityType`, `verb`) dispatch to
/// `service` with `method`. Both match fields support `*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationHook {
    /// `ihook_…` for tenant hooks, `builtin:{SERVICE}:{method}` for the
    /// fixed built-in table.
    pub id: String,
    pub entity_type: String,
    pub verb: String,
    pub service: Service,
    /// `"{HTTP-verb} {path}"`; the HTTP verb defaults to POST.
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl IntegrationHook {
    /// True for rows from the fixed built-in table (not tenant-editable).
    pub fn is_builtin(&self) -> bool {
        self.id.starts_with("builtin:")
    }
}

// =============================================================================
// Dispatch Log
// =============================================================================

/// Outcome of a single integration dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Success,
    Error,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Success => "success",
            DispatchStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "success" => Ok(DispatchStatus::Success),
            "error" => Ok(DispatchStatus::Error),
            other => Err(Error::Internal(format!("unknown dispatch status '{}'", other))),
        }
    }
}

/// One row per completed integration attempt, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEntry {
    /// Opaque id, `dsp_…`.
    pub id: String,
    pub event_id: String,
    pub hook_id: String,
    pub service: Service,
    pub method: String,
    pub status: DispatchStatus,
    /// HTTP status when a response came back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Hook Registrations (stored verb hooks)
// =============================================================================

/// Lifecycle phase a stored hook is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Before,
    After,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::Before => "before",
            HookPhase::After => "after",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "before" => Ok(HookPhase::Before),
            "after" => Ok(HookPhase::After),
            other => Err(Error::BadInput(format!("unknown hook phase '{}'", other))),
        }
    }
}

/// A stored verb hook. The `code` field is stored verbatim and never
/// evaluated; the executor only logs that a registration exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRegistration {
    pub id: String,
    pub noun: String,
    pub verb: String,
    pub phase: HookPhase,
    pub code: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Tenant Metadata
// =============================================================================

/// Lifecycle status of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Deactivated,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Deactivated => "deactivated",
        }
    }
}

/// Tenant metadata assembled from the `tenant_meta` key/value table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantInfo {
    pub tenant_id: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivated_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Response Envelope
// =============================================================================

/// `{success: true, data}`.
pub fn success_envelope(data: Value) -> Value {
    json!({ "success": true, "data": data })
}

/// `{success: true, data, meta}`.
pub fn success_envelope_with_meta(data: Value, meta: Value) -> Value {
    json!({ "success": true, "data": data, "meta": meta })
}

/// `{success: false, error}` with the error's code and message.
pub fn error_envelope(err: &Error) -> Value {
    json!({
        "success": false,
        "error": { "code": err.code(), "message": err.to_string() },
    })
}

// =============================================================================
// Tests
// =============================================================================
