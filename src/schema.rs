//! # SQLite Schema for MorphDB
//!
//! One database per tenant. Nine tables cover the whole kernel: noun schemas,
//! entities, the event log, relationship edges, stored verb hooks,
//! subscriptions, integration hooks, the dispatch log, and tenant metadata.
//!
//! ## Table Overview
//!
//! ```text
//! nouns ──────► entities ──────► events
//! (schemas)     (documents,      (immutable log,
//!               soft delete)     per-entity sequence)
//!
//! subscriptions      integration_hooks ──► dispatch_log
//! (webhook fan-out)  (service routes)      (one row per attempt)
//!
//! relationships      hooks              tenant_meta
//! (triple edges)     (stored, never     (key/value)
//!                    executed)
//! ```
//!
//! ## Design Decisions
//!
//! Documents (`data`, `before_state`, `after_state`, `schema`, `config`) are
//! TEXT columns holding JSON; filter and sort push down through SQLite's
//! `json_extract`. Timestamps are Unix milliseconds (INTEGER). Soft delete is
//! a nullable `deleted_at`; the `(type, deleted_at)` index serves every read
//! path, which filters deleted rows in SQL rather than in application code.
//!
//! Schema evolution is additive: new columns get safe defaults and old rows
//! are read with null-tolerant accessors, so a v1 file opens under v2 code.

use std::path::Path;

use rusqlite::Connection;

use crate::error::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version, stored in SQLite's `user_version` pragma.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// Registered noun schemas, one row per noun, replaced on re-registration.
const CREATE_NOUNS: &str = r#"
CREATE TABLE IF NOT EXISTS nouns (
    name       TEXT PRIMARY KEY,
    schema     TEXT NOT NULL,
    created_at INTEGER NOT NULL
)
"#;

/// Entities: one row per document, soft-deleted via `deleted_at`.
///
/// `data` carries the full payload including its `id`/`type` keys; `version`
/// is 1-based and equals the count of committed mutations.
const CREATE_ENTITIES: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id         TEXT PRIMARY KEY,
    type       TEXT NOT NULL,
    data       TEXT NOT NULL,
    version    INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER,
    context    TEXT NOT NULL DEFAULT ''
)
"#;

const CREATE_ENTITIES_TYPE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS entities_type ON entities(type)
"#;

const CREATE_ENTITIES_LIVE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS entities_type_deleted ON entities(type, deleted_at)
"#;

/// The append-only event log.
///
/// The conjugation triple is denormalized onto every row so events stay
/// self-describing after schema replacement. The unique
/// `(entity_type, entity_id, sequence)` index backs the contiguity
/// invariant: sequences per entity are 1..N with no gaps or duplicates.
const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id                   TEXT PRIMARY KEY,
    type                 TEXT NOT NULL,
    entity_type          TEXT NOT NULL,
    entity_id            TEXT NOT NULL,
    verb                 TEXT NOT NULL,
    conjugation_action   TEXT NOT NULL,
    conjugation_activity TEXT NOT NULL,
    conjugation_event    TEXT NOT NULL,
    data                 TEXT,
    before_state         TEXT,
    after_state          TEXT,
    sequence             INTEGER NOT NULL,
    timestamp            INTEGER NOT NULL
)
"#;

const CREATE_EVENTS_ENTITY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS events_entity ON events(entity_type, entity_id)
"#;

const CREATE_EVENTS_TIMESTAMP_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS events_timestamp ON events(timestamp)
"#;

const CREATE_EVENTS_VERB_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS events_verb ON events(verb)
"#;

const CREATE_EVENTS_SEQUENCE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS events_entity_sequence
ON events(entity_type, entity_id, sequence)
"#;

/// Relationship edges as flat triples; the triple is its own primary key,
/// so the same edge cannot exist twice. The `(object, predicate)` index is
/// the reverse-direction lookup.
const CREATE_RELATIONSHIPS: &str = r#"
CREATE TABLE IF NOT EXISTS relationships (
    subject    TEXT NOT NULL,
    predicate  TEXT NOT NULL,
    object     TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (subject, predicate, object)
)
"#;

const CREATE_RELATIONSHIPS_REVERSE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS relationships_reverse ON relationships(object, predicate)
"#;

/// Stored verb hooks. `code` is kept verbatim and never evaluated.
const CREATE_HOOKS: &str = r#"
CREATE TABLE IF NOT EXISTS hooks (
    id         TEXT PRIMARY KEY,
    noun       TEXT NOT NULL,
    verb       TEXT NOT NULL,
    phase      TEXT NOT NULL,
    code       TEXT NOT NULL,
    created_at INTEGER NOT NULL
)
"#;

const CREATE_HOOKS_LOOKUP_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS hooks_lookup ON hooks(noun, verb, phase)
"#;

/// Webhook/websocket subscriptions.
const CREATE_SUBSCRIPTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    id         TEXT PRIMARY KEY,
    pattern    TEXT NOT NULL,
    mode       TEXT NOT NULL,
    endpoint   TEXT NOT NULL,
    secret     TEXT,
    active     INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
)
"#;

const CREATE_SUBSCRIPTIONS_PATTERN_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS subscriptions_pattern ON subscriptions(pattern)
"#;

const CREATE_SUBSCRIPTIONS_ACTIVE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS subscriptions_active ON subscriptions(active)
"#;

/// Tenant-configured integration hooks. The built-in table is code, not rows.
const CREATE_INTEGRATION_HOOKS: &str = r#"
CREATE TABLE IF NOT EXISTS integration_hooks (
    id          TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    verb        TEXT NOT NULL,
    service     TEXT NOT NULL,
    method      TEXT NOT NULL,
    config      TEXT,
    active      INTEGER NOT NULL DEFAULT 1,
    created_at  INTEGER NOT NULL
)
"#;

const CREATE_INTEGRATION_HOOKS_MATCH_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS integration_hooks_match
ON integration_hooks(entity_type, verb, active)
"#;

/// One row per completed integration attempt, success or error.
const CREATE_DISPATCH_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS dispatch_log (
    id          TEXT PRIMARY KEY,
    event_id    TEXT NOT NULL,
    hook_id     TEXT NOT NULL,
    service     TEXT NOT NULL,
    method      TEXT NOT NULL,
    status      TEXT NOT NULL,
    status_code INTEGER,
    error       TEXT,
    duration_ms INTEGER NOT NULL,
    timestamp   INTEGER NOT NULL
)
"#;

const CREATE_DISPATCH_LOG_EVENT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS dispatch_log_event ON dispatch_log(event_id)
"#;

const CREATE_DISPATCH_LOG_TIMESTAMP_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS dispatch_log_timestamp ON dispatch_log(timestamp)
"#;

/// Tenant metadata as key/value pairs (`tenantId`, `status`, `createdAt`,
/// optional `name`, `plan`, `deactivatedAt`).
const CREATE_TENANT_META: &str = r#"
CREATE TABLE IF NOT EXISTS tenant_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// All DDL statements in creation order.
const ALL_DDL: &[&str] = &[
    CREATE_NOUNS,
    CREATE_ENTITIES,
    CREATE_ENTITIES_TYPE_INDEX,
    CREATE_ENTITIES_LIVE_INDEX,
    CREATE_EVENTS,
    CREATE_EVENTS_ENTITY_INDEX,
    CREATE_EVENTS_TIMESTAMP_INDEX,
    CREATE_EVENTS_VERB_INDEX,
    CREATE_EVENTS_SEQUENCE_INDEX,
    CREATE_RELATIONSHIPS,
    CREATE_RELATIONSHIPS_REVERSE_INDEX,
    CREATE_HOOKS,
    CREATE_HOOKS_LOOKUP_INDEX,
    CREATE_SUBSCRIPTIONS,
    CREATE_SUBSCRIPTIONS_PATTERN_INDEX,
    CREATE_SUBSCRIPTIONS_ACTIVE_INDEX,
    CREATE_INTEGRATION_HOOKS,
    CREATE_INTEGRATION_HOOKS_MATCH_INDEX,
    CREATE_DISPATCH_LOG,
    CREATE_DISPATCH_LOG_EVENT_INDEX,
    CREATE_DISPATCH_LOG_TIMESTAMP_INDEX,
    CREATE_TENANT_META,
];

// =============================================================================
// Database
// =============================================================================

/// An initialized per-tenant SQLite database.
///
/// Thin wrapper whose only job is to open a connection, apply pragmas, run
/// the DDL, and verify the schema version. Hand the connection to
/// [`Storage`](crate::storage::Storage) with [`Database::into_connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (creating if necessary) a tenant database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    /// Opens an in-memory database (testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        match version {
            0 => {
                for ddl in ALL_DDL {
                    conn.execute_batch(ddl)?;
                }
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            }
            v if v == SCHEMA_VERSION => {
                // Re-run IF NOT EXISTS DDL so additive columns/indexes from
                // point releases materialize on older files.
                for ddl in ALL_DDL {
                    conn.execute_batch(ddl)?;
                }
            }
            v => {
                return Err(Error::Internal(format!(
                    "unsupported schema version {} (engine supports {})",
                    v, SCHEMA_VERSION
                )));
            }
        }

        Ok(Self { conn })
    }

    /// Consumes the wrapper, yielding the initialized connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
