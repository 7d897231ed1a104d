//! # Error Handling for MorphDB
//!
//! This module defines the error types used throughout MorphDB. We use a single
//! error enum ([`Error`]) to represent all failure modes, which keeps function
//! signatures simple and lets the transport layer map every error to an HTTP
//! status with one call ([`Error::http_status`]).
//!
//! ## Error Categories
//!
//! | Category | Examples | Status |
//! |----------|----------|--------|
//! | Client input | bad JSON, invalid noun name, malformed sort | 400 |
//! | Schema | undefined noun, unknown verb, wrong verb form | 400 |
//! | Policy | verb disabled on the noun | 403 |
//! | Missing | entity/event/subscription absent or soft-deleted | 404 |
//! | Concurrency | optimistic version precondition failed | 409 |
//! | Internal | SQLite error, invariant violation | 500 |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in MorphDB operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed client input: missing payload fields, bad filter/sort
    /// expressions, invalid `atVersion`, non-PascalCase noun names.
    #[error("bad input: {0}")]
    BadInput(String),

    /// An entity operation referenced a noun that was never defined.
    #[error("noun '{noun}' is not defined")]
    SchemaMissing {
        /// The noun name that failed to resolve.
        noun: String,
    },

    /// A verb was executed that the noun does not declare.
    #[error("noun '{noun}' has no verb '{verb}'")]
    VerbUnknown {
        /// The noun the verb was looked up on.
        noun: String,
        /// The verb name that failed to resolve.
        verb: String,
    },

    /// The verb was supplied in its activity or event form.
    ///
    /// Verbs are executed by their action form only. `closing` and `closed`
    /// both resolve to the verb, but the caller must send `close`.
    #[error("'{provided}' is the {form} form; use the action form '{action}'")]
    UseActionForm {
        /// The form the caller sent.
        provided: String,
        /// Which non-action form it matched ("activity" or "event").
        form: &'static str,
        /// The action form to use instead.
        action: String,
    },

    /// The verb appears in the noun's disabled set.
    #[error("verb '{verb}' is disabled on noun '{noun}'")]
    VerbDisabled {
        /// The noun carrying the disabled marker.
        noun: String,
        /// The disabled verb.
        verb: String,
    },

    /// The target entity, event, subscription, or hook does not exist,
    /// or the entity is soft-deleted (reads never see deleted rows).
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// What kind of record was looked up ("entity", "event", ...).
        kind: &'static str,
        /// The identifier that missed.
        id: String,
    },

    /// Optimistic concurrency conflict: the caller's `expectedVersion` does
    /// not match the entity's current version.
    ///
    /// # Recovery
    ///
    /// Re-read the entity, re-apply the change against `current`, and retry
    /// with the fresh version.
    #[error("version conflict on '{entity_id}': expected {expected}, current is {current}")]
    VersionConflict {
        /// The entity the conflict occurred on.
        entity_id: String,
        /// The version the caller expected.
        expected: u64,
        /// The actual current version.
        current: u64,
    },

    /// SQLite operation failed.
    ///
    /// Wraps any error from the `rusqlite` crate: locked database file,
    /// full disk, corruption, or a SQL bug in MorphDB itself.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization failed while reading or writing a document
    /// column. Stored rows are written by us, so in practice this surfaces
    /// malformed client payloads.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invariant violation or infrastructure failure (e.g. the tenant's
    /// kernel thread has shut down).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Maps this error to the HTTP status code the transport layer returns.
    ///
    /// The mapping is part of the public contract: schema and input problems
    /// are 400, disabled verbs 403, missing records 404, version conflicts
    /// 409, everything infrastructural 500.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::BadInput(_)
            | Error::SchemaMissing { .. }
            | Error::VerbUnknown { .. }
            | Error::UseActionForm { .. }
            | Error::Json(_) => 400,
            Error::VerbDisabled { .. } => 403,
            Error::NotFound { .. } => 404,
            Error::VersionConflict { .. } => 409,
            Error::Sqlite(_) | Error::Internal(_) => 500,
        }
    }

    /// Short machine-readable code for the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::BadInput(_) => "bad_input",
            Error::SchemaMissing { .. } => "schema_missing",
            Error::VerbUnknown { .. } => "verb_unknown",
            Error::UseActionForm { .. } => "use_action_form",
            Error::VerbDisabled { .. } => "verb_disabled",
            Error::NotFound { .. } => "not_found",
            Error::VersionConflict { .. } => "version_conflict",
            Error::Json(_) => "bad_input",
            Error::Sqlite(_) | Error::Internal(_) => "internal",
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
