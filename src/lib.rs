//! # MorphDB - Event-Sourced Entity Engine
//!
//! MorphDB is a multi-tenant entity engine built on SQLite. Clients declare
//! entity types (*nouns*) with fields, enums, relationships, and *verbs*;
//! the engine stores entities, executes verbs atomically, keeps an immutable
//! per-entity event log with monotonic sequence numbers, and fans resulting
//! events out to webhooks, CDC consumers, and named integration services.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Engine                                 │
//! │             (lazy per-tenant kernel registry)                   │
//! └───────────────────────────┬─────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Tenant Kernel                              │
//! │           (serial actor, one thread per tenant)                 │
//! │                                                                 │
//! │  ┌──────────┐ ┌──────────────┐ ┌───────────┐ ┌──────────────┐  │
//! │  │  Schema  │ │ Entity Store │ │ Event Log │ │ Time Travel  │  │
//! │  │ Registry │ │ (soft del.,  │ │ (append-  │ │ (fold/diff)  │  │
//! │  │ (cached) │ │  OCC)        │ │  only)    │ │              │  │
//! │  └──────────┘ └──────────────┘ └───────────┘ └──────────────┘  │
//! └───────────────┬───────────────────────────────┬─────────────────┘
//!                 │ background fan-out            │
//!                 ▼                               ▼
//!        ┌────────────────┐             ┌──────────────────┐
//!        │    Webhooks    │             │   Integrations   │
//!        │ (HMAC-signed)  │             │ (dispatch log)   │
//!        └────────────────┘             └──────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Serial per tenant**: at most one operation runs at a time within a
//!    tenant; separate tenants are fully parallel.
//! 2. **Event-per-mutation**: every committed mutation appends exactly one
//!    event, in the same transaction.
//! 3. **Sequence = version**: per-entity sequences are contiguous from 1 and
//!    equal the entity version after each mutation.
//! 4. **Events are immutable**: never updated, never deleted.
//! 5. **Soft delete only**: `deletedAt` is set once and never cleared; reads
//!    never return deleted rows.
//! 6. **Isolation**: no record is visible to another tenant's kernel.
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error enum and HTTP status mapping
//! - [`ident`]: opaque short-id minting
//! - [`conjugate`]: verb morphology (action/activity/event forms)
//! - [`types`]: entities, events, subscriptions, envelopes
//! - [`noun`]: noun schemas and field descriptors
//! - [`schema`]: SQLite DDL and database initialization
//! - [`storage`]: the per-tenant data plane (registry, store, log, executor)
//! - [`replay`]: time travel (event folding and field diffs)
//! - [`dispatch`]: webhook fan-out with HMAC signatures
//! - [`integrate`]: integration hooks, service bindings, dispatch log
//! - [`stream`]: the resumable CDC stream
//! - [`kernel`]: tenant kernels and the multi-tenant engine
//!
//! ## Example
//!
//! ```rust,ignore
//! use morphdb::{Engine, KernelConfig, ServiceBindings};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> morphdb::Result<()> {
//!     let engine = Engine::new("./tenants", ServiceBindings::new(), KernelConfig::default());
//!     let kernel = engine.kernel("acme")?;
//!
//!     kernel.define_noun("Contact", json!({
//!         "name": "string!",
//!         "stage": "Lead|Qualified|Customer",
//!         "qualify": "verb",
//!     }).as_object().unwrap().clone()).await?;
//!
//!     let (contact, event) = kernel.create(
//!         "Contact",
//!         json!({"name": "Alice", "stage": "Lead"}).as_object().unwrap().clone(),
//!         "https://acme.example",
//!     ).await?;
//!     println!("created {} (event {})", contact.id, event.id);
//!     Ok(())
//! }
//! ```

pub mod conjugate;
pub mod dispatch;
pub mod error;
pub mod ident;
pub mod integrate;
pub mod kernel;
pub mod noun;
pub mod replay;
pub mod schema;
pub mod storage;
pub mod stream;
pub mod types;

pub use conjugate::{conjugate, third_person, Conjugation};
pub use error::{Error, Result};
pub use integrate::ServiceBindings;
pub use kernel::{Engine, KernelConfig, TenantKernel};
pub use noun::{FieldDef, FieldKind, NounSchema, ScalarKind};
pub use replay::{EntityDiff, FieldChange, ReplayedState};
pub use schema::Database;
pub use storage::{Storage, VerbUsage};
pub use stream::{CdcItem, CdcQuery, CdcStream};
pub use types::{
    DispatchEntry, DispatchStatus, Entity, EventQuery, EventRecord, HookPhase, HookRegistration,
    IntegrationHook, ListPage, ListQuery, Sequence, Service, Subscription, SubscriptionMode,
    TenantInfo, TenantStatus, Version,
};
