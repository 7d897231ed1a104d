//! # Tenant Kernels
//!
//! A [`TenantKernel`] is the per-tenant serial actor: one dedicated OS thread
//! owns the tenant's [`Storage`] (and therefore its SQLite connection), and a
//! cloneable async handle speaks to it over a bounded channel. At most one
//! operation runs at a time within a tenant, which gives serializable
//! isolation without locks, while separate tenants run fully in parallel.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         Async Tasks                           │
//! └───────────────┬───────────────────────────────┬───────────────┘
//!                 │ mpsc + oneshot                │
//!                 ▼                               ▼
//!     ┌───────────────────────┐       ┌───────────────────────┐
//!     │  Kernel thread: "t1"  │       │  Kernel thread: "t2"  │
//!     │  ┌─────────────────┐  │       │  ┌─────────────────┐  │
//!     │  │ Storage (t1.db) │  │       │  │ Storage (t2.db) │  │
//!     │  └────────┬────────┘  │       │  └─────────────────┘  │
//!     │           │ committed │       │                       │
//!     │           ▼ events    │       │                       │
//!     │  ┌─────────────────┐  │       │                       │
//!     │  │ Dispatcher task │──┼──► webhooks + integrations    │
//!     │  └─────────────────┘  │                               │
//!     └───────────────────────┘       └───────────────────────┘
//! ```
//!
//! ## Fan-Out
//!
//! The serve loop itself queues fan-out: after each committed mutation it
//! snapshots the active subscriptions and tenant hooks and hands the
//! `(event, context)` pair to a dispatcher task running on the same
//! single-threaded runtime. That keeps dispatch outside the commit boundary
//! and off the caller's critical path, and makes it survive request
//! cancellation: once the mutation commits, delivery proceeds whether or
//! not the caller is still listening. Dispatch-log rows flow back through
//! the regular request channel.
//!
//! ## The SQLite Constraint
//!
//! `rusqlite::Connection` is not `Sync`, so it cannot be shared across
//! threads. Owning it on one dedicated thread and message-passing to it is
//! both the safety story and the concurrency model the engine wants anyway.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reqwest::Client;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::dispatch;
use crate::error::{Error, Result};
use crate::integrate::{self, builtin_hooks, ServiceBindings};
use crate::noun::NounSchema;
use crate::replay::{EntityDiff, ReplayedState};
use crate::schema::Database;
use crate::storage::{Storage, VerbUsage};
use crate::stream::{CdcQuery, CdcStream, CDC_BATCH_LIMIT};
use crate::types::{
    DispatchEntry, Entity, EventQuery, EventRecord, HookPhase, HookRegistration,
    IntegrationHook, ListPage, ListQuery, Service, Subscription, SubscriptionMode, TenantInfo,
    TenantStatus,
};

// =============================================================================
// Configuration
// =============================================================================

/// Per-kernel tuning knobs.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Bound of the request channel between handles and the kernel thread.
    pub channel_capacity: usize,
    /// Per-call timeout for outbound webhook and integration requests.
    pub dispatch_timeout: Duration,
    /// Cap on in-flight outbound deliveries per event.
    pub fanout_limit: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            dispatch_timeout: Duration::from_secs(10),
            fanout_limit: 32,
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// One request to the kernel thread; every variant carries its responder.
enum Request {
    DefineNoun {
        name: String,
        definition: Map<String, Value>,
        reply: oneshot::Sender<Result<NounSchema>>,
    },
    ListNouns {
        reply: oneshot::Sender<Result<Vec<NounSchema>>>,
    },
    GetNoun {
        name: String,
        reply: oneshot::Sender<Result<NounSchema>>,
    },
    ListVerbs {
        reply: oneshot::Sender<Result<Vec<VerbUsage>>>,
    },
    FindVerb {
        form: String,
        reply: oneshot::Sender<Result<Vec<VerbUsage>>>,
    },
    CreateEntity {
        entity_type: String,
        payload: Map<String, Value>,
        context: String,
        reply: oneshot::Sender<Result<(Entity, EventRecord)>>,
    },
    GetEntity {
        entity_type: String,
        id: String,
        reply: oneshot::Sender<Result<Entity>>,
    },
    ListEntities {
        entity_type: String,
        query: ListQuery,
        reply: oneshot::Sender<Result<ListPage>>,
    },
    UpdateEntity {
        entity_type: String,
        id: String,
        patch: Map<String, Value>,
        expected_version: Option<u64>,
        reply: oneshot::Sender<Result<(Entity, EventRecord)>>,
    },
    DeleteEntity {
        entity_type: String,
        id: String,
        reply: oneshot::Sender<Result<(Entity, EventRecord)>>,
    },
    ExecuteVerb {
        entity_type: String,
        id: String,
        verb: String,
        payload: Option<Map<String, Value>>,
        reply: oneshot::Sender<Result<(Entity, EventRecord)>>,
    },
    QueryEvents {
        query: EventQuery,
        reply: oneshot::Sender<Result<Vec<EventRecord>>>,
    },
    History {
        entity_type: String,
        id: String,
        reply: oneshot::Sender<Result<Vec<EventRecord>>>,
    },
    GetEvent {
        id: String,
        reply: oneshot::Sender<Result<EventRecord>>,
    },
    Reconstruct {
        entity_type: String,
        id: String,
        at_version: Option<u64>,
        as_of: Option<DateTime<Utc>>,
        reply: oneshot::Sender<Result<ReplayedState>>,
    },
    Diff {
        entity_type: String,
        id: String,
        from: u64,
        to: u64,
        reply: oneshot::Sender<Result<EntityDiff>>,
    },
    CdcEvents {
        since: Option<String>,
        types: Vec<String>,
        verbs: Vec<String>,
        reply: oneshot::Sender<Result<Vec<EventRecord>>>,
    },
    AddSubscription {
        pattern: String,
        mode: SubscriptionMode,
        endpoint: String,
        secret: Option<String>,
        reply: oneshot::Sender<Result<Subscription>>,
    },
    ListSubscriptions {
        only_active: bool,
        reply: oneshot::Sender<Result<Vec<Subscription>>>,
    },
    SetSubscriptionActive {
        id: String,
        active: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    AddIntegrationHook {
        entity_type: String,
        verb: String,
        service: Service,
        method: String,
        config: Option<Value>,
        reply: oneshot::Sender<Result<IntegrationHook>>,
    },
    ListTenantIntegrationHooks {
        reply: oneshot::Sender<Result<Vec<IntegrationHook>>>,
    },
    SetIntegrationHookActive {
        id: String,
        active: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    RecordDispatches {
        entries: Vec<DispatchEntry>,
        reply: oneshot::Sender<Result<()>>,
    },
    ListDispatches {
        event_id: Option<String>,
        limit: u64,
        reply: oneshot::Sender<Result<Vec<DispatchEntry>>>,
    },
    Relate {
        subject: String,
        predicate: String,
        object: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Related {
        subject: String,
        predicate: String,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    RelatedTo {
        object: String,
        predicate: String,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    RegisterHook {
        noun: String,
        verb: String,
        phase: HookPhase,
        code: String,
        reply: oneshot::Sender<Result<HookRegistration>>,
    },
    ListHooks {
        noun: Option<String>,
        verb: Option<String>,
        reply: oneshot::Sender<Result<Vec<HookRegistration>>>,
    },
    TenantInfo {
        reply: oneshot::Sender<Result<TenantInfo>>,
    },
    SetTenantStatus {
        status: TenantStatus,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Everything the dispatcher needs for one committed event, snapshotted by
/// the serve loop at commit time.
struct FanOutJob {
    event: EventRecord,
    context: String,
    subscriptions: Vec<Subscription>,
    tenant_hooks: Vec<IntegrationHook>,
}

// =============================================================================
// TenantKernel
// =============================================================================

/// The async handle to one tenant's kernel.
///
/// `Clone`, `Send`, `Sync`; clones share the kernel thread. Dropping every
/// handle without [`TenantKernel::shutdown`] closes the channel, which ends
/// the serve loop.
#[derive(Clone)]
pub struct TenantKernel {
    tenant_id: String,
    tx: mpsc::Sender<Request>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TenantKernel {
    /// Spawns the kernel thread for a tenant.
    ///
    /// `path = None` opens an in-memory database (tests); files persist
    /// across kernel restarts.
    pub(crate) fn spawn(
        tenant_id: &str,
        path: Option<PathBuf>,
        bindings: Arc<ServiceBindings>,
        config: &KernelConfig,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(config.channel_capacity);

        // The dispatcher records outcomes through the regular request
        // channel. It holds a weak sender so that dropping every handle
        // still closes the channel and ends the serve loop.
        let record_tx = tx.downgrade();
        let http = Client::builder()
            .timeout(config.dispatch_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build http client: {}", e)))?;
        let fanout_limit = config.fanout_limit;

        let thread_tenant = tenant_id.to_string();
        let thread = thread::Builder::new()
            .name(format!("morphdb-kernel-{}", tenant_id))
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to create kernel runtime");
                rt.block_on(async move {
                    let database = match &path {
                        Some(p) => Database::open(p),
                        None => Database::open_in_memory(),
                    };
                    let mut storage = match database {
                        Ok(db) => Storage::new(db.into_connection()),
                        Err(err) => {
                            warn!(tenant = %thread_tenant, error = %err, "failed to open tenant database");
                            return;
                        }
                    };
                    if let Err(err) = storage.init_tenant_meta(&thread_tenant) {
                        warn!(tenant = %thread_tenant, error = %err, "failed to initialize tenant metadata");
                        return;
                    }

                    // Dispatcher runs as a sibling task on this same
                    // single-threaded runtime; it makes progress whenever the
                    // serve loop awaits.
                    let (fan_tx, fan_rx) = mpsc::unbounded_channel();
                    let dispatcher = tokio::spawn(run_dispatcher(
                        fan_rx,
                        http,
                        bindings,
                        record_tx,
                        fanout_limit,
                    ));

                    run_kernel(storage, rx, fan_tx).await;
                    // Dropping fan_tx above (run_kernel owns it) lets the
                    // dispatcher drain its queue and exit.
                    let _ = dispatcher.await;
                });
            })
            .map_err(|e| Error::Internal(format!("failed to spawn kernel thread: {}", e)))?;

        info!(tenant = tenant_id, "tenant kernel started");
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            tx,
            thread: Arc::new(Mutex::new(Some(thread))),
        })
    }

    /// The tenant this kernel serves.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Sends one request and awaits its reply.
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::Internal("tenant kernel has shut down".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Internal("tenant kernel dropped the reply".to_string()))
    }

    // =========================================================================
    // Schema Registry
    // =========================================================================

    pub async fn define_noun(
        &self,
        name: &str,
        definition: Map<String, Value>,
    ) -> Result<NounSchema> {
        let name = name.to_string();
        self.request(|reply| Request::DefineNoun { name, definition, reply })
            .await?
    }

    pub async fn list_nouns(&self) -> Result<Vec<NounSchema>> {
        self.request(|reply| Request::ListNouns { reply }).await?
    }

    pub async fn get_noun(&self, name: &str) -> Result<NounSchema> {
        let name = name.to_string();
        self.request(|reply| Request::GetNoun { name, reply }).await?
    }

    pub async fn list_verbs(&self) -> Result<Vec<VerbUsage>> {
        self.request(|reply| Request::ListVerbs { reply }).await?
    }

    pub async fn find_verb_by_any_form(&self, form: &str) -> Result<Vec<VerbUsage>> {
        let form = form.to_string();
        self.request(|reply| Request::FindVerb { form, reply }).await?
    }

    // =========================================================================
    // Entities and Verbs
    // =========================================================================

    /// Creates an entity; fan-out is queued by the kernel at commit.
    pub async fn create(
        &self,
        entity_type: &str,
        payload: Map<String, Value>,
        context: &str,
    ) -> Result<(Entity, EventRecord)> {
        let entity_type = entity_type.to_string();
        let context = context.to_string();
        self.request(|reply| Request::CreateEntity { entity_type, payload, context, reply })
            .await?
    }

    pub async fn get(&self, entity_type: &str, id: &str) -> Result<Entity> {
        let entity_type = entity_type.to_string();
        let id = id.to_string();
        self.request(|reply| Request::GetEntity { entity_type, id, reply })
            .await?
    }

    pub async fn list(&self, entity_type: &str, query: ListQuery) -> Result<ListPage> {
        let entity_type = entity_type.to_string();
        self.request(|reply| Request::ListEntities { entity_type, query, reply })
            .await?
    }

    /// Updates under optimistic concurrency.
    pub async fn update(
        &self,
        entity_type: &str,
        id: &str,
        patch: Map<String, Value>,
        expected_version: Option<u64>,
    ) -> Result<(Entity, EventRecord)> {
        let entity_type = entity_type.to_string();
        let id = id.to_string();
        self.request(|reply| Request::UpdateEntity {
            entity_type,
            id,
            patch,
            expected_version,
            reply,
        })
        .await?
    }

    /// Soft-deletes an entity.
    pub async fn delete(&self, entity_type: &str, id: &str) -> Result<(Entity, EventRecord)> {
        let entity_type = entity_type.to_string();
        let id = id.to_string();
        self.request(|reply| Request::DeleteEntity { entity_type, id, reply })
            .await?
    }

    /// Executes a verb by its action form.
    pub async fn execute(
        &self,
        entity_type: &str,
        id: &str,
        verb: &str,
        payload: Option<Map<String, Value>>,
    ) -> Result<(Entity, EventRecord)> {
        let entity_type = entity_type.to_string();
        let id = id.to_string();
        let verb = verb.to_string();
        self.request(|reply| Request::ExecuteVerb { entity_type, id, verb, payload, reply })
            .await?
    }

    // =========================================================================
    // Event Log and Time Travel
    // =========================================================================

    pub async fn query_events(&self, query: EventQuery) -> Result<Vec<EventRecord>> {
        self.request(|reply| Request::QueryEvents { query, reply }).await?
    }

    pub async fn history(&self, entity_type: &str, id: &str) -> Result<Vec<EventRecord>> {
        let entity_type = entity_type.to_string();
        let id = id.to_string();
        self.request(|reply| Request::History { entity_type, id, reply })
            .await?
    }

    pub async fn get_event(&self, id: &str) -> Result<EventRecord> {
        let id = id.to_string();
        self.request(|reply| Request::GetEvent { id, reply }).await?
    }

    pub async fn reconstruct(
        &self,
        entity_type: &str,
        id: &str,
        at_version: Option<u64>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<ReplayedState> {
        let entity_type = entity_type.to_string();
        let id = id.to_string();
        self.request(|reply| Request::Reconstruct { entity_type, id, at_version, as_of, reply })
            .await?
    }

    pub async fn diff(
        &self,
        entity_type: &str,
        id: &str,
        from: u64,
        to: u64,
    ) -> Result<EntityDiff> {
        let entity_type = entity_type.to_string();
        let id = id.to_string();
        self.request(|reply| Request::Diff { entity_type, id, from, to, reply })
            .await?
    }

    /// Opens a CDC stream: buffered matching events, one heartbeat, close.
    pub async fn stream_events(&self, query: CdcQuery) -> Result<CdcStream> {
        let CdcQuery { since, types, verbs } = query;
        let events = self
            .request(|reply| Request::CdcEvents { since, types, verbs, reply })
            .await??;
        Ok(CdcStream::new(events))
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    pub async fn subscribe(
        &self,
        pattern: &str,
        mode: SubscriptionMode,
        endpoint: &str,
        secret: Option<String>,
    ) -> Result<Subscription> {
        let pattern = pattern.to_string();
        let endpoint = endpoint.to_string();
        self.request(|reply| Request::AddSubscription { pattern, mode, endpoint, secret, reply })
            .await?
    }

    pub async fn list_subscriptions(&self, only_active: bool) -> Result<Vec<Subscription>> {
        self.request(|reply| Request::ListSubscriptions { only_active, reply })
            .await?
    }

    pub async fn set_subscription_active(&self, id: &str, active: bool) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Request::SetSubscriptionActive { id, active, reply })
            .await?
    }

    // =========================================================================
    // Integration Hooks and Dispatch Log
    // =========================================================================

    pub async fn add_integration_hook(
        &self,
        entity_type: &str,
        verb: &str,
        service: Service,
        method: &str,
        config: Option<Value>,
    ) -> Result<IntegrationHook> {
        let entity_type = entity_type.to_string();
        let verb = verb.to_string();
        let method = method.to_string();
        self.request(|reply| Request::AddIntegrationHook {
            entity_type,
            verb,
            service,
            method,
            config,
            reply,
        })
        .await?
    }

    /// Built-in hooks (read-only) followed by the tenant's own.
    pub async fn list_integration_hooks(&self) -> Result<Vec<IntegrationHook>> {
        let tenant_hooks = self
            .request(|reply| Request::ListTenantIntegrationHooks { reply })
            .await??;
        let mut hooks = builtin_hooks();
        hooks.extend(tenant_hooks);
        Ok(hooks)
    }

    pub async fn set_integration_hook_active(&self, id: &str, active: bool) -> Result<()> {
        if id.starts_with("builtin:") {
            return Err(Error::BadInput("built-in hooks cannot be modified".to_string()));
        }
        let id = id.to_string();
        self.request(|reply| Request::SetIntegrationHookActive { id, active, reply })
            .await?
    }

    pub async fn list_dispatches(
        &self,
        event_id: Option<&str>,
        limit: u64,
    ) -> Result<Vec<DispatchEntry>> {
        let event_id = event_id.map(str::to_string);
        self.request(|reply| Request::ListDispatches { event_id, limit, reply })
            .await?
    }

    // =========================================================================
    // Relationships and Stored Hooks
    // =========================================================================

    pub async fn relate(&self, subject: &str, predicate: &str, object: &str) -> Result<()> {
        let subject = subject.to_string();
        let predicate = predicate.to_string();
        let object = object.to_string();
        self.request(|reply| Request::Relate { subject, predicate, object, reply })
            .await?
    }

    pub async fn related(&self, subject: &str, predicate: &str) -> Result<Vec<String>> {
        let subject = subject.to_string();
        let predicate = predicate.to_string();
        self.request(|reply| Request::Related { subject, predicate, reply })
            .await?
    }

    pub async fn related_to(&self, object: &str, predicate: &str) -> Result<Vec<String>> {
        let object = object.to_string();
        let predicate = predicate.to_string();
        self.request(|reply| Request::RelatedTo { object, predicate, reply })
            .await?
    }

    pub async fn register_hook(
        &self,
        noun: &str,
        verb: &str,
        phase: HookPhase,
        code: &str,
    ) -> Result<HookRegistration> {
        let noun = noun.to_string();
        let verb = verb.to_string();
        let code = code.to_string();
        self.request(|reply| Request::RegisterHook { noun, verb, phase, code, reply })
            .await?
    }

    pub async fn list_hooks(
        &self,
        noun: Option<&str>,
        verb: Option<&str>,
    ) -> Result<Vec<HookRegistration>> {
        let noun = noun.map(str::to_string);
        let verb = verb.map(str::to_string);
        self.request(|reply| Request::ListHooks { noun, verb, reply })
            .await?
    }

    // =========================================================================
    // Tenant Metadata and Shutdown
    // =========================================================================

    pub async fn tenant_info(&self) -> Result<TenantInfo> {
        self.request(|reply| Request::TenantInfo { reply }).await?
    }

    pub async fn set_tenant_status(&self, status: TenantStatus) -> Result<()> {
        self.request(|reply| Request::SetTenantStatus { status, reply })
            .await?
    }

    /// Graceful shutdown: stop the kernel thread and join it. The dispatcher
    /// drains queued fan-out jobs first.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Request::Shutdown).await;
        if let Some(handle) = self.thread.lock().await.take() {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// Kernel Loop
// =============================================================================

/// Snapshots fan-out inputs at commit time and queues the job.
fn queue_fanout(
    storage: &Storage,
    fan_tx: &mpsc::UnboundedSender<FanOutJob>,
    entity: &Entity,
    event: &EventRecord,
) {
    let subscriptions = storage.list_subscriptions(true).unwrap_or_default();
    let tenant_hooks = storage.list_integration_hooks().unwrap_or_default();
    let _ = fan_tx.send(FanOutJob {
        event: event.clone(),
        context: entity.context.clone(),
        subscriptions,
        tenant_hooks,
    });
}

/// The kernel thread's serve loop: every request runs to completion before
/// the next is taken, which is the whole concurrency model.
async fn run_kernel(
    mut storage: Storage,
    mut rx: mpsc::Receiver<Request>,
    fan_tx: mpsc::UnboundedSender<FanOutJob>,
) {
    while let Some(request) = rx.recv().await {
        match request {
            Request::DefineNoun { name, definition, reply } => {
                let _ = reply.send(storage.define_noun(&name, &definition));
            }
            Request::ListNouns { reply } => {
                let _ = reply.send(storage.list_nouns());
            }
            Request::GetNoun { name, reply } => {
                let _ = reply.send(storage.get_noun(&name));
            }
            Request::ListVerbs { reply } => {
                let _ = reply.send(storage.list_verbs());
            }
            Request::FindVerb { form, reply } => {
                let _ = reply.send(storage.find_verb_by_any_form(&form));
            }
            Request::CreateEntity { entity_type, payload, context, reply } => {
                let result = storage.create_entity(&entity_type, payload, &context);
                if let Ok((entity, event)) = &result {
                    queue_fanout(&storage, &fan_tx, entity, event);
                }
                let _ = reply.send(result);
            }
            Request::GetEntity { entity_type, id, reply } => {
                let _ = reply.send(storage.get_entity(&entity_type, &id));
            }
            Request::ListEntities { entity_type, query, reply } => {
                let _ = reply.send(storage.list_entities(&entity_type, &query));
            }
            Request::UpdateEntity { entity_type, id, patch, expected_version, reply } => {
                let result = storage.update_entity(&entity_type, &id, patch, expected_version);
                if let Ok((entity, event)) = &result {
                    queue_fanout(&storage, &fan_tx, entity, event);
                }
                let _ = reply.send(result);
            }
            Request::DeleteEntity { entity_type, id, reply } => {
                let result = storage.delete_entity(&entity_type, &id);
                if let Ok((entity, event)) = &result {
                    queue_fanout(&storage, &fan_tx, entity, event);
                }
                let _ = reply.send(result);
            }
            Request::ExecuteVerb { entity_type, id, verb, payload, reply } => {
                let result = storage.execute_verb(&entity_type, &id, &verb, payload);
                if let Ok((entity, event)) = &result {
                    queue_fanout(&storage, &fan_tx, entity, event);
                }
                let _ = reply.send(result);
            }
            Request::QueryEvents { query, reply } => {
                let _ = reply.send(storage.query_events(&query));
            }
            Request::History { entity_type, id, reply } => {
                let _ = reply.send(storage.history(&entity_type, &id));
            }
            Request::GetEvent { id, reply } => {
                let _ = reply.send(storage.get_event(&id));
            }
            Request::Reconstruct { entity_type, id, at_version, as_of, reply } => {
                let _ = reply.send(storage.reconstruct(&entity_type, &id, at_version, as_of));
            }
            Request::Diff { entity_type, id, from, to, reply } => {
                let _ = reply.send(storage.diff(&entity_type, &id, from, to));
            }
            Request::CdcEvents { since, types, verbs, reply } => {
                let _ = reply.send(storage.events_after_cursor(
                    since.as_deref(),
                    &types,
                    &verbs,
                    CDC_BATCH_LIMIT,
                ));
            }
            Request::AddSubscription { pattern, mode, endpoint, secret, reply } => {
                let _ = reply.send(storage.add_subscription(&pattern, mode, &endpoint, secret));
            }
            Request::ListSubscriptions { only_active, reply } => {
                let _ = reply.send(storage.list_subscriptions(only_active));
            }
            Request::SetSubscriptionActive { id, active, reply } => {
                let _ = reply.send(storage.set_subscription_active(&id, active));
            }
            Request::AddIntegrationHook { entity_type, verb, service, method, config, reply } => {
                let _ = reply.send(storage.add_integration_hook(
                    &entity_type,
                    &verb,
                    service,
                    &method,
                    config,
                ));
            }
            Request::ListTenantIntegrationHooks { reply } => {
                let _ = reply.send(storage.list_integration_hooks());
            }
            Request::SetIntegrationHookActive { id, active, reply } => {
                let _ = reply.send(storage.set_integration_hook_active(&id, active));
            }
            Request::RecordDispatches { entries, reply } => {
                let mut result = Ok(());
                for entry in &entries {
                    if let Err(err) = storage.record_dispatch(entry) {
                        result = Err(err);
                        break;
                    }
                }
                let _ = reply.send(result);
            }
            Request::ListDispatches { event_id, limit, reply } => {
                let _ = reply.send(storage.list_dispatches(event_id.as_deref(), limit));
            }
            Request::Relate { subject, predicate, object, reply } => {
                let _ = reply.send(storage.relate(&subject, &predicate, &object));
            }
            Request::Related { subject, predicate, reply } => {
                let _ = reply.send(storage.related(&subject, &predicate));
            }
            Request::RelatedTo { object, predicate, reply } => {
                let _ = reply.send(storage.related_to(&object, &predicate));
            }
            Request::RegisterHook { noun, verb, phase, code, reply } => {
                let _ = reply.send(storage.register_hook(&noun, &verb, phase, &code));
            }
            Request::ListHooks { noun, verb, reply } => {
                let _ = reply.send(storage.list_hooks(noun.as_deref(), verb.as_deref()));
            }
            Request::TenantInfo { reply } => {
                let _ = reply.send(storage.tenant_info());
            }
            Request::SetTenantStatus { status, reply } => {
                let _ = reply.send(storage.set_tenant_status(status));
            }
            Request::Shutdown => break,
        }
    }
}

/// Delivers queued fan-out jobs: webhooks first, then integrations, with
/// dispatch-log rows written back through the request channel. Exits when
/// the serve loop drops its sender.
async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<FanOutJob>,
    http: Client,
    bindings: Arc<ServiceBindings>,
    record_tx: mpsc::WeakSender<Request>,
    fanout_limit: usize,
) {
    while let Some(job) = rx.recv().await {
        if dispatch_one_job(
            http.clone(),
            bindings.clone(),
            record_tx.clone(),
            job,
            fanout_limit,
        )
        .await
        .is_break()
        {
            return;
        }
    }
}

/// Processes a single fan-out job. Factored out of `run_dispatcher`'s loop so
/// each iteration's borrows stay in their own stack frame instead of being
/// folded into the loop's generator state.
async fn dispatch_one_job(
    http: Client,
    bindings: Arc<ServiceBindings>,
    record_tx: mpsc::WeakSender<Request>,
    job: FanOutJob,
    fanout_limit: usize,
) -> std::ops::ControlFlow<()> {
    dispatch::fan_out(
        http.clone(),
        job.subscriptions.clone(),
        job.event.clone(),
        fanout_limit,
    )
    .await;

    let entries = integrate::dispatch_all(
        http,
        bindings,
        job.tenant_hooks,
        job.event,
        job.context,
        fanout_limit,
    )
    .await;
    if entries.is_empty() {
        return std::ops::ControlFlow::Continue(());
    }
    // The serve loop may already be gone at teardown; outcomes are then
    // dropped, matching the at-most-once delivery contract.
    let record = match record_tx.upgrade() {
        Some(record) => record,
        None => return std::ops::ControlFlow::Break(()),
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    if record
        .send(Request::RecordDispatches { entries, reply: reply_tx })
        .await
        .is_err()
    {
        return std::ops::ControlFlow::Break(());
    }
    if let Ok(Err(err)) = reply_rx.await {
        warn!(error = %err, "dispatch log write failed");
    }
    std::ops::ControlFlow::Continue(())
}

// =============================================================================
// Engine
// =============================================================================

/// The multi-tenant engine: a lazy registry of tenant kernels plus the
/// shared outbound service bindings.
///
/// Kernels are created on first access and kept for the engine's lifetime;
/// a kernel is never shared between tenants, and each owns its database
/// exclusively.
pub struct Engine {
    /// Directory of tenant database files; `None` = in-memory (tests).
    root: Option<PathBuf>,
    bindings: Arc<ServiceBindings>,
    config: KernelConfig,
    kernels: DashMap<String, TenantKernel>,
}

impl Engine {
    /// An engine persisting each tenant at `{root}/{tenant_id}.db`.
    pub fn new(root: impl Into<PathBuf>, bindings: ServiceBindings, config: KernelConfig) -> Self {
        Self {
            root: Some(root.into()),
            bindings: Arc::new(bindings),
            config,
            kernels: DashMap::new(),
        }
    }

    /// An engine whose tenants live in memory.
    pub fn in_memory(bindings: ServiceBindings, config: KernelConfig) -> Self {
        Self { root: None, bindings: Arc::new(bindings), config, kernels: DashMap::new() }
    }

    /// Resolves (lazily creating) the kernel for a tenant.
    pub fn kernel(&self, tenant_id: &str) -> Result<TenantKernel> {
        validate_tenant_id(tenant_id)?;
        match self.kernels.entry(tenant_id.to_string()) {
            Entry::Occupied(occupied) => Ok(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let path = self.root.as_ref().map(|root| root.join(format!("{}.db", tenant_id)));
                let kernel = TenantKernel::spawn(
                    tenant_id,
                    path,
                    Arc::clone(&self.bindings),
                    &self.config,
                )?;
                vacant.insert(kernel.clone());
                Ok(kernel)
            }
        }
    }

    /// Marks a tenant deactivated; data and kernel are retained.
    pub async fn deactivate_tenant(&self, tenant_id: &str) -> Result<()> {
        self.kernel(tenant_id)?
            .set_tenant_status(TenantStatus::Deactivated)
            .await
    }

    /// Reactivates a previously deactivated tenant.
    pub async fn reactivate_tenant(&self, tenant_id: &str) -> Result<()> {
        self.kernel(tenant_id)?.set_tenant_status(TenantStatus::Active).await
    }

    /// Shuts down every kernel this engine created.
    pub async fn shutdown(self) {
        let tenants: Vec<String> = self.kernels.iter().map(|e| e.key().clone()).collect();
        for tenant in tenants {
            if let Some((_, kernel)) = self.kernels.remove(&tenant) {
                kernel.shutdown().await;
            }
        }
    }
}

/// Tenant ids become file names; keep them boring.
fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    let valid = !tenant_id.is_empty()
        && tenant_id.len() <= 64
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::BadInput(format!("invalid tenant id '{}'", tenant_id)))
    }
}

// =============================================================================
// Tests
// =============================================================================
