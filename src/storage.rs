//! # Synchronous Storage Layer
//!
//! `Storage` owns one tenant's SQLite connection and implements the kernel's
//! data plane: the schema registry, the entity store, the event log, the
//! verb executor's mutation path, and the bookkeeping tables (subscriptions,
//! integration hooks, dispatch log, relationships, stored hooks, tenant
//! metadata).
//!
//! ## Single Writer
//!
//! `Storage` is not thread-safe and never needs to be: each tenant kernel
//! runs it on one dedicated thread (see [`kernel`](crate::kernel)), so every
//! operation within a tenant is serialized. Write operations take `&mut self`
//! to make mutation visible in signatures.
//!
//! ## Commit Boundary
//!
//! Every entity mutation and its event are persisted in the same SQLite
//! transaction. The event's sequence is computed as `MAX(sequence) + 1` over
//! the target entity *inside* that transaction, which keeps the core
//! invariant (event sequence equals resulting entity version) even across
//! crashes: either both rows land or neither does.
//!
//! ## Schema Cache
//!
//! Parsed noun schemas are cached in memory, hydrated lazily on first use
//! and invalidated in full by every `define_noun`. The cache belongs to this
//! struct (per kernel), never to the process.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use serde_json::{Map, Value};
use tracing::debug;

use crate::conjugate::{conjugate, Conjugation};
use crate::error::{Error, Result};
use crate::ident;
use crate::noun::{NounSchema, VerbResolution};
use crate::replay::{diff_fields, fold_events, EntityDiff, ReplayedState};
use crate::types::{
    from_millis, now, to_millis, strip_reserved, DispatchEntry, DispatchStatus, Entity,
    EventQuery, EventRecord, HookPhase, HookRegistration, IntegrationHook, ListPage, ListQuery,
    Sequence, Service, Subscription, SubscriptionMode, TenantInfo, TenantStatus, Version,
};

// =============================================================================
// Registry Views
// =============================================================================

/// A verb flattened across the registry: its conjugation and the nouns that
/// declare it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerbUsage {
    pub verb: String,
    pub conjugation: Conjugation,
    pub nouns: Vec<String>,
}

// =============================================================================
// Storage
// =============================================================================

/// One tenant's storage: connection plus parsed-schema cache.
pub struct Storage {
    conn: Connection,
    /// `None` until hydrated; invalidated (reset to `None`) on every define.
    schemas: Option<HashMap<String, Arc<NounSchema>>>,
}

impl Storage {
    /// Wraps an initialized connection (see [`Database`](crate::schema::Database)).
    pub fn new(conn: Connection) -> Self {
        Self { conn, schemas: None }
    }

    // =========================================================================
    // Schema Registry (C3)
    // =========================================================================

    /// Registers (or replaces) a noun schema and invalidates the cache.
    pub fn define_noun(&mut self, name: &str, definition: &Map<String, Value>) -> Result<NounSchema> {
        let schema = NounSchema::define(name, definition)?;
        let encoded = serde_json::to_string(&schema)?;
        self.conn.execute(
            "INSERT INTO nouns (name, schema, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET schema = excluded.schema",
            params![schema.name, encoded, to_millis(now())],
        )?;
        // Total invalidation: the next read re-hydrates from disk, so cache
        // and store agree after every successful define.
        self.schemas = None;
        Ok(schema)
    }

    fn hydrate(&mut self) -> Result<&HashMap<String, Arc<NounSchema>>> {
        if self.schemas.is_none() {
            let mut loaded = HashMap::new();
            let mut stmt = self.conn.prepare("SELECT name, schema FROM nouns")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (name, encoded) = row?;
                let schema: NounSchema = serde_json::from_str(&encoded)?;
                loaded.insert(name, Arc::new(schema));
            }
            self.schemas = Some(loaded);
        }
        Ok(self.schemas.as_ref().expect("hydrated above"))
    }

    /// Looks up a noun, failing with `SchemaMissing` (the entity-operation
    /// error) when it is not defined.
    fn schema(&mut self, name: &str) -> Result<Arc<NounSchema>> {
        self.hydrate()?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SchemaMissing { noun: name.to_string() })
    }

    /// All registered nouns, sorted by name.
    pub fn list_nouns(&mut self) -> Result<Vec<NounSchema>> {
        let mut nouns: Vec<NounSchema> =
            self.hydrate()?.values().map(|s| (**s).clone()).collect();
        nouns.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nouns)
    }

    /// One noun by name, or `NotFound` (the read-path error).
    pub fn get_noun(&mut self, name: &str) -> Result<NounSchema> {
        self.hydrate()?
            .get(name)
            .map(|s| (**s).clone())
            .ok_or_else(|| Error::NotFound { kind: "noun", id: name.to_string() })
    }

    /// Flattens all schemas into verb → (conjugation, nouns), deduplicated.
    pub fn list_verbs(&mut self) -> Result<Vec<VerbUsage>> {
        let mut by_verb: HashMap<String, VerbUsage> = HashMap::new();
        for schema in self.hydrate()?.values() {
            for (verb, conj) in &schema.verbs {
                let usage = by_verb.entry(verb.clone()).or_insert_with(|| VerbUsage {
                    verb: verb.clone(),
                    conjugation: conj.clone(),
                    nouns: Vec::new(),
                });
                usage.nouns.push(schema.name.clone());
            }
        }
        let mut verbs: Vec<VerbUsage> = by_verb.into_values().collect();
        for usage in &mut verbs {
            usage.nouns.sort();
            usage.nouns.dedup();
        }
        verbs.sort_by(|a, b| a.verb.cmp(&b.verb));
        Ok(verbs)
    }

    /// Searches verbs by action, activity, or event form.
    pub fn find_verb_by_any_form(&mut self, form: &str) -> Result<Vec<VerbUsage>> {
        Ok(self
            .list_verbs()?
            .into_iter()
            .filter(|u| {
                u.conjugation.action == form
                    || u.conjugation.activity == form
                    || u.conjugation.event == form
            })
            .collect())
    }

    // =========================================================================
    // Entity Store (C4)
    // =========================================================================

    /// Creates an entity and appends its `create` event atomically.
    pub fn create_entity(
        &mut self,
        entity_type: &str,
        payload: Map<String, Value>,
        context: &str,
    ) -> Result<(Entity, EventRecord)> {
        let schema = self.schema(entity_type)?;
        if schema.is_disabled("create") {
            return Err(Error::VerbDisabled {
                noun: entity_type.to_string(),
                verb: "create".to_string(),
            });
        }
        let conj = schema
            .verb("create")
            .cloned()
            .unwrap_or_else(|| conjugate("create"));

        // Caller-provided ids are honored; otherwise one is minted.
        let id = match payload.get("id").and_then(Value::as_str) {
            Some(provided) => provided.to_string(),
            None => ident::entity_id(entity_type),
        };

        let ts = now();
        let mut data = payload.clone();
        data.insert("id".to_string(), Value::String(id.clone()));
        data.insert("type".to_string(), Value::String(entity_type.to_string()));

        let entity = Entity {
            id: id.clone(),
            entity_type: entity_type.to_string(),
            data,
            version: Version::FIRST,
            created_at: ts,
            updated_at: ts,
            deleted_at: None,
            context: context.to_string(),
        };
        let after = entity.snapshot();

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO entities (id, type, data, version, created_at, updated_at, deleted_at, context)
             VALUES (?, ?, ?, ?, ?, ?, NULL, ?)",
            params![
                entity.id,
                entity.entity_type,
                serde_json::to_string(&Value::Object(entity.data.clone()))?,
                entity.version.as_raw() as i64,
                to_millis(ts),
                to_millis(ts),
                entity.context,
            ],
        )?;
        let event = append_event_tx(
            &tx,
            &conj,
            entity_type,
            &id,
            "create",
            Some(Value::Object(payload)),
            None,
            Some(after),
            ts,
        )?;
        tx.commit()?;

        Ok((entity, event))
    }

    /// Reads a live entity; soft-deleted rows are filtered in SQL.
    pub fn get_entity(&self, entity_type: &str, id: &str) -> Result<Entity> {
        self.conn
            .query_row(
                "SELECT id, type, data, version, created_at, updated_at, deleted_at, context
                 FROM entities WHERE id = ? AND type = ? AND deleted_at IS NULL",
                params![id, entity_type],
                row_to_entity,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound { kind: "entity", id: id.to_string() })
    }

    /// Lists live entities with the filter pushed down into the query.
    ///
    /// The filter participates in the WHERE clause (not post-pagination
    /// trimming), so `total` and `hasMore` are correct under any page size.
    pub fn list_entities(&self, entity_type: &str, query: &ListQuery) -> Result<ListPage> {
        let mut where_sql = String::from("type = ? AND deleted_at IS NULL");
        let mut where_params: Vec<SqlValue> =
            vec![SqlValue::Text(entity_type.to_string())];

        if let Some(filter) = &query.filter {
            for (field, value) in filter {
                let path = json_path(field);
                match value {
                    // Null matches both absent and explicit-null fields.
                    Value::Null => {
                        where_sql.push_str(" AND json_extract(data, ?) IS NULL");
                        where_params.push(SqlValue::Text(path));
                    }
                    Value::Bool(b) => {
                        where_sql.push_str(" AND json_extract(data, ?) = ?");
                        where_params.push(SqlValue::Text(path));
                        where_params.push(SqlValue::Integer(i64::from(*b)));
                    }
                    Value::Number(n) => {
                        where_sql.push_str(" AND json_extract(data, ?) = ?");
                        where_params.push(SqlValue::Text(path));
                        if let Some(i) = n.as_i64() {
                            where_params.push(SqlValue::Integer(i));
                        } else {
                            where_params.push(SqlValue::Real(n.as_f64().unwrap_or(0.0)));
                        }
                    }
                    Value::String(s) => {
                        where_sql.push_str(" AND json_extract(data, ?) = ?");
                        where_params.push(SqlValue::Text(path));
                        where_params.push(SqlValue::Text(s.clone()));
                    }
                    // Containers compare by normalized JSON text.
                    other => {
                        where_sql.push_str(" AND json_extract(data, ?) = json_extract(?, '$')");
                        where_params.push(SqlValue::Text(path));
                        where_params.push(SqlValue::Text(serde_json::to_string(other)?));
                    }
                }
            }
        }

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM entities WHERE {}", where_sql),
            params_from_iter(where_params.iter()),
            |row| row.get(0),
        )?;

        // Sort: built-in time fields use native columns; anything else uses
        // document extraction; invalid expressions fall back.
        let mut select_params = where_params;
        let order_sql = match &query.sort {
            Some((field, dir)) if *dir == 1 || *dir == -1 => {
                let direction = if *dir == 1 { "ASC" } else { "DESC" };
                match field.as_str() {
                    "$createdAt" => format!("created_at {}", direction),
                    "$updatedAt" => format!("updated_at {}", direction),
                    _ => {
                        select_params.push(SqlValue::Text(json_path(field)));
                        format!("json_extract(data, ?) {}", direction)
                    }
                }
            }
            _ => "created_at DESC".to_string(),
        };

        let limit = query.effective_limit();
        let offset = query.effective_offset();
        select_params.push(SqlValue::Integer(limit as i64));
        select_params.push(SqlValue::Integer(offset as i64));

        let sql = format!(
            "SELECT id, type, data, version, created_at, updated_at, deleted_at, context
             FROM entities WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
            where_sql, order_sql
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let entities: Vec<Entity> = stmt
            .query_map(params_from_iter(select_params.iter()), row_to_entity)?
            .collect::<std::result::Result<_, _>>()?;

        // More rows exist iff the window ends before `total`.
        let has_more = offset + (entities.len() as u64) < total as u64;

        Ok(ListPage { entities, total: total as u64, limit, offset, has_more })
    }

    /// Merges a patch into an entity under optimistic concurrency and
    /// appends the `update` event atomically.
    pub fn update_entity(
        &mut self,
        entity_type: &str,
        id: &str,
        mut patch: Map<String, Value>,
        expected_version: Option<u64>,
    ) -> Result<(Entity, EventRecord)> {
        let schema = self.schema(entity_type)?;
        if schema.is_disabled("update") {
            return Err(Error::VerbDisabled {
                noun: entity_type.to_string(),
                verb: "update".to_string(),
            });
        }
        let conj = schema
            .verb("update")
            .cloned()
            .unwrap_or_else(|| conjugate("update"));

        strip_reserved(&mut patch);
        let patch_value = Value::Object(patch.clone());

        let ts = now();
        let tx = self.conn.transaction()?;
        let mut entity = fetch_entity_tx(&tx, entity_type, id)?;

        if let Some(expected) = expected_version {
            if expected != entity.version.as_raw() {
                // The conflict reply carries the current version so the
                // caller can re-read and retry.
                return Err(Error::VersionConflict {
                    entity_id: id.to_string(),
                    expected,
                    current: entity.version.as_raw(),
                });
            }
        }

        let before = entity.snapshot();
        for (key, value) in patch {
            entity.data.insert(key, value);
        }
        entity.version = entity.version.next();
        entity.updated_at = ts;
        let after = entity.snapshot();

        tx.execute(
            "UPDATE entities SET data = ?, version = ?, updated_at = ? WHERE id = ?",
            params![
                serde_json::to_string(&Value::Object(entity.data.clone()))?,
                entity.version.as_raw() as i64,
                to_millis(ts),
                id,
            ],
        )?;
        let event = append_event_tx(
            &tx,
            &conj,
            entity_type,
            id,
            "update",
            Some(patch_value),
            Some(before),
            Some(after),
            ts,
        )?;
        tx.commit()?;

        debug_assert_eq!(entity.version.as_raw(), event.sequence.as_raw());
        Ok((entity, event))
    }

    /// Soft-deletes an entity and appends the `delete` event atomically.
    ///
    /// A second delete sees the soft-deleted row filtered out and returns
    /// `NotFound`; no second event is emitted.
    pub fn delete_entity(&mut self, entity_type: &str, id: &str) -> Result<(Entity, EventRecord)> {
        let schema = self.schema(entity_type)?;
        if schema.is_disabled("delete") {
            return Err(Error::VerbDisabled {
                noun: entity_type.to_string(),
                verb: "delete".to_string(),
            });
        }
        let conj = schema
            .verb("delete")
            .cloned()
            .unwrap_or_else(|| conjugate("delete"));

        let ts = now();
        let tx = self.conn.transaction()?;
        let mut entity = fetch_entity_tx(&tx, entity_type, id)?;

        let before = entity.snapshot();
        entity.deleted_at = Some(ts);
        entity.version = entity.version.next();

        tx.execute(
            "UPDATE entities SET deleted_at = ?, version = ? WHERE id = ?",
            params![to_millis(ts), entity.version.as_raw() as i64, id],
        )?;
        let event = append_event_tx(
            &tx, &conj, entity_type, id, "delete", None, Some(before), None, ts,
        )?;
        tx.commit()?;

        Ok((entity, event))
    }

    // =========================================================================
    // Verb Executor (C6)
    // =========================================================================

    /// Executes a custom verb: merges the payload, bumps the version, and
    /// appends a `{EntityType}.{verb}` event atomically.
    ///
    /// Default verbs keep their fixed semantics: `update` and `delete` are
    /// routed to the entity store; `create` has no target entity and is
    /// rejected here.
    pub fn execute_verb(
        &mut self,
        entity_type: &str,
        id: &str,
        verb: &str,
        payload: Option<Map<String, Value>>,
    ) -> Result<(Entity, EventRecord)> {
        let schema = self.schema(entity_type)?;

        if schema.is_disabled(verb) {
            return Err(Error::VerbDisabled {
                noun: entity_type.to_string(),
                verb: verb.to_string(),
            });
        }
        let action = match schema.resolve_verb(verb) {
            VerbResolution::Action(action) => action,
            VerbResolution::Activity(action) => {
                return Err(Error::UseActionForm {
                    provided: verb.to_string(),
                    form: "activity",
                    action,
                })
            }
            VerbResolution::Event(action) => {
                return Err(Error::UseActionForm {
                    provided: verb.to_string(),
                    form: "event",
                    action,
                })
            }
            VerbResolution::Unknown => {
                return Err(Error::VerbUnknown {
                    noun: entity_type.to_string(),
                    verb: verb.to_string(),
                })
            }
        };

        match action.as_str() {
            "create" => {
                return Err(Error::BadInput(
                    "'create' takes no target entity; use the create operation".to_string(),
                ))
            }
            "update" => return self.update_entity(entity_type, id, payload.unwrap_or_default(), None),
            "delete" => return self.delete_entity(entity_type, id),
            _ => {}
        }

        let conj = schema
            .verb(&action)
            .cloned()
            .unwrap_or_else(|| conjugate(&action));

        // Stored `before` hooks are looked up for the audit trail but never
        // executed; hook code is data, not a program.
        let before_hooks = self.list_hooks(Some(entity_type), Some(&action))?;
        let before_count = before_hooks
            .iter()
            .filter(|h| h.phase == HookPhase::Before)
            .count();
        if before_count > 0 {
            debug!(
                noun = entity_type,
                verb = %action,
                hooks = before_count,
                "stored before-hooks present; not executed"
            );
        }

        let mut payload = payload.unwrap_or_default();
        strip_reserved(&mut payload);
        let payload_value = Value::Object(payload.clone());

        let ts = now();
        let tx = self.conn.transaction()?;
        let mut entity = fetch_entity_tx(&tx, entity_type, id)?;

        let before = entity.snapshot();
        for (key, value) in payload {
            entity.data.insert(key, value);
        }
        entity.version = entity.version.next();
        entity.updated_at = ts;
        let after = entity.snapshot();

        tx.execute(
            "UPDATE entities SET data = ?, version = ?, updated_at = ? WHERE id = ?",
            params![
                serde_json::to_string(&Value::Object(entity.data.clone()))?,
                entity.version.as_raw() as i64,
                to_millis(ts),
                id,
            ],
        )?;
        let event = append_event_tx(
            &tx,
            &conj,
            entity_type,
            id,
            &action,
            Some(payload_value),
            Some(before),
            Some(after),
            ts,
        )?;
        tx.commit()?;

        Ok((entity, event))
    }

    // =========================================================================
    // Event Log Queries (C5)
    // =========================================================================

    /// Filtered event query, newest first.
    pub fn query_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        let mut where_sql = String::from("1 = 1");
        let mut sql_params: Vec<SqlValue> = Vec::new();
        if let Some(since) = query.since {
            where_sql.push_str(" AND timestamp > ?");
            sql_params.push(SqlValue::Integer(to_millis(since)));
        }
        if let Some(entity_type) = &query.entity_type {
            where_sql.push_str(" AND entity_type = ?");
            sql_params.push(SqlValue::Text(entity_type.clone()));
        }
        if let Some(entity_id) = &query.entity_id {
            where_sql.push_str(" AND entity_id = ?");
            sql_params.push(SqlValue::Text(entity_id.clone()));
        }
        if let Some(verb) = &query.verb {
            where_sql.push_str(" AND verb = ?");
            sql_params.push(SqlValue::Text(verb.clone()));
        }
        sql_params.push(SqlValue::Integer(query.effective_limit() as i64));

        let sql = format!(
            "{} WHERE {} ORDER BY timestamp DESC, id DESC LIMIT ?",
            SELECT_EVENT, where_sql
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(sql_params.iter()), row_to_event)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(events)
    }

    /// The full per-entity log in replay order. No limit: replay needs
    /// every event.
    pub fn history(&self, entity_type: &str, entity_id: &str) -> Result<Vec<EventRecord>> {
        let sql = format!(
            "{} WHERE entity_type = ? AND entity_id = ? ORDER BY sequence ASC",
            SELECT_EVENT
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![entity_type, entity_id], row_to_event)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(events)
    }

    /// One event by id.
    pub fn get_event(&self, id: &str) -> Result<EventRecord> {
        let sql = format!("{} WHERE id = ?", SELECT_EVENT);
        self.conn
            .query_row(&sql, params![id], row_to_event)
            .optional()?
            .ok_or_else(|| Error::NotFound { kind: "event", id: id.to_string() })
    }

    /// Events for one entity constrained by sequence and/or timestamp
    /// ceilings, in replay order.
    fn events_until(
        &self,
        entity_type: &str,
        entity_id: &str,
        at_version: Option<u64>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>> {
        let mut where_sql = String::from("entity_type = ? AND entity_id = ?");
        let mut sql_params: Vec<SqlValue> = vec![
            SqlValue::Text(entity_type.to_string()),
            SqlValue::Text(entity_id.to_string()),
        ];
        if let Some(version) = at_version {
            where_sql.push_str(" AND sequence <= ?");
            sql_params.push(SqlValue::Integer(version as i64));
        }
        if let Some(as_of) = as_of {
            where_sql.push_str(" AND timestamp <= ?");
            sql_params.push(SqlValue::Integer(to_millis(as_of)));
        }
        let sql = format!("{} WHERE {} ORDER BY sequence ASC", SELECT_EVENT, where_sql);
        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(sql_params.iter()), row_to_event)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(events)
    }

    // =========================================================================
    // Time Travel (C7)
    // =========================================================================

    /// Reconstructs entity state at a version and/or timestamp ceiling.
    pub fn reconstruct(
        &self,
        entity_type: &str,
        entity_id: &str,
        at_version: Option<u64>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<ReplayedState> {
        let events = self.events_until(entity_type, entity_id, at_version, as_of)?;
        fold_events(&events)
            .ok_or_else(|| Error::NotFound { kind: "entity", id: entity_id.to_string() })
    }

    /// Field-level diff between two versions, plus the events between them.
    pub fn diff(
        &self,
        entity_type: &str,
        entity_id: &str,
        from: u64,
        to: u64,
    ) -> Result<EntityDiff> {
        if from >= to {
            return Err(Error::BadInput(format!(
                "diff requires from < to (got {} and {})",
                from, to
            )));
        }

        let all = self.events_until(entity_type, entity_id, Some(to), None)?;
        if all.is_empty() {
            return Err(Error::NotFound { kind: "entity", id: entity_id.to_string() });
        }
        let split = all.partition_point(|e| e.sequence.as_raw() <= from);
        let (up_to_from, between) = all.split_at(split);

        let empty = Map::new();
        let before_state = fold_events(up_to_from);
        let after_state = fold_events(&all);
        let before_map = before_state.as_ref().map(|s| &s.state).unwrap_or(&empty);
        let after_map = after_state.as_ref().map(|s| &s.state).unwrap_or(&empty);

        Ok(EntityDiff {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            from,
            to,
            changes: diff_fields(before_map, after_map),
            events: between.to_vec(),
            before_state: before_state.map(|s| s.to_value()).unwrap_or(Value::Null),
            after_state: after_state.map(|s| s.to_value()).unwrap_or(Value::Null),
        })
    }

    // =========================================================================
    // CDC Cursor Reads (C10)
    // =========================================================================

    /// Events strictly after the cursor, ordered `timestamp ASC, id ASC`.
    ///
    /// The cursor is an event id; its timestamp is resolved first, then
    /// events later than it (or at the same instant with a greater id) are
    /// returned. An unknown cursor is `NotFound`.
    pub fn events_after_cursor(
        &self,
        since: Option<&str>,
        types: &[String],
        verbs: &[String],
        limit: u64,
    ) -> Result<Vec<EventRecord>> {
        let mut where_sql = String::from("1 = 1");
        let mut sql_params: Vec<SqlValue> = Vec::new();

        if let Some(cursor) = since {
            let cursor_ts: i64 = self
                .conn
                .query_row(
                    "SELECT timestamp FROM events WHERE id = ?",
                    params![cursor],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| Error::NotFound { kind: "event", id: cursor.to_string() })?;
            where_sql.push_str(" AND (timestamp > ? OR (timestamp = ? AND id > ?))");
            sql_params.push(SqlValue::Integer(cursor_ts));
            sql_params.push(SqlValue::Integer(cursor_ts));
            sql_params.push(SqlValue::Text(cursor.to_string()));
        }
        if !types.is_empty() {
            where_sql.push_str(&format!(
                " AND entity_type IN ({})",
                placeholders(types.len())
            ));
            sql_params.extend(types.iter().map(|t| SqlValue::Text(t.clone())));
        }
        if !verbs.is_empty() {
            where_sql.push_str(&format!(" AND verb IN ({})", placeholders(verbs.len())));
            sql_params.extend(verbs.iter().map(|v| SqlValue::Text(v.clone())));
        }
        sql_params.push(SqlValue::Integer(limit as i64));

        let sql = format!(
            "{} WHERE {} ORDER BY timestamp ASC, id ASC LIMIT ?",
            SELECT_EVENT, where_sql
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(sql_params.iter()), row_to_event)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(events)
    }

    // =========================================================================
    // Subscriptions (C8 storage)
    // =========================================================================

    pub fn add_subscription(
        &mut self,
        pattern: &str,
        mode: SubscriptionMode,
        endpoint: &str,
        secret: Option<String>,
    ) -> Result<Subscription> {
        let subscription = Subscription {
            id: ident::subscription_id(),
            pattern: pattern.to_string(),
            mode,
            endpoint: endpoint.to_string(),
            secret,
            active: true,
            created_at: now(),
        };
        self.conn.execute(
            "INSERT INTO subscriptions (id, pattern, mode, endpoint, secret, active, created_at)
             VALUES (?, ?, ?, ?, ?, 1, ?)",
            params![
                subscription.id,
                subscription.pattern,
                subscription.mode.as_str(),
                subscription.endpoint,
                subscription.secret,
                to_millis(subscription.created_at),
            ],
        )?;
        Ok(subscription)
    }

    pub fn list_subscriptions(&self, only_active: bool) -> Result<Vec<Subscription>> {
        let sql = if only_active {
            "SELECT id, pattern, mode, endpoint, secret, active, created_at
             FROM subscriptions WHERE active = 1 ORDER BY created_at ASC"
        } else {
            "SELECT id, pattern, mode, endpoint, secret, active, created_at
             FROM subscriptions ORDER BY created_at ASC"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], row_to_subscription)?;
        let mut subscriptions = Vec::new();
        for row in rows {
            subscriptions.push(row??);
        }
        Ok(subscriptions)
    }

    /// Activates or deactivates a subscription (physical deletion is a
    /// non-goal).
    pub fn set_subscription_active(&mut self, id: &str, active: bool) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE subscriptions SET active = ? WHERE id = ?",
            params![active as i64, id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound { kind: "subscription", id: id.to_string() });
        }
        Ok(())
    }

    // =========================================================================
    // Integration Hooks and Dispatch Log (C9 storage)
    // =========================================================================

    pub fn add_integration_hook(
        &mut self,
        entity_type: &str,
        verb: &str,
        service: Service,
        method: &str,
        config: Option<Value>,
    ) -> Result<IntegrationHook> {
        let hook = IntegrationHook {
            id: ident::integration_hook_id(),
            entity_type: entity_type.to_string(),
            verb: verb.to_string(),
            service,
            method: method.to_string(),
            config,
            active: true,
            created_at: now(),
        };
        self.conn.execute(
            "INSERT INTO integration_hooks (id, entity_type, verb, service, method, config, active, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?)",
            params![
                hook.id,
                hook.entity_type,
                hook.verb,
                hook.service.as_str(),
                hook.method,
                hook.config.as_ref().map(|c| c.to_string()),
                to_millis(hook.created_at),
            ],
        )?;
        Ok(hook)
    }

    /// Tenant-configured hooks only; the built-in table is code (see
    /// [`integrate`](crate::integrate)).
    pub fn list_integration_hooks(&self) -> Result<Vec<IntegrationHook>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_type, verb, service, method, config, active, created_at
             FROM integration_hooks ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_integration_hook)?;
        let mut hooks = Vec::new();
        for row in rows {
            hooks.push(row??);
        }
        Ok(hooks)
    }

    pub fn set_integration_hook_active(&mut self, id: &str, active: bool) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE integration_hooks SET active = ? WHERE id = ?",
            params![active as i64, id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound { kind: "integration hook", id: id.to_string() });
        }
        Ok(())
    }

    /// Appends one dispatch-log row (one per completed attempt).
    pub fn record_dispatch(&mut self, entry: &DispatchEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO dispatch_log (id, event_id, hook_id, service, method, status, status_code, error, duration_ms, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.id,
                entry.event_id,
                entry.hook_id,
                entry.service.as_str(),
                entry.method,
                entry.status.as_str(),
                entry.status_code.map(|c| c as i64),
                entry.error,
                entry.duration_ms as i64,
                to_millis(entry.timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn list_dispatches(
        &self,
        event_id: Option<&str>,
        limit: u64,
    ) -> Result<Vec<DispatchEntry>> {
        let mut sql_params: Vec<SqlValue> = Vec::new();
        let mut where_sql = String::from("1 = 1");
        if let Some(event_id) = event_id {
            where_sql.push_str(" AND event_id = ?");
            sql_params.push(SqlValue::Text(event_id.to_string()));
        }
        sql_params.push(SqlValue::Integer(limit as i64));
        let sql = format!(
            "SELECT id, event_id, hook_id, service, method, status, status_code, error, duration_ms, timestamp
             FROM dispatch_log WHERE {} ORDER BY timestamp DESC, id DESC LIMIT ?",
            where_sql
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(sql_params.iter()), row_to_dispatch)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row??);
        }
        Ok(entries)
    }

    // =========================================================================
    // Relationships
    // =========================================================================

    /// Inserts an edge; the triple is its own primary key, so re-relating
    /// the same pair is a no-op.
    pub fn relate(&mut self, subject: &str, predicate: &str, object: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO relationships (subject, predicate, object, created_at)
             VALUES (?, ?, ?, ?)",
            params![subject, predicate, object, to_millis(now())],
        )?;
        Ok(())
    }

    /// Forward lookup: objects related from `subject` via `predicate`.
    pub fn related(&self, subject: &str, predicate: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT object FROM relationships WHERE subject = ? AND predicate = ?
             ORDER BY created_at ASC, object ASC",
        )?;
        let rows = stmt.query_map(params![subject, predicate], |row| row.get(0))?;
        let objects = rows.collect::<std::result::Result<_, _>>()?;
        Ok(objects)
    }

    /// Reverse lookup: subjects pointing at `object` via `predicate`.
    pub fn related_to(&self, object: &str, predicate: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT subject FROM relationships WHERE object = ? AND predicate = ?
             ORDER BY created_at ASC, subject ASC",
        )?;
        let rows = stmt.query_map(params![object, predicate], |row| row.get(0))?;
        let subjects = rows.collect::<std::result::Result<_, _>>()?;
        Ok(subjects)
    }

    // =========================================================================
    // Stored Verb Hooks
    // =========================================================================

    /// Stores hook code verbatim. Never evaluated; that posture is part of
    /// the contract.
    pub fn register_hook(
        &mut self,
        noun: &str,
        verb: &str,
        phase: HookPhase,
        code: &str,
    ) -> Result<HookRegistration> {
        let hook = HookRegistration {
            id: ident::hook_id(),
            noun: noun.to_string(),
            verb: verb.to_string(),
            phase,
            code: code.to_string(),
            created_at: now(),
        };
        self.conn.execute(
            "INSERT INTO hooks (id, noun, verb, phase, code, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                hook.id,
                hook.noun,
                hook.verb,
                hook.phase.as_str(),
                hook.code,
                to_millis(hook.created_at),
            ],
        )?;
        Ok(hook)
    }

    pub fn list_hooks(
        &self,
        noun: Option<&str>,
        verb: Option<&str>,
    ) -> Result<Vec<HookRegistration>> {
        let mut where_sql = String::from("1 = 1");
        let mut sql_params: Vec<SqlValue> = Vec::new();
        if let Some(noun) = noun {
            where_sql.push_str(" AND noun = ?");
            sql_params.push(SqlValue::Text(noun.to_string()));
        }
        if let Some(verb) = verb {
            where_sql.push_str(" AND verb = ?");
            sql_params.push(SqlValue::Text(verb.to_string()));
        }
        let sql = format!(
            "SELECT id, noun, verb, phase, code, created_at FROM hooks
             WHERE {} ORDER BY created_at ASC",
            where_sql
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(sql_params.iter()), row_to_hook)?;
        let mut hooks = Vec::new();
        for row in rows {
            hooks.push(row??);
        }
        Ok(hooks)
    }

    // =========================================================================
    // Tenant Metadata
    // =========================================================================

    /// Writes initial tenant metadata if this is a fresh database.
    pub fn init_tenant_meta(&mut self, tenant_id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO tenant_meta (key, value) VALUES ('tenantId', ?)",
            params![tenant_id],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO tenant_meta (key, value) VALUES ('status', 'active')",
            [],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO tenant_meta (key, value) VALUES ('createdAt', ?)",
            params![to_millis(now()).to_string()],
        )?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM tenant_meta WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_meta(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO tenant_meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Assembles [`TenantInfo`] from the key/value rows, null-tolerant for
    /// rows written by older engine versions.
    pub fn tenant_info(&self) -> Result<TenantInfo> {
        let tenant_id = self
            .get_meta("tenantId")?
            .ok_or_else(|| Error::Internal("tenant metadata missing".to_string()))?;
        let status = match self.get_meta("status")?.as_deref() {
            Some("deactivated") => TenantStatus::Deactivated,
            _ => TenantStatus::Active,
        };
        let created_at = self
            .get_meta("createdAt")?
            .and_then(|v| v.parse::<i64>().ok())
            .map(from_millis)
            .unwrap_or_else(now);
        let deactivated_at = self
            .get_meta("deactivatedAt")?
            .and_then(|v| v.parse::<i64>().ok())
            .map(from_millis);
        Ok(TenantInfo {
            tenant_id,
            status,
            created_at,
            name: self.get_meta("name")?,
            plan: self.get_meta("plan")?,
            deactivated_at,
        })
    }

    /// Flips tenant status. Deactivation retains all data.
    pub fn set_tenant_status(&mut self, status: TenantStatus) -> Result<()> {
        self.set_meta("status", status.as_str())?;
        match status {
            TenantStatus::Deactivated => {
                self.set_meta("deactivatedAt", &to_millis(now()).to_string())?;
            }
            TenantStatus::Active => {
                self.conn
                    .execute("DELETE FROM tenant_meta WHERE key = 'deactivatedAt'", [])?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Transaction Helpers
// =============================================================================

/// Fetches a live entity inside a transaction; soft-deleted rows read as
/// missing.
fn fetch_entity_tx(tx: &Transaction<'_>, entity_type: &str, id: &str) -> Result<Entity> {
    tx.query_row(
        "SELECT id, type, data, version, created_at, updated_at, deleted_at, context
         FROM entities WHERE id = ? AND type = ? AND deleted_at IS NULL",
        params![id, entity_type],
        row_to_entity,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound { kind: "entity", id: id.to_string() })
}

/// Appends one event inside the mutation's transaction.
///
/// The sequence is `MAX(sequence) + 1` over the target entity, computed
/// here so the mutation and its event share one commit.
#[allow(clippy::too_many_arguments)]
fn append_event_tx(
    tx: &Transaction<'_>,
    conj: &Conjugation,
    entity_type: &str,
    entity_id: &str,
    verb: &str,
    data: Option<Value>,
    before: Option<Value>,
    after: Option<Value>,
    ts: DateTime<Utc>,
) -> Result<EventRecord> {
    let max_sequence: i64 = tx.query_row(
        "SELECT COALESCE(MAX(sequence), 0) FROM events WHERE entity_type = ? AND entity_id = ?",
        params![entity_type, entity_id],
        |row| row.get(0),
    )?;

    let event = EventRecord {
        id: ident::event_id(),
        event_type: format!("{}.{}", entity_type, verb),
        entity_type: entity_type.to_string(),
        entity_id: entity_id.to_string(),
        verb: verb.to_string(),
        conjugation: conj.clone(),
        data,
        before,
        after,
        sequence: Sequence::from_raw(max_sequence as u64 + 1),
        timestamp: ts,
    };

    tx.execute(
        "INSERT INTO events (id, type, entity_type, entity_id, verb,
                             conjugation_action, conjugation_activity, conjugation_event,
                             data, before_state, after_state, sequence, timestamp)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            event.id,
            event.event_type,
            event.entity_type,
            event.entity_id,
            event.verb,
            event.conjugation.action,
            event.conjugation.activity,
            event.conjugation.event,
            event.data.as_ref().map(|v| v.to_string()),
            event.before.as_ref().map(|v| v.to_string()),
            event.after.as_ref().map(|v| v.to_string()),
            event.sequence.as_raw() as i64,
            to_millis(event.timestamp),
        ],
    )?;

    Ok(event)
}

// =============================================================================
// Row Mapping
// =============================================================================

const SELECT_EVENT: &str = "SELECT id, type, entity_type, entity_id, verb,
        conjugation_action, conjugation_activity, conjugation_event,
        data, before_state, after_state, sequence, timestamp
 FROM events";

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<Entity> {
    let data_text: String = row.get(2)?;
    let data = serde_json::from_str::<Value>(&data_text)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    Ok(Entity {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        data,
        version: Version::from_raw(row.get::<_, i64>(3)? as u64),
        created_at: from_millis(row.get(4)?),
        updated_at: from_millis(row.get(5)?),
        deleted_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        context: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let parse = |text: Option<String>| text.and_then(|t| serde_json::from_str(&t).ok());
    Ok(EventRecord {
        id: row.get(0)?,
        event_type: row.get(1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        verb: row.get(4)?,
        conjugation: Conjugation {
            action: row.get(5)?,
            activity: row.get(6)?,
            event: row.get(7)?,
        },
        data: parse(row.get(8)?),
        before: parse(row.get(9)?),
        after: parse(row.get(10)?),
        sequence: Sequence::from_raw(row.get::<_, i64>(11)? as u64),
        timestamp: from_millis(row.get(12)?),
    })
}

fn row_to_subscription(row: &Row<'_>) -> rusqlite::Result<Result<Subscription>> {
    let id: String = row.get(0)?;
    let pattern: String = row.get(1)?;
    let mode_text: String = row.get(2)?;
    let endpoint: String = row.get(3)?;
    let secret: Option<String> = row.get(4)?;
    let active: i64 = row.get(5)?;
    let created_at: i64 = row.get(6)?;
    Ok(SubscriptionMode::parse(&mode_text).map(|mode| Subscription {
        id,
        pattern,
        mode,
        endpoint,
        secret,
        active: active != 0,
        created_at: from_millis(created_at),
    }))
}

fn row_to_integration_hook(row: &Row<'_>) -> rusqlite::Result<Result<IntegrationHook>> {
    let id: String = row.get(0)?;
    let entity_type: String = row.get(1)?;
    let verb: String = row.get(2)?;
    let service_text: String = row.get(3)?;
    let method: String = row.get(4)?;
    let config_text: Option<String> = row.get(5)?;
    let active: i64 = row.get(6)?;
    let created_at: i64 = row.get(7)?;
    Ok(Service::parse(&service_text).map(|service| IntegrationHook {
        id,
        entity_type,
        verb,
        service,
        method,
        config: config_text.and_then(|t| serde_json::from_str(&t).ok()),
        active: active != 0,
        created_at: from_millis(created_at),
    }))
}

fn row_to_dispatch(row: &Row<'_>) -> rusqlite::Result<Result<DispatchEntry>> {
    let id: String = row.get(0)?;
    let event_id: String = row.get(1)?;
    let hook_id: String = row.get(2)?;
    let service_text: String = row.get(3)?;
    let method: String = row.get(4)?;
    let status_text: String = row.get(5)?;
    let status_code: Option<i64> = row.get(6)?;
    let error: Option<String> = row.get(7)?;
    let duration_ms: i64 = row.get(8)?;
    let timestamp: i64 = row.get(9)?;
    Ok(Service::parse(&service_text).and_then(|service| {
        DispatchStatus::parse(&status_text).map(|status| DispatchEntry {
            id,
            event_id,
            hook_id,
            service,
            method,
            status,
            status_code: status_code.map(|c| c as u16),
            error,
            duration_ms: duration_ms as u64,
            timestamp: from_millis(timestamp),
        })
    }))
}

fn row_to_hook(row: &Row<'_>) -> rusqlite::Result<Result<HookRegistration>> {
    let id: String = row.get(0)?;
    let noun: String = row.get(1)?;
    let verb: String = row.get(2)?;
    let phase_text: String = row.get(3)?;
    let code: String = row.get(4)?;
    let created_at: i64 = row.get(5)?;
    Ok(HookPhase::parse(&phase_text).map(|phase| HookRegistration {
        id,
        noun,
        verb,
        phase,
        code,
        created_at: from_millis(created_at),
    }))
}

// =============================================================================
// Small Helpers
// =============================================================================

/// JSON path for a top-level field: `$."name"`.
///
/// The path is passed as a bound parameter, never spliced into SQL; quotes
/// inside field names are doubled per JSON-path quoting.
fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\"\""))
}

/// `?, ?, ?` for dynamic IN lists.
fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 3);
    for i in 0..count {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
