//! In-memory schemaed store.
//!
//! Buckets hold JSON records in insertion order with a generated primary
//! key and a `_version` counter.  Named queries are equality filters over
//! one bucket; subscriptions re-evaluate after every committed mutation and
//! deliver only when the result actually changed.
//!
//! All state sits behind one `std::sync::Mutex` with no awaits inside the
//! critical sections, so `detach()` is synchronous with respect to
//! subsequent mutations: once it returns, no further push for that
//! subscription can be produced.
//!
//! Bucket TTL is lazy: expired records are purged when the bucket is next
//! touched, never by a timer.  Purging emits no change notifications.

use async_trait::async_trait;
use gate_core::backend::{Aggregate, PushSink, StoreBackend, StoreSubscription, SubscriptionGuard};
use gate_core::epoch_ms;
use gate_protocol::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

pub const VERSION_FIELD: &str = "_version";
pub const CREATED_FIELD: &str = "_createdAt";

const DEFAULT_PAGE_LIMIT: usize = 50;

// ---------------------------------------------------------------------------
// Schema types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_primary_key() -> String {
    "id".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketSchema {
    pub name: String,
    #[serde(default)]
    pub schema: BTreeMap<String, FieldDef>,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDef {
    pub name: String,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Store state
// ---------------------------------------------------------------------------

struct BucketState {
    schema: BucketSchema,
    records: Vec<Map<String, Value>>,
}

struct SubEntry {
    id: u64,
    query: String,
    params: Option<Value>,
    sink: PushSink,
    last: Value,
}

struct StoreInner {
    buckets: BTreeMap<String, BucketState>,
    queries: BTreeMap<String, QueryDef>,
    subscriptions: Vec<SubEntry>,
    next_sub_id: u64,
}

pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Arc::new(Mutex::new(StoreInner {
                buckets: BTreeMap::new(),
                queries: BTreeMap::new(),
                subscriptions: Vec::new(),
                next_sub_id: 1,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Pure helpers over the bucket map (shared by direct ops and transactions)
// ---------------------------------------------------------------------------

fn bucket<'a>(
    buckets: &'a BTreeMap<String, BucketState>,
    name: &str,
) -> Result<&'a BucketState, GatewayError> {
    buckets
        .get(name)
        .ok_or_else(|| GatewayError::bucket_not_defined(name))
}

fn bucket_mut<'a>(
    buckets: &'a mut BTreeMap<String, BucketState>,
    name: &str,
) -> Result<&'a mut BucketState, GatewayError> {
    buckets
        .get_mut(name)
        .ok_or_else(|| GatewayError::bucket_not_defined(name))
}

fn as_object(value: &Value, what: &str) -> Result<Map<String, Value>, GatewayError> {
    value
        .as_object()
        .cloned()
        .ok_or_else(|| GatewayError::validation(format!("{what} must be a JSON object")))
}

fn validate_fields(
    schema: &BucketSchema,
    fields: &Map<String, Value>,
) -> Result<(), GatewayError> {
    for (name, value) in fields {
        if name == &schema.primary_key {
            continue;
        }
        let Some(def) = schema.schema.get(name) else {
            return Err(GatewayError::validation(format!(
                "unknown field `{name}` for bucket `{}`",
                schema.name
            )));
        };
        if !def.field_type.accepts(value) && !value.is_null() {
            return Err(GatewayError::validation(format!(
                "field `{name}` has the wrong type"
            )));
        }
    }
    Ok(())
}

/// Drop records past the bucket's TTL.  Intentionally silent: the result
/// of a subscribed query catches up on the next real mutation.
fn purge_expired(buckets: &mut BTreeMap<String, BucketState>, bucket_name: &str, now_ms: i64) {
    let Some(state) = buckets.get_mut(bucket_name) else {
        return;
    };
    let Some(ttl_ms) = state.schema.ttl_ms else {
        return;
    };
    let ttl_ms = i64::try_from(ttl_ms).unwrap_or(i64::MAX);
    state.records.retain(|r| {
        r.get(CREATED_FIELD)
            .and_then(Value::as_i64)
            .is_none_or(|created| created + ttl_ms > now_ms)
    });
}

fn apply_insert(
    buckets: &mut BTreeMap<String, BucketState>,
    bucket_name: &str,
    record: &Value,
    now_ms: i64,
) -> Result<Value, GatewayError> {
    let state = bucket_mut(buckets, bucket_name)?;
    let fields = as_object(record, "record")?;
    validate_fields(&state.schema, &fields)?;

    let mut full = fields;
    let pk = state.schema.primary_key.clone();
    let key = match full.get(&pk) {
        Some(Value::String(k)) => k.clone(),
        Some(_) => {
            return Err(GatewayError::validation(format!(
                "primary key `{pk}` must be a string"
            )));
        }
        None => uuid::Uuid::new_v4().to_string(),
    };
    if state
        .records
        .iter()
        .any(|r| r.get(&pk).and_then(Value::as_str) == Some(key.as_str()))
    {
        return Err(GatewayError::already_exists(format!(
            "record `{key}` already exists in bucket `{bucket_name}`"
        )));
    }
    for (name, def) in &state.schema.schema {
        if !full.contains_key(name) {
            if let Some(default) = &def.default {
                full.insert(name.clone(), default.clone());
            } else if def.required {
                return Err(GatewayError::validation(format!(
                    "missing required field `{name}`"
                )));
            }
        }
    }
    full.insert(pk, Value::String(key));
    full.insert(VERSION_FIELD.to_owned(), json!(1));
    if state.schema.ttl_ms.is_some() {
        full.insert(CREATED_FIELD.to_owned(), json!(now_ms));
    }
    state.records.push(full.clone());
    Ok(Value::Object(full))
}

fn apply_update(
    buckets: &mut BTreeMap<String, BucketState>,
    bucket_name: &str,
    key: &str,
    patch: &Value,
) -> Result<Value, GatewayError> {
    let state = bucket_mut(buckets, bucket_name)?;
    let fields = as_object(patch, "patch")?;
    if fields.contains_key(&state.schema.primary_key) {
        return Err(GatewayError::validation(format!(
            "primary key `{}` cannot be updated",
            state.schema.primary_key
        )));
    }
    validate_fields(&state.schema, &fields)?;

    let pk = state.schema.primary_key.clone();
    let record = state
        .records
        .iter_mut()
        .find(|r| r.get(&pk).and_then(Value::as_str) == Some(key))
        .ok_or_else(|| {
            GatewayError::not_found(format!("record `{key}` not found in bucket `{bucket_name}`"))
        })?;
    for (name, value) in fields {
        record.insert(name, value);
    }
    let version = record
        .get(VERSION_FIELD)
        .and_then(Value::as_u64)
        .unwrap_or(0);
    record.insert(VERSION_FIELD.to_owned(), json!(version + 1));
    Ok(Value::Object(record.clone()))
}

fn apply_delete(
    buckets: &mut BTreeMap<String, BucketState>,
    bucket_name: &str,
    key: &str,
) -> Result<Value, GatewayError> {
    let state = bucket_mut(buckets, bucket_name)?;
    let pk = state.schema.primary_key.clone();
    state
        .records
        .retain(|r| r.get(&pk).and_then(Value::as_str) != Some(key));
    // Deleting an absent key still reports success; delete is idempotent.
    Ok(json!({ "deleted": true }))
}

fn apply_clear(
    buckets: &mut BTreeMap<String, BucketState>,
    bucket_name: &str,
) -> Result<Value, GatewayError> {
    let state = bucket_mut(buckets, bucket_name)?;
    let cleared = state.records.len();
    state.records.clear();
    Ok(json!({ "cleared": cleared }))
}

fn matches_filter(record: &Map<String, Value>, filter: Option<&Value>) -> bool {
    let Some(Value::Object(filter)) = filter else {
        return true;
    };
    filter
        .iter()
        .all(|(field, expected)| record.get(field) == Some(expected))
}

fn matching<'a>(
    state: &'a BucketState,
    filter: Option<&'a Value>,
) -> impl Iterator<Item = &'a Map<String, Value>> {
    state.records.iter().filter(move |r| matches_filter(r, filter))
}

/// Evaluate a named query: the optional subscription `params` object is
/// merged over the query's own filter.
fn evaluate_query(
    buckets: &BTreeMap<String, BucketState>,
    query: &QueryDef,
    params: Option<&Value>,
) -> Result<Value, GatewayError> {
    let state = bucket(buckets, &query.bucket)?;
    let mut filter = match &query.filter {
        Some(Value::Object(f)) => f.clone(),
        _ => Map::new(),
    };
    if let Some(Value::Object(extra)) = params {
        for (k, v) in extra {
            filter.insert(k.clone(), v.clone());
        }
    }
    let filter = if filter.is_empty() {
        None
    } else {
        Some(Value::Object(filter))
    };
    let mut records: Vec<Value> = matching(state, filter.as_ref())
        .map(|r| Value::Object(r.clone()))
        .collect();
    if let Some(limit) = query.limit {
        records.truncate(limit);
    }
    Ok(Value::Array(records))
}

/// Re-evaluate every subscription rooted at `bucket_name` and deliver the
/// results that changed.  Called with the store lock held; per-subscription
/// ordering therefore follows mutation order.
fn notify_bucket(inner: &mut StoreInner, bucket_name: &str) {
    let mut updates: Vec<(usize, Value)> = Vec::new();
    for (idx, sub) in inner.subscriptions.iter().enumerate() {
        let Some(query) = inner.queries.get(&sub.query) else {
            continue;
        };
        if query.bucket != bucket_name {
            continue;
        }
        let Ok(result) = evaluate_query(&inner.buckets, query, sub.params.as_ref()) else {
            continue;
        };
        if result != sub.last {
            updates.push((idx, result));
        }
    }
    for (idx, result) in updates {
        let sub = &mut inner.subscriptions[idx];
        sub.last = result.clone();
        (sub.sink)(result);
    }
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn get(&self, bucket_name: &str, key: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        purge_expired(&mut inner.buckets, bucket_name, epoch_ms());
        let state = bucket(&inner.buckets, bucket_name)?;
        let pk = &state.schema.primary_key;
        Ok(state
            .records
            .iter()
            .find(|r| r.get(pk).and_then(Value::as_str) == Some(key))
            .map_or(Value::Null, |r| Value::Object(r.clone())))
    }

    async fn all(&self, bucket_name: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        purge_expired(&mut inner.buckets, bucket_name, epoch_ms());
        let state = bucket(&inner.buckets, bucket_name)?;
        Ok(Value::Array(
            state.records.iter().map(|r| Value::Object(r.clone())).collect(),
        ))
    }

    async fn find_where(&self, bucket_name: &str, filter: &Value) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        purge_expired(&mut inner.buckets, bucket_name, epoch_ms());
        let state = bucket(&inner.buckets, bucket_name)?;
        Ok(Value::Array(
            matching(state, Some(filter))
                .map(|r| Value::Object(r.clone()))
                .collect(),
        ))
    }

    async fn find_one(&self, bucket_name: &str, filter: &Value) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        purge_expired(&mut inner.buckets, bucket_name, epoch_ms());
        let state = bucket(&inner.buckets, bucket_name)?;
        Ok(matching(state, Some(filter))
            .next()
            .map_or(Value::Null, |r| Value::Object(r.clone())))
    }

    async fn count(&self, bucket_name: &str, filter: Option<&Value>) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        purge_expired(&mut inner.buckets, bucket_name, epoch_ms());
        let state = bucket(&inner.buckets, bucket_name)?;
        Ok(json!(matching(state, filter).count()))
    }

    async fn first(&self, bucket_name: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        purge_expired(&mut inner.buckets, bucket_name, epoch_ms());
        let state = bucket(&inner.buckets, bucket_name)?;
        Ok(state
            .records
            .first()
            .map_or(Value::Null, |r| Value::Object(r.clone())))
    }

    async fn last(&self, bucket_name: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        purge_expired(&mut inner.buckets, bucket_name, epoch_ms());
        let state = bucket(&inner.buckets, bucket_name)?;
        Ok(state
            .records
            .last()
            .map_or(Value::Null, |r| Value::Object(r.clone())))
    }

    async fn paginate(&self, bucket_name: &str, options: &Value) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        purge_expired(&mut inner.buckets, bucket_name, epoch_ms());
        let state = bucket(&inner.buckets, bucket_name)?;
        let limit = options
            .get("limit")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_PAGE_LIMIT, |l| usize::try_from(l).unwrap_or(usize::MAX))
            .max(1);
        let offset = options
            .get("cursor")
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let filter = options.get("filter");
        let records: Vec<Value> = matching(state, filter)
            .skip(offset)
            .take(limit + 1)
            .map(|r| Value::Object(r.clone()))
            .collect();
        let has_more = records.len() > limit;
        let page: Vec<Value> = records.into_iter().take(limit).collect();
        let mut result = json!({ "records": page, "hasMore": has_more });
        if has_more {
            result["nextCursor"] = json!((offset + limit).to_string());
        }
        Ok(result)
    }

    async fn aggregate(
        &self,
        bucket_name: &str,
        aggregate: Aggregate,
        field: &str,
        filter: Option<&Value>,
    ) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        purge_expired(&mut inner.buckets, bucket_name, epoch_ms());
        let state = bucket(&inner.buckets, bucket_name)?;
        let values: Vec<f64> = matching(state, filter)
            .filter_map(|r| r.get(field).and_then(Value::as_f64))
            .collect();
        let result = match aggregate {
            Aggregate::Sum => Some(values.iter().sum::<f64>()),
            Aggregate::Avg if values.is_empty() => None,
            Aggregate::Avg => {
                let len = u32::try_from(values.len()).unwrap_or(u32::MAX);
                Some(values.iter().sum::<f64>() / f64::from(len))
            }
            Aggregate::Min => values.iter().copied().reduce(f64::min),
            Aggregate::Max => values.iter().copied().reduce(f64::max),
        };
        Ok(result
            .and_then(serde_json::Number::from_f64)
            .map_or(Value::Null, Value::Number))
    }

    async fn insert(&self, bucket_name: &str, record: &Value) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        let now = epoch_ms();
        purge_expired(&mut inner.buckets, bucket_name, now);
        let inserted = apply_insert(&mut inner.buckets, bucket_name, record, now)?;
        notify_bucket(&mut inner, bucket_name);
        Ok(inserted)
    }

    async fn update(
        &self,
        bucket_name: &str,
        key: &str,
        patch: &Value,
    ) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        purge_expired(&mut inner.buckets, bucket_name, epoch_ms());
        let updated = apply_update(&mut inner.buckets, bucket_name, key, patch)?;
        notify_bucket(&mut inner, bucket_name);
        Ok(updated)
    }

    async fn delete(&self, bucket_name: &str, key: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        purge_expired(&mut inner.buckets, bucket_name, epoch_ms());
        let deleted = apply_delete(&mut inner.buckets, bucket_name, key)?;
        notify_bucket(&mut inner, bucket_name);
        Ok(deleted)
    }

    async fn clear(&self, bucket_name: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        let cleared = apply_clear(&mut inner.buckets, bucket_name)?;
        notify_bucket(&mut inner, bucket_name);
        Ok(cleared)
    }

    async fn buckets(&self) -> Result<Value, GatewayError> {
        let inner = self.lock();
        Ok(json!(inner.buckets.keys().collect::<Vec<_>>()))
    }

    async fn stats(&self) -> Result<Value, GatewayError> {
        let inner = self.lock();
        let records: usize = inner.buckets.values().map(|b| b.records.len()).sum();
        Ok(json!({
            "buckets": inner.buckets.len(),
            "records": records,
            "queries": inner.queries.len(),
            "subscriptions": inner.subscriptions.len(),
        }))
    }

    async fn define_bucket(&self, definition: &Value) -> Result<Value, GatewayError> {
        let schema: BucketSchema = serde_json::from_value(definition.clone())
            .map_err(|e| GatewayError::validation(format!("invalid bucket definition: {e}")))?;
        let mut inner = self.lock();
        if inner.buckets.contains_key(&schema.name) {
            return Err(GatewayError::already_exists(format!(
                "bucket `{}` already exists",
                schema.name
            )));
        }
        let name = schema.name.clone();
        inner.buckets.insert(
            name.clone(),
            BucketState {
                schema,
                records: Vec::new(),
            },
        );
        Ok(json!({ "created": true, "bucket": name }))
    }

    async fn drop_bucket(&self, bucket_name: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        if inner.buckets.remove(bucket_name).is_none() {
            return Err(GatewayError::bucket_not_defined(bucket_name));
        }
        Ok(json!({ "dropped": true, "bucket": bucket_name }))
    }

    async fn update_bucket(
        &self,
        bucket_name: &str,
        definition: &Value,
    ) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        let state = bucket_mut(&mut inner.buckets, bucket_name)?;
        if let Some(fields) = definition.get("schema") {
            state.schema.schema = serde_json::from_value(fields.clone())
                .map_err(|e| GatewayError::validation(format!("invalid schema: {e}")))?;
        }
        if let Some(ttl) = definition.get("ttlMs") {
            state.schema.ttl_ms = ttl.as_u64();
        }
        Ok(json!({ "updated": true, "bucket": bucket_name }))
    }

    async fn get_bucket_schema(&self, bucket_name: &str) -> Result<Value, GatewayError> {
        let inner = self.lock();
        let state = bucket(&inner.buckets, bucket_name)?;
        Ok(serde_json::to_value(&state.schema)?)
    }

    async fn define_query(&self, definition: &Value) -> Result<Value, GatewayError> {
        let query: QueryDef = serde_json::from_value(definition.clone())
            .map_err(|e| GatewayError::validation(format!("invalid query definition: {e}")))?;
        let mut inner = self.lock();
        if !inner.buckets.contains_key(&query.bucket) {
            return Err(GatewayError::bucket_not_defined(&query.bucket));
        }
        if inner.queries.contains_key(&query.name) {
            return Err(GatewayError::already_exists(format!(
                "query `{}` already exists",
                query.name
            )));
        }
        let name = query.name.clone();
        inner.queries.insert(name.clone(), query);
        Ok(json!({ "defined": true, "query": name }))
    }

    async fn undefine_query(&self, name: &str) -> Result<Value, GatewayError> {
        let mut inner = self.lock();
        if inner.queries.remove(name).is_none() {
            return Err(GatewayError::not_found(format!("query `{name}` not found")));
        }
        Ok(json!({ "removed": true, "query": name }))
    }

    async fn list_queries(&self) -> Result<Value, GatewayError> {
        let inner = self.lock();
        Ok(serde_json::to_value(
            inner.queries.values().collect::<Vec<_>>(),
        )?)
    }

    async fn transaction(&self, operations: &Value) -> Result<Value, GatewayError> {
        let ops = operations
            .as_array()
            .ok_or_else(|| GatewayError::validation("operations must be an array"))?;

        let mut inner = self.lock();
        let now = epoch_ms();
        let bucket_names: Vec<String> = inner.buckets.keys().cloned().collect();
        for name in &bucket_names {
            purge_expired(&mut inner.buckets, name, now);
        }
        // Apply against a working copy; commit by swapping it in.  Reads
        // within the transaction see earlier writes of the same transaction.
        let mut working: BTreeMap<String, BucketState> = inner
            .buckets
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    BucketState {
                        schema: state.schema.clone(),
                        records: state.records.clone(),
                    },
                )
            })
            .collect();

        let mut results = Vec::with_capacity(ops.len());
        let mut affected: BTreeSet<String> = BTreeSet::new();
        for op in ops {
            let kind = op
                .get("op")
                .and_then(Value::as_str)
                .ok_or_else(|| GatewayError::validation("transaction op missing `op` field"))?;
            let bucket_name = op
                .get("bucket")
                .and_then(Value::as_str)
                .ok_or_else(|| GatewayError::validation("transaction op missing `bucket` field"))?;
            let result = match kind {
                "insert" => {
                    let record = op
                        .get("record")
                        .ok_or_else(|| GatewayError::validation("insert op missing `record`"))?;
                    apply_insert(&mut working, bucket_name, record, now)?
                }
                "update" => {
                    let key = op
                        .get("key")
                        .and_then(Value::as_str)
                        .ok_or_else(|| GatewayError::validation("update op missing `key`"))?;
                    let patch = op
                        .get("patch")
                        .ok_or_else(|| GatewayError::validation("update op missing `patch`"))?;
                    apply_update(&mut working, bucket_name, key, patch)?
                }
                "delete" => {
                    let key = op
                        .get("key")
                        .and_then(Value::as_str)
                        .ok_or_else(|| GatewayError::validation("delete op missing `key`"))?;
                    apply_delete(&mut working, bucket_name, key)?
                }
                "clear" => apply_clear(&mut working, bucket_name)?,
                other => {
                    return Err(GatewayError::validation(format!(
                        "unknown transaction op `{other}`"
                    )));
                }
            };
            affected.insert(bucket_name.to_owned());
            results.push(result);
        }

        inner.buckets = working;
        for bucket_name in &affected {
            notify_bucket(&mut inner, bucket_name);
        }
        Ok(json!({ "committed": true, "results": results }))
    }

    async fn register_subscription(
        &self,
        query_name: &str,
        params: Option<&Value>,
        sink: PushSink,
    ) -> Result<StoreSubscription, GatewayError> {
        let mut inner = self.lock();
        let query = inner
            .queries
            .get(query_name)
            .cloned()
            .ok_or_else(|| GatewayError::query_not_defined(query_name))?;
        purge_expired(&mut inner.buckets, &query.bucket, epoch_ms());
        let initial = evaluate_query(&inner.buckets, &query, params)?;
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        inner.subscriptions.push(SubEntry {
            id,
            query: query_name.to_owned(),
            params: params.cloned(),
            sink,
            last: initial.clone(),
        });

        let handle = Arc::clone(&self.inner);
        let guard = SubscriptionGuard::new(move || {
            handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscriptions
                .retain(|s| s.id != id);
        });
        Ok(StoreSubscription { initial, guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tasks_definition() -> Value {
        json!({
            "name": "tasks",
            "schema": {
                "title": { "type": "string", "required": true },
                "done": { "type": "boolean", "default": false },
                "points": { "type": "number" },
            }
        })
    }

    async fn store_with_tasks() -> MemoryStore {
        let store = MemoryStore::new();
        store.define_bucket(&tasks_definition()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn insert_assigns_id_version_and_defaults() {
        let store = store_with_tasks().await;
        let record = store
            .insert("tasks", &json!({ "title": "x" }))
            .await
            .unwrap();
        assert_eq!(record["title"], "x");
        assert_eq!(record["done"], false, "default applied");
        assert_eq!(record["_version"], 1);
        let key = record["id"].as_str().unwrap().to_owned();

        let fetched = store.get("tasks", &key).await.unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn insert_rejects_unknown_fields_and_missing_required() {
        let store = store_with_tasks().await;
        let err = store
            .insert("tasks", &json!({ "title": "x", "_forceFail": true }))
            .await
            .unwrap_err();
        assert_eq!(err.code, gate_protocol::ErrorCode::ValidationError);

        let err = store.insert("tasks", &json!({ "done": true })).await.unwrap_err();
        assert_eq!(err.code, gate_protocol::ErrorCode::ValidationError);

        let err = store
            .insert("tasks", &json!({ "title": 42 }))
            .await
            .unwrap_err();
        assert_eq!(err.code, gate_protocol::ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn unknown_bucket_is_bucket_not_defined() {
        let store = MemoryStore::new();
        let err = store.all("nope").await.unwrap_err();
        assert_eq!(err.code, gate_protocol::ErrorCode::BucketNotDefined);
    }

    #[tokio::test]
    async fn update_bumps_version_monotonically_and_delete_then_get_is_null() {
        let store = store_with_tasks().await;
        let record = store.insert("tasks", &json!({ "title": "a" })).await.unwrap();
        let key = record["id"].as_str().unwrap().to_owned();

        let v2 = store
            .update("tasks", &key, &json!({ "done": true }))
            .await
            .unwrap();
        assert_eq!(v2["_version"], 2);
        let v3 = store
            .update("tasks", &key, &json!({ "title": "b" }))
            .await
            .unwrap();
        assert_eq!(v3["_version"], 3);

        assert_eq!(
            store.delete("tasks", &key).await.unwrap(),
            json!({ "deleted": true })
        );
        assert_eq!(store.get("tasks", &key).await.unwrap(), Value::Null);
        // Deleting a missing key still reports success.
        assert_eq!(
            store.delete("tasks", &key).await.unwrap(),
            json!({ "deleted": true })
        );
    }

    #[tokio::test]
    async fn clear_then_count_is_zero() {
        let store = store_with_tasks().await;
        for i in 0..3 {
            store
                .insert("tasks", &json!({ "title": format!("t{i}") }))
                .await
                .unwrap();
        }
        assert_eq!(store.count("tasks", None).await.unwrap(), json!(3));
        store.clear("tasks").await.unwrap();
        assert_eq!(store.count("tasks", None).await.unwrap(), json!(0));
    }

    #[tokio::test]
    async fn aggregates_on_empty_bucket_follow_store_semantics() {
        let store = store_with_tasks().await;
        assert_eq!(
            store
                .aggregate("tasks", Aggregate::Sum, "points", None)
                .await
                .unwrap(),
            json!(0.0)
        );
        assert_eq!(
            store
                .aggregate("tasks", Aggregate::Avg, "points", None)
                .await
                .unwrap(),
            Value::Null
        );
        assert_eq!(
            store
                .aggregate("tasks", Aggregate::Min, "points", None)
                .await
                .unwrap(),
            Value::Null
        );
        assert_eq!(
            store
                .aggregate("tasks", Aggregate::Max, "points", None)
                .await
                .unwrap(),
            Value::Null
        );
    }

    #[tokio::test]
    async fn aggregates_compute_over_matching_numeric_values() {
        let store = store_with_tasks().await;
        for (title, points, done) in [("a", 1.0, false), ("b", 2.0, false), ("c", 9.0, true)] {
            store
                .insert(
                    "tasks",
                    &json!({ "title": title, "points": points, "done": done }),
                )
                .await
                .unwrap();
        }
        let open = json!({ "done": false });
        assert_eq!(
            store
                .aggregate("tasks", Aggregate::Sum, "points", Some(&open))
                .await
                .unwrap(),
            json!(3.0)
        );
        assert_eq!(
            store
                .aggregate("tasks", Aggregate::Max, "points", None)
                .await
                .unwrap(),
            json!(9.0)
        );
    }

    #[tokio::test]
    async fn paginate_walks_the_bucket_with_cursors() {
        let store = store_with_tasks().await;
        for i in 0..5 {
            store
                .insert("tasks", &json!({ "title": format!("t{i}") }))
                .await
                .unwrap();
        }
        let page1 = store.paginate("tasks", &json!({ "limit": 2 })).await.unwrap();
        assert_eq!(page1["records"].as_array().unwrap().len(), 2);
        assert_eq!(page1["hasMore"], true);
        let cursor = page1["nextCursor"].as_str().unwrap().to_owned();

        let page2 = store
            .paginate("tasks", &json!({ "limit": 2, "cursor": cursor }))
            .await
            .unwrap();
        assert_eq!(page2["records"][0]["title"], "t2");

        let page3 = store
            .paginate("tasks", &json!({ "limit": 2, "cursor": "4" }))
            .await
            .unwrap();
        assert_eq!(page3["records"].as_array().unwrap().len(), 1);
        assert_eq!(page3["hasMore"], false);
        assert!(page3.get("nextCursor").is_none());
    }

    #[tokio::test]
    async fn ttl_buckets_purge_expired_records_lazily() {
        let store = MemoryStore::new();
        store
            .define_bucket(&json!({
                "name": "presence",
                "ttlMs": 50,
                "schema": { "who": { "type": "string" } }
            }))
            .await
            .unwrap();

        let record = store.insert("presence", &json!({ "who": "a" })).await.unwrap();
        assert!(record["_createdAt"].is_number());
        let key = record["id"].as_str().unwrap().to_owned();
        assert_eq!(store.count("presence", None).await.unwrap(), json!(1));

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert_eq!(store.get("presence", &key).await.unwrap(), Value::Null);
        assert_eq!(store.count("presence", None).await.unwrap(), json!(0));
    }

    #[tokio::test]
    async fn buckets_without_ttl_never_stamp_or_purge() {
        let store = store_with_tasks().await;
        let record = store.insert("tasks", &json!({ "title": "x" })).await.unwrap();
        assert!(record.get("_createdAt").is_none());
    }

    fn counting_sink() -> (PushSink, Arc<AtomicUsize>, Arc<Mutex<Vec<Value>>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_count = Arc::clone(&count);
        let sink_seen = Arc::clone(&seen);
        let sink: PushSink = Arc::new(move |value| {
            sink_count.fetch_add(1, Ordering::SeqCst);
            sink_seen.lock().unwrap().push(value);
        });
        (sink, count, seen)
    }

    #[tokio::test]
    async fn subscription_delivers_initial_then_deduplicated_changes() {
        let store = store_with_tasks().await;
        store
            .define_query(&json!({ "name": "all-tasks", "bucket": "tasks" }))
            .await
            .unwrap();

        let (sink, count, seen) = counting_sink();
        let sub = store
            .register_subscription("all-tasks", None, sink)
            .await
            .unwrap();
        assert_eq!(sub.initial, json!([]));

        store.insert("tasks", &json!({ "title": "x" })).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen[0].as_array().unwrap().len(), 1);
            assert_eq!(seen[0][0]["title"], "x");
        }

        // A mutation that does not change the result set emits nothing.
        assert_eq!(
            store.delete("tasks", "missing-key").await.unwrap(),
            json!({ "deleted": true })
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sub.guard.detach();
        store.insert("tasks", &json!({ "title": "y" })).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1, "no push after detach");
    }

    #[tokio::test]
    async fn subscribe_to_unknown_query_is_query_not_defined() {
        let store = store_with_tasks().await;
        let (sink, _, _) = counting_sink();
        let err = store
            .register_subscription("nope", None, sink)
            .await
            .unwrap_err();
        assert_eq!(err.code, gate_protocol::ErrorCode::QueryNotDefined);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_failure_and_pushes_once_on_commit() {
        let store = store_with_tasks().await;
        store
            .define_query(&json!({ "name": "all-tasks", "bucket": "tasks" }))
            .await
            .unwrap();
        let (sink, count, _) = counting_sink();
        let _sub = store
            .register_subscription("all-tasks", None, sink)
            .await
            .unwrap();

        // Second op fails validation; nothing is committed, nothing pushed.
        let err = store
            .transaction(&json!([
                { "op": "insert", "bucket": "tasks", "record": { "title": "A" } },
                { "op": "insert", "bucket": "tasks", "record": { "title": "B", "_forceFail": true } },
            ]))
            .await
            .unwrap_err();
        assert_eq!(err.code, gate_protocol::ErrorCode::ValidationError);
        assert_eq!(store.all("tasks").await.unwrap(), json!([]));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // A committed transaction with two inserts pushes exactly once.
        store
            .transaction(&json!([
                { "op": "insert", "bucket": "tasks", "record": { "title": "A" } },
                { "op": "insert", "bucket": "tasks", "record": { "title": "B" } },
            ]))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(store.count("tasks", None).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn transaction_reads_its_own_writes_via_update() {
        let store = store_with_tasks().await;
        let result = store
            .transaction(&json!([
                { "op": "insert", "bucket": "tasks", "record": { "id": "t1", "title": "A" } },
                { "op": "update", "bucket": "tasks", "key": "t1", "patch": { "done": true } },
            ]))
            .await
            .unwrap();
        assert_eq!(result["results"][1]["done"], true);
        assert_eq!(result["results"][1]["_version"], 2);
    }

    #[tokio::test]
    async fn named_queries_respect_filters_and_params() {
        let store = store_with_tasks().await;
        store
            .define_query(&json!({
                "name": "open-tasks", "bucket": "tasks", "filter": { "done": false }
            }))
            .await
            .unwrap();
        store
            .insert("tasks", &json!({ "title": "open" }))
            .await
            .unwrap();
        store
            .insert("tasks", &json!({ "title": "closed", "done": true }))
            .await
            .unwrap();

        let (sink, _, _) = counting_sink();
        let sub = store
            .register_subscription("open-tasks", None, sink)
            .await
            .unwrap();
        let initial = sub.initial.as_array().unwrap();
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0]["title"], "open");

        // Params narrow the query further.
        let (sink2, _, _) = counting_sink();
        let sub2 = store
            .register_subscription("open-tasks", Some(&json!({ "title": "nope" })), sink2)
            .await
            .unwrap();
        assert_eq!(sub2.initial, json!([]));
    }
}
