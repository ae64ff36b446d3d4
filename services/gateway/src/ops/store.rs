//! Store handlers.
//!
//! Thin field extraction over the store backend; results are forwarded
//! verbatim.  Subscribe/unsubscribe additionally manage the connection's
//! subscription map.

use crate::actor::ConnectionActor;
use gate_core::backend::Aggregate;
use gate_protocol::{Channel, GatewayError, Operation, Request};
use serde_json::{Map, Value, json};

pub async fn dispatch(
    actor: &ConnectionActor,
    op: Operation,
    req: &Request,
) -> Result<Value, GatewayError> {
    let store = &actor.state.store;
    match op {
        Operation::StoreGet => {
            store
                .get(req.require_str("bucket")?, req.require_str("key")?)
                .await
        }
        Operation::StoreAll => store.all(req.require_str("bucket")?).await,
        Operation::StoreWhere => {
            store
                .find_where(req.require_str("bucket")?, req.require_field("filter")?)
                .await
        }
        Operation::StoreFindOne => {
            store
                .find_one(req.require_str("bucket")?, req.require_field("filter")?)
                .await
        }
        Operation::StoreCount => {
            store
                .count(req.require_str("bucket")?, req.field("filter"))
                .await
        }
        Operation::StoreFirst => store.first(req.require_str("bucket")?).await,
        Operation::StoreLast => store.last(req.require_str("bucket")?).await,
        Operation::StorePaginate => {
            store
                .paginate(req.require_str("bucket")?, &Value::Object(req.body.clone()))
                .await
        }
        Operation::StoreSum | Operation::StoreAvg | Operation::StoreMin | Operation::StoreMax => {
            let aggregate = match op {
                Operation::StoreSum => Aggregate::Sum,
                Operation::StoreAvg => Aggregate::Avg,
                Operation::StoreMin => Aggregate::Min,
                _ => Aggregate::Max,
            };
            store
                .aggregate(
                    req.require_str("bucket")?,
                    aggregate,
                    req.require_str("field")?,
                    req.field("filter"),
                )
                .await
        }
        Operation::StoreInsert => {
            store
                .insert(req.require_str("bucket")?, req.require_field("record")?)
                .await
        }
        Operation::StoreUpdate => {
            store
                .update(
                    req.require_str("bucket")?,
                    req.require_str("key")?,
                    req.require_field("patch")?,
                )
                .await
        }
        Operation::StoreDelete => {
            store
                .delete(req.require_str("bucket")?, req.require_str("key")?)
                .await
        }
        Operation::StoreClear => store.clear(req.require_str("bucket")?).await,
        Operation::StoreTransaction => store.transaction(req.require_field("operations")?).await,
        Operation::StoreBuckets => store.buckets().await,
        Operation::StoreStats => store.stats().await,
        Operation::StoreDefineBucket => {
            store.define_bucket(&bucket_definition(req)?).await
        }
        Operation::StoreDropBucket => store.drop_bucket(req.require_str("bucket")?).await,
        Operation::StoreUpdateBucket => {
            store
                .update_bucket(req.require_str("bucket")?, &Value::Object(req.body.clone()))
                .await
        }
        Operation::StoreGetBucketSchema => {
            store.get_bucket_schema(req.require_str("bucket")?).await
        }
        Operation::StoreDefineQuery => {
            store.define_query(&Value::Object(req.body.clone())).await
        }
        Operation::StoreUndefineQuery => store.undefine_query(req.require_str("name")?).await,
        Operation::StoreListQueries => store.list_queries().await,
        _ => Err(GatewayError::internal("operation routed to the wrong handler")),
    }
}

/// The wire names the bucket via `bucket`; the backend expects `name`.
fn bucket_definition(req: &Request) -> Result<Value, GatewayError> {
    let mut definition = Map::new();
    definition.insert("name".to_owned(), json!(req.require_str("bucket")?));
    for field in ["schema", "primaryKey", "ttlMs"] {
        if let Some(value) = req.field(field) {
            definition.insert(field.to_owned(), value.clone());
        }
    }
    Ok(Value::Object(definition))
}

/// Register a store-query subscription.  The ceiling is enforced before the
/// source registration so a refused subscribe leaves no trace.
pub async fn subscribe(
    actor: &mut ConnectionActor,
    req: &Request,
) -> Result<Value, GatewayError> {
    let query = req.require_str("query")?.to_owned();
    actor.ensure_subscription_capacity()?;

    let subscription_id = actor.allocate_subscription_id();
    let sink = actor.push_sink(subscription_id.clone(), Channel::Subscription);
    let params = req.field("params").cloned();
    let subscription = actor
        .state
        .store
        .register_subscription(&query, params.as_ref(), sink)
        .await?;
    actor.insert_subscription(
        subscription_id.clone(),
        Channel::Subscription,
        subscription.guard,
    );
    Ok(json!({ "subscriptionId": subscription_id, "data": subscription.initial }))
}

/// Subscription ids are valid only on the connection that created them.
pub fn unsubscribe(actor: &mut ConnectionActor, req: &Request) -> Result<Value, GatewayError> {
    let subscription_id = req.require_str("subscriptionId")?;
    match actor.remove_subscription(subscription_id) {
        Some(entry) => {
            entry.guard.detach();
            Ok(json!({ "unsubscribed": true, "subscriptionId": subscription_id }))
        }
        None => Err(GatewayError::not_found(format!(
            "subscription `{subscription_id}` not found on this connection"
        ))),
    }
}
