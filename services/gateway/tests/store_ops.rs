// Store surface over the wire: schema enforcement, record laws, queries,
// aggregates, pagination, and transaction atomicity.

mod common;

use common::{base_config, spawn_gateway};
use gate_test_utils::TestClient;
use serde_json::{Value, json};

async fn client_with_tasks_bucket(url: &str) -> TestClient {
    let mut client = TestClient::connect(url).await.unwrap();
    client.recv_frame().await.unwrap(); // welcome
    client
        .call(
            1,
            "store.defineBucket",
            json!({
                "bucket": "tasks",
                "schema": {
                    "title": { "type": "string", "required": true },
                    "done": { "type": "boolean", "default": false },
                    "points": { "type": "number" },
                }
            }),
        )
        .await
        .unwrap();
    client
}

#[tokio::test]
async fn insert_get_update_delete_follow_the_version_laws() {
    let gateway = spawn_gateway(base_config()).await;
    let mut client = client_with_tasks_bucket(&gateway.url).await;

    let record = client
        .call(2, "store.insert", json!({ "bucket": "tasks", "record": { "title": "x" } }))
        .await
        .unwrap();
    assert_eq!(record["_version"], 1);
    assert_eq!(record["done"], false);
    let key = record["id"].as_str().unwrap().to_owned();

    let fetched = client
        .call(3, "store.get", json!({ "bucket": "tasks", "key": key }))
        .await
        .unwrap();
    assert_eq!(fetched, record);

    let updated = client
        .call(
            4,
            "store.update",
            json!({ "bucket": "tasks", "key": key, "patch": { "done": true } }),
        )
        .await
        .unwrap();
    assert_eq!(updated["_version"], 2);

    let deleted = client
        .call(5, "store.delete", json!({ "bucket": "tasks", "key": key }))
        .await
        .unwrap();
    assert_eq!(deleted["deleted"], true);

    let gone = client
        .call(6, "store.get", json!({ "bucket": "tasks", "key": key }))
        .await
        .unwrap();
    assert_eq!(gone, Value::Null);

    // Deleting a key that no longer exists still reports success.
    let again = client
        .call(7, "store.delete", json!({ "bucket": "tasks", "key": key }))
        .await
        .unwrap();
    assert_eq!(again["deleted"], true);
}

#[tokio::test]
async fn schema_violations_are_validation_errors() {
    let gateway = spawn_gateway(base_config()).await;
    let mut client = client_with_tasks_bucket(&gateway.url).await;

    let (code, _) = client
        .call_err(
            2,
            "store.insert",
            json!({ "bucket": "tasks", "record": { "title": "x", "_forceFail": true } }),
        )
        .await
        .unwrap();
    assert_eq!(code, "VALIDATION_ERROR");

    let (code, _) = client
        .call_err(3, "store.insert", json!({ "bucket": "tasks", "record": { "done": true } }))
        .await
        .unwrap();
    assert_eq!(code, "VALIDATION_ERROR");
}

#[tokio::test]
async fn unknown_bucket_and_missing_fields_error_distinctly() {
    let gateway = spawn_gateway(base_config()).await;
    let mut client = TestClient::connect(&gateway.url).await.unwrap();
    client.recv_frame().await.unwrap();

    let (code, _) = client
        .call_err(1, "store.all", json!({ "bucket": "ghosts" }))
        .await
        .unwrap();
    assert_eq!(code, "BUCKET_NOT_DEFINED");

    let (code, _) = client.call_err(2, "store.get", json!({})).await.unwrap();
    assert_eq!(code, "VALIDATION_ERROR");
}

#[tokio::test]
async fn clear_then_count_returns_zero() {
    let gateway = spawn_gateway(base_config()).await;
    let mut client = client_with_tasks_bucket(&gateway.url).await;

    for (id, title) in [(2, "a"), (3, "b"), (4, "c")] {
        client
            .call(id, "store.insert", json!({ "bucket": "tasks", "record": { "title": title } }))
            .await
            .unwrap();
    }
    assert_eq!(
        client.call(5, "store.count", json!({ "bucket": "tasks" })).await.unwrap(),
        json!(3)
    );
    client.call(6, "store.clear", json!({ "bucket": "tasks" })).await.unwrap();
    assert_eq!(
        client.call(7, "store.count", json!({ "bucket": "tasks" })).await.unwrap(),
        json!(0)
    );
}

#[tokio::test]
async fn aggregates_follow_empty_and_filtered_semantics() {
    let gateway = spawn_gateway(base_config()).await;
    let mut client = client_with_tasks_bucket(&gateway.url).await;

    // Empty bucket: sum 0, avg/min/max null.
    assert_eq!(
        client
            .call(2, "store.sum", json!({ "bucket": "tasks", "field": "points" }))
            .await
            .unwrap(),
        json!(0.0)
    );
    for (id, op) in [(3, "store.avg"), (4, "store.min"), (5, "store.max")] {
        assert_eq!(
            client
                .call(id, op, json!({ "bucket": "tasks", "field": "points" }))
                .await
                .unwrap(),
            Value::Null,
            "{op}"
        );
    }

    for (id, points) in [(6, 1.0), (7, 2.0), (8, 6.0)] {
        client
            .call(
                id,
                "store.insert",
                json!({ "bucket": "tasks", "record": { "title": "t", "points": points } }),
            )
            .await
            .unwrap();
    }
    assert_eq!(
        client
            .call(9, "store.sum", json!({ "bucket": "tasks", "field": "points" }))
            .await
            .unwrap(),
        json!(9.0)
    );
    assert_eq!(
        client
            .call(10, "store.avg", json!({ "bucket": "tasks", "field": "points" }))
            .await
            .unwrap(),
        json!(3.0)
    );
}

#[tokio::test]
async fn where_find_one_first_last_and_paginate() {
    let gateway = spawn_gateway(base_config()).await;
    let mut client = client_with_tasks_bucket(&gateway.url).await;

    for (id, title, done) in [(2, "a", false), (3, "b", true), (4, "c", false)] {
        client
            .call(
                id,
                "store.insert",
                json!({ "bucket": "tasks", "record": { "title": title, "done": done } }),
            )
            .await
            .unwrap();
    }

    let open = client
        .call(5, "store.where", json!({ "bucket": "tasks", "filter": { "done": false } }))
        .await
        .unwrap();
    assert_eq!(open.as_array().unwrap().len(), 2);

    let found = client
        .call(6, "store.findOne", json!({ "bucket": "tasks", "filter": { "title": "b" } }))
        .await
        .unwrap();
    assert_eq!(found["done"], true);

    let first = client.call(7, "store.first", json!({ "bucket": "tasks" })).await.unwrap();
    let last = client.call(8, "store.last", json!({ "bucket": "tasks" })).await.unwrap();
    assert_eq!(first["title"], "a");
    assert_eq!(last["title"], "c");

    let page = client
        .call(9, "store.paginate", json!({ "bucket": "tasks", "limit": 2 }))
        .await
        .unwrap();
    assert_eq!(page["records"].as_array().unwrap().len(), 2);
    assert_eq!(page["hasMore"], true);
    let cursor = page["nextCursor"].as_str().unwrap().to_owned();

    let rest = client
        .call(10, "store.paginate", json!({ "bucket": "tasks", "limit": 2, "cursor": cursor }))
        .await
        .unwrap();
    assert_eq!(rest["records"].as_array().unwrap().len(), 1);
    assert_eq!(rest["hasMore"], false);
}

#[tokio::test]
async fn failed_transaction_rolls_back_completely() {
    let gateway = spawn_gateway(base_config()).await;
    let mut client = client_with_tasks_bucket(&gateway.url).await;

    let (code, _) = client
        .call_err(
            2,
            "store.transaction",
            json!({ "operations": [
                { "op": "insert", "bucket": "tasks", "record": { "title": "A" } },
                { "op": "insert", "bucket": "tasks", "record": { "title": "B", "_forceFail": true } },
            ]}),
        )
        .await
        .unwrap();
    assert_eq!(code, "VALIDATION_ERROR");

    let all = client.call(3, "store.all", json!({ "bucket": "tasks" })).await.unwrap();
    assert_eq!(all, json!([]));
}

#[tokio::test]
async fn bucket_and_query_management_round_trip() {
    let gateway = spawn_gateway(base_config()).await;
    let mut client = client_with_tasks_bucket(&gateway.url).await;

    let buckets = client.call(2, "store.buckets", json!({})).await.unwrap();
    assert_eq!(buckets, json!(["tasks"]));

    let schema = client
        .call(3, "store.getBucketSchema", json!({ "bucket": "tasks" }))
        .await
        .unwrap();
    assert_eq!(schema["name"], "tasks");
    assert_eq!(schema["primaryKey"], "id");

    client
        .call(
            4,
            "store.defineQuery",
            json!({ "name": "open-tasks", "bucket": "tasks", "filter": { "done": false } }),
        )
        .await
        .unwrap();
    let queries = client.call(5, "store.listQueries", json!({})).await.unwrap();
    assert_eq!(queries.as_array().unwrap().len(), 1);

    client
        .call(6, "store.undefineQuery", json!({ "name": "open-tasks" }))
        .await
        .unwrap();
    let queries = client.call(7, "store.listQueries", json!({})).await.unwrap();
    assert_eq!(queries, json!([]));

    client.call(8, "store.dropBucket", json!({ "bucket": "tasks" })).await.unwrap();
    let (code, _) = client
        .call_err(9, "store.all", json!({ "bucket": "tasks" }))
        .await
        .unwrap();
    assert_eq!(code, "BUCKET_NOT_DEFINED");
}
