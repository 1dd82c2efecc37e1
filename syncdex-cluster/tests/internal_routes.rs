mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{load_fixture, node, INDEX, STORE};
use serde_json::{json, Value};
use syncdex_cluster::internal_router;
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn partitions_lists_locally_hosted_buckets() {
    let n = node(&[1, 3]).await;
    let app = internal_router(n.service.clone(), "node-b");

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/internal/partitions?index={}&store={}", INDEX, STORE))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["node_id"], "node-b");
    assert_eq!(body["partitions"], json!([1, 3]));
}

#[tokio::test(flavor = "multi_thread")]
async fn partitions_for_unknown_index_is_not_found() {
    let n = node(&[0, 1, 2, 3]).await;
    let app = internal_router(n.service.clone(), "node-b");

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/internal/partitions?index=missing&store={}", STORE))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["kind"], "index_not_found");
}

#[tokio::test(flavor = "multi_thread")]
async fn search_answers_from_requested_partitions() {
    let n = node(&[0, 1, 2, 3]).await;
    load_fixture(&[&n]).await;
    let app = internal_router(n.service.clone(), "node-b");

    let response = app
        .oneshot(post_json(
            "/internal/search",
            json!({
                "index": INDEX,
                "store": STORE,
                "query": "text:world",
                "default_field": "text",
                "partitions": [0, 1, 2, 3],
                "limit": 10
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let hits = body["hits"].as_array().unwrap();
    assert_eq!(hits.len(), 4);
    let rows: usize = hits.iter().map(|h| h["rows"].as_array().unwrap().len()).sum();
    assert_eq!(rows, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn search_on_foreign_partition_is_misdirected() {
    let n = node(&[0]).await;
    let app = internal_router(n.service.clone(), "node-a");

    let response = app
        .oneshot(post_json(
            "/internal/search",
            json!({
                "index": INDEX,
                "store": STORE,
                "query": "world",
                "default_field": "text",
                "partitions": [2],
                "limit": 10
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::MISDIRECTED_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "partition_not_hosted");
    assert_eq!(body["partition"], 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_query_syntax_is_bad_request() {
    let n = node(&[0]).await;
    let app = internal_router(n.service.clone(), "node-a");

    let response = app
        .oneshot(post_json(
            "/internal/search",
            json!({
                "index": INDEX,
                "store": STORE,
                "query": "(text:world",
                "default_field": "text",
                "partitions": [0],
                "limit": 10
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["kind"], "query_parse_error");
}

#[tokio::test(flavor = "multi_thread")]
async fn flush_reports_drained_partitions() {
    let n = node(&[0, 1, 2, 3]).await;
    load_fixture(&[&n]).await;
    let app = internal_router(n.service.clone(), "node-a");

    let response = app
        .oneshot(post_json(
            "/internal/flush",
            json!({ "index": INDEX, "store": STORE, "timeout_ms": 5000 }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["flushed"], true);
}
