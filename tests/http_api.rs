//! Drives the router end to end over local backends.

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use storyvault::backends::Backends;
use storyvault::index::{SledIndex, SqliteIndex};
use storyvault::store::{FilesystemStore, ObjectContentStore};
use tempfile::TempDir;
use tower::ServiceExt;

fn memory_app() -> Router {
    let index = SledIndex::temporary().unwrap();
    storyvault::app(Backends::new(
        Arc::new(index),
        Arc::new(ObjectContentStore::in_memory()),
    ))
}

fn words(n: usize) -> String {
    vec!["word"; n].join(" ")
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn publish_body(title: &str, author: &str, tags: &[&str]) -> Value {
    json!({
        "title": title,
        "authorDid": author,
        "authorName": "Ada",
        "content": words(960),
        "tags": tags,
    })
}

#[tokio::test]
async fn health_and_readiness() {
    let app = memory_app();
    let (status, body) = send(&app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["sled"]["ok"], true);
    assert_eq!(body["checks"]["memory"]["ok"], true);
}

#[tokio::test]
async fn story_lifecycle() {
    let app = memory_app();
    let (status, created) = send(
        &app,
        Method::POST,
        "/stories",
        Some(publish_body("Digital Ghosts", "did:plc:ada", &["Fiction", "family"])),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["wordCount"], 960);
    assert_eq!(created["tags"], json!(["fiction", "family"]));
    let id = created["id"].as_str().unwrap().to_string();

    let (status, fetched) = send(&app, Method::GET, &format!("/stories/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["title"], "Digital Ghosts");
    assert_eq!(fetched["content"], words(960));

    let (status, revised) = send(
        &app,
        Method::PATCH,
        &format!("/stories/{}", id),
        Some(json!({ "title": "Analog Ghosts" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(revised["title"], "Analog Ghosts");
    assert_eq!(revised["createdAt"], created["createdAt"]);

    let (status, _) = send(&app, Method::DELETE, &format!("/stories/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&app, Method::GET, &format!("/stories/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);
    let (status, _) = send(&app, Method::DELETE, &format!("/stories/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn word_count_violations_are_bad_requests() {
    let app = memory_app();
    let mut body = publish_body("Too short", "did:plc:ada", &[]);
    body["content"] = json!(words(12));
    let (status, err) = send(&app, Method::POST, "/stories", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["error"].as_str().unwrap().contains("950"));
}

#[tokio::test]
async fn listing_search_and_count() {
    let app = memory_app();
    for (title, author, tags) in [
        ("Digital Ghosts", "did:plc:ada", &["fiction", "family"][..]),
        ("Harbor Lights", "did:plc:ada", &["fiction"][..]),
        ("The Ghost Shift", "did:plc:bob", &["scifi"][..]),
    ] {
        let (status, _) = send(&app, Method::POST, "/stories", Some(publish_body(title, author, tags))).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, page) = send(&app, Method::GET, "/stories?limit=2&sortBy=title&sortOrder=asc", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 3);
    assert_eq!(page["hasMore"], true);
    assert_eq!(page["stories"][0]["title"], "Digital Ghosts");

    let (_, page) = send(&app, Method::GET, "/stories?tags=fiction,family", None).await;
    assert_eq!(page["total"], 1);

    let (_, page) = send(&app, Method::GET, "/authors/did:plc:ada/stories", None).await;
    assert_eq!(page["total"], 2);

    let (_, page) = send(&app, Method::GET, "/stories/search?q=GHOST", None).await;
    assert_eq!(page["total"], 2);

    let (_, page) = send(&app, Method::GET, "/stories/search?q=ghost&authorDid=did:plc:bob", None).await;
    assert_eq!(page["stories"][0]["title"], "The Ghost Shift");

    let (status, count) = send(&app, Method::GET, "/stories/count?authorDid=did:plc:ada", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(count["count"], 2);

    let (status, _) = send(&app, Method::GET, "/stories?sortBy=wordCount", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn works_over_sqlite_and_filesystem() {
    let tmp = TempDir::new().unwrap();
    let url = format!("sqlite://{}", tmp.path().join("stories.db").display());
    let index = SqliteIndex::connect(&url, 2).await.unwrap();
    let store = FilesystemStore::new(tmp.path().join("blobs")).await.unwrap();
    let backends = Backends::new(Arc::new(index), Arc::new(store));
    let app = storyvault::app(backends.clone());

    let (status, created) = send(
        &app,
        Method::POST,
        "/stories",
        Some(publish_body("Harbor Lights", "did:plc:ada", &[])),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let key = created["storageKey"].as_str().unwrap();
    assert!(backends.store.exists(key).await.unwrap());

    let (status, _) = send(&app, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    backends.shutdown().await;
}
