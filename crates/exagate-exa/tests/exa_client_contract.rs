//! Offline contract tests for the Exa client against a local fixture server.
//!
//! These verify the retry policy (5xx retried with backoff, 4xx never),
//! auth-header injection, and the not-found mapping for research polls.

use axum::{
    extract::Path,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use exagate_core::{Error, ExaBackend, SearchRequest};
use exagate_exa::ExaClient;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fixture listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("axum serve");
    });
    addr
}

fn client_for(addr: SocketAddr) -> ExaClient {
    ExaClient::new(
        reqwest::Client::new(),
        "test-key",
        format!("http://{addr}"),
    )
}

#[tokio::test]
async fn search_sends_api_key_and_parses_results() {
    let app = Router::new().route(
        "/search",
        post(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
            assert_eq!(
                headers.get("x-api-key").and_then(|v| v.to_str().ok()),
                Some("test-key")
            );
            assert_eq!(body["query"], "rust async");
            assert_eq!(body["text"], false);
            Json(serde_json::json!({
                "results": [
                    {"title": "A", "url": "https://a.example", "text": "alpha"},
                    {"title": "B", "url": "https://b.example", "summary": "beta"},
                    {"title": "C", "url": "https://c.example", "text": "gamma"}
                ]
            }))
        }),
    );
    let addr = serve(app).await;

    let results = client_for(addr)
        .search(&SearchRequest {
            query: "rust async".to_string(),
            num_results: 2,
            include_text: false,
        })
        .await
        .expect("search");

    // Client-side truncation to num_results, order preserved.
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].url, "https://a.example");
    assert_eq!(
        results[1].body,
        exagate_core::ResultText::Snippet("beta".to_string())
    );
}

#[tokio::test]
async fn transient_5xx_is_retried_then_succeeds() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    let app = Router::new().route(
        "/search",
        post(move || {
            let hits = Arc::clone(&hits2);
            async move {
                if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                    return (
                        StatusCode::BAD_GATEWAY,
                        Json(serde_json::json!({"error": "flaky"})),
                    );
                }
                (
                    StatusCode::OK,
                    Json(serde_json::json!({
                        "results": [{"url": "https://ok.example", "text": "fine"}]
                    })),
                )
            }
        }),
    );
    let addr = serve(app).await;

    let results = client_for(addr)
        .search(&SearchRequest {
            query: "q".to_string(),
            num_results: 3,
            include_text: false,
        })
        .await
        .expect("search after retries");
    assert_eq!(results.len(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_upstream_error() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    let app = Router::new().route(
        "/answer",
        post(move || {
            let hits = Arc::clone(&hits2);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::INTERNAL_SERVER_ERROR, "down")
            }
        }),
    );
    let addr = serve(app).await;

    let err = client_for(addr)
        .answer("why", false)
        .await
        .expect_err("should fail");
    match err {
        Error::Upstream { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "down");
        }
        other => panic!("expected upstream error, got {other}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), exagate_exa::RETRY_ATTEMPTS as usize);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    let app = Router::new().route(
        "/contents",
        post(move || {
            let hits = Arc::clone(&hits2);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::BAD_REQUEST, "invalid url")
            }
        }),
    );
    let addr = serve(app).await;

    let err = client_for(addr)
        .fetch_content("not-a-url", None)
        .await
        .expect_err("should fail");
    match err {
        Error::Upstream { status, .. } => assert_eq!(status, 400),
        other => panic!("expected upstream error, got {other}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_contents_results_is_a_fetch_failure() {
    let app = Router::new().route(
        "/contents",
        post(|| async { Json(serde_json::json!({"results": []})) }),
    );
    let addr = serve(app).await;

    let err = client_for(addr)
        .fetch_content("https://missing.example", None)
        .await
        .expect_err("should fail");
    match err {
        Error::Fetch(msg) => assert!(msg.contains("no content returned")),
        other => panic!("expected fetch error, got {other}"),
    }
}

#[tokio::test]
async fn research_poll_maps_404_to_not_found() {
    let app = Router::new().route(
        "/research/v0/tasks/:id",
        get(|Path(_id): Path<String>| async { (StatusCode::NOT_FOUND, "no such task") }),
    );
    let addr = serve(app).await;

    let err = client_for(addr)
        .research_get("task-nope")
        .await
        .expect_err("should fail");
    match err {
        Error::NotFound(id) => assert_eq!(id, "task-nope"),
        other => panic!("expected not-found, got {other}"),
    }
}

#[tokio::test]
async fn research_create_and_poll_round_trip() {
    let app = Router::new()
        .route(
            "/research/v0/tasks",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["instructions"], "summarize rust releases");
                assert_eq!(body["output"]["schema"]["type"], "object");
                Json(serde_json::json!({"id": "task-123"}))
            }),
        )
        .route(
            "/research/v0/tasks/:id",
            get(|Path(id): Path<String>| async move {
                Json(serde_json::json!({
                    "id": id,
                    "status": "completed",
                    "instructions": "summarize rust releases",
                    "data": {"summary": "done"},
                    "citations": ["https://blog.rust-lang.org"]
                }))
            }),
        );
    let addr = serve(app).await;
    let client = client_for(addr);

    let schema = serde_json::json!({"type": "object"})
        .as_object()
        .cloned()
        .unwrap();
    let task_id = client
        .research_create(&exagate_core::ResearchCreate {
            instructions: "summarize rust releases".to_string(),
            model: None,
            output_schema: Some(schema),
        })
        .await
        .expect("create");
    assert_eq!(task_id, "task-123");

    let task = client.research_get(&task_id).await.expect("poll");
    assert_eq!(task.state, exagate_core::TaskState::Completed);
    assert!(task.state.is_terminal());
    assert_eq!(task.result.unwrap()["summary"], "done");
}

#[tokio::test]
async fn subpage_crawl_caps_results_at_requested_count() {
    let app = Router::new().route(
        "/contents",
        post(|Json(body): Json<serde_json::Value>| async move {
            assert_eq!(body["subpages"], 2);
            assert_eq!(body["subpage_target"][0], "about");
            // Provider overshoots; the client must cap.
            Json(serde_json::json!({
                "results": [{
                    "url": "https://root.example",
                    "title": "Root",
                    "text": "root",
                    "subpages": [
                        {"url": "https://root.example/a", "text": "a"},
                        {"url": "https://root.example/b", "text": "b"},
                        {"url": "https://root.example/c", "text": "c"}
                    ]
                }]
            }))
        }),
    );
    let addr = serve(app).await;

    let bundle = client_for(addr)
        .fetch_subpages(&exagate_core::SubpageRequest {
            url: "https://root.example".to_string(),
            subpages: 2,
            target_keywords: ["about".to_string()].into_iter().collect(),
            livecrawl: None,
        })
        .await
        .expect("subpages");
    assert_eq!(bundle.root.url, "https://root.example");
    assert_eq!(bundle.subpages.len(), 2);
    assert_eq!(bundle.requested_count, 2);
}
