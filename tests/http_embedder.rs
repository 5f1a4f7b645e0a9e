//! HTTP embedding provider against a mock server: response decoding and the
//! transient/permanent classification of failures.

use std::time::Duration;

use httpmock::prelude::*;
use ragline::embed::{EmbedError, EmbeddingProvider, HttpEmbeddingProvider};
use serde_json::json;
use url::Url;

fn provider(server: &MockServer) -> HttpEmbeddingProvider {
    HttpEmbeddingProvider::new(
        Url::parse(&server.url("/embed")).unwrap(),
        "test-model",
        3,
        Duration::from_secs(2),
    )
    .unwrap()
}

#[tokio::test]
async fn successful_response_decodes_in_order() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/embed")
                .json_body(json!({"model": "test-model", "input": ["alpha", "beta"]}));
            then.status(200)
                .json_body(json!({"embeddings": [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]}));
        })
        .await;

    let provider = provider(&server);
    let batch = vec!["alpha".to_string(), "beta".to_string()];
    let vectors = provider.embed(&batch).await.unwrap();
    assert_eq!(vectors, vec![vec![0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6]]);
    mock.assert_async().await;
}

#[tokio::test]
async fn server_errors_and_rate_limits_classify_transient() {
    for status in [408, 429, 500, 503] {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embed");
                then.status(status).body("overloaded");
            })
            .await;

        let provider = provider(&server);
        let err = provider.embed(&["x".to_string()]).await.unwrap_err();
        assert!(
            matches!(err, EmbedError::Transient(_)),
            "status {status} should be transient, got {err:?}"
        );
    }
}

#[tokio::test]
async fn client_errors_classify_permanent() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/embed");
            then.status(400).body("malformed input");
        })
        .await;

    let provider = provider(&server);
    let err = provider.embed(&["x".to_string()]).await.unwrap_err();
    assert!(matches!(err, EmbedError::Permanent(_)), "got {err:?}");
}

#[tokio::test]
async fn vector_count_mismatch_is_permanent() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/embed");
            then.status(200).json_body(json!({"embeddings": [[0.1, 0.2]]}));
        })
        .await;

    let provider = provider(&server);
    let batch = vec!["a".to_string(), "b".to_string()];
    let err = provider.embed(&batch).await.unwrap_err();
    assert!(matches!(err, EmbedError::Permanent(_)), "got {err:?}");
}

#[tokio::test]
async fn undecodable_body_is_permanent() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/embed");
            then.status(200).body("not json at all");
        })
        .await;

    let provider = provider(&server);
    let err = provider.embed(&["x".to_string()]).await.unwrap_err();
    assert!(matches!(err, EmbedError::Permanent(_)), "got {err:?}");
}

#[tokio::test]
async fn connection_refused_is_transient() {
    // Bind-and-drop leaves a port with nothing listening.
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let provider = HttpEmbeddingProvider::new(
        Url::parse(&format!("http://{addr}/embed")).unwrap(),
        "test-model",
        3,
        Duration::from_millis(500),
    )
    .unwrap();
    let err = provider.embed(&["x".to_string()]).await.unwrap_err();
    assert!(matches!(err, EmbedError::Transient(_)), "got {err:?}");
}
