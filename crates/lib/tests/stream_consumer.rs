//! Integration tests: drive the stream consumer over real HTTP against small axum routers
//! that reproduce chunking, rejection and dropped connections.

use axum::{
    body::{Body, Bytes},
    http::{header, HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use futures_util::stream::{self, StreamExt};
use lib::api::ApiClient;
use lib::session::Credential;
use lib::stream::{consume_stream, frame_stream, send_message, StreamError, StreamRequest};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Serve `app` on a loopback port and return a client pointed at it.
async fn serve(app: Router) -> ApiClient {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    ApiClient::new(Some(format!("http://{}", addr)))
}

/// Body that sends each chunk as its own write, with a short pause in between.
fn chunked(chunks: &'static [&'static [u8]]) -> Body {
    let s = stream::iter(chunks.iter().copied()).then(|c| async move {
        tokio::time::sleep(Duration::from_millis(15)).await;
        Ok::<_, std::io::Error>(Bytes::from_static(c))
    });
    Body::from_stream(s)
}

fn credential() -> Credential {
    Credential::new("tok-test", "Dr. Test")
}

async fn collect(client: &ApiClient, credential: &Credential) -> (Vec<String>, Result<usize, StreamError>) {
    let mut seen = Vec::new();
    let result = {
        let mut on_token = |t: &str| seen.push(t.to_string());
        consume_stream(client, "/stream", &StreamRequest::new("c1", "hi"), credential, &mut on_token).await
    };
    (seen, result)
}

#[tokio::test]
async fn frames_split_across_chunks_arrive_whole_and_in_order() {
    let app = Router::new().route(
        "/stream",
        post(|| async { chunked(&[b"data: Hel", b"lo\n\ndata: , wor", b"ld\n\n"]) }),
    );
    let client = serve(app).await;

    let (seen, result) = collect(&client, &credential()).await;
    assert_eq!(seen, vec!["Hello", ", world"]);
    assert_eq!(result.expect("stream ok"), 2);
}

#[tokio::test]
async fn multibyte_split_and_unmarked_segments() {
    let app = Router::new().route(
        "/stream",
        post(|| async {
            chunked(&[
                b"event: ping\n\ndata: caf\xC3",
                b"\xA9\n\n: keep-alive\n\ndata: \xE2\x9C",
                b"\x93 ok\n\nevent: end\ndata: [DONE]\n\n",
            ])
        }),
    );
    let client = serve(app).await;

    let (seen, result) = collect(&client, &credential()).await;
    assert_eq!(seen, vec!["café", "✓ ok"]);
    assert_eq!(result.expect("stream ok"), 2);
}

#[tokio::test]
async fn rejected_request_never_calls_on_token() {
    let app = Router::new().route(
        "/stream",
        post(|| async { (StatusCode::UNAUTHORIZED, "Invalid token") }),
    );
    let client = serve(app).await;

    let (seen, result) = collect(&client, &credential()).await;
    assert!(seen.is_empty());
    match result {
        Err(StreamError::RequestFailed { status, body }) => {
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, "Invalid token");
        }
        other => panic!("expected RequestFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn dropped_connection_keeps_delivered_frames() {
    let app = Router::new().route(
        "/stream",
        post(|| async {
            let parts = stream::iter(0..2).then(|i| async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                if i == 0 {
                    Ok(Bytes::from_static(b"data: partial\n\n"))
                } else {
                    Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "upstream gone"))
                }
            });
            Body::from_stream(parts)
        }),
    );
    let client = serve(app).await;

    let (seen, result) = collect(&client, &credential()).await;
    assert_eq!(seen, vec!["partial"]);
    assert!(
        matches!(result, Err(StreamError::ReadFailed(_))),
        "expected ReadFailed, got {:?}",
        result
    );
}

#[tokio::test]
async fn missing_credential_sends_nothing() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/stream",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                "data: x\n\n"
            }
        }),
    );
    let client = serve(app).await;

    let (seen, result) = collect(&client, &Credential::new("", "")).await;
    assert!(seen.is_empty());
    assert!(matches!(result, Err(StreamError::Unauthenticated)));
    assert!(matches!(
        frame_stream(&client, "/stream", &StreamRequest::new("c1", "hi"), &Credential::new(" ", "")).await,
        Err(StreamError::Unauthenticated)
    ));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn request_carries_bearer_token_and_body() {
    let app = Router::new().route(
        "/stream",
        post(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
            let auth = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            format!(
                "data: {}\n\ndata: {}\n\ndata: {}\n\n",
                auth,
                body["prompt"].as_str().unwrap_or(""),
                body.get("image_url").is_some()
            )
        }),
    );
    let client = serve(app).await;

    let mut seen = Vec::new();
    let mut on_token = |t: &str| seen.push(t.to_string());
    let request = StreamRequest::new("c1", "how is the patient?");
    let n = send_message(&client, &credential(), &request, &mut on_token)
        .await
        .expect("stream ok");
    assert_eq!(n, 3);
    assert_eq!(seen, vec!["Bearer tok-test", "how is the patient?", "false"]);
}

#[tokio::test]
async fn frame_stream_yields_payloads_lazily() {
    let app = Router::new().route(
        "/stream",
        post(|| async { chunked(&[b"data: one\n\ndata: t", b"wo\n\n", b"data: three"]) }),
    );
    let client = serve(app).await;

    let frames = frame_stream(&client, "/stream", &StreamRequest::new("c1", "hi"), &credential())
        .await
        .expect("stream opened");
    let items: Vec<String> = frames
        .map(|r| r.expect("frame ok"))
        .collect()
        .await;
    assert_eq!(items, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn frame_stream_ends_after_read_failure() {
    let app = Router::new().route(
        "/stream",
        post(|| async {
            let parts = stream::iter(0..2).then(|i| async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                if i == 0 {
                    Ok(Bytes::from_static(b"data: a\n\ndata: b\n\n"))
                } else {
                    Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
                }
            });
            Body::from_stream(parts)
        }),
    );
    let client = serve(app).await;

    let frames = frame_stream(&client, "/stream", &StreamRequest::new("c1", "hi"), &credential())
        .await
        .expect("stream opened");
    let items: Vec<Result<String, StreamError>> = frames.collect().await;
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_deref().ok(), Some("a"));
    assert_eq!(items[1].as_deref().ok(), Some("b"));
    assert!(matches!(items[2], Err(StreamError::ReadFailed(_))));
}

#[tokio::test]
async fn independent_calls_do_not_share_buffers() {
    let app = Router::new().route(
        "/stream",
        post(|| async { chunked(&[b"data: x\n\ndata: dangling"]) }),
    );
    let client = serve(app).await;

    let (first, _) = collect(&client, &credential()).await;
    let (second, _) = collect(&client, &credential()).await;
    assert_eq!(first, vec!["x", "dangling"]);
    assert_eq!(first, second);
}
