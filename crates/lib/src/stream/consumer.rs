//! Stream consumer: one request, then a sequential read → decode → deliver loop.
//!
//! The credential is captured when the call starts. There is no retry, timeout or
//! cancellation here; dropping the future closes the connection.

use crate::api::ApiClient;
use crate::session::Credential;
use crate::stream::decoder::FrameDecoder;
use axum::body::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::StatusCode;
use serde::Serialize;
use std::collections::VecDeque;

/// Chat streaming endpoint.
pub const STREAM_ENDPOINT: &str = "/stream";

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// No credential; nothing was sent.
    #[error("not signed in")]
    Unauthenticated,
    /// Non-success status on the initial request. `body` is the backend's text.
    #[error("stream request failed: {status} {body}")]
    RequestFailed { status: StatusCode, body: String },
    /// Transport or decode failure after the response started.
    #[error("stream read failed: {0}")]
    ReadFailed(String),
    /// The request could not be sent at all (connect error, bad URL).
    #[error("stream request could not be sent: {0}")]
    Request(#[from] reqwest::Error),
}

/// Body of POST /stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamRequest {
    pub chat_id: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// System prompt override (backend default: a helpful medical assistant).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl StreamRequest {
    pub fn new(chat_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// Lazy, finite sequence of frame payloads from one response.
pub type FrameStream = BoxStream<'static, Result<String, StreamError>>;

async fn open<B: Serialize + ?Sized + Sync>(
    client: &ApiClient,
    endpoint: &str,
    body: &B,
    credential: &Credential,
) -> Result<reqwest::Response, StreamError> {
    if credential.token.trim().is_empty() {
        return Err(StreamError::Unauthenticated);
    }
    log::debug!("opening stream {}", endpoint);
    let res = client
        .http()
        .post(client.url(endpoint))
        .bearer_auth(&credential.token)
        .json(body)
        .send()
        .await?;
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        log::debug!("stream {} rejected with {}", endpoint, status);
        return Err(StreamError::RequestFailed { status, body });
    }
    Ok(res)
}

/// POST `body` to `endpoint` and call `on_token` once per frame, in arrival order.
/// Resolves with the number of frames delivered once the body ends. Frames delivered
/// before a failure stay delivered.
pub async fn consume_stream<B: Serialize + ?Sized + Sync>(
    client: &ApiClient,
    endpoint: &str,
    body: &B,
    credential: &Credential,
    on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
) -> Result<usize, StreamError> {
    let res = open(client, endpoint, body, credential).await?;
    let mut chunks = res.bytes_stream();
    let mut decoder = FrameDecoder::new();
    let mut delivered = 0usize;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| StreamError::ReadFailed(e.to_string()))?;
        for payload in decoder.push(&chunk)? {
            on_token(&payload);
            delivered += 1;
        }
    }
    if let Some(payload) = decoder.finish()? {
        on_token(&payload);
        delivered += 1;
    }
    log::debug!("stream {} finished after {} frame(s)", endpoint, delivered);
    Ok(delivered)
}

/// POST /stream for a chat message.
pub async fn send_message(
    client: &ApiClient,
    credential: &Credential,
    request: &StreamRequest,
    on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
) -> Result<usize, StreamError> {
    consume_stream(client, STREAM_ENDPOINT, request, credential, on_token).await
}

struct FrameState {
    chunks: BoxStream<'static, reqwest::Result<Bytes>>,
    /// None once the body ended or failed.
    decoder: Option<FrameDecoder>,
    ready: VecDeque<String>,
}

/// Like [`consume_stream`], but hands back the payloads as a `Stream` the caller pulls.
/// The request is sent (and its status checked) before this returns; after an `Err`
/// item the stream ends.
pub async fn frame_stream<B: Serialize + ?Sized + Sync>(
    client: &ApiClient,
    endpoint: &str,
    body: &B,
    credential: &Credential,
) -> Result<FrameStream, StreamError> {
    let res = open(client, endpoint, body, credential).await?;
    let state = FrameState {
        chunks: res.bytes_stream().boxed(),
        decoder: Some(FrameDecoder::new()),
        ready: VecDeque::new(),
    };
    let frames = stream::unfold(state, |mut st| async move {
        loop {
            if let Some(payload) = st.ready.pop_front() {
                return Some((Ok(payload), st));
            }
            let decoder = st.decoder.as_mut()?;
            match st.chunks.next().await {
                Some(Ok(chunk)) => match decoder.push(&chunk) {
                    Ok(payloads) => st.ready.extend(payloads),
                    Err(e) => {
                        st.decoder = None;
                        return Some((Err(e), st));
                    }
                },
                Some(Err(e)) => {
                    st.decoder = None;
                    return Some((Err(StreamError::ReadFailed(e.to_string())), st));
                }
                None => {
                    let decoder = st.decoder.take()?;
                    return match decoder.finish() {
                        Ok(Some(payload)) => Some((Ok(payload), st)),
                        Ok(None) => None,
                        Err(e) => Some((Err(e), st)),
                    };
                }
            }
        }
    });
    Ok(frames.boxed())
}
