//! Streaming chat replies.
//!
//! `POST /stream` answers with a body of `data: <token>\n\n` frames that ends when the
//! connection closes. [`consume_stream`] delivers each payload to a callback in arrival
//! order; [`frame_stream`] exposes the same payloads as a lazy `Stream`.

mod consumer;
mod decoder;

pub use consumer::{
    consume_stream, frame_stream, send_message, FrameStream, StreamError, StreamRequest,
    STREAM_ENDPOINT,
};
pub use decoder::{FrameDecoder, DATA_MARKER, FRAME_SEPARATOR, MAX_UNTERMINATED};
