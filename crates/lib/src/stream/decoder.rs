//! Incremental frame decoder for `data: <payload>\n\n` response bodies.
//!
//! Bytes go in as they arrive; complete frame payloads come out. Multi-byte UTF-8
//! sequences split across chunks are held until completed, and text after the last
//! `\n\n` is carried over and joined with the next chunk before splitting again.

use crate::stream::StreamError;

/// Separates frames in the body.
pub const FRAME_SEPARATOR: &str = "\n\n";

/// Prefix that marks a segment as a frame. Stripped before delivery.
pub const DATA_MARKER: &str = "data: ";

/// Most unterminated text held while waiting for a separator (1 MiB).
pub const MAX_UNTERMINATED: usize = 1 << 20;

/// Per-call decoder state. Create a fresh one for every response body.
#[derive(Debug)]
pub struct FrameDecoder {
    /// Undecoded bytes: the start of a UTF-8 sequence whose remainder has not arrived.
    pending: Vec<u8>,
    /// Decoded text not yet terminated by a separator.
    text: String,
    limit: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_UNTERMINATED)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that fails once more than `limit` bytes of text wait for a separator.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            text: String::new(),
            limit,
        }
    }

    /// Feed one chunk; returns payloads of every frame the chunk completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, StreamError> {
        self.decode(chunk)?;
        let frames = self.drain_frames();
        if self.text.len() > self.limit {
            return Err(StreamError::ReadFailed(format!(
                "no frame separator within {} bytes",
                self.limit
            )));
        }
        Ok(frames)
    }

    /// End of body. A dangling partial UTF-8 sequence is an error; an unterminated
    /// trailing frame is still delivered, anything else left over is dropped.
    pub fn finish(self) -> Result<Option<String>, StreamError> {
        if !self.pending.is_empty() {
            return Err(StreamError::ReadFailed(format!(
                "stream ended inside a UTF-8 sequence ({} byte(s) left)",
                self.pending.len()
            )));
        }
        Ok(frame_payload(&self.text).map(str::to_string))
    }

    /// Text received but not yet closed by a separator.
    pub fn remainder(&self) -> &str {
        &self.text
    }

    fn decode(&mut self, chunk: &[u8]) -> Result<(), StreamError> {
        self.pending.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(s) => s.len(),
            // Incomplete sequence at the end: keep it for the next chunk.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => {
                return Err(StreamError::ReadFailed(format!(
                    "stream body is not valid UTF-8: {}",
                    e
                )))
            }
        };
        let rest = self.pending.split_off(valid);
        let complete = std::mem::replace(&mut self.pending, rest);
        let decoded = String::from_utf8(complete)
            .map_err(|e| StreamError::ReadFailed(format!("stream body is not valid UTF-8: {}", e)))?;
        self.text.push_str(&decoded);
        Ok(())
    }

    fn drain_frames(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.text[start..].find(FRAME_SEPARATOR) {
            let segment = &self.text[start..start + pos];
            if let Some(payload) = frame_payload(segment) {
                frames.push(payload.to_string());
            }
            start += pos + FRAME_SEPARATOR.len();
        }
        self.text.drain(..start);
        frames
    }
}

/// Payload of a segment, or None when the segment is not a frame.
fn frame_payload(segment: &str) -> Option<&str> {
    let payload = segment.strip_prefix(DATA_MARKER);
    if payload.is_none() && !segment.is_empty() {
        log::debug!("discarding unmarked stream segment ({} bytes)", segment.len());
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(chunks: &[&[u8]]) -> Vec<String> {
        let mut d = FrameDecoder::new();
        let mut out = Vec::new();
        for c in chunks {
            out.extend(d.push(c).unwrap());
        }
        out.extend(d.finish().unwrap());
        out
    }

    #[test]
    fn frames_split_across_chunks_are_reassembled() {
        let out = feed(&[b"data: Hel", b"lo\n\ndata: , wor", b"ld\n\n"]);
        assert_eq!(out, vec!["Hello", ", world"]);
    }

    #[test]
    fn unterminated_text_over_limit_fails() {
        let mut d = FrameDecoder::with_limit(16);
        assert_eq!(d.push(b"data: ok\n\ndata: 0123").unwrap(), vec!["ok"]);
        assert_eq!(d.push(b"456789").unwrap(), Vec::<String>::new());
        assert!(matches!(d.push(b"abcdef"), Err(StreamError::ReadFailed(_))));

        let mut d = FrameDecoder::with_limit(16);
        let out = d.push(b"data: 0123456789abcdef\n\n").unwrap();
        assert_eq!(out, vec!["0123456789abcdef"]);
    }

    #[test]
    fn separator_split_across_chunks() {
        let out = feed(&[b"data: a\n", b"\ndata: b\n", b"\n"]);
        assert_eq!(out, vec!["a", "b"]);
    }

    #[test]
    fn unmarked_segments_are_discarded() {
        let out = feed(&[b": keep-alive\n\ndata: x\n\nevent: end\ndata: [DONE]\n\n"]);
        assert_eq!(out, vec!["x"]);
    }

    #[test]
    fn payload_is_verbatim() {
        let out = feed(&[b"data:  leading space \n\ndata: \n\ndata: data: nested\n\n"]);
        assert_eq!(out, vec![" leading space ", "", "data: nested"]);
    }

    #[test]
    fn marker_split_across_chunks() {
        let out = feed(&[b"da", b"ta", b": ", b"ok\n\n"]);
        assert_eq!(out, vec!["ok"]);
    }

    #[test]
    fn multibyte_characters_split_mid_sequence() {
        let body = "data: caf\u{e9}\n\ndata: \u{1f9e0} ok\n\n".as_bytes();
        let whole = feed(&[body]);
        assert_eq!(whole, vec!["caf\u{e9}", "\u{1f9e0} ok"]);
        // Every single split point, including inside the 2- and 4-byte sequences.
        for i in 1..body.len() {
            assert_eq!(feed(&[&body[..i], &body[i..]]), whole, "split at {}", i);
        }
        // Byte by byte.
        let bytes: Vec<&[u8]> = body.chunks(1).collect();
        assert_eq!(feed(&bytes), whole);
    }

    #[test]
    fn frames_complete_only_once_terminated() {
        let mut d = FrameDecoder::new();
        assert!(d.push(b"data: wait").unwrap().is_empty());
        assert_eq!(d.remainder(), "data: wait");
        assert_eq!(d.push(b"ing\n\n").unwrap(), vec!["waiting"]);
        assert_eq!(d.remainder(), "");
    }

    #[test]
    fn unterminated_trailing_frame_is_flushed_at_end() {
        assert_eq!(feed(&[b"data: a\n\ndata: tail"]), vec!["a", "tail"]);
        assert_eq!(feed(&[b"data: a\n\nnoise"]), vec!["a"]);
    }

    #[test]
    fn invalid_utf8_is_a_read_failure() {
        let mut d = FrameDecoder::new();
        let err = d.push(b"data: \xff\xfe\n\n").unwrap_err();
        assert!(matches!(err, StreamError::ReadFailed(_)));
    }

    #[test]
    fn truncated_sequence_at_end_is_a_read_failure() {
        let mut d = FrameDecoder::new();
        assert_eq!(d.push(b"data: a\n\n\xe2\x82").unwrap(), vec!["a"]);
        assert!(matches!(d.finish(), Err(StreamError::ReadFailed(_))));
    }
}
