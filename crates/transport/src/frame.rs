//! Line framing for the chat event stream.
//!
//! The backend writes one `data:` line per event. Reads may end anywhere, including
//! in the middle of a JSON payload or a multi-byte character, so the decoder keeps a
//! carry-over buffer between calls.

use std::mem;

pub const DATA_MARKER: &str = "data:";
pub const EVENT_MARKER: &str = "event:";

/// One logical protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload of a `data:` line with its marker(s) removed. Never empty.
    Data(String),
    /// Informational `event:` name. Carries no payload.
    Event(String),
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    carry: String,
    // Trailing bytes of a UTF-8 sequence split across reads.
    pending_bytes: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a raw network chunk and returns the frames it completes.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let text = self.decode_utf8(chunk);
        self.push_str(&text)
    }

    /// Appends already-decoded text and returns the frames it completes.
    pub fn push_str(&mut self, chunk: &str) -> Vec<Frame> {
        self.carry.push_str(chunk);

        let Some(last_newline) = self.carry.rfind('\n') else {
            return Vec::new();
        };

        let incomplete = self.carry.split_off(last_newline + 1);
        let complete = mem::replace(&mut self.carry, incomplete);
        complete.lines().filter_map(parse_line).collect()
    }

    /// Flushes whatever is left as one final, possibly unterminated, line.
    pub fn finish(&mut self) -> Vec<Frame> {
        if !self.pending_bytes.is_empty() {
            let tail = mem::take(&mut self.pending_bytes);
            self.carry.push_str(&String::from_utf8_lossy(&tail));
        }

        let remaining = mem::take(&mut self.carry);
        remaining.lines().filter_map(parse_line).collect()
    }

    pub fn carry_over(&self) -> &str {
        &self.carry
    }

    fn decode_utf8(&mut self, chunk: &[u8]) -> String {
        let mut bytes = mem::take(&mut self.pending_bytes);
        bytes.extend_from_slice(chunk);

        let mut decoded = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    break;
                }
                Err(error) => {
                    let (valid, after) = rest.split_at(error.valid_up_to());
                    decoded.push_str(&String::from_utf8_lossy(valid));

                    match error.error_len() {
                        Some(invalid_len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[invalid_len..];
                        }
                        None => {
                            self.pending_bytes = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        decoded
    }
}

/// Strips the `data:` marker, and the second one emitted by older backends.
///
/// Returns `None` for non-data lines and for empty payloads.
pub fn extract_payload(line: &str) -> Option<&str> {
    let payload = line.trim().strip_prefix(DATA_MARKER)?.trim_start();
    let payload = payload
        .strip_prefix(DATA_MARKER)
        .map_or(payload, str::trim_start);

    (!payload.is_empty()).then_some(payload)
}

fn parse_line(line: &str) -> Option<Frame> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(name) = line.strip_prefix(EVENT_MARKER) {
        return Some(Frame::Event(name.trim().to_string()));
    }

    extract_payload(line).map(|payload| Frame::Data(payload.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(payload: &str) -> Frame {
        Frame::Data(payload.to_string())
    }

    #[test]
    fn keeps_incomplete_line_until_newline_arrives() {
        let mut decoder = FrameDecoder::new();

        assert!(decoder.push_str("data: {\"content\":\"He").is_empty());
        assert_eq!(decoder.carry_over(), "data: {\"content\":\"He");

        let frames = decoder.push_str("llo\"}\n");
        assert_eq!(frames, vec![data("{\"content\":\"Hello\"}")]);
        assert_eq!(decoder.carry_over(), "");
    }

    #[test]
    fn double_prefix_matches_single_prefix() {
        assert_eq!(
            extract_payload("data:data: {\"content\":\"x\"}"),
            extract_payload("data: {\"content\":\"x\"}")
        );
        assert_eq!(
            extract_payload("  data: data:{\"content\":\"x\"}  "),
            Some("{\"content\":\"x\"}")
        );
    }

    #[test]
    fn classifies_event_blank_and_foreign_lines() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push_str("event: message\n\n: keep-alive\nid: 7\ndata:\ndata: [DONE]\n");

        assert_eq!(
            frames,
            vec![Frame::Event("message".to_string()), data("[DONE]")]
        );
    }

    #[test]
    fn tolerates_crlf_line_endings() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push_str("data: {\"done\":true}\r\n");

        assert_eq!(frames, vec![data("{\"done\":true}")]);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push_str("data: [DONE]").is_empty());

        assert_eq!(decoder.finish(), vec![data("[DONE]")]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn multibyte_characters_survive_any_split() {
        let line = "data: {\"content\":\"你好 🚀\"}\n".as_bytes();

        for split in 0..=line.len() {
            let mut decoder = FrameDecoder::new();
            let mut frames = decoder.push_bytes(&line[..split]);
            frames.extend(decoder.push_bytes(&line[split..]));

            assert_eq!(
                frames,
                vec![data("{\"content\":\"你好 🚀\"}")],
                "split at byte {split}"
            );
        }
    }

    #[test]
    fn invalid_utf8_is_replaced_not_dropped() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push_bytes(b"data: {\"content\":\"a\xffb\"}\n");

        assert_eq!(frames, vec![data("{\"content\":\"a\u{fffd}b\"}")]);
    }
}
