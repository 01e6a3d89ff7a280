//! Legacy protocol framing codec.
//!
//! Every frame is a header block terminated by an empty line, followed by a
//! body of exactly `Content-Length` bytes:
//! - `Content-Length: <n>\r\n` plus optional extra headers
//! - `\r\n`
//! - `<n>` bytes of JSON
//!
//! The connect handshake is a header-only frame with `Content-Length: 0`.

use super::message::LegacyMessage;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

const HEADER_END: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "Content-Length";

/// Header blocks larger than this without a terminator are discarded
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// Bodies announced larger than this are refused and the stream resynced
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Headers of one frame, in wire order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameHeaders(Vec<(String, String)>);

impl FrameHeaders {
    /// Case-insensitive lookup
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn parse(block: &[u8]) -> Result<Self, String> {
        let text = std::str::from_utf8(block).map_err(|e| format!("header is not utf-8: {}", e))?;
        let mut headers = Vec::new();
        for line in text.split("\r\n").filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| format!("malformed header line: {:?}", line))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
        Ok(FrameHeaders(headers))
    }
}

/// One decoded frame.
///
/// Malformed input is surfaced as a frame rather than a decoder error so the
/// framed stream keeps running after it.
#[derive(Debug, Clone, PartialEq)]
pub enum LegacyFrame {
    /// Header-only frame sent once by the debuggee on connect
    Handshake(FrameHeaders),
    Message(LegacyMessage),
    Malformed(String),
}

#[derive(Debug)]
struct PendingBody {
    headers: FrameHeaders,
    length: usize,
}

/// Codec for `Content-Length` framed JSON
#[derive(Debug, Default)]
pub struct LegacyCodec {
    pending: Option<PendingBody>,
    /// Set after a header with an unusable length; input is skipped up to
    /// the next `Content-Length`
    resync: bool,
}

impl LegacyCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop input up to the next `Content-Length`. False if none is buffered yet.
    fn skip_to_header(&mut self, src: &mut BytesMut) -> bool {
        let marker = CONTENT_LENGTH.as_bytes();
        match src.windows(marker.len()).position(|w| w == marker) {
            Some(at) => {
                src.advance(at);
                self.resync = false;
                true
            }
            None => {
                // Keep a tail that may hold the start of a split marker
                let keep = marker.len() - 1;
                if src.len() > keep {
                    src.advance(src.len() - keep);
                }
                false
            }
        }
    }

    fn decode_header(&mut self, src: &mut BytesMut) -> Option<Result<(), String>> {
        let Some(end) = src.windows(HEADER_END.len()).position(|w| w == HEADER_END) else {
            if src.len() > MAX_HEADER_LEN {
                src.clear();
                return Some(Err(format!(
                    "header block exceeds {} bytes without terminator",
                    MAX_HEADER_LEN
                )));
            }
            return None;
        };

        let block = src.split_to(end);
        src.advance(HEADER_END.len());

        let headers = match FrameHeaders::parse(&block) {
            Ok(headers) => headers,
            Err(e) => return Some(Err(e)),
        };
        let length = match headers.get(CONTENT_LENGTH).map(str::parse::<usize>) {
            Some(Ok(length)) if length > MAX_BODY_LEN => {
                self.resync = true;
                return Some(Err(format!(
                    "Content-Length {} exceeds {} bytes",
                    length, MAX_BODY_LEN
                )));
            }
            Some(Ok(length)) => length,
            Some(Err(e)) => {
                self.resync = true;
                return Some(Err(format!("invalid Content-Length: {}", e)));
            }
            None => return Some(Err("missing Content-Length header".to_string())),
        };

        self.pending = Some(PendingBody { headers, length });
        Some(Ok(()))
    }
}

impl Decoder for LegacyCodec {
    type Item = LegacyFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.resync && !self.skip_to_header(src) {
            return Ok(None);
        }

        if self.pending.is_none() {
            match self.decode_header(src) {
                None => return Ok(None),
                Some(Err(reason)) => return Ok(Some(LegacyFrame::Malformed(reason))),
                Some(Ok(())) => {}
            }
        }

        let needed = match &self.pending {
            Some(pending) => pending.length,
            None => return Ok(None),
        };
        if src.len() < needed {
            return Ok(None);
        }

        let body = src.split_to(needed);
        let Some(pending) = self.pending.take() else {
            return Ok(None);
        };

        if pending.length == 0 {
            return Ok(Some(LegacyFrame::Handshake(pending.headers)));
        }

        match serde_json::from_slice::<LegacyMessage>(&body) {
            Ok(message) => Ok(Some(LegacyFrame::Message(message))),
            Err(e) => Ok(Some(LegacyFrame::Malformed(format!("invalid message body: {}", e)))),
        }
    }
}

impl Encoder<LegacyMessage> for LegacyCodec {
    type Error = io::Error;

    fn encode(&mut self, item: LegacyMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let header = format!("{}: {}\r\n\r\n", CONTENT_LENGTH, payload.len());

        dst.reserve(header.len() + payload.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::message::{LegacyEvent, LegacyRequest};
    use serde_json::json;

    fn frame(body: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
    }

    #[test]
    fn test_decode_complete_message() {
        let mut codec = LegacyCodec::new();
        let mut buf = BytesMut::from(
            frame(r#"{"type":"event","event":"break","body":{"sourceLine":3}}"#).as_str(),
        );

        let result = codec.decode(&mut buf).unwrap();
        let expected = LegacyEvent::new("break", json!({"sourceLine": 3}));
        assert_eq!(result, Some(LegacyFrame::Message(LegacyMessage::Event(expected))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_handshake() {
        let mut codec = LegacyCodec::new();
        let mut buf = BytesMut::from(
            "Type: connect\r\nV8-Version: 3.28.71.19\r\nProtocol-Version: 1\r\nContent-Length: 0\r\n\r\n",
        );

        let Some(LegacyFrame::Handshake(headers)) = codec.decode(&mut buf).unwrap() else {
            panic!("expected handshake");
        };
        assert_eq!(headers.get("type"), Some("connect"));
        assert_eq!(headers.get("V8-VERSION"), Some("3.28.71.19"));
    }

    #[test]
    fn test_decode_partial_header() {
        let mut codec = LegacyCodec::new();
        let mut buf = BytesMut::from("Content-Len");

        let result = codec.decode(&mut buf).unwrap();
        assert_eq!(result, None);
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn test_decode_partial_body_then_rest() {
        let mut codec = LegacyCodec::new();
        let full = frame(r#"{"type":"response","request_seq":1,"success":true,"body":{}}"#);
        let (head, tail) = full.split_at(30);
        let mut buf = BytesMut::from(head);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(tail.as_bytes());

        let Some(LegacyFrame::Message(LegacyMessage::Response(response))) =
            codec.decode(&mut buf).unwrap()
        else {
            panic!("expected response");
        };
        assert_eq!(response.request_seq, 1);
        assert!(response.success);
    }

    #[test]
    fn test_decode_merged_frames() {
        let mut codec = LegacyCodec::new();
        let mut data = frame(r#"{"type":"event","event":"afterCompile","body":{}}"#);
        data.push_str(&frame(r#"{"type":"event","event":"break","body":{}}"#));
        let mut buf = BytesMut::from(data.as_str());

        let first = codec.decode(&mut buf).unwrap();
        let second = codec.decode(&mut buf).unwrap();
        let third = codec.decode(&mut buf).unwrap();

        assert!(matches!(first, Some(LegacyFrame::Message(LegacyMessage::Event(e))) if e.event == "afterCompile"));
        assert!(matches!(second, Some(LegacyFrame::Message(LegacyMessage::Event(e))) if e.event == "break"));
        assert_eq!(third, None);
    }

    #[test]
    fn test_decode_multibyte_body_uses_byte_length() {
        let mut codec = LegacyCodec::new();
        let body = r#"{"type":"event","event":"break","body":{"text":"λ → ok"}}"#;
        let mut buf = BytesMut::from(frame(body).as_str());

        let result = codec.decode(&mut buf).unwrap();
        assert!(matches!(result, Some(LegacyFrame::Message(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_body_resets_and_continues() {
        let mut codec = LegacyCodec::new();
        let mut data = frame("{not json}");
        data.push_str(&frame(r#"{"type":"event","event":"break","body":{}}"#));
        let mut buf = BytesMut::from(data.as_str());

        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(LegacyFrame::Malformed(_))));
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(LegacyFrame::Message(LegacyMessage::Event(_)))
        ));
    }

    #[test]
    fn test_missing_content_length_is_malformed() {
        let mut codec = LegacyCodec::new();
        let mut data = String::from("Type: connect\r\n\r\n");
        data.push_str(&frame(r#"{"type":"event","event":"break","body":{}}"#));
        let mut buf = BytesMut::from(data.as_str());

        let Some(LegacyFrame::Malformed(reason)) = codec.decode(&mut buf).unwrap() else {
            panic!("expected malformed frame");
        };
        assert!(reason.contains("Content-Length"));
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(LegacyFrame::Message(_))));
    }

    #[test]
    fn test_oversized_header_is_discarded() {
        let mut codec = LegacyCodec::new();
        let mut buf = BytesMut::from(vec![b'x'; MAX_HEADER_LEN + 1].as_slice());

        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(LegacyFrame::Malformed(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_body_is_refused_and_stream_resyncs() {
        let mut codec = LegacyCodec::new();
        let mut data = String::from("Content-Length: 18446744073709551615\r\n\r\n{\"type\":");
        data.push_str(&frame(r#"{"type":"event","event":"break","body":{}}"#));
        let mut buf = BytesMut::from(data.as_str());

        let Some(LegacyFrame::Malformed(reason)) = codec.decode(&mut buf).unwrap() else {
            panic!("expected malformed frame");
        };
        assert!(reason.contains("Content-Length"));
        assert!(buf.capacity() < MAX_BODY_LEN);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(LegacyFrame::Message(LegacyMessage::Event(_)))
        ));
    }

    #[test]
    fn test_resync_waits_for_next_header() {
        let mut codec = LegacyCodec::new();
        let mut buf = BytesMut::from("Content-Length: 1e9\r\n\r\ngarbage without a hea");

        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(LegacyFrame::Malformed(_))));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.len() < CONTENT_LENGTH.len());

        buf.extend_from_slice(frame(r#"{"type":"event","event":"break","body":{}}"#).as_bytes());
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(LegacyFrame::Message(_))));
    }

    #[test]
    fn test_encode_request() {
        let mut codec = LegacyCodec::new();
        let mut buf = BytesMut::new();
        let request = LegacyMessage::Request(LegacyRequest {
            seq: 1,
            command: "version".to_string(),
            arguments: None,
        });

        codec.encode(request, &mut buf).unwrap();

        let text = std::str::from_utf8(&buf).unwrap();
        let body = r#"{"type":"request","seq":1,"command":"version"}"#;
        assert_eq!(text, frame(body));
    }
}
