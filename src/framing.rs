//! Newline-delimited record codec.
//!
//! Inbound bytes are split into lines and each line is classified as either a
//! structured [`Packet`] or a plain text line. In the default value-driven
//! mode a line is a packet when it parses as a JSON object whose `type` names
//! a known packet kind. In enveloped mode a packet line must start with
//! [`RECORD_SEPARATOR`]; everything else is plain text even if it looks like
//! JSON.

use std::{cmp, io};

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, warn};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{Packet, KNOWN_KINDS};

/// ASCII record separator, the packet envelope marker in enveloped mode.
pub const RECORD_SEPARATOR: u8 = 0x1e;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingMode {
    #[default]
    ValueDriven,
    Enveloped,
}

/// One inbound record.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Packet(Packet),
    Plain(String),
    /// An enveloped record whose body is not a complete known packet.
    Malformed { kind: String, reason: String },
}

/// One outbound record.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Line(String),
    Packet(Packet),
    /// Written as-is, without a trailing newline.
    Raw(String),
}

/// Without an envelope a line only becomes a packet when it fully parses as
/// one; anything short of that, including a known `type` with missing
/// fields, stays plain text.
pub fn classify(line: &str, mode: FramingMode) -> Record {
    match mode {
        FramingMode::ValueDriven => match parse_packet(line) {
            Some(Ok(packet)) => Record::Packet(packet),
            Some(Err((kind, reason))) => {
                debug!("Treating incomplete {kind} record as text: {reason}");
                Record::Plain(line.to_string())
            }
            None => Record::Plain(line.to_string()),
        },
        FramingMode::Enveloped => {
            let Some(body) = line.strip_prefix(char::from(RECORD_SEPARATOR)) else {
                return Record::Plain(line.to_string());
            };
            match parse_packet(body) {
                Some(Ok(packet)) => Record::Packet(packet),
                Some(Err((kind, reason))) => Record::Malformed { kind, reason },
                None => Record::Malformed {
                    kind: "enveloped".to_string(),
                    reason: "not a JSON object with a known type".to_string(),
                },
            }
        }
    }
}

/// `None` when the text is not a JSON object carrying a known `type`;
/// otherwise the packet, or its kind and why its fields did not parse.
fn parse_packet(text: &str) -> Option<Result<Packet, (String, String)>> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let kind = value.as_object()?.get("type")?.as_str()?.to_string();
    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return None;
    }
    Some(serde_json::from_value::<Packet>(value).map_err(|e| (kind, e.to_string())))
}

#[derive(Debug, Clone)]
pub struct RecordCodec {
    mode: FramingMode,
    max_length: usize,
    /// Where the newline search resumes, so partial lines are scanned once.
    next_index: usize,
    /// Set while skipping the remainder of an over-long line.
    discarding: bool,
}

impl RecordCodec {
    pub fn new(mode: FramingMode, max_length: usize) -> Self {
        RecordCodec {
            mode,
            max_length: max_length.max(1),
            next_index: 0,
            discarding: false,
        }
    }
}

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Record>, io::Error> {
        loop {
            let read_to = cmp::min(self.max_length.saturating_add(1), buf.len());
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    let line = &line[..end];
                    let line = line.strip_suffix(b"\r").unwrap_or(line);
                    if line.is_empty() {
                        continue;
                    }
                    let text = String::from_utf8_lossy(line);
                    return Ok(Some(classify(&text, self.mode)));
                }
                (false, None) if buf.len() > self.max_length => {
                    warn!("Discarding record longer than {} bytes", self.max_length);
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Record>, io::Error> {
        // A trailing partial line without its newline is never delivered.
        let record = self.decode(buf)?;
        if record.is_none() {
            buf.clear();
            self.next_index = 0;
        }
        Ok(record)
    }
}

impl Encoder<Frame> for RecordCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        match frame {
            Frame::Line(line) => {
                dst.reserve(line.len() + 1);
                dst.put_slice(line.as_bytes());
                dst.put_u8(b'\n');
            }
            Frame::Packet(packet) => {
                let json = serde_json::to_vec(&packet).map_err(io::Error::other)?;
                dst.reserve(json.len() + 2);
                if self.mode == FramingMode::Enveloped {
                    dst.put_u8(RECORD_SEPARATOR);
                }
                dst.put_slice(&json);
                dst.put_u8(b'\n');
            }
            Frame::Raw(text) => dst.put_slice(text.as_bytes()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PrivateMessage;

    fn decode_all(codec: &mut RecordCodec, buf: &mut BytesMut) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(record) = codec.decode(buf).unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn splits_lines_and_skips_empty_ones() {
        let mut codec = RecordCodec::new(FramingMode::ValueDriven, 1024);
        let mut buf = BytesMut::from("hello\n\n\r\nworld\r\npartial");
        let records = decode_all(&mut codec, &mut buf);
        assert_eq!(
            records,
            vec![Record::Plain("hello".into()), Record::Plain("world".into())]
        );
        assert_eq!(&buf[..], b"partial");

        buf.extend_from_slice(b" line\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Record::Plain("partial line".into()))
        );
    }

    #[test]
    fn value_driven_routes_known_kinds_as_packets() {
        let line = r#"{"type":"msg","to":["bob"],"text":"hi","from":"alice"}"#;
        match classify(line, FramingMode::ValueDriven) {
            Record::Packet(Packet::PrivateMessage(PrivateMessage { to, text, .. })) => {
                assert_eq!(to, vec!["bob".to_string()]);
                assert_eq!(text, "hi");
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn unknown_kinds_and_non_objects_are_plain() {
        for line in [r#"{"type":"weather"}"#, "[1,2,3]", "42", r#"{"no":"type"}"#, "/join r1"] {
            assert_eq!(
                classify(line, FramingMode::ValueDriven),
                Record::Plain(line.to_string())
            );
        }
    }

    #[test]
    fn known_kind_with_missing_fields_stays_plain_without_envelope() {
        let line = r#"{"type":"file_start"}"#;
        assert_eq!(
            classify(line, FramingMode::ValueDriven),
            Record::Plain(line.to_string())
        );

        let tagged = format!("{}{line}", char::from(RECORD_SEPARATOR));
        assert!(matches!(
            classify(&tagged, FramingMode::Enveloped),
            Record::Malformed { ref kind, .. } if kind == "file_start"
        ));
    }

    #[test]
    fn enveloped_mode_requires_the_separator() {
        let json = r#"{"type":"msg","to":["bob"],"text":"hi"}"#;
        assert_eq!(
            classify(json, FramingMode::Enveloped),
            Record::Plain(json.to_string())
        );
        let tagged = format!("{}{json}", char::from(RECORD_SEPARATOR));
        assert!(matches!(
            classify(&tagged, FramingMode::Enveloped),
            Record::Packet(Packet::PrivateMessage(_))
        ));
        let broken = format!("{}not json", char::from(RECORD_SEPARATOR));
        assert!(matches!(
            classify(&broken, FramingMode::Enveloped),
            Record::Malformed { .. }
        ));
    }

    #[test]
    fn over_long_records_are_skipped_not_fatal() {
        let mut codec = RecordCodec::new(FramingMode::ValueDriven, 8);
        let mut buf = BytesMut::from("this line is far too long\nok\n");
        assert_eq!(decode_all(&mut codec, &mut buf), vec![Record::Plain("ok".into())]);
    }

    #[test]
    fn encodes_packets_per_mode() {
        let packet = Packet::FriendRequest(crate::messages::FriendRequest { from: "a".into() });

        let mut plain = RecordCodec::new(FramingMode::ValueDriven, 64);
        let mut dst = BytesMut::new();
        plain.encode(Frame::Packet(packet.clone()), &mut dst).unwrap();
        plain.encode(Frame::Line("bye".into()), &mut dst).unwrap();
        assert_eq!(&dst[..], b"{\"type\":\"friendreq\",\"from\":\"a\"}\nbye\n");

        let mut enveloped = RecordCodec::new(FramingMode::Enveloped, 64);
        let mut dst = BytesMut::new();
        enveloped.encode(Frame::Packet(packet), &mut dst).unwrap();
        assert_eq!(dst[0], RECORD_SEPARATOR);
    }
}
