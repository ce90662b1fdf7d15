//! Decoder for the `application/vnd.amazon.eventstream` binary framing used by
//! Bedrock streaming responses.
//!
//! Frame layout (big endian):
//!
//! | Field | Size |
//! |-------|------|
//! | total length | 4 |
//! | headers length | 4 |
//! | prelude CRC | 4 |
//! | headers | variable |
//! | payload | variable |
//! | message CRC | 4 |
//!
//! CRCs are not verified; TLS already protects the bytes in transit.

use crate::{Error, ErrorContext};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use tokio_util::codec::Decoder;

const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Header values rendered as strings (`:event-type`, `:message-type`, ...).
    pub headers: HashMap<String, String>,
    pub payload: Bytes,
}

impl Frame {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn message_type(&self) -> &str {
        self.header(":message-type").unwrap_or("event")
    }
}

#[derive(Debug, Clone)]
pub struct EventStreamCodec {
    max_frame_bytes: usize,
}

impl EventStreamCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::unmarshal_with_context(msg, ErrorContext::new().with_source("eventstream"))
}

impl Decoder for EventStreamCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let headers_len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if total < PRELUDE_LEN + CRC_LEN + headers_len {
            return Err(malformed(format!("frame length {} too small", total)));
        }
        if total > self.max_frame_bytes {
            return Err(malformed(format!("frame length {} exceeds limit", total)));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total).freeze();
        frame.advance(PRELUDE_LEN);
        let mut header_bytes = frame.split_to(headers_len);
        let payload_len = total - PRELUDE_LEN - headers_len - CRC_LEN;
        let payload = frame.split_to(payload_len);

        let mut headers = HashMap::new();
        while header_bytes.has_remaining() {
            let name_len = header_bytes.get_u8() as usize;
            if header_bytes.remaining() < name_len + 1 {
                return Err(malformed("truncated header name"));
            }
            let name = String::from_utf8_lossy(&header_bytes.split_to(name_len)).to_string();
            let value_type = header_bytes.get_u8();
            let value = read_header_value(value_type, &mut header_bytes)?;
            headers.insert(name, value);
        }

        Ok(Some(Frame { headers, payload }))
    }
}

fn read_header_value(value_type: u8, buf: &mut Bytes) -> Result<String, Error> {
    let need = |n: usize, buf: &Bytes| {
        if buf.remaining() < n {
            Err(malformed("truncated header value"))
        } else {
            Ok(())
        }
    };
    Ok(match value_type {
        0 => "true".to_string(),
        1 => "false".to_string(),
        2 => {
            need(1, buf)?;
            buf.get_i8().to_string()
        }
        3 => {
            need(2, buf)?;
            buf.get_i16().to_string()
        }
        4 => {
            need(4, buf)?;
            buf.get_i32().to_string()
        }
        5 | 8 => {
            need(8, buf)?;
            buf.get_i64().to_string()
        }
        6 | 7 => {
            need(2, buf)?;
            let len = buf.get_u16() as usize;
            need(len, buf)?;
            String::from_utf8_lossy(&buf.split_to(len)).to_string()
        }
        9 => {
            need(16, buf)?;
            let raw = buf.split_to(16);
            raw.iter().map(|b| format!("{:02x}", b)).collect()
        }
        other => return Err(malformed(format!("unknown header type {}", other))),
    })
}

/// Encodes a frame with string headers. CRC fields are written as zero.
pub fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut hdr = Vec::new();
    for (name, value) in headers {
        hdr.push(name.len() as u8);
        hdr.extend_from_slice(name.as_bytes());
        hdr.push(7);
        hdr.extend_from_slice(&(value.len() as u16).to_be_bytes());
        hdr.extend_from_slice(value.as_bytes());
    }
    let total = PRELUDE_LEN + hdr.len() + payload.len() + CRC_LEN;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(&(hdr.len() as u32).to_be_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&hdr);
    out.extend_from_slice(payload);
    out.extend_from_slice(&[0; 4]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_split_across_reads() {
        let bytes = encode_frame(
            &[(":event-type", "chunk"), (":message-type", "event")],
            br#"{"bytes":"e30="}"#,
        );
        let mut codec = EventStreamCodec::new(1 << 20);
        let mut buf = BytesMut::from(&bytes[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[10..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header(":event-type"), Some("chunk"));
        assert_eq!(frame.message_type(), "event");
        assert_eq!(&frame.payload[..], br#"{"bytes":"e30="}"#);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let bytes = encode_frame(&[], &[0u8; 64]);
        let mut codec = EventStreamCodec::new(32);
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
