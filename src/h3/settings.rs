//! HTTP/3 control-stream framing constants and the SETTINGS frame.

use std::collections::HashMap;

use super::varint::{self, VarIntError};

pub mod stream_type {
    pub const CONTROL: u64 = 0x0;
    pub const QPACK_ENCODER: u64 = 0x2;
    pub const QPACK_DECODER: u64 = 0x3;
}

pub mod frame_type {
    pub const DATA: u64 = 0x0;
    pub const HEADERS: u64 = 0x1;
    pub const SETTINGS: u64 = 0x4;
}

pub mod setting_id {
    pub const QPACK_MAX_TABLE_CAPACITY: u64 = 0x1;
    pub const MAX_FIELD_SECTION_SIZE: u64 = 0x6;
    pub const QPACK_BLOCKED_STREAMS: u64 = 0x7;
    /// RFC 9220 extended CONNECT.
    pub const ENABLE_CONNECT_PROTOCOL: u64 = 0x8;
    /// RFC 9297 HTTP/3 DATAGRAM.
    pub const H3_DATAGRAM: u64 = 0x33;
}

/// Values this server advertises in its own SETTINGS frame, per the
/// documented external interface.
pub const QPACK_MAX_DTABLE_CAPACITY: u64 = 4096;
pub const QPACK_BLOCKED_STREAMS: u64 = 100;

#[derive(Debug, Default, Clone)]
pub struct Settings(HashMap<u64, u64>);

impl Settings {
    pub fn server_defaults() -> Self {
        let mut s = HashMap::new();
        s.insert(setting_id::QPACK_MAX_TABLE_CAPACITY, QPACK_MAX_DTABLE_CAPACITY);
        s.insert(setting_id::QPACK_BLOCKED_STREAMS, QPACK_BLOCKED_STREAMS);
        s.insert(setting_id::ENABLE_CONNECT_PROTOCOL, 1);
        s.insert(setting_id::H3_DATAGRAM, 1);
        Self(s)
    }

    pub fn get(&self, id: u64) -> Option<u64> {
        self.0.get(&id).copied()
    }

    pub fn supports_extended_connect(&self) -> bool {
        self.get(setting_id::ENABLE_CONNECT_PROTOCOL) == Some(1)
    }

    pub fn supports_h3_datagram(&self) -> bool {
        self.get(setting_id::H3_DATAGRAM) == Some(1)
    }

    /// Encode as a full SETTINGS frame (type + length + payload).
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for (&id, &value) in &self.0 {
            varint::encode(id, &mut payload);
            varint::encode(value, &mut payload);
        }

        let mut frame = Vec::new();
        varint::encode(frame_type::SETTINGS, &mut frame);
        varint::encode(payload.len() as u64, &mut frame);
        frame.extend_from_slice(&payload);
        frame
    }

    /// Parse a SETTINGS frame payload (the identifier/value pairs only, not
    /// the type/length prefix).
    pub fn decode_payload(mut buf: &[u8]) -> Result<Self, VarIntError> {
        let mut settings = HashMap::new();
        while !buf.is_empty() {
            let (id, n) = varint::decode(buf)?;
            buf = &buf[n..];
            let (value, n) = varint::decode(buf)?;
            buf = &buf[n..];
            settings.insert(id, value);
        }
        Ok(Self(settings))
    }
}
