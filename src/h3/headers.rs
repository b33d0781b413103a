//! QPACK header block encode/decode, delegated to the `qpack` crate in
//! stateless mode (no dynamic table insertions, so the encoder/decoder
//! unidirectional streams carry no instructions beyond their type byte).

use crate::error::{AppErrorCode, ConnError};

use super::varint;
use super::settings::frame_type;

fn qpack_err(e: impl std::fmt::Display) -> ConnError {
    ConnError::Application {
        code: AppErrorCode::QPACK_DECOMPRESSION_FAILED,
        reason: e.to_string(),
    }
}

/// Decode a HEADERS frame payload into an ordered list of (name, value)
/// pairs: `:method`, `:path`, and (if present) `:protocol` first, followed
/// by the regular header fields.
pub fn decode(payload: &[u8]) -> Result<Vec<(String, String)>, ConnError> {
    let qpack::Decoded { fields, .. } =
        qpack::decode_stateless(&mut std::io::Cursor::new(payload), u64::MAX).map_err(qpack_err)?;

    let (method, uri, protocol, headers) = qpack::http_headers::Header::try_from(fields)
        .map_err(qpack_err)?
        .into_request_parts()
        .map_err(qpack_err)?;

    let mut result = vec![
        (":method".to_string(), method.to_string()),
        (":path".to_string(), uri.path().to_string()),
    ];
    if let Some(protocol) = protocol {
        result.push((":protocol".to_string(), protocol));
    }
    for (name, value) in headers.iter() {
        result.push((
            name.as_str().to_string(),
            value.to_str().unwrap_or_default().to_string(),
        ));
    }

    Ok(result)
}

/// Encode a response as a complete HEADERS frame (QPACK prefix, stateless
/// encoding, plus the outer frame type/length). `extra` is at most the one
/// additional header this server's responses ever carry (`content-type` or
/// `sec-webtransport-http3-draft`).
pub fn encode_response(status: http::StatusCode, extra: Option<(&str, &str)>) -> Result<Vec<u8>, ConnError> {
    let mut header_map = http::HeaderMap::new();
    if let Some((name, value)) = extra {
        let name = http::HeaderName::from_bytes(name.as_bytes())
            .expect("response header names are static ASCII literals");
        let value =
            http::HeaderValue::from_str(value).expect("response header values are static ASCII literals");
        header_map.insert(name, value);
    }

    let header = qpack::http_headers::Header::response(status, header_map);

    let mut block = Vec::new();
    qpack::encode_stateless(&mut block, header).map_err(qpack_err)?;

    let mut frame = Vec::new();
    varint::encode(frame_type::HEADERS, &mut frame);
    varint::encode(block.len() as u64, &mut frame);
    frame.extend_from_slice(&block);
    Ok(frame)
}

/// Parse a single frame (type, length, payload) off the front of `buf`.
/// Returns `None` if `buf` doesn't yet contain a complete frame.
pub fn parse_frame(buf: &[u8]) -> Option<(u64, &[u8], usize)> {
    let (ty, n1) = varint::decode(buf).ok()?;
    let rest = &buf[n1..];
    let (len, n2) = varint::decode(rest).ok()?;
    let len = len as usize;
    let rest = &rest[n2..];
    if rest.len() < len {
        return None;
    }
    Some((ty, &rest[..len], n1 + n2 + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a HEADERS frame the way a client would for an extended-CONNECT
    /// request, carrying `:protocol` via `Header::request`'s `Extensions`
    /// slot rather than as a literal header field.
    fn encode_connect_request(protocol: &str) -> Vec<u8> {
        let mut ext = http::Extensions::new();
        ext.insert(protocol.to_string());
        let header = qpack::http_headers::Header::request(
            http::Method::CONNECT,
            http::Uri::from_static("https://localhost/wt"),
            http::HeaderMap::new(),
            ext,
        )
        .unwrap();

        let mut block = Vec::new();
        qpack::encode_stateless(&mut block, header).unwrap();

        let mut frame = Vec::new();
        varint::encode(frame_type::HEADERS, &mut frame);
        varint::encode(block.len() as u64, &mut frame);
        frame.extend_from_slice(&block);
        frame
    }

    #[test]
    fn decode_recovers_connect_protocol() {
        let frame = encode_connect_request("webtransport");
        let (_, payload, _) = parse_frame(&frame).unwrap();
        let fields = decode(payload).unwrap();

        assert!(fields.contains(&(":method".to_string(), "CONNECT".to_string())));
        assert!(fields.contains(&(":protocol".to_string(), "webtransport".to_string())));
    }

    #[test]
    fn encode_response_round_trips_through_decode() {
        let frame = encode_response(http::StatusCode::OK, Some(("content-type", "text/plain"))).unwrap();
        let (_, payload, _) = parse_frame(&frame).unwrap();

        let qpack::Decoded { fields, .. } =
            qpack::decode_stateless(&mut std::io::Cursor::new(payload), u64::MAX).unwrap();
        let (status, headers) = qpack::http_headers::Header::try_from(fields)
            .unwrap()
            .into_response_parts()
            .unwrap();

        assert_eq!(status, http::StatusCode::OK);
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
    }
}
