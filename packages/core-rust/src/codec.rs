//! Frame encoding for the byte-pipe transport.
//!
//! JSON is the reference encoding. Named `MsgPack` (`rmp_serde::to_vec_named`)
//! is accepted as a compact alternative; both decode through
//! `serde_json::Value` so structural validation is identical.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::messages::{ErrorCode, ErrorPayload, Request, RequestRejection, Response};

/// Encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Json,
    MsgPack,
}

impl WireFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::MsgPack => "msgpack",
        }
    }
}

impl std::str::FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(WireFormat::Json),
            "msgpack" => Ok(WireFormat::MsgPack),
            other => Err(format!("unknown wire format {other:?}")),
        }
    }
}

/// Frame encoding and decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid MsgPack frame: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("failed to encode MsgPack frame: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
}

/// Serializes any envelope type.
///
/// # Errors
///
/// Returns `CodecError` if the value cannot be represented in `format`.
pub fn encode<T: Serialize>(value: &T, format: WireFormat) -> Result<Vec<u8>, CodecError> {
    match format {
        WireFormat::Json => Ok(serde_json::to_vec(value)?),
        WireFormat::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
    }
}

/// Deserializes any envelope type.
///
/// # Errors
///
/// Returns `CodecError` if the bytes are not a valid encoding of `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8], format: WireFormat) -> Result<T, CodecError> {
    match format {
        WireFormat::Json => Ok(serde_json::from_slice(bytes)?),
        WireFormat::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
    }
}

/// Decodes and structurally validates an inbound request frame.
///
/// # Errors
///
/// Returns a rejection with `PARSE_ERROR` if the bytes are not a valid
/// document, or `INVALID_REQUEST` if the document is not a request.
pub fn decode_request(bytes: &[u8], format: WireFormat) -> Result<Request, RequestRejection> {
    let value: Value = decode(bytes, format).map_err(|e| RequestRejection {
        id: None,
        error: ErrorPayload::new(ErrorCode::ParseError, e.to_string()),
    })?;
    Request::from_value(value)
}

/// Decodes an outbound (host-to-client) frame.
///
/// # Errors
///
/// Returns `CodecError` if the bytes are not a valid response frame.
pub fn decode_response(bytes: &[u8], format: WireFormat) -> Result<Response, CodecError> {
    decode(bytes, format)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mutation::{Mutation, MutationId};
    use crate::resource::ResourceId;

    #[test]
    fn wire_format_names() {
        for format in [WireFormat::Json, WireFormat::MsgPack] {
            assert_eq!(format.as_str().parse::<WireFormat>(), Ok(format));
        }
        assert!("xml".parse::<WireFormat>().is_err());
    }

    #[test]
    fn request_survives_both_formats() {
        let mut req = Request::new(
            "c-9",
            ResourceId::parse(r#"AudioSource("mic")"#).unwrap(),
            "setMuted",
            vec![json!(true)],
        );
        req.params.mutation_id = Some(MutationId(4));

        for format in [WireFormat::Json, WireFormat::MsgPack] {
            let bytes = encode(&req, format).unwrap();
            assert_eq!(decode_request(&bytes, format).unwrap(), req);
        }
    }

    #[test]
    fn response_with_mutations_survives_msgpack() {
        let mut resp = Response::success("c-1", json!({"ok": true}));
        let big_id = MutationId(u64::from(u32::MAX) + 1);
        resp.mutations = Some(vec![Mutation::new(big_id, "X", json!([1]))]);
        let bytes = encode(&resp, WireFormat::MsgPack).unwrap();
        assert_eq!(decode_response(&bytes, WireFormat::MsgPack).unwrap(), resp);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let rejection = decode_request(b"{not json", WireFormat::Json).unwrap_err();
        assert_eq!(rejection.error.kind(), Some(ErrorCode::ParseError));
        assert!(rejection.id.is_none());

        let rejection = decode_request(&[0xc1], WireFormat::MsgPack).unwrap_err();
        assert_eq!(rejection.error.kind(), Some(ErrorCode::ParseError));
    }

    #[test]
    fn well_formed_non_request_is_invalid_request() {
        let rejection = decode_request(br#"{"id":"1"}"#, WireFormat::Json).unwrap_err();
        assert_eq!(rejection.error.kind(), Some(ErrorCode::InvalidRequest));
        assert_eq!(rejection.id.as_deref(), Some("1"));
    }
}
