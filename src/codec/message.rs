//! Transport envelope and logical invoke payloads

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, SurgeError};

/// Logical envelope: correlation id, payload content type and payload bytes.
///
/// Body layout (big endian):
///
/// ```text
/// | u16 id_len | id | u16 ct_len | content_type | u32 payload_len | payload | u32 crc32 |
/// ```
///
/// The CRC covers every byte before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub id: String,
    pub content_type: String,
    pub payload: Bytes,
}

const CRC_LEN: usize = 4;

impl TransportMessage {
    pub fn new(id: impl Into<String>, content_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            content_type: content_type.into(),
            payload: payload.into(),
        }
    }

    /// New request with a fresh random 128-bit id (hex)
    pub fn request(content_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(hex::encode(rand::random::<[u8; 16]>()), content_type, payload)
    }

    /// Response correlated to this message
    pub fn reply(&self, payload: impl Into<Bytes>) -> Self {
        Self::new(self.id.clone(), self.content_type.clone(), payload)
    }

    /// Serialize the envelope body (without framing)
    pub fn write_body(&self) -> Result<BytesMut> {
        let id = self.id.as_bytes();
        let ct = self.content_type.as_bytes();
        if id.len() > u16::MAX as usize {
            return Err(SurgeError::Codec(format!("message id too long: {} bytes", id.len())));
        }
        if ct.len() > u16::MAX as usize {
            return Err(SurgeError::Codec(format!("content type too long: {} bytes", ct.len())));
        }
        if self.payload.len() > u32::MAX as usize {
            return Err(SurgeError::Codec(format!("payload too long: {} bytes", self.payload.len())));
        }

        let mut buf = BytesMut::with_capacity(2 + id.len() + 2 + ct.len() + 4 + self.payload.len() + CRC_LEN);
        buf.put_u16(id.len() as u16);
        buf.put_slice(id);
        buf.put_u16(ct.len() as u16);
        buf.put_slice(ct);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);
        Ok(buf)
    }

    /// Parse an envelope body; the whole slice must be consumed
    pub fn read_body(body: &[u8]) -> Result<Self> {
        if body.len() < CRC_LEN {
            return Err(SurgeError::Codec("envelope truncated".into()));
        }

        let (content, mut crc_bytes) = body.split_at(body.len() - CRC_LEN);
        let expected = crc_bytes.get_u32();
        let actual = crc32fast::hash(content);
        if expected != actual {
            return Err(SurgeError::Codec(format!(
                "checksum mismatch: expected {:08x}, got {:08x}",
                expected, actual
            )));
        }

        let mut cur = content;
        let id = read_string(&mut cur, "id")?;
        let content_type = read_string(&mut cur, "content type")?;

        if cur.remaining() < 4 {
            return Err(SurgeError::Codec("payload length truncated".into()));
        }
        let payload_len = cur.get_u32() as usize;
        if cur.remaining() != payload_len {
            return Err(SurgeError::Codec(format!(
                "payload length {} does not match {} remaining bytes",
                payload_len,
                cur.remaining()
            )));
        }

        Ok(Self {
            id,
            content_type,
            payload: Bytes::copy_from_slice(cur),
        })
    }
}

fn read_string(cur: &mut &[u8], field: &str) -> Result<String> {
    if cur.remaining() < 2 {
        return Err(SurgeError::Codec(format!("{} length truncated", field)));
    }
    let len = cur.get_u16() as usize;
    if cur.remaining() < len {
        return Err(SurgeError::Codec(format!("{} truncated", field)));
    }
    let data = *cur;
    let (raw, rest) = data.split_at(len);
    let value = std::str::from_utf8(raw)
        .map_err(|e| SurgeError::Codec(format!("{} is not utf-8: {}", field, e)))?
        .to_string();
    *cur = rest;
    Ok(value)
}

/// Outbound call payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteInvokeMessage {
    pub service_id: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub hash_key: Option<String>,
    #[serde(default)]
    pub attachments: HashMap<String, String>,
}

impl RemoteInvokeMessage {
    pub fn new(service_id: impl Into<String>, parameters: HashMap<String, Value>) -> Self {
        Self {
            service_id: service_id.into(),
            parameters,
            ..Default::default()
        }
    }

    pub fn with_hash_key(mut self, key: Option<String>) -> Self {
        self.hash_key = key;
        self
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }
}

/// Reply payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteInvokeResult {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub status_code: i32,
}

impl RemoteInvokeResult {
    pub fn success(value: Value) -> Self {
        Self {
            result: Some(value),
            error: None,
            status_code: 0,
        }
    }

    pub fn failure(status_code: i32, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
            status_code,
        }
    }

    /// Result value, or `Remote` when the server reported an error
    pub fn into_result(self) -> Result<Value> {
        if self.status_code != 0 || self.error.is_some() {
            return Err(SurgeError::Remote {
                code: self.status_code,
                message: self.error.unwrap_or_default(),
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_round_trip() {
        let msg = TransportMessage::request("application/json", Bytes::from_static(b"{\"a\":1}"));
        let body = msg.write_body().unwrap();
        let decoded = TransportMessage::read_body(&body).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.id.len(), 32);
        assert!(hex::decode(&decoded.id).is_ok());
    }

    #[test]
    fn test_reply_keeps_id() {
        let req = TransportMessage::request("application/json", Bytes::new());
        let resp = req.reply(Bytes::from_static(b"ok"));
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.content_type, req.content_type);
    }

    #[test]
    fn test_corrupt_and_truncated_body() {
        let msg = TransportMessage::new("id-1", "application/json", Bytes::from_static(b"payload"));
        let body = msg.write_body().unwrap();

        let mut flipped = body.to_vec();
        flipped[5] ^= 0xff;
        assert!(matches!(TransportMessage::read_body(&flipped), Err(SurgeError::Codec(_))));

        for cut in [0, 3, 8, body.len() - 1] {
            assert!(
                matches!(TransportMessage::read_body(&body[..cut]), Err(SurgeError::Codec(_))),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_invoke_result_conversion() {
        assert_eq!(RemoteInvokeResult::success(json!("hi")).into_result().unwrap(), json!("hi"));
        assert_eq!(RemoteInvokeResult::default().into_result().unwrap(), Value::Null);

        let err = RemoteInvokeResult::failure(500, "boom").into_result().unwrap_err();
        assert!(matches!(err, SurgeError::Remote { code: 500, ref message } if message == "boom"));
    }
}
