//! Payload serializers keyed by content type

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{consts, Result, SurgeError};
use super::{RemoteInvokeMessage, RemoteInvokeResult};

/// Converts invoke payloads to and from bytes for one content type
pub trait PayloadSerializer: Send + Sync {
    fn content_type(&self) -> &str;

    fn encode_invoke(&self, msg: &RemoteInvokeMessage) -> Result<Bytes>;

    fn decode_invoke(&self, bytes: &[u8]) -> Result<RemoteInvokeMessage>;

    fn encode_result(&self, result: &RemoteInvokeResult) -> Result<Bytes>;

    fn decode_result(&self, bytes: &[u8]) -> Result<RemoteInvokeResult>;
}

/// `application/json`
#[derive(Debug, Default, Clone)]
pub struct JsonSerializer;

impl PayloadSerializer for JsonSerializer {
    fn content_type(&self) -> &str {
        consts::CONTENT_TYPE_JSON
    }

    fn encode_invoke(&self, msg: &RemoteInvokeMessage) -> Result<Bytes> {
        serde_json::to_vec(msg).map(Bytes::from).map_err(json_error)
    }

    fn decode_invoke(&self, bytes: &[u8]) -> Result<RemoteInvokeMessage> {
        serde_json::from_slice(bytes).map_err(json_error)
    }

    fn encode_result(&self, result: &RemoteInvokeResult) -> Result<Bytes> {
        serde_json::to_vec(result).map(Bytes::from).map_err(json_error)
    }

    fn decode_result(&self, bytes: &[u8]) -> Result<RemoteInvokeResult> {
        serde_json::from_slice(bytes).map_err(json_error)
    }
}

fn json_error(e: serde_json::Error) -> SurgeError {
    SurgeError::Codec(format!("json: {}", e))
}

fn bincode_error(e: bincode::Error) -> SurgeError {
    SurgeError::Codec(format!("bincode: {}", e))
}

// bincode is not self-describing, so dynamic values travel as embedded JSON
#[derive(Serialize, Deserialize)]
struct InvokeWire {
    service_id: String,
    parameters: Vec<(String, Vec<u8>)>,
    hash_key: Option<String>,
    attachments: Vec<(String, String)>,
}

#[derive(Serialize, Deserialize)]
struct ResultWire {
    result: Option<Vec<u8>>,
    error: Option<String>,
    status_code: i32,
}

/// `application/x-bincode`
#[derive(Debug, Default, Clone)]
pub struct BincodeSerializer;

impl PayloadSerializer for BincodeSerializer {
    fn content_type(&self) -> &str {
        consts::CONTENT_TYPE_BINCODE
    }

    fn encode_invoke(&self, msg: &RemoteInvokeMessage) -> Result<Bytes> {
        let mut parameters = Vec::with_capacity(msg.parameters.len());
        for (name, value) in &msg.parameters {
            parameters.push((name.clone(), serde_json::to_vec(value).map_err(json_error)?));
        }
        let wire = InvokeWire {
            service_id: msg.service_id.clone(),
            parameters,
            hash_key: msg.hash_key.clone(),
            attachments: msg.attachments.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        bincode::serialize(&wire).map(Bytes::from).map_err(bincode_error)
    }

    fn decode_invoke(&self, bytes: &[u8]) -> Result<RemoteInvokeMessage> {
        let wire: InvokeWire = bincode::deserialize(bytes).map_err(bincode_error)?;
        let mut parameters = HashMap::with_capacity(wire.parameters.len());
        for (name, raw) in wire.parameters {
            let value: Value = serde_json::from_slice(&raw).map_err(json_error)?;
            parameters.insert(name, value);
        }
        Ok(RemoteInvokeMessage {
            service_id: wire.service_id,
            parameters,
            hash_key: wire.hash_key,
            attachments: wire.attachments.into_iter().collect(),
        })
    }

    fn encode_result(&self, result: &RemoteInvokeResult) -> Result<Bytes> {
        let wire = ResultWire {
            result: result
                .result
                .as_ref()
                .map(serde_json::to_vec)
                .transpose()
                .map_err(json_error)?,
            error: result.error.clone(),
            status_code: result.status_code,
        };
        bincode::serialize(&wire).map(Bytes::from).map_err(bincode_error)
    }

    fn decode_result(&self, bytes: &[u8]) -> Result<RemoteInvokeResult> {
        let wire: ResultWire = bincode::deserialize(bytes).map_err(bincode_error)?;
        let result = wire
            .result
            .map(|raw| serde_json::from_slice::<Value>(&raw))
            .transpose()
            .map_err(json_error)?;
        Ok(RemoteInvokeResult {
            result,
            error: wire.error,
            status_code: wire.status_code,
        })
    }
}

/// Serializers by content type, built once at startup
#[derive(Clone)]
pub struct SerializerRegistry {
    serializers: HashMap<String, Arc<dyn PayloadSerializer>>,
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializerRegistry")
            .field("content_types", &self.content_types())
            .finish()
    }
}

impl SerializerRegistry {
    /// Registry with the JSON and bincode serializers
    pub fn new() -> Self {
        Self::empty()
            .with_serializer(Arc::new(JsonSerializer))
            .with_serializer(Arc::new(BincodeSerializer))
    }

    pub fn empty() -> Self {
        Self {
            serializers: HashMap::new(),
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn PayloadSerializer>) -> Self {
        self.serializers.insert(serializer.content_type().to_string(), serializer);
        self
    }

    pub fn get(&self, content_type: &str) -> Result<Arc<dyn PayloadSerializer>> {
        self.serializers
            .get(content_type)
            .cloned()
            .ok_or_else(|| SurgeError::Codec(format!("unknown content type: {}", content_type)))
    }

    pub fn content_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.serializers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> RemoteInvokeMessage {
        let mut params = HashMap::new();
        params.insert("name".to_string(), json!("surge"));
        params.insert("nested".to_string(), json!({"ids": [1, 2, 3], "ok": true}));
        RemoteInvokeMessage::new("Echo", params)
            .with_hash_key(Some("user-7".into()))
            .with_attachment("trace", "abc")
    }

    #[test]
    fn test_serializers_round_trip() {
        let registry = SerializerRegistry::new();
        for ct in [consts::CONTENT_TYPE_JSON, consts::CONTENT_TYPE_BINCODE] {
            let serializer = registry.get(ct).unwrap();
            assert_eq!(serializer.content_type(), ct);

            let msg = sample();
            let bytes = serializer.encode_invoke(&msg).unwrap();
            assert_eq!(serializer.decode_invoke(&bytes).unwrap(), msg);

            let result = RemoteInvokeResult::success(json!({"echo": "surge"}));
            let bytes = serializer.encode_result(&result).unwrap();
            assert_eq!(serializer.decode_result(&bytes).unwrap(), result);
        }
    }

    #[test]
    fn test_garbage_is_codec_error() {
        let registry = SerializerRegistry::new();
        for ct in [consts::CONTENT_TYPE_JSON, consts::CONTENT_TYPE_BINCODE] {
            let serializer = registry.get(ct).unwrap();
            assert!(matches!(serializer.decode_result(&[0xff, 0x01]), Err(SurgeError::Codec(_))));
        }
    }

    #[test]
    fn test_unknown_content_type() {
        let registry = SerializerRegistry::new();
        assert_eq!(registry.content_types(), vec!["application/json", "application/x-bincode"]);
        assert!(matches!(registry.get("text/xml"), Err(SurgeError::Codec(_))));
        assert!(SerializerRegistry::empty().get(consts::CONTENT_TYPE_JSON).is_err());
    }
}
