//! # Codec Module
//!
//! Wire encoding for outbound calls, composed from two independent parts:
//!
//! - **Framing**: how one envelope is delimited in a byte stream
//!   (length-prefixed, fixed-length blocks or CRLF-terminated lines)
//! - **Payload serialization**: how a [`RemoteInvokeMessage`] or
//!   [`RemoteInvokeResult`] becomes bytes (JSON or bincode)
//!
//! The content type travels in every envelope, so the receiver picks the
//! matching serializer without negotiation.

mod framing;
mod message;
mod serializer;

pub use framing::Framing;
pub use message::{RemoteInvokeMessage, RemoteInvokeResult, TransportMessage};
pub use serializer::{BincodeSerializer, JsonSerializer, PayloadSerializer, SerializerRegistry};

use std::sync::Arc;

use bytes::Bytes;

use crate::{consts, Result, SurgeError};

/// Package parse status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageStatus {
    /// Package is complete
    Full,
    /// Package data is incomplete (need more bytes)
    Less,
    /// Package is invalid
    Error,
}

/// Encodes envelopes into frames
#[derive(Debug, Clone, Copy)]
pub struct MessageEncoder {
    framing: Framing,
}

impl MessageEncoder {
    pub fn encode(&self, msg: &TransportMessage) -> Result<Bytes> {
        let body = msg.write_body()?;
        self.framing.wrap(&body)
    }
}

/// Decodes exactly one frame into an envelope
#[derive(Debug, Clone, Copy)]
pub struct MessageDecoder {
    framing: Framing,
}

impl MessageDecoder {
    pub fn decode(&self, frame: &[u8]) -> Result<TransportMessage> {
        let body = self.framing.unwrap_frame(frame)?;
        TransportMessage::read_body(&body)
    }
}

/// Framing plus serializers, shared by the invoker and the transport
#[derive(Debug, Clone)]
pub struct TransportCodec {
    framing: Framing,
    content_type: String,
    serializers: Arc<SerializerRegistry>,
}

impl Default for TransportCodec {
    fn default() -> Self {
        Self::new(Framing::LengthPrefixed, consts::CONTENT_TYPE_JSON)
    }
}

impl TransportCodec {
    pub fn new(framing: Framing, content_type: impl Into<String>) -> Self {
        Self {
            framing,
            content_type: content_type.into(),
            serializers: Arc::new(SerializerRegistry::new()),
        }
    }

    pub fn with_serializers(mut self, serializers: Arc<SerializerRegistry>) -> Self {
        self.serializers = serializers;
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Content type used for outbound requests
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn serializers(&self) -> &SerializerRegistry {
        &self.serializers
    }

    pub fn encoder(&self) -> MessageEncoder {
        MessageEncoder { framing: self.framing }
    }

    pub fn decoder(&self) -> MessageDecoder {
        MessageDecoder { framing: self.framing }
    }

    /// Frame boundary detection for stream reassembly
    pub fn parse_package(&self, buf: &[u8]) -> (usize, PackageStatus) {
        self.framing.parse(buf)
    }

    /// Encode a request; returns the correlation id and the frame
    pub fn encode_request(&self, msg: &RemoteInvokeMessage) -> Result<(String, Bytes)> {
        let serializer = self.serializers.get(&self.content_type)?;
        let envelope = TransportMessage::request(self.content_type.clone(), serializer.encode_invoke(msg)?);
        let frame = self.encoder().encode(&envelope)?;
        Ok((envelope.id, frame))
    }

    /// Decode a response frame, checking it answers `expected_id`
    pub fn decode_response(&self, frame: &[u8], expected_id: &str) -> Result<RemoteInvokeResult> {
        let envelope = self.decoder().decode(frame)?;
        if envelope.id != expected_id {
            return Err(SurgeError::Communication(format!(
                "response id {} does not match request id {}",
                envelope.id, expected_id
            )));
        }
        let serializer = self.serializers.get(&envelope.content_type)?;
        serializer.decode_result(&envelope.payload)
    }

    /// Server side: decode a request frame
    pub fn decode_request(&self, frame: &[u8]) -> Result<(TransportMessage, RemoteInvokeMessage)> {
        let envelope = self.decoder().decode(frame)?;
        let serializer = self.serializers.get(&envelope.content_type)?;
        let msg = serializer.decode_invoke(&envelope.payload)?;
        Ok((envelope, msg))
    }

    /// Server side: encode a reply using the request's id and content type
    pub fn encode_response(&self, request: &TransportMessage, result: &RemoteInvokeResult) -> Result<Bytes> {
        let serializer = self.serializers.get(&request.content_type)?;
        let envelope = request.reply(serializer.encode_result(result)?);
        self.encoder().encode(&envelope)
    }

    /// Correlation id of a frame, if it decodes
    pub fn peek_id(&self, frame: &[u8]) -> Option<String> {
        self.decoder().decode(frame).ok().map(|m| m.id)
    }
}
