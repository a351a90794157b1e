//! Body encodings and content negotiation

use crate::error::{DecodeError, MarshalError};
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use prost_reflect::{DeserializeOptions, DynamicMessage, MessageDescriptor, SerializeOptions};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Content types
pub mod content_type {
    pub const JSON: &str = "application/json";
    pub const NDJSON: &str = "application/x-ndjson";
    pub const PROTOBUF: &str = "application/x-protobuf";
    pub const PROTOBUF_ALT: &str = "application/protobuf";
    pub const SSE: &str = "text/event-stream";
}

/// Encodes and decodes message bodies
pub trait Marshaler: Send + Sync + fmt::Debug {
    /// Content type of encoded bodies
    fn content_type(&self) -> &str;

    /// Decode a request body; an empty body yields the default message
    fn decode(&self, body: &[u8], descriptor: &MessageDescriptor) -> Result<DynamicMessage, DecodeError>;

    fn encode(&self, message: &DynamicMessage) -> Result<Bytes, MarshalError>;

    /// Encode an arbitrary value, such as an error body
    fn encode_value(&self, value: &serde_json::Value) -> Result<Bytes, MarshalError>;

    /// Encode one element of a server stream, delimiter included
    fn encode_stream_item(&self, message: &DynamicMessage) -> Result<Bytes, MarshalError> {
        let encoded = self.encode(message)?;
        let delimiter = self.stream_delimiter();
        let mut buf = BytesMut::with_capacity(encoded.len() + delimiter.len());
        buf.put(encoded);
        buf.put_slice(delimiter);
        Ok(buf.freeze())
    }

    /// Written after every stream element
    fn stream_delimiter(&self) -> &[u8] {
        b"\n"
    }

    /// Content type of server-streaming responses
    fn stream_content_type(&self) -> &str {
        self.content_type()
    }
}

/// JSON encoding options
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JsonOptions {
    /// Reject unknown fields when decoding
    pub strict: bool,
    /// Write fields holding their default value
    pub emit_unpopulated: bool,
    /// Use proto field names instead of lowerCamelCase JSON names
    pub proto_names: bool,
}

/// Canonical protobuf JSON mapping
#[derive(Debug, Clone, Default)]
pub struct JsonMarshaler {
    options: JsonOptions,
}

impl JsonMarshaler {
    pub fn new(options: JsonOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &JsonOptions {
        &self.options
    }

    fn serialize_options(&self) -> SerializeOptions {
        SerializeOptions::new()
            .skip_default_fields(!self.options.emit_unpopulated)
            .use_proto_field_name(self.options.proto_names)
    }

    /// JSON value of a message
    pub fn to_value(&self, message: &DynamicMessage) -> Result<serde_json::Value, MarshalError> {
        Ok(message.serialize_with_options(serde_json::value::Serializer, &self.serialize_options())?)
    }
}

impl Marshaler for JsonMarshaler {
    fn content_type(&self) -> &str {
        content_type::JSON
    }

    fn decode(&self, body: &[u8], descriptor: &MessageDescriptor) -> Result<DynamicMessage, DecodeError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(DynamicMessage::new(descriptor.clone()));
        }
        let options = DeserializeOptions::new().deny_unknown_fields(self.options.strict);
        let mut de = serde_json::Deserializer::from_slice(body);
        let message = DynamicMessage::deserialize_with_options(descriptor.clone(), &mut de, &options)
            .and_then(|message| de.end().map(|()| message))
            .map_err(|e| DecodeError::Body {
                content_type: content_type::JSON.to_string(),
                message: e.to_string(),
            })?;
        Ok(message)
    }

    fn encode(&self, message: &DynamicMessage) -> Result<Bytes, MarshalError> {
        let mut ser = serde_json::Serializer::new(Vec::new());
        message.serialize_with_options(&mut ser, &self.serialize_options())?;
        Ok(Bytes::from(ser.into_inner()))
    }

    fn encode_value(&self, value: &serde_json::Value) -> Result<Bytes, MarshalError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    /// `{"result": <message>}` followed by a newline
    fn encode_stream_item(&self, message: &DynamicMessage) -> Result<Bytes, MarshalError> {
        let item = serde_json::json!({ "result": self.to_value(message)? });
        let mut encoded = serde_json::to_vec(&item)?;
        encoded.push(b'\n');
        Ok(Bytes::from(encoded))
    }

    fn stream_content_type(&self) -> &str {
        content_type::NDJSON
    }
}

/// Binary protobuf encoding
///
/// Stream elements are length-delimited; arbitrary values cannot be encoded,
/// so error bodies fall back to JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoMarshaler;

impl Marshaler for ProtoMarshaler {
    fn content_type(&self) -> &str {
        content_type::PROTOBUF
    }

    fn decode(&self, body: &[u8], descriptor: &MessageDescriptor) -> Result<DynamicMessage, DecodeError> {
        DynamicMessage::decode(descriptor.clone(), body).map_err(|e| DecodeError::Body {
            content_type: content_type::PROTOBUF.to_string(),
            message: e.to_string(),
        })
    }

    fn encode(&self, message: &DynamicMessage) -> Result<Bytes, MarshalError> {
        Ok(Bytes::from(message.encode_to_vec()))
    }

    fn encode_value(&self, _value: &serde_json::Value) -> Result<Bytes, MarshalError> {
        Err(MarshalError::Unsupported("protobuf marshaler"))
    }

    fn encode_stream_item(&self, message: &DynamicMessage) -> Result<Bytes, MarshalError> {
        Ok(Bytes::from(message.encode_length_delimited_to_vec()))
    }

    fn stream_delimiter(&self) -> &[u8] {
        b""
    }
}

/// Marshalers by MIME type
#[derive(Debug, Clone)]
pub struct MarshalerRegistry {
    by_mime: HashMap<String, Arc<dyn Marshaler>>,
    default: Arc<dyn Marshaler>,
}

impl Default for MarshalerRegistry {
    fn default() -> Self {
        Self::new(JsonOptions::default())
    }
}

impl MarshalerRegistry {
    /// JSON as default, binary protobuf under its MIME types
    pub fn new(json: JsonOptions) -> Self {
        let proto: Arc<dyn Marshaler> = Arc::new(ProtoMarshaler);
        Self::with_default(Arc::new(JsonMarshaler::new(json)))
            .register(content_type::PROTOBUF, Arc::clone(&proto))
            .register(content_type::PROTOBUF_ALT, proto)
    }

    /// Registry holding a single codec
    pub fn with_default(default: Arc<dyn Marshaler>) -> Self {
        let mut by_mime = HashMap::new();
        by_mime.insert(normalize(default.content_type()), Arc::clone(&default));
        Self { by_mime, default }
    }

    pub fn register(mut self, mime: &str, marshaler: Arc<dyn Marshaler>) -> Self {
        self.by_mime.insert(normalize(mime), marshaler);
        self
    }

    pub fn default_marshaler(&self) -> &Arc<dyn Marshaler> {
        &self.default
    }

    pub fn get(&self, mime: &str) -> Option<&Arc<dyn Marshaler>> {
        self.by_mime.get(&normalize(mime))
    }

    /// Pick the inbound and outbound marshalers of a request
    ///
    /// Inbound follows `Content-Type`; outbound the first supported `Accept`
    /// entry, then the inbound marshaler.
    pub fn for_request(
        &self,
        content_type: Option<&str>,
        accept: Option<&str>,
    ) -> (Arc<dyn Marshaler>, Arc<dyn Marshaler>) {
        let inbound = content_type
            .and_then(|ct| self.get(ct))
            .unwrap_or(&self.default)
            .clone();
        let outbound = accept
            .and_then(|accept| accept.split(',').find_map(|entry| self.get(entry)))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&inbound));
        (inbound, outbound)
    }
}

/// Lowercased MIME type without parameters
fn normalize(mime: &str) -> String {
    mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}
