//! The wire message model: a tagged record whose field schema is declared
//! by its [`MessageType`], plus the four bulk-transfer message types that
//! ride on top of it (§3, §6).

use std::collections::HashMap;
use std::fmt;

use super::peer_link::PeerId;

/// Scalar types a [`MessageType`] may declare for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    Bytes,
    String,
}

/// A concrete field value carried by a [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Bytes(Vec<u8>),
    String(String),
}

impl FieldValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            FieldValue::Bool(_) => ScalarType::Bool,
            FieldValue::I8(_) => ScalarType::I8,
            FieldValue::I16(_) => ScalarType::I16,
            FieldValue::I32(_) => ScalarType::I32,
            FieldValue::I64(_) => ScalarType::I64,
            FieldValue::Bytes(_) => ScalarType::Bytes,
            FieldValue::String(_) => ScalarType::String,
        }
    }
}

/// Raised when a filter's declared field type disagrees with the value it
/// is being compared against (§4.1 `setField`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("field `{field}` on message type `{message_type}` expects {expected:?}, got {actual:?}")]
pub struct IncorrectTypeError {
    pub message_type: &'static str,
    pub field: String,
    pub expected: ScalarType,
    pub actual: ScalarType,
}

/// A named, process-global, immutable schema: a map from field name to its
/// scalar type (§3).
pub struct MessageType {
    pub name: &'static str,
    fields: &'static [(&'static str, ScalarType)],
}

impl MessageType {
    pub const fn new(name: &'static str, fields: &'static [(&'static str, ScalarType)]) -> Self {
        Self { name, fields }
    }

    pub fn field_type(&self, name: &str) -> Option<ScalarType> {
        self.fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, ty)| *ty)
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageType").field(&self.name).finish()
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        // MessageType instances are process-global statics; identity is enough.
        std::ptr::eq(self, other)
    }
}

impl Eq for MessageType {}

/// A tagged record exchanged between peers (§3).
#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: &'static MessageType,
    pub fields: HashMap<String, FieldValue>,
    pub source: PeerId,
    pub boot_id: u64,
}

impl Message {
    pub fn new(msg_type: &'static MessageType, source: PeerId, boot_id: u64) -> Self {
        Self {
            msg_type,
            fields: HashMap::new(),
            source,
            boot_id,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

// --- Wire message types carried by the bulk-transfer core (§6) -------------

pub mod types {
    use super::{MessageType, ScalarType};

    pub static BULK_PACKET_SEND: MessageType = MessageType::new(
        "BulkPacketSend",
        &[
            ("uid", ScalarType::I64),
            ("blockNo", ScalarType::I32),
            ("bytes", ScalarType::Bytes),
        ],
    );

    pub static BULK_RECEIVED_ALL: MessageType =
        MessageType::new("BulkReceivedAll", &[("uid", ScalarType::I64)]);

    pub static BULK_RECEIVE_ABORTED: MessageType =
        MessageType::new("BulkReceiveAborted", &[("uid", ScalarType::I64)]);

    pub static BULK_SEND_ABORTED: MessageType =
        MessageType::new("BulkSendAborted", &[("uid", ScalarType::I64)]);
}
