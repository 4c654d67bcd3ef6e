//! Wire protocol: values, object descriptors, instructions and results.
//!
//! Every instruction travels on an rpc channel as a little-endian `u32`
//! length followed by the serializer's encoding; the result comes back the
//! same way on the same channel.

use std::collections::BTreeMap;

use objmux_channel::{Channel, ChannelError};
use serde::{Deserialize, Serialize};

use crate::error::{RemoteException, RemotingError, Result};
use crate::shape::{DelegateShape, InterfaceShape, MemberRef};
use crate::value::Value;

/// Upper bound on one encoded instruction or result.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Serialized form of a [`Value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Object(ObjectDescriptor),
}

/// How an object or delegate reference is transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectDescriptor {
    /// An object the receiver already knows, in the sender's id space.
    Reference { id: i64 },
    /// First transmission of a lent object.
    Wrapped {
        id: i64,
        interfaces: Vec<InterfaceShape>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recreate_type_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recreate_data: Option<Box<WireValue>>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        cached_property_values: BTreeMap<String, WireValue>,
    },
    /// First transmission of a lent delegate.
    WrappedDelegate { id: i64, shape: DelegateShape },
    /// A proxy being returned to its lender, in the receiver's id space.
    BackReference { id: i64 },
}

impl ObjectDescriptor {
    pub fn id(&self) -> i64 {
        match self {
            ObjectDescriptor::Reference { id }
            | ObjectDescriptor::Wrapped { id, .. }
            | ObjectDescriptor::WrappedDelegate { id, .. }
            | ObjectDescriptor::BackReference { id } => *id,
        }
    }

    /// Whether the id lives in the sender's lent table.
    pub fn is_lent(&self) -> bool {
        !matches!(self, ObjectDescriptor::BackReference { .. })
    }
}

/// A proxy the sender dropped, with how many descriptors for its id it had
/// received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collected {
    pub id: i64,
    pub received: u64,
}

impl WireValue {
    /// Convert plain data. Objects and delegates are rejected.
    pub fn from_plain(value: &Value) -> Result<WireValue> {
        Ok(match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Float(f) => WireValue::Float(*f),
            Value::Str(s) => WireValue::Str(s.clone()),
            Value::Bytes(b) => WireValue::Bytes(b.clone()),
            Value::List(items) => WireValue::List(
                items
                    .iter()
                    .map(WireValue::from_plain)
                    .collect::<Result<_>>()?,
            ),
            Value::Map(entries) => WireValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), WireValue::from_plain(v)?)))
                    .collect::<Result<_>>()?,
            ),
            other => {
                return Err(RemotingError::Serialization(format!(
                    "{} is not plain data",
                    other.type_name()
                )))
            }
        })
    }

    /// Inverse of [`WireValue::from_plain`].
    pub fn into_plain(self) -> Result<Value> {
        Ok(match self {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(f) => Value::Float(f),
            WireValue::Str(s) => Value::Str(s),
            WireValue::Bytes(b) => Value::Bytes(b),
            WireValue::List(items) => Value::List(
                items
                    .into_iter()
                    .map(WireValue::into_plain)
                    .collect::<Result<_>>()?,
            ),
            WireValue::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, v.into_plain()?)))
                    .collect::<Result<_>>()?,
            ),
            WireValue::Object(descriptor) => {
                return Err(RemotingError::Serialization(format!(
                    "unexpected object descriptor for id {}",
                    descriptor.id()
                )))
            }
        })
    }

    pub fn as_object(&self) -> Option<&ObjectDescriptor> {
        match self {
            WireValue::Object(descriptor) => Some(descriptor),
            _ => None,
        }
    }

    /// Append the sender-side id of every lent descriptor, in encoding order.
    pub(crate) fn collect_lent_ids(&self, ids: &mut Vec<i64>) {
        match self {
            WireValue::List(items) => items.iter().for_each(|item| item.collect_lent_ids(ids)),
            WireValue::Map(entries) => entries.values().for_each(|v| v.collect_lent_ids(ids)),
            WireValue::Object(descriptor) if descriptor.is_lent() => ids.push(descriptor.id()),
            _ => {}
        }
    }
}

fn lent_ids<'a>(values: impl IntoIterator<Item = &'a WireValue>) -> Vec<i64> {
    let mut ids = Vec::new();
    for value in values {
        value.collect_lent_ids(&mut ids);
    }
    ids
}

/// One request sent to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    CreateObject {
        type_name: String,
        #[serde(default)]
        args: Vec<WireValue>,
    },
    InvokeMethod {
        target: i64,
        member: MemberRef,
        #[serde(default)]
        args: Vec<WireValue>,
    },
    InvokeStaticMethod {
        name: String,
        #[serde(default)]
        args: Vec<WireValue>,
    },
    GetProperty {
        target: i64,
        member: MemberRef,
    },
    SetProperty {
        target: i64,
        member: MemberRef,
        value: WireValue,
    },
    AddEvent {
        target: i64,
        member: MemberRef,
        handler: WireValue,
    },
    RemoveEvent {
        target: i64,
        member: MemberRef,
        handler: WireValue,
    },
    InvokeDelegate {
        target: i64,
        #[serde(default)]
        args: Vec<WireValue>,
    },
    /// Rebuild an object from the recreate data it was lent with.
    Recreate { type_name: String, data: WireValue },
    /// The sender dropped its proxies for these ids. The result lists the
    /// ids the receiver released.
    ObjectsCollected { objects: Vec<Collected> },
    /// The sender does not know these ids; the receiver's proxies are stale.
    RemoveReferencesNotFound { ids: Vec<i64> },
}

impl Instruction {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::CreateObject { .. } => "create_object",
            Instruction::InvokeMethod { .. } => "invoke_method",
            Instruction::InvokeStaticMethod { .. } => "invoke_static_method",
            Instruction::GetProperty { .. } => "get_property",
            Instruction::SetProperty { .. } => "set_property",
            Instruction::AddEvent { .. } => "add_event",
            Instruction::RemoveEvent { .. } => "remove_event",
            Instruction::InvokeDelegate { .. } => "invoke_delegate",
            Instruction::Recreate { .. } => "recreate",
            Instruction::ObjectsCollected { .. } => "objects_collected",
            Instruction::RemoveReferencesNotFound { .. } => "remove_references_not_found",
        }
    }

    /// The lent object the instruction addresses, if any.
    pub fn target(&self) -> Option<i64> {
        match self {
            Instruction::InvokeMethod { target, .. }
            | Instruction::GetProperty { target, .. }
            | Instruction::SetProperty { target, .. }
            | Instruction::AddEvent { target, .. }
            | Instruction::RemoveEvent { target, .. }
            | Instruction::InvokeDelegate { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Ids of the objects this instruction lends.
    pub(crate) fn lent_ids(&self) -> Vec<i64> {
        match self {
            Instruction::CreateObject { args, .. }
            | Instruction::InvokeMethod { args, .. }
            | Instruction::InvokeStaticMethod { args, .. }
            | Instruction::InvokeDelegate { args, .. } => lent_ids(args),
            Instruction::SetProperty { value, .. } => lent_ids([value]),
            Instruction::AddEvent { handler, .. } | Instruction::RemoveEvent { handler, .. } => {
                lent_ids([handler])
            }
            Instruction::GetProperty { .. }
            | Instruction::Recreate { .. }
            | Instruction::ObjectsCollected { .. }
            | Instruction::RemoveReferencesNotFound { .. } => Vec::new(),
        }
    }
}

/// Answer to one [`Instruction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotingResult {
    pub value: WireValue,
    /// Out and ref parameter values keyed by argument position.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub out_parameters: BTreeMap<u32, WireValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<RemoteException>,
}

impl RemotingResult {
    pub fn value(value: WireValue) -> Self {
        Self {
            value,
            out_parameters: BTreeMap::new(),
            exception: None,
        }
    }

    pub fn unit() -> Self {
        Self::value(WireValue::Null)
    }

    pub fn exception(exception: RemoteException) -> Self {
        Self {
            value: WireValue::Null,
            out_parameters: BTreeMap::new(),
            exception: Some(exception),
        }
    }

    /// The value, or the remote exception as an error.
    pub fn into_value(self) -> Result<WireValue> {
        match self.exception {
            Some(exception) => Err(RemotingError::Remote(exception)),
            None => Ok(self.value),
        }
    }

    /// Ids of the objects this result lends.
    pub(crate) fn lent_ids(&self) -> Vec<i64> {
        lent_ids(std::iter::once(&self.value).chain(self.out_parameters.values()))
    }
}

/// Write one length-prefixed message and flush it to the connection.
pub(crate) fn write_message(channel: &Channel, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(RemotingError::Protocol(format!(
            "message of {} bytes exceeds limit of {MAX_MESSAGE_SIZE}",
            payload.len()
        )));
    }
    let len = payload.len() as u32;
    channel.write(&len.to_le_bytes())?;
    channel.write(payload)?;
    channel.flush()?;
    Ok(())
}

/// Read one length-prefixed message. `Ok(None)` means the peer closed the
/// channel between messages.
pub(crate) fn read_message(channel: &Channel) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let first = channel.read(&mut header)?;
    if first == 0 {
        return Ok(None);
    }
    if first < header.len() {
        channel.read_exact(&mut header[first..])?;
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(RemotingError::Protocol(format!(
            "message of {len} bytes exceeds limit of {MAX_MESSAGE_SIZE}"
        )));
    }
    let mut payload = vec![0u8; len];
    channel.read_exact(&mut payload).map_err(|err| match err {
        ChannelError::ChannelClosed(id) => {
            RemotingError::Protocol(format!("channel {id} closed mid-message"))
        }
        other => other.into(),
    })?;
    Ok(Some(payload))
}
