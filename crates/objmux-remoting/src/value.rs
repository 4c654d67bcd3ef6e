use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{RemotingError, Result};
use crate::object::{LocalDelegate, RemoteObject};
use crate::proxy::{RemoteDelegate, RemoteProxy};

/// A value passed to or returned from a remote member.
///
/// Plain data is copied across the connection. Objects and delegates are
/// passed by reference: the receiver gets a proxy, and a proxy sent back to
/// its lender arrives as the original object.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(ObjectHandle),
    Delegate(DelegateHandle),
}

/// An object reference: either lent by this side or proxied from the peer.
#[derive(Clone)]
pub enum ObjectHandle {
    Local(Arc<dyn RemoteObject>),
    Remote(RemoteProxy),
}

#[derive(Clone)]
pub enum DelegateHandle {
    Local(Arc<LocalDelegate>),
    Remote(RemoteDelegate),
}

impl ObjectHandle {
    /// Identity comparison.
    pub fn same_as(&self, other: &ObjectHandle) -> bool {
        match (self, other) {
            (ObjectHandle::Local(a), ObjectHandle::Local(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (ObjectHandle::Remote(a), ObjectHandle::Remote(b)) => a.same_as(b),
            _ => false,
        }
    }
}

impl DelegateHandle {
    /// Identity comparison. Delegate proxies are unique per id, so two
    /// handles for the same lent delegate compare equal.
    pub fn same_as(&self, other: &DelegateHandle) -> bool {
        match (self, other) {
            (DelegateHandle::Local(a), DelegateHandle::Local(b)) => Arc::ptr_eq(a, b),
            (DelegateHandle::Remote(a), DelegateHandle::Remote(b)) => a.same_as(b),
            _ => false,
        }
    }

    /// Invoke the delegate, locally or through the connection.
    pub fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        match self {
            DelegateHandle::Local(delegate) => {
                let mut args = args;
                delegate.call(&mut args).map_err(RemotingError::Remote)
            }
            DelegateHandle::Remote(delegate) => delegate.invoke(args),
        }
    }
}

impl Value {
    /// Wrap a local object so it can be lent to the peer.
    pub fn object<T: RemoteObject>(object: T) -> Self {
        Value::Object(ObjectHandle::Local(Arc::new(object)))
    }

    pub fn local(object: Arc<dyn RemoteObject>) -> Self {
        Value::Object(ObjectHandle::Local(object))
    }

    pub fn delegate(delegate: LocalDelegate) -> Self {
        Value::Delegate(DelegateHandle::Local(Arc::new(delegate)))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&RemoteProxy> {
        match self {
            Value::Object(ObjectHandle::Remote(proxy)) => Some(proxy),
            _ => None,
        }
    }

    pub fn into_proxy(self) -> Option<RemoteProxy> {
        match self {
            Value::Object(ObjectHandle::Remote(proxy)) => Some(proxy),
            _ => None,
        }
    }

    pub fn as_delegate(&self) -> Option<&DelegateHandle> {
        match self {
            Value::Delegate(handle) => Some(handle),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Delegate(_) => "delegate",
        }
    }

    /// Whether the value contains no objects or delegates at any depth.
    pub fn is_plain(&self) -> bool {
        match self {
            Value::Object(_) | Value::Delegate(_) => false,
            Value::List(items) => items.iter().all(Value::is_plain),
            Value::Map(entries) => entries.values().all(Value::is_plain),
            _ => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.same_as(b),
            (Value::Delegate(a), Value::Delegate(b)) => a.same_as(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Map(entries) => f.debug_map().entries(entries).finish(),
            Value::Object(ObjectHandle::Local(_)) => f.write_str("Object(local)"),
            Value::Object(ObjectHandle::Remote(proxy)) => {
                write!(f, "Object(remote {})", proxy.id())
            }
            Value::Delegate(DelegateHandle::Local(d)) => {
                write!(f, "Delegate(local {})", d.shape().name)
            }
            Value::Delegate(DelegateHandle::Remote(d)) => write!(f, "Delegate(remote {})", d.id()),
        }
    }
}

impl fmt::Display for Value {
    /// Plain values render as JSON-like text; references render their id.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                f.write_str("}")
            }
            other => write!(f, "{other:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<RemoteProxy> for Value {
    fn from(proxy: RemoteProxy) -> Self {
        Value::Object(ObjectHandle::Remote(proxy))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Parse a command-line style argument: JSON when it parses, else a string.
pub fn parse_plain_arg(text: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(json) => from_json(json),
        Err(_) => Value::Str(text.to_string()),
    }
}

impl Value {
    /// JSON rendering for tooling. References become `"<object N>"` markers
    /// and bytes become an array of numbers.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(x) => serde_json::Number::from_f64(*x)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::from(b.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Object(ObjectHandle::Remote(proxy)) => {
                serde_json::Value::String(format!("<object {}>", proxy.id()))
            }
            Value::Object(ObjectHandle::Local(_)) => serde_json::Value::String("<object>".into()),
            Value::Delegate(_) => serde_json::Value::String("<delegate>".into()),
        }
    }
}

fn from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::Str(s),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k, from_json(v)))
                .collect(),
        ),
    }
}
