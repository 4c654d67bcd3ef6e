use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{RemotingError, Result};
use crate::identity::Lent;
use crate::object::{CallContext, RemoteObject};
use crate::proxy::{ProxyInner, ProxyKind, ProxyMeta, RemoteDelegate, RemoteProxy};
use crate::session::Session;
use crate::shape::{InterfaceShape, MemberRef};
use crate::value::{DelegateHandle, ObjectHandle, Value};
use crate::wire::{ObjectDescriptor, WireValue};

impl Session {
    /// Convert a value for sending, lending any local objects it contains.
    pub(crate) fn to_wire(&self, value: &Value) -> Result<WireValue> {
        Ok(match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Float(f) => WireValue::Float(*f),
            Value::Str(s) => WireValue::Str(s.clone()),
            Value::Bytes(b) => WireValue::Bytes(b.clone()),
            Value::List(items) => WireValue::List(self.args_to_wire(items)?),
            Value::Map(entries) => {
                let values = self.values_to_wire(entries.values())?;
                WireValue::Map(entries.keys().cloned().zip(values).collect())
            }
            Value::Object(ObjectHandle::Local(object)) => {
                WireValue::Object(self.wrap_object(object)?)
            }
            Value::Object(ObjectHandle::Remote(proxy)) => {
                WireValue::Object(ObjectDescriptor::BackReference {
                    id: proxy.inner.bound_id_in(&self.arc()?)?,
                })
            }
            Value::Delegate(DelegateHandle::Local(delegate)) => {
                let wrap = self.lent.get_or_wrap(&Lent::Delegate(Arc::clone(delegate)));
                WireValue::Object(if wrap.fresh {
                    ObjectDescriptor::WrappedDelegate {
                        id: wrap.id,
                        shape: delegate.shape().clone(),
                    }
                } else {
                    ObjectDescriptor::Reference { id: wrap.id }
                })
            }
            Value::Delegate(DelegateHandle::Remote(delegate)) => {
                WireValue::Object(ObjectDescriptor::BackReference {
                    id: delegate.inner.bound_id_in(&self.arc()?)?,
                })
            }
        })
    }

    pub(crate) fn args_to_wire(&self, args: &[Value]) -> Result<Vec<WireValue>> {
        self.values_to_wire(args)
    }

    /// Convert several values as one unit: when one fails, the descriptors
    /// already counted for the others are taken back.
    pub(crate) fn values_to_wire<'a>(
        &self,
        values: impl IntoIterator<Item = &'a Value>,
    ) -> Result<Vec<WireValue>> {
        let mut converted = Vec::new();
        for value in values {
            match self.to_wire(value) {
                Ok(wire) => converted.push(wire),
                Err(err) => {
                    self.unsend(&WireValue::List(converted));
                    return Err(err);
                }
            }
        }
        Ok(converted)
    }

    /// Take back the descriptors of a value that never reached the peer.
    pub(crate) fn unsend(&self, wire: &WireValue) {
        let mut ids = Vec::new();
        wire.collect_lent_ids(&mut ids);
        self.unsend_ids(&ids);
    }

    pub(crate) fn unsend_ids(&self, ids: &[i64]) {
        if !ids.is_empty() {
            tracing::debug!(session = self.id(), count = ids.len(), "descriptors not delivered");
            self.lent.unsend(ids);
        }
    }

    /// Convert a received value, materializing proxies for lent objects and
    /// resolving back references to our own objects.
    pub(crate) fn from_wire(&self, wire: WireValue) -> Result<Value> {
        Ok(match wire {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(f) => Value::Float(f),
            WireValue::Str(s) => Value::Str(s),
            WireValue::Bytes(b) => Value::Bytes(b),
            WireValue::List(items) => Value::List(self.args_from_wire(items)?),
            WireValue::Map(entries) => {
                let resolved: Vec<(String, Result<Value>)> = entries
                    .into_iter()
                    .map(|(k, v)| (k, self.from_wire(v)))
                    .collect();
                Value::Map(
                    resolved
                        .into_iter()
                        .map(|(k, v)| Ok((k, v?)))
                        .collect::<Result<_>>()?,
                )
            }
            WireValue::Object(descriptor) => self.resolve(descriptor)?,
        })
    }

    /// Every descriptor is materialized, and counted, before the first
    /// failure is reported.
    pub(crate) fn args_from_wire(&self, args: Vec<WireValue>) -> Result<Vec<Value>> {
        let resolved: Vec<Result<Value>> = args.into_iter().map(|arg| self.from_wire(arg)).collect();
        resolved.into_iter().collect()
    }

    fn arc(&self) -> Result<Arc<Session>> {
        self.weak_self.upgrade().ok_or(RemotingError::Disposed)
    }

    /// `Wrapped` the first time an object is sent, `Reference` afterwards.
    fn wrap_object(&self, object: &Arc<dyn RemoteObject>) -> Result<ObjectDescriptor> {
        let wrap = self.lent.get_or_wrap(&Lent::Object(Arc::clone(object)));
        if !wrap.fresh {
            return Ok(ObjectDescriptor::Reference { id: wrap.id });
        }

        let interfaces = object.interfaces();
        let recreate = match object.recreate_info() {
            Some(info) => match WireValue::from_plain(&info.data) {
                Ok(data) => Some((info.type_name, data)),
                Err(err) => {
                    // Never described to the peer, so the id must not be
                    // referenced later.
                    self.lent.forget(wrap.id);
                    return Err(err);
                }
            },
            None => None,
        };
        let cached_property_values = self.snapshot_properties(object, &interfaces);
        let (recreate_type_name, recreate_data) = match recreate {
            Some((name, data)) => (Some(name), Some(Box::new(data))),
            None => (None, None),
        };
        tracing::trace!(session = self.id(), id = wrap.id, "lending object");
        Ok(ObjectDescriptor::Wrapped {
            id: wrap.id,
            interfaces,
            recreate_type_name,
            recreate_data,
            cached_property_values,
        })
    }

    fn snapshot_properties(
        &self,
        object: &Arc<dyn RemoteObject>,
        interfaces: &[InterfaceShape],
    ) -> BTreeMap<String, WireValue> {
        let mut snapshot = BTreeMap::new();
        let Ok(session) = self.arc() else {
            return snapshot;
        };
        let ctx = CallContext::new(session);
        for iface in interfaces {
            for property in iface.properties.iter().filter(|p| p.cacheable) {
                let member = MemberRef::new(&iface.name, &property.name);
                let value = object
                    .get_property(&ctx, &member)
                    .map_err(RemotingError::Remote)
                    .and_then(|v| WireValue::from_plain(&v));
                match value {
                    Ok(value) => {
                        snapshot.insert(property.name.clone(), value);
                    }
                    Err(err) => {
                        tracing::debug!(property = %member, error = %err, "property not cached");
                    }
                }
            }
        }
        snapshot
    }

    fn resolve(&self, descriptor: ObjectDescriptor) -> Result<Value> {
        match descriptor {
            ObjectDescriptor::Wrapped {
                id,
                interfaces,
                recreate_type_name,
                recreate_data,
                cached_property_values,
            } => {
                let recreate = recreate_type_name
                    .map(|name| (name, recreate_data.map_or(WireValue::Null, |d| *d)));
                let meta = Arc::new(ProxyMeta {
                    kind: ProxyKind::Object {
                        interfaces,
                        recreate,
                    },
                    cached: cached_property_values,
                });
                let proxy = self
                    .proxies
                    .get_or_insert(id, meta, |id, meta| self.new_proxy(id, meta));
                Ok(proxy_value(proxy))
            }
            ObjectDescriptor::WrappedDelegate { id, shape } => {
                let meta = Arc::new(ProxyMeta {
                    kind: ProxyKind::Delegate { shape },
                    cached: BTreeMap::new(),
                });
                let proxy = self
                    .proxies
                    .get_or_insert(id, meta, |id, meta| self.new_proxy(id, meta));
                Ok(proxy_value(proxy))
            }
            ObjectDescriptor::Reference { id } => self
                .proxies
                .revive(id, |id, meta| self.new_proxy(id, meta))
                .map(proxy_value)
                .ok_or(RemotingError::ObjectNotFound(id)),
            ObjectDescriptor::BackReference { id } => match self.lent.get(id) {
                Some(Lent::Object(object)) => Ok(Value::Object(ObjectHandle::Local(object))),
                Some(Lent::Delegate(delegate)) => {
                    Ok(Value::Delegate(DelegateHandle::Local(delegate)))
                }
                None => {
                    self.queue_not_found(id);
                    Err(RemotingError::ObjectNotFound(id))
                }
            },
        }
    }

    fn new_proxy(&self, id: i64, meta: Arc<ProxyMeta>) -> Arc<ProxyInner> {
        ProxyInner::new(id, self.id(), meta, self.proxy_host(), self.sweep_signal())
    }
}

fn proxy_value(proxy: Arc<ProxyInner>) -> Value {
    if proxy.is_delegate() {
        Value::Delegate(DelegateHandle::Remote(RemoteDelegate::from_inner(proxy)))
    } else {
        Value::Object(ObjectHandle::Remote(RemoteProxy::from_inner(proxy)))
    }
}
