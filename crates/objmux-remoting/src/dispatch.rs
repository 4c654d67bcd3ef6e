use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ExceptionKind, RemoteException, RemotingError, Result};
use crate::identity::Lent;
use crate::object::{CallContext, LocalDelegate, RemoteObject};
use crate::session::Session;
use crate::shape::{find_interface, MemberRef, PropertyShape};
use crate::value::{DelegateHandle, ObjectHandle, Value};
use crate::wire::{Instruction, RemotingResult, WireValue};

impl Session {
    /// Execute one instruction from the peer. Failures become exception
    /// results; nothing here tears the connection down.
    pub(crate) fn dispatch(self: &Arc<Self>, instruction: Instruction) -> RemotingResult {
        let name = instruction.name();
        let target = instruction.target();
        tracing::trace!(session = self.id(), instruction = name, ?target, "executing");

        match self.execute_local(instruction) {
            Ok(result) => result,
            Err(err) => {
                let exception = to_exception(err);
                tracing::debug!(
                    session = self.id(),
                    instruction = name,
                    kind = %exception.kind,
                    error = %exception.message,
                    "instruction failed"
                );
                RemotingResult::exception(exception)
            }
        }
    }

    /// Descriptors carried by an instruction are materialized before it is
    /// validated, so a rejected call still accounts for every object the
    /// peer lent with it.
    fn execute_local(self: &Arc<Self>, instruction: Instruction) -> Result<RemotingResult> {
        let ctx = CallContext::new(Arc::clone(self));
        match instruction {
            Instruction::CreateObject { type_name, args } => {
                let args = self.args_from_wire(args);
                let Some(factory) = self.registry.factory(&type_name) else {
                    tracing::warn!(
                        session = self.id(),
                        type_name = %type_name,
                        "create for unregistered type"
                    );
                    return Err(RemoteException::type_not_registered(&type_name).into());
                };
                let mut args = args?;
                let object = factory(&ctx, &mut args)?;
                self.reply(&Value::Object(ObjectHandle::Local(object)))
            }
            Instruction::InvokeStaticMethod { name, args } => {
                let args = self.args_from_wire(args);
                let Some(method) = self.registry.static_method(&name) else {
                    tracing::warn!(
                        session = self.id(),
                        name = %name,
                        "call to unregistered static method"
                    );
                    return Err(RemoteException::static_method_not_registered(&name).into());
                };
                let mut args = args?;
                let value = method(&ctx, &mut args)?;
                self.reply(&value)
            }
            Instruction::InvokeMethod {
                target,
                member,
                args,
            } => {
                let args = self.args_from_wire(args);
                let object = self.lent_object(target)?;
                let interfaces = object.interfaces();
                let method = find_interface(&interfaces, &member)
                    .and_then(|i| i.find_method(&member.member))
                    .ok_or_else(|| RemoteException::member_not_found(&member))?;
                let mut args = args?;
                if args.len() > method.params.len() {
                    return Err(RemoteException::invalid_argument(format!(
                        "{member} takes {} arguments, got {}",
                        method.params.len(),
                        args.len()
                    ))
                    .into());
                }
                let value = object.invoke(&ctx, &member, &mut args)?;

                // Same order the caller reads them back in: the value, then
                // out parameters by position.
                let positions: Vec<usize> = method
                    .returned_positions()
                    .filter(|&pos| pos < args.len())
                    .collect();
                let returned = std::iter::once(&value).chain(positions.iter().map(|&p| &args[p]));
                let mut wire = self.values_to_wire(returned)?.into_iter();
                let value = wire.next().unwrap_or(WireValue::Null);
                let out_parameters: BTreeMap<u32, WireValue> =
                    positions.iter().map(|&p| p as u32).zip(wire).collect();
                Ok(RemotingResult {
                    value,
                    out_parameters,
                    exception: None,
                })
            }
            Instruction::GetProperty { target, member } => {
                let object = self.lent_object(target)?;
                property_shape(object.as_ref(), &member)?;
                let value = object.get_property(&ctx, &member)?;
                self.reply(&value)
            }
            Instruction::SetProperty {
                target,
                member,
                value,
            } => {
                let value = self.from_wire(value);
                let object = self.lent_object(target)?;
                if !property_shape(object.as_ref(), &member)?.writable {
                    return Err(RemoteException::invalid_argument(format!(
                        "property {member} is read-only"
                    ))
                    .into());
                }
                object.set_property(&ctx, &member, value?)?;
                Ok(RemotingResult::unit())
            }
            Instruction::AddEvent {
                target,
                member,
                handler,
            } => {
                let handler = self.event_handler(handler);
                let object = self.lent_object(target)?;
                check_event(object.as_ref(), &member)?;
                object.add_event(&ctx, &member, handler?)?;
                Ok(RemotingResult::unit())
            }
            Instruction::RemoveEvent {
                target,
                member,
                handler,
            } => {
                let handler = self.event_handler(handler);
                let object = self.lent_object(target)?;
                check_event(object.as_ref(), &member)?;
                object.remove_event(&ctx, &member, &handler?)?;
                Ok(RemotingResult::unit())
            }
            Instruction::InvokeDelegate { target, args } => {
                let args = self.args_from_wire(args);
                let delegate = self.lent_delegate(target)?;
                let mut args = args?;
                let value = delegate.call(&mut args)?;
                self.reply(&value)
            }
            Instruction::Recreate { type_name, data } => {
                let Some(factory) = self.registry.recreatable(&type_name) else {
                    tracing::warn!(
                        session = self.id(),
                        type_name = %type_name,
                        "recreate for unregistered type"
                    );
                    return Err(RemoteException::type_not_registered(&type_name).into());
                };
                let object = factory(&ctx, data.into_plain()?)?;
                tracing::debug!(session = self.id(), type_name = %type_name, "object recreated");
                self.reply(&Value::Object(ObjectHandle::Local(object)))
            }
            Instruction::ObjectsCollected { objects } => {
                let released = self.lent.collect(&objects);
                tracing::debug!(
                    session = self.id(),
                    requested = objects.len(),
                    released = released.len(),
                    "peer collected proxies"
                );
                Ok(RemotingResult::value(WireValue::List(
                    released.into_iter().map(WireValue::Int).collect(),
                )))
            }
            Instruction::RemoveReferencesNotFound { ids } => {
                let stale = self.proxies.invalidate(&ids);
                for proxy in &stale {
                    proxy.mark_invalid();
                }
                tracing::debug!(
                    session = self.id(),
                    count = ids.len(),
                    live = stale.len(),
                    "peer reported unknown references"
                );
                Ok(RemotingResult::unit())
            }
        }
    }

    fn reply(&self, value: &Value) -> Result<RemotingResult> {
        Ok(RemotingResult::value(self.to_wire(value)?))
    }

    fn lent_object(&self, id: i64) -> Result<Arc<dyn RemoteObject>> {
        match self.lent.get(id) {
            Some(Lent::Object(object)) => Ok(object),
            Some(Lent::Delegate(_)) => Err(RemoteException::invalid_argument(format!(
                "object {id} is a delegate"
            ))
            .into()),
            None => {
                self.queue_not_found(id);
                Err(RemotingError::ObjectNotFound(id))
            }
        }
    }

    fn lent_delegate(&self, id: i64) -> Result<Arc<LocalDelegate>> {
        match self.lent.get(id) {
            Some(Lent::Delegate(delegate)) => Ok(delegate),
            Some(Lent::Object(_)) => Err(RemoteException::invalid_argument(format!(
                "object {id} is not a delegate"
            ))
            .into()),
            None => {
                self.queue_not_found(id);
                Err(RemotingError::ObjectNotFound(id))
            }
        }
    }

    fn event_handler(&self, handler: WireValue) -> Result<DelegateHandle> {
        match self.from_wire(handler)? {
            Value::Delegate(handle) => Ok(handle),
            other => Err(RemoteException::invalid_argument(format!(
                "event handler must be a delegate, got {}",
                other.type_name()
            ))
            .into()),
        }
    }
}

fn property_shape(object: &dyn RemoteObject, member: &MemberRef) -> Result<PropertyShape> {
    find_interface(&object.interfaces(), member)
        .and_then(|i| i.find_property(&member.member))
        .cloned()
        .ok_or_else(|| RemoteException::member_not_found(member).into())
}

fn check_event(object: &dyn RemoteObject, member: &MemberRef) -> Result<()> {
    find_interface(&object.interfaces(), member)
        .and_then(|i| i.find_event(&member.member))
        .map(|_| ())
        .ok_or_else(|| RemoteException::member_not_found(member).into())
}

/// Map a local failure to what the caller sees.
fn to_exception(err: RemotingError) -> RemoteException {
    match err {
        RemotingError::Remote(exception) => exception,
        RemotingError::ObjectNotFound(id) => RemoteException::object_not_found(id),
        RemotingError::UnknownMember(member) => RemoteException::member_not_found(member),
        RemotingError::Serialization(message) => RemoteException::invalid_argument(message),
        RemotingError::Protocol(message) => RemoteException::new(ExceptionKind::Protocol, message),
        other => RemoteException::invocation(other.to_string()),
    }
}
