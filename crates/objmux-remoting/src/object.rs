use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::RemoteException;
use crate::session::Session;
use crate::shape::{DelegateShape, InterfaceShape, MemberRef};
use crate::value::{DelegateHandle, Value};

/// Per-instruction context handed to object code.
///
/// Gives access to the session the instruction arrived on, so a member can
/// call back into the peer that invoked it.
#[derive(Clone)]
pub struct CallContext {
    session: Arc<Session>,
}

impl CallContext {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("session", &self.session.id())
            .finish()
    }
}

/// Data a lender attaches to an object so a reconnecting peer can rebuild
/// it with the `Recreate` instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct RecreateInfo {
    pub type_name: String,
    /// Plain data only.
    pub data: Value,
}

/// An object that can be lent to the peer.
///
/// Members are addressed by `(interface, member)` pairs that must match the
/// shapes returned from [`RemoteObject::interfaces`]. Out and ref
/// parameters are written back into `args`.
pub trait RemoteObject: Send + Sync + 'static {
    fn interfaces(&self) -> Vec<InterfaceShape>;

    fn invoke(
        &self,
        ctx: &CallContext,
        member: &MemberRef,
        args: &mut [Value],
    ) -> Result<Value, RemoteException>;

    fn get_property(
        &self,
        _ctx: &CallContext,
        member: &MemberRef,
    ) -> Result<Value, RemoteException> {
        Err(RemoteException::member_not_found(member))
    }

    fn set_property(
        &self,
        _ctx: &CallContext,
        member: &MemberRef,
        _value: Value,
    ) -> Result<(), RemoteException> {
        Err(RemoteException::member_not_found(member))
    }

    fn add_event(
        &self,
        _ctx: &CallContext,
        member: &MemberRef,
        _handler: DelegateHandle,
    ) -> Result<(), RemoteException> {
        Err(RemoteException::member_not_found(member))
    }

    fn remove_event(
        &self,
        _ctx: &CallContext,
        member: &MemberRef,
        _handler: &DelegateHandle,
    ) -> Result<(), RemoteException> {
        Err(RemoteException::member_not_found(member))
    }

    fn recreate_info(&self) -> Option<RecreateInfo> {
        None
    }
}

type DelegateFn = dyn Fn(&mut [Value]) -> Result<Value, RemoteException> + Send + Sync;

/// A callable lent to the peer, typically as an event handler.
pub struct LocalDelegate {
    shape: DelegateShape,
    func: Box<DelegateFn>,
}

impl LocalDelegate {
    pub fn new<F>(shape: DelegateShape, func: F) -> Self
    where
        F: Fn(&mut [Value]) -> Result<Value, RemoteException> + Send + Sync + 'static,
    {
        Self {
            shape,
            func: Box::new(func),
        }
    }

    pub fn shape(&self) -> &DelegateShape {
        &self.shape
    }

    pub fn call(&self, args: &mut [Value]) -> Result<Value, RemoteException> {
        (self.func)(args)
    }
}

impl fmt::Debug for LocalDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDelegate")
            .field("shape", &self.shape.name)
            .finish()
    }
}

/// Handler list backing one event of a [`RemoteObject`].
#[derive(Default)]
pub struct EventHandlers {
    handlers: Mutex<Vec<DelegateHandle>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handler: DelegateHandle) {
        self.lock().push(handler);
    }

    /// Remove the first handler identical to `handler`. Returns whether one
    /// was found.
    pub fn remove(&self, handler: &DelegateHandle) -> bool {
        let mut handlers = self.lock();
        match handlers.iter().position(|h| h.same_as(handler)) {
            Some(index) => {
                handlers.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every handler with `args`. Handlers run outside the lock; a
    /// failing handler is logged and does not stop the others. Returns how
    /// many handlers succeeded.
    pub fn raise(&self, args: &[Value]) -> usize {
        let handlers = self.lock().clone();
        let mut delivered = 0;
        for handler in handlers {
            match handler.invoke(args.to_vec()) {
                Ok(_) => delivered += 1,
                Err(err) => tracing::warn!(error = %err, "event handler failed"),
            }
        }
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DelegateHandle>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
