//! Local stand-ins for objects and delegates lent by the peer.
//!
//! Every member access on a [`RemoteProxy`] follows the same pipeline:
//! rebind to the current connection if needed, run the `before` hooks,
//! send the instruction on the calling thread's channel and wait for the
//! result, run the `after` hooks, then either raise the remote exception or
//! copy out/ref parameters back into the caller's arguments.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::client::ClientInner;
use crate::error::{ExceptionKind, RemotingError, Result};
use crate::hooks::{intercept, CallInfo, CallKind};
use crate::identity::SweepSignal;
use crate::session::Session;
use crate::shape::{
    find_interface, resolve_member, DelegateShape, InterfaceShape, MemberKind, MemberRef,
};
use crate::value::{DelegateHandle, ObjectHandle, Value};
use crate::wire::{Instruction, RemotingResult, WireValue};

/// Who a proxy asks for the session carrying its calls.
pub(crate) enum ProxyHost {
    /// Bound for life to one session.
    Session(Weak<Session>),
    /// Follows the client's current connection, rebinding after reconnects.
    Client(Weak<ClientInner>),
}

pub(crate) enum ProxyKind {
    Object {
        interfaces: Vec<InterfaceShape>,
        /// Type name and data for the `Recreate` instruction.
        recreate: Option<(String, WireValue)>,
    },
    Delegate {
        shape: DelegateShape,
    },
}

/// What the lender told us about an object when it was first sent.
pub(crate) struct ProxyMeta {
    pub kind: ProxyKind,
    pub cached: BTreeMap<String, WireValue>,
}

impl ProxyMeta {
    fn interfaces(&self) -> &[InterfaceShape] {
        match &self.kind {
            ProxyKind::Object { interfaces, .. } => interfaces,
            ProxyKind::Delegate { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindState {
    Bound,
    /// The lender reported the id unknown.
    Invalid,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    id: i64,
    session: u64,
    state: BindState,
}

impl Binding {
    fn check(self) -> Result<i64> {
        match self.state {
            BindState::Bound => Ok(self.id),
            BindState::Invalid => Err(RemotingError::ObjectNotFound(self.id)),
        }
    }
}

/// One step of the recipe that rebuilds a proxy on a fresh connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectStep {
    /// `CreateObject` with plain arguments.
    Create { type_name: String, args: Vec<Value> },
    /// `InvokeStaticMethod` with plain arguments.
    Static { name: String, args: Vec<Value> },
    /// Call a method on the previous step's object.
    Method { member: MemberRef, args: Vec<Value> },
    /// Read a property of the previous step's object.
    Property { member: MemberRef },
}

/// Ordered steps that yield an equivalent object after a reconnect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconnectPath {
    steps: Vec<ReconnectStep>,
}

impl ReconnectPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(type_name: &str, args: Vec<Value>) -> Self {
        Self::new().then(ReconnectStep::Create {
            type_name: type_name.to_string(),
            args,
        })
    }

    pub fn then(mut self, step: ReconnectStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[ReconnectStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Result of [`RemoteProxy::reconnect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Already bound to the current connection.
    NoneNeeded,
    Reconnected,
    ReconnectionFailed(String),
    /// No reconnect path and no recreate data.
    NotReconnectable,
}

pub(crate) struct ProxyInner {
    host: ProxyHost,
    meta: Arc<ProxyMeta>,
    binding: Mutex<Binding>,
    rebind: Mutex<()>,
    reconnect_path: Mutex<Option<ReconnectPath>>,
    cache: Mutex<BTreeMap<String, Value>>,
    events: Mutex<Vec<(MemberRef, DelegateHandle)>>,
    signal: Mutex<Arc<SweepSignal>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProxyInner {
    pub(crate) fn new(
        id: i64,
        session: u64,
        meta: Arc<ProxyMeta>,
        host: ProxyHost,
        signal: Arc<SweepSignal>,
    ) -> Arc<Self> {
        let cache = cache_from(&meta);
        Arc::new(Self {
            host,
            meta,
            binding: Mutex::new(Binding {
                id,
                session,
                state: BindState::Bound,
            }),
            rebind: Mutex::new(()),
            reconnect_path: Mutex::new(None),
            cache: Mutex::new(cache),
            events: Mutex::new(Vec::new()),
            signal: Mutex::new(signal),
        })
    }

    pub(crate) fn meta(&self) -> Arc<ProxyMeta> {
        Arc::clone(&self.meta)
    }

    pub(crate) fn raw_id(&self) -> i64 {
        lock(&self.binding).id
    }

    pub(crate) fn is_delegate(&self) -> bool {
        matches!(self.meta.kind, ProxyKind::Delegate { .. })
    }

    pub(crate) fn mark_invalid(&self) {
        lock(&self.binding).state = BindState::Invalid;
    }

    fn binding(&self) -> Binding {
        *lock(&self.binding)
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        match &self.host {
            ProxyHost::Session(session) => session.upgrade().filter(|s| !s.is_disposed()),
            ProxyHost::Client(client) => client.upgrade()?.live_session(),
        }
    }

    /// The session to call through and the id the object has there.
    fn bind(self: &Arc<Self>) -> Result<(Arc<Session>, i64)> {
        match &self.host {
            ProxyHost::Session(session) => {
                let session = session.upgrade().ok_or(RemotingError::Disposed)?;
                if session.is_disposed() {
                    return Err(RemotingError::NotConnected(
                        session
                            .closed_reason()
                            .unwrap_or_else(|| "session closed".to_string()),
                    ));
                }
                let id = self.binding().check()?;
                Ok((session, id))
            }
            ProxyHost::Client(client) => {
                let client = client.upgrade().ok_or(RemotingError::Disposed)?;
                let session = client.session()?;
                let id = self.bound_id_in(&session)?;
                Ok((session, id))
            }
        }
    }

    /// Id of this proxy in `session`, rebinding when it was minted by an
    /// earlier connection of the same client.
    pub(crate) fn bound_id_in(self: &Arc<Self>, session: &Arc<Session>) -> Result<i64> {
        let binding = self.binding();
        if binding.session == session.id() {
            return binding.check();
        }
        match &self.host {
            ProxyHost::Client(client) if session.is_hosted_by(client) => self.rebind(session),
            _ => Err(RemotingError::Protocol(format!(
                "object {} belongs to another session",
                binding.id
            ))),
        }
    }

    fn rebind(self: &Arc<Self>, session: &Arc<Session>) -> Result<i64> {
        let _serial = lock(&self.rebind);
        let old = self.binding();
        if old.session == session.id() {
            return old.check();
        }

        // The temporary proxy must stay alive until this one is adopted, or
        // a sweep could report the fresh id collected.
        let rebuilt = self.rebuild(session, old.id)?;
        let new_id = rebuilt.raw_id();
        session.adopt_proxy(new_id, self);
        *lock(&self.binding) = Binding {
            id: new_id,
            session: session.id(),
            state: BindState::Bound,
        };
        *lock(&self.signal) = session.sweep_signal();
        *lock(&self.cache) = lock(&rebuilt.cache).clone();
        drop(rebuilt);

        let events = lock(&self.events).clone();
        for (member, handler) in events {
            let readd = session
                .to_wire(&Value::Delegate(handler))
                .and_then(|handler| {
                    session.call(&Instruction::AddEvent {
                        target: new_id,
                        member: member.clone(),
                        handler,
                    })
                })
                .and_then(|result| result.into_value().map(|_| ()));
            if let Err(err) = readd {
                tracing::warn!(
                    id = new_id,
                    event = %member,
                    error = %err,
                    "failed to re-add event handler"
                );
            }
        }

        tracing::debug!(
            old = old.id,
            id = new_id,
            session = session.id(),
            "proxy rebound"
        );
        Ok(new_id)
    }

    fn rebuild(&self, session: &Arc<Session>, old_id: i64) -> Result<Arc<ProxyInner>> {
        if let ProxyKind::Object {
            recreate: Some((type_name, data)),
            ..
        } = &self.meta.kind
        {
            let result = session
                .call(&Instruction::Recreate {
                    type_name: type_name.clone(),
                    data: data.clone(),
                })
                .and_then(|result| result.into_value())
                .and_then(|value| session.from_wire(value));
            return match result {
                Ok(Value::Object(ObjectHandle::Remote(proxy))) => Ok(proxy.inner),
                Ok(other) => Err(RemotingError::ReconnectionFailed(format!(
                    "recreate of '{type_name}' returned {}",
                    other.type_name()
                ))),
                Err(err) => Err(reconnect_error(err)),
            };
        }

        let path = lock(&self.reconnect_path).clone();
        match path {
            Some(path) if !path.is_empty() => replay(session, &path)
                .map(|proxy| proxy.inner)
                .map_err(reconnect_error),
            _ => Err(RemotingError::NotReconnectable(old_id)),
        }
    }

    /// Send one instruction through the call pipeline.
    fn dispatch<B>(
        self: &Arc<Self>,
        kind: CallKind,
        member: &str,
        args: &[Value],
        build: B,
    ) -> Result<(Value, BTreeMap<u32, Value>)>
    where
        B: FnOnce(i64, &Session) -> Result<Instruction>,
    {
        let (session, id) = self.bind()?;
        let info = CallInfo {
            kind,
            target: Some(id),
            member,
            args,
        };
        intercept(session.interceptors(), &info, || {
            let instruction = build(id, session.as_ref())?;
            let result = session.call(&instruction)?;
            self.absorb(&session, id, result)
        })
    }

    fn absorb(
        &self,
        session: &Session,
        id: i64,
        result: RemotingResult,
    ) -> Result<(Value, BTreeMap<u32, Value>)> {
        if let Some(exception) = result.exception {
            if exception.kind == ExceptionKind::ObjectNotFound && exception.object_id == Some(id) {
                self.mark_invalid();
                return Err(RemotingError::ObjectNotFound(id));
            }
            return Err(RemotingError::Remote(exception));
        }
        let value = session.from_wire(result.value);
        let outs: Vec<(u32, Result<Value>)> = result
            .out_parameters
            .into_iter()
            .map(|(pos, wire)| (pos, session.from_wire(wire)))
            .collect();
        let value = value?;
        let outs = outs
            .into_iter()
            .map(|(pos, value)| Ok((pos, value?)))
            .collect::<Result<_>>()?;
        Ok((value, outs))
    }

    fn resolve(&self, kind: MemberKind, name: &str) -> Result<MemberRef> {
        resolve_member(self.meta.interfaces(), kind, name)
            .ok_or_else(|| RemotingError::UnknownMember(name.to_string()))
    }

    fn is_cacheable(&self, member: &MemberRef) -> bool {
        find_interface(self.meta.interfaces(), member)
            .and_then(|i| i.find_property(&member.member))
            .is_some_and(|p| p.cacheable)
    }

    /// Give an object returned from this proxy a reconnect path derived from
    /// ours.
    fn derive_path(&self, result: &Value, step: impl FnOnce() -> ReconnectStep) {
        if !matches!(self.host, ProxyHost::Client(_)) {
            return;
        }
        let Some(child) = result.as_proxy() else {
            return;
        };
        if child.has_recreate_data() || child.reconnect_path().is_some() {
            return;
        }
        if let Some(path) = lock(&self.reconnect_path).clone() {
            child.set_reconnect_path(path.then(step()));
        }
    }
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        lock(&self.signal).nudge();
    }
}

fn cache_from(meta: &ProxyMeta) -> BTreeMap<String, Value> {
    meta.cached
        .iter()
        .filter_map(|(name, wire)| Some((name.clone(), wire.clone().into_plain().ok()?)))
        .collect()
}

fn reconnect_error(err: RemotingError) -> RemotingError {
    match err {
        RemotingError::Connection(_)
        | RemotingError::NotConnected(_)
        | RemotingError::NotReconnectable(_)
        | RemotingError::ReconnectionFailed(_)
        | RemotingError::Disposed => err,
        other => RemotingError::ReconnectionFailed(other.to_string()),
    }
}

fn replay(session: &Arc<Session>, path: &ReconnectPath) -> Result<RemoteProxy> {
    let mut current: Option<RemoteProxy> = None;
    for step in path.steps() {
        let value = match (step, &current) {
            (ReconnectStep::Create { type_name, args }, _) => {
                Value::from(session.create(type_name, args.clone())?)
            }
            (ReconnectStep::Static { name, args }, _) => {
                session.invoke_static(name, args.clone())?
            }
            (ReconnectStep::Method { member, args }, Some(proxy)) => {
                proxy.call_member(member, &mut args.clone())?
            }
            (ReconnectStep::Property { member }, Some(proxy)) => proxy.get_member(member)?,
            (_, None) => {
                return Err(RemotingError::ReconnectionFailed(
                    "reconnect path starts from a member step".to_string(),
                ))
            }
        };
        current = Some(value.into_proxy().ok_or_else(|| {
            RemotingError::ReconnectionFailed("reconnect step did not yield an object".to_string())
        })?);
    }
    current.ok_or_else(|| RemotingError::ReconnectionFailed("empty reconnect path".to_string()))
}

/// Proxy for an object lent by the peer.
///
/// Cloning is cheap; all clones share identity and binding.
#[derive(Clone)]
pub struct RemoteProxy {
    pub(crate) inner: Arc<ProxyInner>,
}

impl RemoteProxy {
    pub(crate) fn from_inner(inner: Arc<ProxyInner>) -> Self {
        Self { inner }
    }

    /// Id on the current connection, or -1 when the connection it was bound
    /// to is gone.
    pub fn id(&self) -> i64 {
        let binding = self.inner.binding();
        match self.inner.current_session() {
            Some(session) if session.id() == binding.session => binding.id,
            _ => -1,
        }
    }

    pub fn interfaces(&self) -> &[InterfaceShape] {
        self.inner.meta.interfaces()
    }

    pub fn same_as(&self, other: &RemoteProxy) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Call a method with input-only arguments.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let mut args = args;
        self.call_with_out(method, &mut args)
    }

    /// Call a method; out and ref parameters are written back into `args`.
    pub fn call_with_out(&self, method: &str, args: &mut [Value]) -> Result<Value> {
        let member = self.inner.resolve(MemberKind::Method, method)?;
        self.call_member(&member, args)
    }

    pub fn call_member(&self, member: &MemberRef, args: &mut [Value]) -> Result<Value> {
        let label = member.to_string();
        let (value, outs) =
            self.inner
                .dispatch(CallKind::Method, &label, args, |target, session| {
                    Ok(Instruction::InvokeMethod {
                        target,
                        member: member.clone(),
                        args: session.args_to_wire(args)?,
                    })
                })?;
        for (pos, out) in outs {
            if let Some(slot) = args.get_mut(pos as usize) {
                *slot = out;
            }
        }
        if args.iter().all(Value::is_plain) {
            self.inner.derive_path(&value, || ReconnectStep::Method {
                member: member.clone(),
                args: args.to_vec(),
            });
        }
        Ok(value)
    }

    /// Read a property. Cacheable properties come from the local snapshot.
    pub fn get(&self, property: &str) -> Result<Value> {
        let member = self.inner.resolve(MemberKind::Property, property)?;
        self.get_member(&member)
    }

    pub fn get_member(&self, member: &MemberRef) -> Result<Value> {
        if self.inner.is_cacheable(member) {
            if let Some(value) = lock(&self.inner.cache).get(&member.member) {
                return Ok(value.clone());
            }
        }
        let label = member.to_string();
        let (value, _) = self
            .inner
            .dispatch(CallKind::GetProperty, &label, &[], |target, _| {
                Ok(Instruction::GetProperty {
                    target,
                    member: member.clone(),
                })
            })?;
        self.inner.derive_path(&value, || ReconnectStep::Property {
            member: member.clone(),
        });
        Ok(value)
    }

    /// Write a property remotely; cacheable properties also update the
    /// local snapshot.
    pub fn set(&self, property: &str, value: Value) -> Result<()> {
        let member = self.inner.resolve(MemberKind::Property, property)?;
        self.set_member(&member, value)
    }

    pub fn set_member(&self, member: &MemberRef, value: Value) -> Result<()> {
        let label = member.to_string();
        let args = [value];
        self.inner
            .dispatch(CallKind::SetProperty, &label, &args, |target, session| {
                Ok(Instruction::SetProperty {
                    target,
                    member: member.clone(),
                    value: session.to_wire(&args[0])?,
                })
            })?;
        if self.inner.is_cacheable(member) && args[0].is_plain() {
            let [value] = args;
            lock(&self.inner.cache).insert(member.member.clone(), value);
        }
        Ok(())
    }

    /// Subscribe `handler` to an event. The subscription is replayed when
    /// the proxy rebinds after a reconnect.
    pub fn add_event(&self, event: &str, handler: DelegateHandle) -> Result<()> {
        let member = self.inner.resolve(MemberKind::Event, event)?;
        let label = member.to_string();
        let args = [Value::Delegate(handler.clone())];
        self.inner
            .dispatch(CallKind::AddEvent, &label, &args, |target, session| {
                Ok(Instruction::AddEvent {
                    target,
                    member: member.clone(),
                    handler: session.to_wire(&args[0])?,
                })
            })?;
        lock(&self.inner.events).push((member, handler));
        Ok(())
    }

    pub fn remove_event(&self, event: &str, handler: &DelegateHandle) -> Result<()> {
        let member = self.inner.resolve(MemberKind::Event, event)?;
        let label = member.to_string();
        let args = [Value::Delegate(handler.clone())];
        self.inner
            .dispatch(CallKind::RemoveEvent, &label, &args, |target, session| {
                Ok(Instruction::RemoveEvent {
                    target,
                    member: member.clone(),
                    handler: session.to_wire(&args[0])?,
                })
            })?;
        let mut events = lock(&self.inner.events);
        if let Some(pos) = events
            .iter()
            .position(|(m, h)| *m == member && h.same_as(handler))
        {
            events.remove(pos);
        }
        Ok(())
    }

    pub fn reconnect_path(&self) -> Option<ReconnectPath> {
        lock(&self.inner.reconnect_path).clone()
    }

    /// Replace the recipe used to rebuild this proxy after a reconnect.
    pub fn set_reconnect_path(&self, path: ReconnectPath) {
        *lock(&self.inner.reconnect_path) = Some(path);
    }

    pub fn has_recreate_data(&self) -> bool {
        matches!(
            self.inner.meta.kind,
            ProxyKind::Object {
                recreate: Some(_),
                ..
            }
        )
    }

    /// Whether the lender reported this object unknown.
    pub fn is_invalid(&self) -> bool {
        self.inner.binding().state == BindState::Invalid
    }

    /// Bind to the client's current connection now instead of on the next
    /// call.
    pub fn reconnect(&self) -> ReconnectOutcome {
        let ProxyHost::Client(client) = &self.inner.host else {
            return match self.inner.bind() {
                Ok(_) => ReconnectOutcome::NoneNeeded,
                Err(_) => ReconnectOutcome::NotReconnectable,
            };
        };
        let session = client
            .upgrade()
            .ok_or(RemotingError::Disposed)
            .and_then(|c| c.session());
        let session = match session {
            Ok(session) => session,
            Err(err) => return ReconnectOutcome::ReconnectionFailed(err.to_string()),
        };
        if self.inner.binding().session == session.id() {
            return ReconnectOutcome::NoneNeeded;
        }
        match self.inner.bound_id_in(&session) {
            Ok(_) => ReconnectOutcome::Reconnected,
            Err(RemotingError::NotReconnectable(_)) => ReconnectOutcome::NotReconnectable,
            Err(err) => ReconnectOutcome::ReconnectionFailed(err.to_string()),
        }
    }

    /// Session currently carrying this proxy's calls, if connected.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner.current_session()
    }
}

impl fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.interfaces().iter().map(|i| i.name.as_str()).collect();
        f.debug_struct("RemoteProxy")
            .field("id", &self.inner.raw_id())
            .field("interfaces", &names)
            .finish()
    }
}

/// Proxy for a delegate lent by the peer.
#[derive(Clone)]
pub struct RemoteDelegate {
    pub(crate) inner: Arc<ProxyInner>,
}

impl RemoteDelegate {
    pub(crate) fn from_inner(inner: Arc<ProxyInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> i64 {
        self.inner.raw_id()
    }

    pub fn shape(&self) -> Option<&DelegateShape> {
        match &self.inner.meta.kind {
            ProxyKind::Delegate { shape } => Some(shape),
            ProxyKind::Object { .. } => None,
        }
    }

    pub fn same_as(&self, other: &RemoteDelegate) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        let label = self
            .shape()
            .map_or_else(|| "delegate".to_string(), |s| s.name.clone());
        let (value, _) =
            self.inner
                .dispatch(CallKind::InvokeDelegate, &label, &args, |target, session| {
                    Ok(Instruction::InvokeDelegate {
                        target,
                        args: session.args_to_wire(&args)?,
                    })
                })?;
        Ok(value)
    }
}

impl fmt::Debug for RemoteDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDelegate")
            .field("id", &self.id())
            .field("shape", &self.shape().map(|s| s.name.as_str()))
            .finish()
    }
}

/// Generic member access, implemented by [`RemoteProxy`].
///
/// Typed facades are written against this trait so they can be driven by a
/// proxy or by a local test double.
pub trait InvocationHandler: Send + Sync {
    fn invoke(&self, member: &MemberRef, args: &mut [Value]) -> Result<Value>;

    fn get_property(&self, member: &MemberRef) -> Result<Value>;

    fn set_property(&self, member: &MemberRef, value: Value) -> Result<()>;
}

impl InvocationHandler for RemoteProxy {
    fn invoke(&self, member: &MemberRef, args: &mut [Value]) -> Result<Value> {
        self.call_member(member, args)
    }

    fn get_property(&self, member: &MemberRef) -> Result<Value> {
        self.get_member(member)
    }

    fn set_property(&self, member: &MemberRef, value: Value) -> Result<()> {
        self.set_member(member, value)
    }
}
