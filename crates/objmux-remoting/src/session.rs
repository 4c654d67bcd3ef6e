use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use bytes::Bytes;
use objmux_channel::{Channel, Channeller, Disposition, Hello, RemoteChannelHandler};

use crate::client::ClientInner;
use crate::error::{ExceptionKind, RemoteException, RemotingError, Result};
use crate::hooks::{intercept, CallInfo, CallInterceptor, CallKind};
use crate::identity::{LentTable, ProxyTable, SweepSignal, Wake};
use crate::proxy::{ProxyHost, ProxyInner, RemoteProxy};
use crate::registry::Registry;
use crate::serializer::Serializer;
use crate::user_channel::{classify, user_data, ChannelPurpose, UserChannel, RPC_TAG};
use crate::value::Value;
use crate::wire::{read_message, write_message, Collected, Instruction, RemotingResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static RPC_CHANNELS: RefCell<Vec<ThreadChannelGuard>> = RefCell::new(Vec::new());
}

/// Releases a thread's rpc channel when the thread exits.
struct ThreadChannelGuard {
    session: Weak<Session>,
    thread: ThreadId,
    channel: Weak<Channel>,
}

impl ThreadChannelGuard {
    fn is_live(&self) -> bool {
        self.session.strong_count() > 0
            && self.channel.upgrade().is_some_and(|c| !c.is_disposed())
    }
}

impl Drop for ThreadChannelGuard {
    fn drop(&mut self) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        match self.session.upgrade() {
            Some(session) => session.forget_channel_of(self.thread, &channel),
            None => channel.dispose(),
        }
    }
}

/// Which endpoint a session belongs to.
pub(crate) enum SessionHost {
    Client(Weak<ClientInner>),
    Server,
}

type CloseCallback = Box<dyn FnOnce(u64, &str) + Send>;

pub(crate) struct SessionOptions {
    pub generation: u64,
    pub registry: Arc<Registry>,
    pub serializer: Arc<dyn Serializer>,
    pub interceptors: Arc<[Arc<dyn CallInterceptor>]>,
    pub call_timeout: Option<Duration>,
    pub sweep_interval: Duration,
    pub host: SessionHost,
    pub on_close: Option<CloseCallback>,
}

/// Remoting state for one connection.
///
/// A session owns the channeller, both identity maps and the per-thread
/// rpc channels. Every thread that calls through a session gets its own
/// channel, so calls from different threads never wait on each other.
/// Instructions from the peer are served on the channeller's worker
/// threads, one per channel.
pub struct Session {
    id: u64,
    generation: u64,
    channeller: Channeller,
    pub(crate) registry: Arc<Registry>,
    pub(crate) serializer: Arc<dyn Serializer>,
    interceptors: Arc<[Arc<dyn CallInterceptor>]>,
    call_timeout: Option<Duration>,
    host: SessionHost,
    pub(crate) lent: LentTable,
    pub(crate) proxies: ProxyTable,
    thread_channels: RwLock<HashMap<ThreadId, Arc<Channel>>>,
    not_found: Mutex<Vec<i64>>,
    signal: Arc<SweepSignal>,
    on_close: Mutex<Option<CloseCallback>>,
    pub(crate) weak_self: Weak<Session>,
}

struct SessionHandler {
    session: Weak<Session>,
}

impl RemoteChannelHandler for SessionHandler {
    fn channel_created(&self, channel: Arc<Channel>, data: Option<Bytes>) -> Disposition {
        let Some(session) = self.session.upgrade() else {
            return Disposition::AutoDispose;
        };
        match classify(data.as_ref()) {
            ChannelPurpose::Rpc => {
                drop(session);
                serve(&self.session, &channel);
                Disposition::AutoDispose
            }
            ChannelPurpose::User(tag) => match session.registry.user_channel_handler() {
                Some(handler) => handler(UserChannel::new(channel, tag)),
                None => {
                    tracing::warn!(
                        session = session.id,
                        channel = channel.local_id(),
                        "user channel opened but no handler registered"
                    );
                    Disposition::AutoDispose
                }
            },
            ChannelPurpose::Unknown => {
                tracing::warn!(
                    session = session.id,
                    channel = channel.local_id(),
                    "discarding channel with unrecognized creation data"
                );
                Disposition::AutoDispose
            }
        }
    }

    fn connection_lost(&self, reason: &str) {
        if let Some(session) = self.session.upgrade() {
            session.connection_lost(reason);
        }
    }
}

impl Session {
    /// Start serving `channeller`, which must be handshaken and not started.
    pub(crate) fn start(channeller: Channeller, options: SessionOptions) -> Result<Arc<Session>> {
        let SessionOptions {
            generation,
            registry,
            serializer,
            interceptors,
            call_timeout,
            sweep_interval,
            host,
            on_close,
        } = options;

        let session = Arc::new_cyclic(|weak_self| Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            generation,
            channeller: channeller.clone(),
            registry,
            serializer,
            interceptors,
            call_timeout,
            host,
            lent: LentTable::new(),
            proxies: ProxyTable::new(),
            thread_channels: RwLock::new(HashMap::new()),
            not_found: Mutex::new(Vec::new()),
            signal: Arc::new(SweepSignal::default()),
            on_close: Mutex::new(on_close),
            weak_self: weak_self.clone(),
        });

        channeller.start(Arc::new(SessionHandler {
            session: Arc::downgrade(&session),
        }))?;

        let weak = Arc::downgrade(&session);
        let signal = Arc::clone(&session.signal);
        thread::Builder::new()
            .name(format!("objmux-sweep-{}", session.id))
            .spawn(move || run_sweeper(weak, signal, sweep_interval))
            .map_err(|err| {
                channeller.dispose();
                RemotingError::Spawn(err)
            })?;

        tracing::info!(
            session = session.id,
            conn = channeller.conn_id(),
            generation,
            transport = channeller.transport_name(),
            "session started"
        );
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Connection generation of the owning client; 1 for server sessions.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn conn_id(&self) -> u64 {
        self.channeller.conn_id()
    }

    /// The peer's hello from the handshake.
    pub fn peer(&self) -> Option<&Hello> {
        self.channeller.handshake().map(|h| &h.peer)
    }

    pub fn transport_name(&self) -> &'static str {
        self.channeller.transport_name()
    }

    pub fn is_disposed(&self) -> bool {
        self.channeller.is_disposed()
    }

    pub fn closed_reason(&self) -> Option<String> {
        self.channeller.closed_reason()
    }

    /// Block until the connection closes. Returns false on timeout.
    pub fn wait_closed(&self, timeout: Option<Duration>) -> bool {
        self.channeller.wait_closed(timeout)
    }

    /// Number of objects this side has lent and the peer still holds.
    pub fn lent_count(&self) -> usize {
        self.lent.len()
    }

    /// Number of live proxies for objects the peer lent.
    pub fn proxy_count(&self) -> usize {
        self.proxies.live_count()
    }

    /// Number of rpc channels cached for calling threads.
    pub fn thread_channel_count(&self) -> usize {
        self.thread_channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Close the connection. Idempotent.
    pub fn dispose(&self) {
        self.channeller.dispose();
    }

    /// Create an instance of a type registered on the peer.
    pub fn create(&self, type_name: &str, args: Vec<Value>) -> Result<RemoteProxy> {
        let info = CallInfo {
            kind: CallKind::Create,
            target: None,
            member: type_name,
            args: &args,
        };
        let (value, ()) = intercept(&self.interceptors, &info, || {
            let instruction = Instruction::CreateObject {
                type_name: type_name.to_string(),
                args: self.args_to_wire(&args)?,
            };
            let value = self.call(&instruction)?.into_value()?;
            Ok((self.from_wire(value)?, ()))
        })?;
        value.into_proxy().ok_or_else(|| {
            RemotingError::Protocol(format!("creating '{type_name}' did not return an object"))
        })
    }

    /// Call a static method registered on the peer.
    pub fn invoke_static(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let info = CallInfo {
            kind: CallKind::Static,
            target: None,
            member: name,
            args: &args,
        };
        let (value, ()) = intercept(&self.interceptors, &info, || {
            let instruction = Instruction::InvokeStaticMethod {
                name: name.to_string(),
                args: self.args_to_wire(&args)?,
            };
            let value = self.call(&instruction)?.into_value()?;
            Ok((self.from_wire(value)?, ()))
        })?;
        Ok(value)
    }

    /// Open a raw byte channel; the peer's user-channel handler receives it
    /// with `tag`.
    pub fn create_user_channel(&self, tag: &[u8]) -> Result<UserChannel> {
        let channel = self.channeller.create_channel(Some(&user_data(tag)))?;
        tracing::debug!(
            session = self.id,
            channel = channel.local_id(),
            "user channel created"
        );
        Ok(UserChannel::new(channel, Bytes::copy_from_slice(tag)))
    }

    /// Send a raw instruction and return the peer's result unchanged.
    pub fn execute(&self, instruction: &Instruction) -> Result<RemotingResult> {
        self.call(instruction)
    }

    /// Report dropped proxies and stale references to the peer now.
    /// Returns how many collected ids the peer released.
    pub fn sweep(&self) -> Result<usize> {
        if self.is_disposed() {
            return Ok(0);
        }
        let collected = self.proxies.sweep();
        let not_found = std::mem::take(
            &mut *self.not_found.lock().unwrap_or_else(PoisonError::into_inner),
        );

        let mut count = 0;
        if !collected.is_empty() {
            tracing::debug!(
                session = self.id,
                count = collected.len(),
                "reporting collected proxies"
            );
            let released = self
                .call(&Instruction::ObjectsCollected {
                    objects: collected.clone(),
                })?
                .into_value()?
                .into_plain()?;
            let released: Vec<i64> = released
                .as_list()
                .unwrap_or_default()
                .iter()
                .filter_map(Value::as_i64)
                .collect();
            let confirmed: Vec<Collected> = collected
                .into_iter()
                .filter(|c| released.contains(&c.id))
                .collect();
            count = self.proxies.remove_released(&confirmed);
            if count < released.len() {
                tracing::debug!(
                    session = self.id,
                    released = released.len(),
                    removed = count,
                    "some released proxies came back before the confirmation"
                );
            }
        }
        if !not_found.is_empty() {
            tracing::debug!(
                session = self.id,
                count = not_found.len(),
                "reporting unknown references"
            );
            self.call(&Instruction::RemoveReferencesNotFound { ids: not_found })?
                .into_value()?;
        }
        Ok(count)
    }

    /// Drop the calling thread's cached rpc channel.
    pub fn release_thread_channel(&self) {
        let removed = self
            .thread_channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&thread::current().id());
        if let Some(channel) = removed {
            channel.dispose();
        }
    }

    pub(crate) fn interceptors(&self) -> &[Arc<dyn CallInterceptor>] {
        &self.interceptors
    }

    pub(crate) fn sweep_signal(&self) -> Arc<SweepSignal> {
        Arc::clone(&self.signal)
    }

    pub(crate) fn is_hosted_by(&self, client: &Weak<ClientInner>) -> bool {
        matches!(&self.host, SessionHost::Client(own) if own.ptr_eq(client))
    }

    pub(crate) fn proxy_host(&self) -> ProxyHost {
        match &self.host {
            SessionHost::Client(client) => ProxyHost::Client(client.clone()),
            SessionHost::Server => ProxyHost::Session(self.weak_self.clone()),
        }
    }

    pub(crate) fn adopt_proxy(&self, id: i64, proxy: &Arc<ProxyInner>) {
        self.proxies.adopt(id, proxy);
    }

    /// Remember an id the peer asked for that this side does not know.
    pub(crate) fn queue_not_found(&self, id: i64) {
        self.not_found
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
        self.signal.nudge();
    }

    fn thread_channel(&self) -> Result<Arc<Channel>> {
        let thread = thread::current().id();
        let cached = self
            .thread_channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&thread)
            .cloned();
        if let Some(channel) = cached.filter(|c| !c.is_disposed()) {
            return Ok(channel);
        }

        let channel = self.channeller.create_channel(Some(RPC_TAG))?;
        channel.set_read_timeout(self.call_timeout);
        let replaced = self
            .thread_channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(thread, Arc::clone(&channel));
        if let Some(old) = replaced {
            old.dispose();
        }
        let stale = RPC_CHANNELS.try_with(|guards| {
            let mut guards = guards.borrow_mut();
            let (live, stale): (Vec<_>, Vec<_>) =
                guards.drain(..).partition(ThreadChannelGuard::is_live);
            *guards = live;
            guards.push(ThreadChannelGuard {
                session: self.weak_self.clone(),
                thread,
                channel: Arc::downgrade(&channel),
            });
            stale
        });
        drop(stale);
        tracing::debug!(
            session = self.id,
            channel = channel.local_id(),
            "rpc channel opened for thread"
        );
        Ok(channel)
    }

    fn forget_thread_channel(&self, channel: &Arc<Channel>) {
        self.forget_channel_of(thread::current().id(), channel);
    }

    fn forget_channel_of(&self, thread: ThreadId, channel: &Arc<Channel>) {
        let mut channels = self
            .thread_channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if channels.get(&thread).is_some_and(|c| Arc::ptr_eq(c, channel)) {
            channels.remove(&thread);
        }
        drop(channels);
        channel.dispose();
    }

    /// One request/response exchange on the calling thread's channel.
    pub(crate) fn call(&self, instruction: &Instruction) -> Result<RemotingResult> {
        if self.is_disposed() {
            return Err(RemotingError::NotConnected(
                self.closed_reason()
                    .unwrap_or_else(|| "session closed".to_string()),
            ));
        }
        let sent = self
            .serializer
            .encode_instruction(instruction)
            .and_then(|request| {
                let channel = self.thread_channel()?;
                tracing::trace!(
                    session = self.id,
                    channel = channel.local_id(),
                    instruction = instruction.name(),
                    "sending instruction"
                );
                match write_message(&channel, &request) {
                    Ok(()) => Ok(channel),
                    Err(err) => {
                        self.forget_thread_channel(&channel);
                        Err(err)
                    }
                }
            });
        let channel = match sent {
            Ok(channel) => channel,
            Err(err) => {
                self.unsend_ids(&instruction.lent_ids());
                return Err(err);
            }
        };

        let response = read_message(&channel).and_then(|response| {
            response.ok_or_else(|| {
                RemotingError::Protocol(format!(
                    "channel {} closed before the result arrived",
                    channel.local_id()
                ))
            })
        });
        match response {
            Ok(response) => self.serializer.decode_result(&response),
            Err(err) => {
                // The conversation on this channel is out of step; the next
                // call opens a fresh one.
                self.forget_thread_channel(&channel);
                Err(err)
            }
        }
    }

    /// Decode, execute and answer one request. Returns false when the
    /// channel can no longer carry results.
    fn answer(self: &Arc<Self>, channel: &Channel, request: &[u8]) -> bool {
        let result = match self.serializer.decode_instruction(request) {
            Ok(instruction) => self.dispatch(instruction),
            Err(err) => {
                tracing::warn!(
                    session = self.id,
                    channel = channel.local_id(),
                    error = %err,
                    "undecodable instruction"
                );
                RemotingResult::exception(RemoteException::new(
                    ExceptionKind::Protocol,
                    err.to_string(),
                ))
            }
        };

        let mut lent = result.lent_ids();
        let encoded = match self.serializer.encode_result(&result) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(session = self.id, error = %err, "result not serializable");
                self.unsend_ids(&std::mem::take(&mut lent));
                let fallback = RemotingResult::exception(RemoteException::new(
                    ExceptionKind::Protocol,
                    format!("result not serializable: {err}"),
                ));
                match self.serializer.encode_result(&fallback) {
                    Ok(encoded) => encoded,
                    Err(_) => return false,
                }
            }
        };
        match write_message(channel, &encoded) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(session = self.id, error = %err, "failed to send result");
                self.unsend_ids(&lent);
                false
            }
        }
    }

    fn connection_lost(&self, reason: &str) {
        self.signal.stop();
        self.thread_channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let released = self.lent.clear();
        self.proxies.clear();
        tracing::info!(
            session = self.id,
            released = released.len(),
            reason,
            "session closed"
        );
        drop(released);

        let callback = self
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(self.id, reason);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.signal.stop();
        self.channeller.dispose();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("conn", &self.channeller.conn_id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Execute instructions from one rpc channel until the peer closes it. The
/// session is only held while a request is being answered, so an idle
/// channel does not keep it alive.
fn serve(session: &Weak<Session>, channel: &Channel) {
    tracing::debug!(channel = channel.local_id(), "serving rpc channel");
    loop {
        let request = match read_message(channel) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(channel = channel.local_id(), error = %err, "rpc channel ended");
                break;
            }
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        if !session.answer(channel, &request) {
            break;
        }
    }
}

fn run_sweeper(session: Weak<Session>, signal: Arc<SweepSignal>, interval: Duration) {
    while signal.wait(interval) == Wake::Sweep {
        let Some(session) = session.upgrade() else {
            break;
        };
        if let Err(err) = session.sweep() {
            if err.is_connection_fatal() || session.is_disposed() {
                break;
            }
            tracing::warn!(session = session.id, error = %err, "sweep failed");
        }
    }
    if let Some(session) = session.upgrade() {
        session.release_thread_channel();
    }
}
