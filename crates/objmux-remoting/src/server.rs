use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use objmux_channel::ChannelListener;
use objmux_transport::{Address, IpcStream};

use crate::config::EndpointConfig;
use crate::error::{RemotingError, Result};
use crate::hooks::CallInterceptor;
use crate::proxy::RemoteProxy;
use crate::registry::{Registrar, Registry};
use crate::serializer::{JsonSerializer, Serializer};
use crate::session::{Session, SessionHost, SessionOptions};
use crate::user_channel::UserChannel;
use crate::value::Value;

const ACCEPT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Bound,
    Running,
    Disposed,
}

struct ServerInner {
    address: Address,
    config: EndpointConfig,
    registry: Arc<Registry>,
    interceptors: Mutex<Vec<Arc<dyn CallInterceptor>>>,
    serializer: Mutex<Arc<dyn Serializer>>,
    state: Mutex<ServerState>,
    stop: AtomicBool,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    sessions_changed: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServerInner {
    /// Handshake an accepted stream and start serving it.
    fn admit(self: &Arc<Self>, listener: &ChannelListener, stream: IpcStream) {
        let channeller = match listener.handshake(stream) {
            Ok(channeller) => channeller,
            Err(err) => {
                tracing::warn!(address = %self.address, error = %err, "handshake failed");
                return;
            }
        };
        if self.stop.load(Ordering::Acquire) {
            channeller.dispose();
            return;
        }

        let server = Arc::downgrade(self);
        let options = SessionOptions {
            generation: 1,
            registry: Arc::clone(&self.registry),
            serializer: Arc::clone(&lock(&self.serializer)),
            interceptors: lock(&self.interceptors).iter().cloned().collect(),
            call_timeout: self.config.call_timeout,
            sweep_interval: self.config.sweep_interval,
            host: SessionHost::Server,
            on_close: Some(Box::new(move |session: u64, reason: &str| {
                if let Some(server) = server.upgrade() {
                    server.remove_session(session, reason);
                }
            })),
        };
        let session = match Session::start(channeller, options) {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(address = %self.address, error = %err, "failed to start session");
                return;
            }
        };

        let mut sessions = lock(&self.sessions);
        if session.is_disposed() || self.stop.load(Ordering::Acquire) {
            drop(sessions);
            session.dispose();
            return;
        }
        sessions.insert(session.id(), Arc::clone(&session));
        let count = sessions.len();
        drop(sessions);
        self.sessions_changed.notify_all();
        tracing::info!(
            address = %self.address,
            session = session.id(),
            sessions = count,
            "client session accepted"
        );
    }

    fn remove_session(&self, id: u64, reason: &str) {
        let removed = lock(&self.sessions).remove(&id);
        self.sessions_changed.notify_all();
        if removed.is_some() {
            tracing::debug!(session = id, reason, "server session removed");
        }
    }

    fn close_sessions(&self) -> usize {
        let drained: Vec<Arc<Session>> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        self.sessions_changed.notify_all();
        for session in &drained {
            session.dispose();
        }
        drained.len()
    }
}

fn accept_loop(server: Arc<ServerInner>, listener: Arc<ChannelListener>) {
    tracing::info!(address = %server.address, "accepting connections");
    while !server.stop.load(Ordering::Acquire) {
        match listener.try_accept_stream() {
            Ok(Some(stream)) => {
                let server = Arc::clone(&server);
                let listener = Arc::clone(&listener);
                let spawned = thread::Builder::new()
                    .name("objmux-handshake".to_string())
                    .spawn(move || server.admit(&listener, stream));
                if let Err(err) = spawned {
                    tracing::warn!(error = %err, "failed to spawn handshake thread");
                }
            }
            Ok(None) => thread::sleep(ACCEPT_POLL),
            Err(err) => {
                tracing::warn!(address = %server.address, error = %err, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    tracing::info!(address = %server.address, "stopped accepting connections");
}

/// The listening side of remoting connections.
///
/// Every accepted connection gets its own [`Session`]; objects registered
/// here can be created by any client. Dropping the server stops the
/// accept loop and closes every session.
pub struct RemotingServer {
    inner: Arc<ServerInner>,
    listener: Mutex<Option<ChannelListener>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RemotingServer {
    /// Bind the listening socket. Connections are accepted after
    /// [`RemotingServer::start`].
    pub fn bind(address: &Address, config: EndpointConfig) -> Result<Self> {
        config.validate()?;
        let listener = ChannelListener::bind(address)?
            .with_handshake_config(config.handshake_config())
            .with_channeller_config(config.channeller_config());
        let address = listener.local_address();
        tracing::debug!(%address, "server bound");

        Ok(Self {
            inner: Arc::new(ServerInner {
                address,
                config,
                registry: Arc::new(Registry::new()),
                interceptors: Mutex::new(Vec::new()),
                serializer: Mutex::new(Arc::new(JsonSerializer)),
                state: Mutex::new(ServerState::Bound),
                stop: AtomicBool::new(false),
                sessions: Mutex::new(HashMap::new()),
                sessions_changed: Condvar::new(),
            }),
            listener: Mutex::new(Some(listener)),
            accept_thread: Mutex::new(None),
        })
    }

    /// Replace the message serializer. Only before start.
    pub fn set_serializer(&self, serializer: Arc<dyn Serializer>) -> Result<()> {
        self.inner.registry.check_open()?;
        *lock(&self.inner.serializer) = serializer;
        Ok(())
    }

    /// Install a hook around calls the server makes into clients. Only
    /// before start.
    pub fn add_interceptor(&self, interceptor: Arc<dyn CallInterceptor>) -> Result<()> {
        self.inner.registry.check_open()?;
        lock(&self.inner.interceptors).push(interceptor);
        Ok(())
    }

    /// Seal registrations and start accepting connections.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                ServerState::Bound => *state = ServerState::Running,
                ServerState::Running => return Err(RemotingError::AlreadyStarted),
                ServerState::Disposed => return Err(RemotingError::Disposed),
            }
        }
        self.inner.registry.seal();

        let listener = lock(&self.listener).take().ok_or(RemotingError::Disposed)?;
        listener.set_nonblocking(true)?;
        let listener = Arc::new(listener);
        let server = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("objmux-accept".to_string())
            .spawn(move || accept_loop(server, listener))
            .map_err(RemotingError::Spawn)?;
        *lock(&self.accept_thread) = Some(handle);
        Ok(())
    }

    /// The address clients connect to. For `tcp:…:0` this carries the
    /// assigned port.
    pub fn local_address(&self) -> &Address {
        &self.inner.address
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.inner.state) == ServerState::Running
    }

    /// Handles for every connected client.
    pub fn sessions(&self) -> Vec<ServerSession> {
        let mut sessions: Vec<ServerSession> = lock(&self.inner.sessions)
            .values()
            .map(|session| ServerSession {
                session: Arc::clone(session),
            })
            .collect();
        sessions.sort_by_key(ServerSession::id);
        sessions
    }

    pub fn session_count(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    /// Block until at least `count` clients are connected. Returns false on
    /// timeout.
    pub fn wait_for_sessions(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut sessions = lock(&self.inner.sessions);
        while sessions.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sessions = self
                .inner
                .sessions_changed
                .wait_timeout(sessions, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Sever every client connection; the server keeps accepting. Returns
    /// how many sessions were closed.
    pub fn close_sessions(&self) -> usize {
        let closed = self.inner.close_sessions();
        if closed > 0 {
            tracing::info!(address = %self.inner.address, closed, "closed client sessions");
        }
        closed
    }

    /// Stop accepting and close every session. Idempotent.
    pub fn dispose(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state == ServerState::Disposed {
                return;
            }
            *state = ServerState::Disposed;
        }
        self.inner.stop.store(true, Ordering::Release);
        let handle = lock(&self.accept_thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("accept thread panicked");
            }
        }
        lock(&self.listener).take();
        let closed = self.inner.close_sessions();
        tracing::info!(address = %self.inner.address, closed, "server disposed");
    }
}

impl Registrar for RemotingServer {
    fn registry(&self) -> &Registry {
        &self.inner.registry
    }
}

impl Drop for RemotingServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for RemotingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotingServer")
            .field("address", &self.inner.address.to_string())
            .field("state", &*lock(&self.inner.state))
            .field("sessions", &self.session_count())
            .finish()
    }
}

/// Server-side handle for one connected client, used to call back into
/// objects the client hosts.
#[derive(Clone)]
pub struct ServerSession {
    session: Arc<Session>,
}

impl ServerSession {
    pub fn id(&self) -> u64 {
        self.session.id()
    }

    /// Create an instance of a type registered on the client.
    pub fn create(&self, type_name: &str, args: Vec<Value>) -> Result<RemoteProxy> {
        self.session.create(type_name, args)
    }

    /// Call a static method registered on the client.
    pub fn invoke_static(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.session.invoke_static(name, args)
    }

    pub fn create_user_channel(&self, tag: &[u8]) -> Result<UserChannel> {
        self.session.create_user_channel(tag)
    }

    /// Disconnect this client.
    pub fn close(&self) {
        self.session.dispose();
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_disposed()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
