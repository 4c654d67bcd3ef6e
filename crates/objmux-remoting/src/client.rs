use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use objmux_channel::{connect_with_config, ChannelError, Channeller};
use objmux_transport::{Address, TransportError};

use crate::config::EndpointConfig;
use crate::error::{RemotingError, Result};
use crate::hooks::CallInterceptor;
use crate::proxy::{ReconnectPath, ReconnectStep, RemoteProxy};
use crate::registry::{Registrar, Registry};
use crate::serializer::{JsonSerializer, Serializer};
use crate::session::{Session, SessionHost, SessionOptions};
use crate::user_channel::UserChannel;
use crate::value::Value;
use crate::wire::{Instruction, RemotingResult};

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(20);
const MAX_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Opens a handshaken, unstarted channeller to the server.
pub type Connector =
    Box<dyn Fn(&EndpointConfig) -> std::result::Result<Channeller, ChannelError> + Send + Sync>;

/// Lifecycle of a [`RemotingClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unstarted,
    /// Started, no connection made yet (reconnect-capable clients connect
    /// on first use).
    Started,
    Connected,
    /// The connection was lost or closed; the next call reconnects.
    Disconnected,
    Disposed,
}

struct Link {
    state: ClientState,
    session: Option<Arc<Session>>,
    generation: u64,
}

pub(crate) struct ClientInner {
    endpoint: String,
    connector: Connector,
    config: EndpointConfig,
    registry: Arc<Registry>,
    interceptors: Mutex<Vec<Arc<dyn CallInterceptor>>>,
    serializer: Mutex<Arc<dyn Serializer>>,
    link: Mutex<Link>,
    connect_lock: Mutex<()>,
    weak_self: Weak<ClientInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClientInner {
    /// The current session, connecting first when the client is allowed to.
    pub(crate) fn session(&self) -> Result<Arc<Session>> {
        if let Some(session) = self.live_session() {
            return Ok(session);
        }
        self.check_usable()?;

        let _connecting = lock(&self.connect_lock);
        if let Some(session) = self.live_session() {
            return Ok(session);
        }
        self.check_usable()?;
        self.connect()
    }

    pub(crate) fn live_session(&self) -> Option<Arc<Session>> {
        lock(&self.link)
            .session
            .as_ref()
            .filter(|s| !s.is_disposed())
            .cloned()
    }

    fn check_usable(&self) -> Result<()> {
        let link = lock(&self.link);
        match link.state {
            ClientState::Unstarted => Err(RemotingError::NotStarted),
            ClientState::Disposed => Err(RemotingError::Disposed),
            ClientState::Disconnected if !self.config.reconnect => Err(
                RemotingError::NotConnected("client disconnected".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Dial, handshake and start a session. Callers hold `connect_lock`.
    fn connect(&self) -> Result<Arc<Session>> {
        let channeller = self.dial()?;
        let generation = {
            let mut link = lock(&self.link);
            if link.state == ClientState::Disposed {
                drop(link);
                channeller.dispose();
                return Err(RemotingError::Disposed);
            }
            link.generation += 1;
            link.generation
        };

        let client = self.weak_self.clone();
        let options = SessionOptions {
            generation,
            registry: Arc::clone(&self.registry),
            serializer: Arc::clone(&lock(&self.serializer)),
            interceptors: lock(&self.interceptors).iter().cloned().collect(),
            call_timeout: self.config.call_timeout,
            sweep_interval: self.config.sweep_interval,
            host: SessionHost::Client(self.weak_self.clone()),
            on_close: Some(Box::new(move |session: u64, reason: &str| {
                if let Some(client) = client.upgrade() {
                    client.session_closed(session, reason);
                }
            })),
        };
        let session = Session::start(channeller, options)?;

        let mut link = lock(&self.link);
        if link.state == ClientState::Disposed || session.is_disposed() {
            let disposed = link.state == ClientState::Disposed;
            drop(link);
            let reason = session
                .closed_reason()
                .unwrap_or_else(|| "client disposed".to_string());
            session.dispose();
            return Err(if disposed {
                RemotingError::Disposed
            } else {
                RemotingError::NotConnected(reason)
            });
        }
        link.session = Some(Arc::clone(&session));
        link.state = ClientState::Connected;
        drop(link);

        tracing::info!(
            endpoint = %self.endpoint,
            session = session.id(),
            generation,
            "client connected"
        );
        Ok(session)
    }

    /// Open a channeller, retrying refused connections until the connect
    /// timeout. Handshake failures are returned at once.
    fn dial(&self) -> Result<Channeller> {
        let deadline = Instant::now() + self.config.connect_timeout;
        let mut delay = INITIAL_RETRY_DELAY;
        loop {
            match (self.connector)(&self.config) {
                Ok(channeller) => return Ok(channeller),
                Err(err) if is_retryable(&err) && Instant::now() + delay < deadline => {
                    tracing::debug!(
                        endpoint = %self.endpoint,
                        error = %err,
                        retry_in = ?delay,
                        "connect failed; retrying"
                    );
                    thread::sleep(delay);
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn session_closed(&self, session_id: u64, reason: &str) {
        let mut link = lock(&self.link);
        if link.session.as_ref().map(|s| s.id()) != Some(session_id) {
            return;
        }
        let closed = link.session.take();
        link.state = if self.config.reconnect {
            ClientState::Disconnected
        } else {
            ClientState::Disposed
        };
        let state = link.state;
        drop(link);
        drop(closed);
        tracing::info!(
            endpoint = %self.endpoint,
            session = session_id,
            ?state,
            reason,
            "client connection lost"
        );
    }

    fn take_session(&self, next: ClientState) -> Option<Arc<Session>> {
        let mut link = lock(&self.link);
        if link.state == ClientState::Disposed {
            return None;
        }
        link.state = next;
        link.session.take()
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let session = lock(&self.link).session.take();
        if let Some(session) = session {
            session.dispose();
        }
    }
}

fn is_retryable(err: &ChannelError) -> bool {
    matches!(err, ChannelError::Transport(TransportError::Connect { .. }))
}

/// The connecting side of a remoting connection.
///
/// Register types the server may create on this side, then [`start`].
/// A client configured with `reconnect` connects lazily and transparently
/// reconnects after a lost connection; proxies with a reconnect path or
/// recreate data rebind on their next call.
///
/// [`start`]: RemotingClient::start
#[derive(Clone)]
pub struct RemotingClient {
    inner: Arc<ClientInner>,
}

impl RemotingClient {
    pub fn new(address: Address, config: EndpointConfig) -> Self {
        let endpoint = address.to_string();
        Self::with_connector(endpoint, config, move |config: &EndpointConfig| {
            connect_with_config(
                &address,
                &config.handshake_config(),
                config.channeller_config(),
            )
        })
    }

    /// Build a client over a custom connector, for transports or test
    /// harnesses that produce their own channellers.
    pub fn with_connector<F>(
        endpoint: impl Into<String>,
        config: EndpointConfig,
        connector: F,
    ) -> Self
    where
        F: Fn(&EndpointConfig) -> std::result::Result<Channeller, ChannelError>
            + Send
            + Sync
            + 'static,
    {
        let inner = Arc::new_cyclic(|weak_self| ClientInner {
            endpoint: endpoint.into(),
            connector: Box::new(connector),
            config,
            registry: Arc::new(Registry::new()),
            interceptors: Mutex::new(Vec::new()),
            serializer: Mutex::new(Arc::new(JsonSerializer)),
            link: Mutex::new(Link {
                state: ClientState::Unstarted,
                session: None,
                generation: 0,
            }),
            connect_lock: Mutex::new(()),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    /// Replace the message serializer. Only before start.
    pub fn set_serializer(&self, serializer: Arc<dyn Serializer>) -> Result<()> {
        self.inner.registry.check_open()?;
        *lock(&self.inner.serializer) = serializer;
        Ok(())
    }

    /// Install a hook around every outgoing call. Only before start.
    pub fn add_interceptor(&self, interceptor: Arc<dyn CallInterceptor>) -> Result<()> {
        self.inner.registry.check_open()?;
        lock(&self.inner.interceptors).push(interceptor);
        Ok(())
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Seal registrations. Clients without `reconnect` connect here and
    /// are disposed if that fails.
    pub fn start(&self) -> Result<()> {
        {
            let mut link = lock(&self.inner.link);
            match link.state {
                ClientState::Unstarted => link.state = ClientState::Started,
                ClientState::Disposed => return Err(RemotingError::Disposed),
                _ => return Err(RemotingError::AlreadyStarted),
            }
        }
        self.inner.registry.seal();

        if !self.inner.config.reconnect {
            let connected = {
                let _connecting = lock(&self.inner.connect_lock);
                self.inner.connect()
            };
            if let Err(err) = connected {
                tracing::warn!(
                    endpoint = %self.inner.endpoint,
                    error = %err,
                    "client failed to connect"
                );
                self.dispose();
                return Err(err);
            }
        }
        tracing::debug!(
            endpoint = %self.inner.endpoint,
            reconnect = self.inner.config.reconnect,
            "client started"
        );
        Ok(())
    }

    pub fn state(&self) -> ClientState {
        lock(&self.inner.link).state
    }

    /// Number of connections made so far.
    pub fn generation(&self) -> u64 {
        lock(&self.inner.link).generation
    }

    /// The current session, connecting first if needed.
    pub fn session(&self) -> Result<Arc<Session>> {
        self.inner.session()
    }

    /// The current session without connecting.
    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.inner.live_session()
    }

    /// Create an instance of a type registered on the server. Proxies
    /// created from plain arguments remember how to recreate themselves.
    pub fn create(&self, type_name: &str, args: Vec<Value>) -> Result<RemoteProxy> {
        let session = self.inner.session()?;
        let path = args
            .iter()
            .all(Value::is_plain)
            .then(|| ReconnectPath::create(type_name, args.clone()));
        let proxy = session.create(type_name, args)?;
        if let Some(path) = path {
            if proxy.reconnect_path().is_none() {
                proxy.set_reconnect_path(path);
            }
        }
        Ok(proxy)
    }

    /// Call a static method registered on the server.
    pub fn invoke_static(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let session = self.inner.session()?;
        let step = args.iter().all(Value::is_plain).then(|| ReconnectStep::Static {
            name: name.to_string(),
            args: args.clone(),
        });
        let value = session.invoke_static(name, args)?;
        if let (Some(step), Some(proxy)) = (step, value.as_proxy()) {
            if proxy.reconnect_path().is_none() && !proxy.has_recreate_data() {
                proxy.set_reconnect_path(ReconnectPath::new().then(step));
            }
        }
        Ok(value)
    }

    pub fn create_user_channel(&self, tag: &[u8]) -> Result<UserChannel> {
        self.inner.session()?.create_user_channel(tag)
    }

    /// Send a raw instruction and return the server's result unchanged.
    pub fn execute(&self, instruction: &Instruction) -> Result<RemotingResult> {
        self.inner.session()?.execute(instruction)
    }

    /// Close the current connection. A reconnect-capable client connects
    /// again on the next call.
    pub fn disconnect(&self) {
        if let Some(session) = self.inner.take_session(ClientState::Disconnected) {
            tracing::info!(
                endpoint = %self.inner.endpoint,
                session = session.id(),
                "client disconnecting"
            );
            session.dispose();
        }
    }

    /// Close the connection for good. Idempotent.
    pub fn dispose(&self) {
        let session = self.inner.take_session(ClientState::Disposed);
        if let Some(session) = session {
            session.dispose();
        }
    }
}

impl Registrar for RemotingClient {
    fn registry(&self) -> &Registry {
        &self.inner.registry
    }
}

impl std::fmt::Debug for RemotingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotingClient")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}
