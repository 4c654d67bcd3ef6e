use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use objmux_frame::{
    is_control, Frame, FrameError, FrameReader, FrameWriter, CONTROL, DEFAULT_MAX_PAYLOAD,
    FIRST_DYNAMIC_CHANNEL,
};
use objmux_transport::IpcStream;
use tracing::{debug, info, trace, warn};

use crate::channel::Channel;
use crate::control::ControlMessage;
use crate::error::{ChannelError, Result};
use crate::handshake::HandshakeResult;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for a [`Channeller`].
#[derive(Debug, Clone)]
pub struct ChannellerConfig {
    /// Size of each channel's send buffer; a full buffer becomes one frame.
    pub send_buffer_size: usize,
    /// How long `create_channel` waits for the peer to associate.
    pub association_timeout: Duration,
    /// Maximum payload size accepted or produced on this connection.
    pub max_payload_size: usize,
}

impl Default for ChannellerConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: 64 * 1024,
            association_timeout: Duration::from_secs(10),
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// What happens to a remotely created channel once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Dispose the channel.
    AutoDispose,
    /// Leave the channel open; the handler took ownership.
    Keep,
}

/// Receives channels the peer opens.
///
/// `channel_created` runs on a fresh thread per channel. The channeller keeps
/// the handler until the connection is torn down, so implementations that
/// point back at their owner should hold a `Weak`.
pub trait RemoteChannelHandler: Send + Sync + 'static {
    /// A peer-created channel, with the data the peer attached to it.
    fn channel_created(&self, channel: Arc<Channel>, data: Option<Bytes>) -> Disposition;

    /// The connection was torn down. Called once.
    fn connection_lost(&self, _reason: &str) {}
}

impl<F> RemoteChannelHandler for F
where
    F: Fn(Arc<Channel>, Option<Bytes>) -> Disposition + Send + Sync + 'static,
{
    fn channel_created(&self, channel: Arc<Channel>, data: Option<Bytes>) -> Disposition {
        self(channel, data)
    }
}

struct Table {
    channels: HashMap<i32, Arc<Channel>>,
    closed: Option<String>,
}

struct Queue<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> Queue<T> {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            closed: false,
        }
    }
}

struct Io {
    reader: FrameReader<IpcStream>,
    writer: FrameWriter<IpcStream>,
}

pub(crate) struct Core {
    conn: u64,
    config: ChannellerConfig,
    table: RwLock<Table>,
    next_id: AtomicI32,
    outbound: Mutex<Queue<Frame>>,
    outbound_ready: Condvar,
    control: Mutex<Queue<ControlMessage>>,
    control_ready: Condvar,
    handler: Mutex<Option<Arc<dyn RemoteChannelHandler>>>,
    io: Mutex<Option<Io>>,
    closed: Mutex<bool>,
    closed_cv: Condvar,
    stream: IpcStream,
    handshake: Option<HandshakeResult>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Core {
    fn closed_reason(&self) -> Option<String> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
            .clone()
    }

    fn disconnected(&self) -> ChannelError {
        ChannelError::Disconnected(
            self.closed_reason()
                .unwrap_or_else(|| "connection closed".to_string()),
        )
    }

    fn allocate_id(&self) -> Result<i32> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if id < FIRST_DYNAMIC_CHANNEL {
            return Err(ChannelError::IdsExhausted);
        }
        Ok(id)
    }

    fn register(&self, channel: &Arc<Channel>) -> Result<()> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(reason) = &table.closed {
            return Err(ChannelError::Disconnected(reason.clone()));
        }
        table.channels.insert(channel.local_id(), Arc::clone(channel));
        Ok(())
    }

    fn lookup(&self, id: i32) -> Option<Arc<Channel>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .channels
            .get(&id)
            .cloned()
    }

    pub(crate) fn forget(&self, id: i32) -> Option<Arc<Channel>> {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .channels
            .remove(&id)
    }

    pub(crate) fn enqueue_frame(&self, frame: Frame) -> Result<()> {
        if frame.payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.config.max_payload_size,
            }
            .into());
        }
        {
            let mut outbound = lock(&self.outbound);
            if !outbound.closed {
                outbound.items.push_back(frame);
                self.outbound_ready.notify_one();
                return Ok(());
            }
        }
        Err(self.disconnected())
    }

    pub(crate) fn enqueue_control(&self, message: &ControlMessage) -> Result<()> {
        trace!(conn = self.conn, kind = message.kind(), "sending control message");
        self.enqueue_frame(Frame::new(CONTROL, message.to_payload()?))
    }

    /// Tear the connection down. Returns false if it already was.
    fn shutdown(&self, reason: &str) -> bool {
        let channels: Vec<Arc<Channel>> = {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            if table.closed.is_some() {
                return false;
            }
            table.closed = Some(reason.to_string());
            table.channels.drain().map(|(_, channel)| channel).collect()
        };

        {
            let mut outbound = lock(&self.outbound);
            outbound.closed = true;
            outbound.items.clear();
        }
        self.outbound_ready.notify_all();
        {
            let mut control = lock(&self.control);
            control.closed = true;
            control.items.clear();
        }
        self.control_ready.notify_all();
        lock(&self.io).take();

        for channel in &channels {
            channel.connection_lost(reason);
        }

        if let Err(err) = self.stream.shutdown() {
            warn!(conn = self.conn, error = %err, "stream shutdown failed");
        }

        info!(conn = self.conn, reason, channels = channels.len(), "connection closed");

        let handler = lock(&self.handler).take();
        if let Some(handler) = handler {
            handler.connection_lost(reason);
        }

        *lock(&self.closed) = true;
        self.closed_cv.notify_all();
        true
    }

    fn route(self: &Arc<Self>, frame: Frame) {
        if is_control(frame.channel) {
            match ControlMessage::from_payload(&frame.payload) {
                Ok(message) => {
                    let mut control = lock(&self.control);
                    if !control.closed {
                        control.items.push_back(message);
                        self.control_ready.notify_one();
                    }
                }
                Err(err) => {
                    warn!(conn = self.conn, error = %err, "discarding malformed control message");
                }
            }
            return;
        }

        match self.lookup(frame.channel) {
            Some(channel) => {
                if !channel.deliver(frame.payload) {
                    debug!(
                        conn = self.conn,
                        channel = frame.channel,
                        "discarding frame for disposing channel"
                    );
                }
            }
            None => {
                debug!(
                    conn = self.conn,
                    channel = frame.channel,
                    "discarding frame for unknown channel"
                );
            }
        }
    }

    fn handle_control(self: &Arc<Self>, message: ControlMessage) {
        match message {
            ControlMessage::ChannelCreated { sender_id, data } => {
                self.accept_remote_channel(sender_id, data.map(Bytes::from));
            }
            ControlMessage::ChannelAssociated {
                sender_id,
                receiver_id,
            } => match self.lookup(receiver_id) {
                Some(channel) if channel.associate(sender_id) => {
                    debug!(
                        conn = self.conn,
                        channel = receiver_id,
                        remote = sender_id,
                        "channel associated"
                    );
                }
                _ => {
                    warn!(
                        conn = self.conn,
                        channel = receiver_id,
                        remote = sender_id,
                        "association for unknown channel; releasing remote side"
                    );
                    let _ = self.enqueue_control(&ControlMessage::ChannelRemoved {
                        receiver_id: sender_id,
                    });
                }
            },
            ControlMessage::ChannelRemoved { receiver_id } => match self.forget(receiver_id) {
                Some(channel) => {
                    debug!(conn = self.conn, channel = receiver_id, "channel removed by peer");
                    channel.remote_removed();
                }
                None => {
                    debug!(conn = self.conn, channel = receiver_id, "removal for unknown channel");
                }
            },
        }
    }

    fn accept_remote_channel(self: &Arc<Self>, sender_id: i32, data: Option<Bytes>) {
        let Some(handler) = lock(&self.handler).clone() else {
            return;
        };

        let local_id = match self.allocate_id() {
            Ok(id) => id,
            Err(err) => {
                self.shutdown(&err.to_string());
                return;
            }
        };
        let channel = Channel::new(
            local_id,
            Some(sender_id),
            Arc::downgrade(self),
            self.conn,
            self.config.send_buffer_size,
        );
        if self.register(&channel).is_err() {
            return;
        }
        if self
            .enqueue_control(&ControlMessage::ChannelAssociated {
                sender_id: local_id,
                receiver_id: sender_id,
            })
            .is_err()
        {
            return;
        }
        debug!(conn = self.conn, channel = local_id, remote = sender_id, "remote channel created");

        let worker_channel = Arc::clone(&channel);
        let spawned = thread::Builder::new()
            .name(format!("objmux-ch-{}-{}", self.conn, local_id))
            .spawn(move || {
                let disposition = handler.channel_created(Arc::clone(&worker_channel), data);
                if disposition == Disposition::AutoDispose {
                    worker_channel.dispose();
                }
            });
        if let Err(err) = spawned {
            warn!(
                conn = self.conn,
                channel = local_id,
                error = %err,
                "failed to spawn channel worker"
            );
            channel.dispose();
        }
    }
}

fn reader_loop(core: Arc<Core>, mut reader: FrameReader<IpcStream>) {
    loop {
        match reader.read_frame() {
            Ok(frame) => core.route(frame),
            Err(FrameError::ConnectionClosed) => {
                core.shutdown("connection closed by peer");
                break;
            }
            Err(err) => {
                core.shutdown(&format!("read failed: {err}"));
                break;
            }
        }
    }
    trace!(conn = core.conn, "reader stopped");
}

fn writer_loop(core: Arc<Core>, mut writer: FrameWriter<IpcStream>) {
    loop {
        let batch: Vec<Frame> = {
            let mut outbound = lock(&core.outbound);
            while outbound.items.is_empty() && !outbound.closed {
                outbound = core
                    .outbound_ready
                    .wait(outbound)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if outbound.closed {
                break;
            }
            outbound.items.drain(..).collect()
        };

        trace!(conn = core.conn, frames = batch.len(), "writing batch");
        if let Err(err) = writer.write_frames(&batch) {
            core.shutdown(&format!("write failed: {err}"));
            break;
        }
    }
    trace!(conn = core.conn, "writer stopped");
}

fn control_loop(core: Arc<Core>) {
    loop {
        let message = {
            let mut control = lock(&core.control);
            loop {
                if control.closed {
                    break None;
                }
                if let Some(message) = control.items.pop_front() {
                    break Some(message);
                }
                control = core
                    .control_ready
                    .wait(control)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        match message {
            Some(message) => core.handle_control(message),
            None => break,
        }
    }
    trace!(conn = core.conn, "control dispatcher stopped");
}

/// Multiplexes channels over one physical connection.
///
/// Built from a handshaken reader/writer pair with [`Channeller::new`], then
/// brought to life with [`Channeller::start`], which spawns the reader,
/// writer and control threads. Handles are cheap to clone and all refer to
/// the same connection.
#[derive(Clone)]
pub struct Channeller {
    core: Arc<Core>,
}

impl Channeller {
    /// Wrap a connection whose handshake is already done.
    pub fn new(
        reader: FrameReader<IpcStream>,
        writer: FrameWriter<IpcStream>,
        config: ChannellerConfig,
    ) -> Result<Self> {
        Self::build(reader, writer, config, None)
    }

    /// Like [`Channeller::new`], remembering the handshake outcome.
    pub fn with_handshake(
        reader: FrameReader<IpcStream>,
        writer: FrameWriter<IpcStream>,
        config: ChannellerConfig,
        handshake: HandshakeResult,
    ) -> Result<Self> {
        Self::build(reader, writer, config, Some(handshake))
    }

    fn build(
        mut reader: FrameReader<IpcStream>,
        mut writer: FrameWriter<IpcStream>,
        config: ChannellerConfig,
        handshake: Option<HandshakeResult>,
    ) -> Result<Self> {
        let stream = reader.get_ref().try_clone()?;
        reader.set_read_timeout(None)?;
        reader.set_max_payload_size(config.max_payload_size);
        writer.set_max_payload_size(config.max_payload_size);

        let conn = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        debug!(conn, transport = stream.transport_name(), "channeller created");

        Ok(Self {
            core: Arc::new(Core {
                conn,
                config,
                table: RwLock::new(Table {
                    channels: HashMap::new(),
                    closed: None,
                }),
                next_id: AtomicI32::new(FIRST_DYNAMIC_CHANNEL),
                outbound: Mutex::new(Queue::new()),
                outbound_ready: Condvar::new(),
                control: Mutex::new(Queue::new()),
                control_ready: Condvar::new(),
                handler: Mutex::new(None),
                io: Mutex::new(Some(Io { reader, writer })),
                closed: Mutex::new(false),
                closed_cv: Condvar::new(),
                stream,
                handshake,
            }),
        })
    }

    /// Spawn the reader, writer and control threads.
    pub fn start(&self, handler: Arc<dyn RemoteChannelHandler>) -> Result<()> {
        let core = &self.core;
        let Some(Io { reader, writer }) = lock(&core.io).take() else {
            if core.closed_reason().is_some() {
                return Err(core.disconnected());
            }
            return Err(ChannelError::AlreadyStarted);
        };
        *lock(&core.handler) = Some(handler);

        let spawn = |name: &str, body: Box<dyn FnOnce() + Send>| {
            thread::Builder::new()
                .name(format!("objmux-{name}-{}", core.conn))
                .spawn(body)
                .map(|_| ())
        };

        let reader_core = Arc::clone(core);
        let writer_core = Arc::clone(core);
        let control_core = Arc::clone(core);
        let result = spawn("writer", Box::new(move || writer_loop(writer_core, writer)))
            .and_then(|()| spawn("control", Box::new(move || control_loop(control_core))))
            .and_then(|()| spawn("reader", Box::new(move || reader_loop(reader_core, reader))));

        if let Err(err) = result {
            core.shutdown(&format!("failed to spawn channeller thread: {err}"));
            return Err(ChannelError::Spawn(err));
        }
        debug!(conn = core.conn, "channeller started");
        Ok(())
    }

    /// Open a channel and wait for the peer to associate it.
    ///
    /// Fails immediately when the connection is already gone, and with
    /// [`ChannelError::AssociationTimeout`] when the peer does not answer in
    /// time.
    pub fn create_channel(&self, data: Option<&[u8]>) -> Result<Arc<Channel>> {
        let core = &self.core;
        if let Some(reason) = core.closed_reason() {
            return Err(ChannelError::Disconnected(reason));
        }
        if lock(&core.io).is_some() {
            return Err(ChannelError::NotStarted);
        }

        let id = core.allocate_id()?;
        let channel = Channel::new(
            id,
            None,
            Arc::downgrade(core),
            core.conn,
            core.config.send_buffer_size,
        );
        core.register(&channel)?;
        debug!(conn = core.conn, channel = id, "creating channel");

        if let Err(err) = core.enqueue_control(&ControlMessage::ChannelCreated {
            sender_id: id,
            data: data.map(<[u8]>::to_vec),
        }) {
            core.forget(id);
            return Err(err);
        }

        match channel.wait_associated(core.config.association_timeout) {
            Ok(_) => Ok(channel),
            Err(err) => {
                channel.dispose();
                core.forget(id);
                Err(err)
            }
        }
    }

    /// Tear down the connection and every channel. Idempotent.
    pub fn dispose(&self) {
        if !self.core.shutdown("disposed locally") {
            trace!(conn = self.core.conn, "channeller already disposed");
        }
    }

    /// Whether the connection is gone.
    pub fn is_disposed(&self) -> bool {
        self.core.closed_reason().is_some()
    }

    /// Why the connection was torn down, if it was.
    pub fn closed_reason(&self) -> Option<String> {
        self.core.closed_reason()
    }

    /// Block until the connection is torn down or `timeout` elapses.
    /// Returns whether it is closed.
    pub fn wait_closed(&self, timeout: Option<Duration>) -> bool {
        let mut closed = lock(&self.core.closed);
        match timeout {
            None => {
                while !*closed {
                    closed = self
                        .core
                        .closed_cv
                        .wait(closed)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                true
            }
            Some(timeout) => {
                let (closed, _) = self
                    .core
                    .closed_cv
                    .wait_timeout_while(closed, timeout, |closed| !*closed)
                    .unwrap_or_else(PoisonError::into_inner);
                *closed
            }
        }
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.core
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .channels
            .len()
    }

    /// Process-unique id used in log fields.
    pub fn conn_id(&self) -> u64 {
        self.core.conn
    }

    /// Handshake outcome, if the channeller was built with one.
    pub fn handshake(&self) -> Option<&HandshakeResult> {
        self.core.handshake.as_ref()
    }

    /// Transport kind of the underlying stream.
    pub fn transport_name(&self) -> &'static str {
        self.core.stream.transport_name()
    }

    /// `(uid, gid, pid)` of the peer process, where the platform reports it.
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        self.core.stream.peer_credentials()
    }

    /// Active configuration.
    pub fn config(&self) -> &ChannellerConfig {
        &self.core.config
    }

    /// Whether two handles refer to the same connection.
    pub fn same_connection(&self, other: &Channeller) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl std::fmt::Debug for Channeller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channeller")
            .field("conn", &self.core.conn)
            .field("transport", &self.transport_name())
            .field("channels", &self.channel_count())
            .field("closed", &self.closed_reason())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::HashSet;
    use std::io::{Read, Write};
    use std::sync::mpsc;
    use std::time::Instant;

    use super::*;
    use crate::channel::ChannelState;

    fn unstarted_pair(config: ChannellerConfig) -> (Channeller, Channeller) {
        let (left, right) = IpcStream::pair().unwrap();
        let make = |stream: IpcStream| {
            let reader = FrameReader::new(stream.try_clone().unwrap());
            let writer = FrameWriter::new(stream);
            Channeller::new(reader, writer, config.clone()).unwrap()
        };
        (make(left), make(right))
    }

    type Accepted = mpsc::Receiver<(Arc<Channel>, Option<Bytes>)>;

    fn keep_all() -> (Arc<dyn RemoteChannelHandler>, Accepted) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler = move |channel: Arc<Channel>, data: Option<Bytes>| {
            let _ = lock(&tx).send((channel, data));
            Disposition::Keep
        };
        (Arc::new(handler), rx)
    }

    fn echo_once() -> Arc<dyn RemoteChannelHandler> {
        Arc::new(|channel: Arc<Channel>, _data: Option<Bytes>| {
            let mut buf = [0u8; 5];
            if channel.read_exact(&mut buf).is_ok() {
                let _ = channel.send(&buf);
            }
            Disposition::AutoDispose
        })
    }

    /// A started channeller facing a raw frame peer.
    fn raw_peer(
        config: ChannellerConfig,
        handler: Arc<dyn RemoteChannelHandler>,
    ) -> (Channeller, FrameReader<IpcStream>, FrameWriter<IpcStream>) {
        let (left, right) = IpcStream::pair().unwrap();
        let reader = FrameReader::new(left.try_clone().unwrap());
        let writer = FrameWriter::new(left);
        let channeller = Channeller::new(reader, writer, config).unwrap();
        channeller.start(handler).unwrap();
        (
            channeller,
            FrameReader::new(right.try_clone().unwrap()),
            FrameWriter::new(right),
        )
    }

    fn read_control(reader: &mut FrameReader<IpcStream>) -> ControlMessage {
        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.channel, CONTROL);
        ControlMessage::from_payload(&frame.payload).unwrap()
    }

    #[test]
    fn create_channel_and_echo() {
        let (client, server) = unstarted_pair(ChannellerConfig::default());
        let (client_handler, _rx) = keep_all();
        client.start(client_handler).unwrap();
        server.start(echo_once()).unwrap();

        let channel = client.create_channel(Some(b"echo")).unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        channel.send(b"hello").unwrap();

        let mut buf = [0u8; 5];
        channel.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // The server handler returned AutoDispose.
        assert_eq!(channel.read(&mut buf).unwrap(), 0);
        assert!(channel.is_disposed());
    }

    #[test]
    fn handler_receives_creation_data() {
        let (client, server) = unstarted_pair(ChannellerConfig::default());
        let (client_handler, _crx) = keep_all();
        let (server_handler, srx) = keep_all();
        client.start(client_handler).unwrap();
        server.start(server_handler).unwrap();

        let local = client.create_channel(Some(b"user:logs")).unwrap();
        let (remote, data) = srx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(data.as_deref(), Some(b"user:logs".as_ref()));
        assert_eq!(remote.remote_id(), Some(local.local_id()));
        assert_eq!(local.remote_id(), Some(remote.local_id()));
    }

    #[test]
    fn concurrent_creation_from_both_sides() {
        let (left, right) = unstarted_pair(ChannellerConfig::default());
        let (left_handler, left_rx) = keep_all();
        let (right_handler, right_rx) = keep_all();
        left.start(left_handler).unwrap();
        right.start(right_handler).unwrap();

        let mut threads = Vec::new();
        for (index, side) in [left.clone(), right.clone()].into_iter().enumerate() {
            for _ in 0..8 {
                let side = side.clone();
                threads.push(thread::spawn(move || {
                    let channel = side.create_channel(None).unwrap();
                    (index, channel.local_id(), channel.remote_id().unwrap())
                }));
            }
        }
        let mut created = [HashSet::new(), HashSet::new()];
        for handle in threads {
            let (index, local, remote) = handle.join().unwrap();
            created[index].insert((local, remote));
        }
        assert_eq!(created[0].len(), 8);
        assert_eq!(created[1].len(), 8);

        for _ in 0..8 {
            // Channels accepted on the left were created on the right, and vice versa.
            let (on_left, _) = left_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let (on_right, _) = right_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let from_right = (on_left.remote_id().unwrap(), on_left.local_id());
            let from_left = (on_right.remote_id().unwrap(), on_right.local_id());
            assert!(created[1].contains(&from_right), "unmatched pair {from_right:?}");
            assert!(created[0].contains(&from_left), "unmatched pair {from_left:?}");
        }

        // Each side allocated 16 distinct local ids (8 created, 8 accepted).
        assert_eq!(left.channel_count(), 16);
        assert_eq!(right.channel_count(), 16);
    }

    #[test]
    fn per_channel_order_is_preserved() {
        let (client, server) = unstarted_pair(ChannellerConfig::default());
        let (client_handler, _crx) = keep_all();
        let (server_handler, srx) = keep_all();
        client.start(client_handler).unwrap();
        server.start(server_handler).unwrap();

        let channel = client.create_channel(None).unwrap();
        for i in 0..50 {
            channel.send(format!("[{i:02}]").as_bytes()).unwrap();
        }
        let (remote, _) = srx.recv_timeout(Duration::from_secs(5)).unwrap();

        let mut buf = vec![0u8; 50 * 4];
        remote.read_exact(&mut buf).unwrap();
        let expected: String = (0..50).map(|i| format!("[{i:02}]")).collect();
        assert_eq!(String::from_utf8(buf).unwrap(), expected);
    }

    #[test]
    fn io_traits_work_on_channels() {
        let (client, server) = unstarted_pair(ChannellerConfig::default());
        let (client_handler, _crx) = keep_all();
        let (server_handler, srx) = keep_all();
        client.start(client_handler).unwrap();
        server.start(server_handler).unwrap();

        let channel = client.create_channel(None).unwrap();
        let mut writer = &*channel;
        writer.write_all(b"line one\n").unwrap();
        writer.flush().unwrap();
        channel.dispose();

        let (remote, _) = srx.recv_timeout(Duration::from_secs(5)).unwrap();
        let mut text = String::new();
        (&*remote).read_to_string(&mut text).unwrap();
        assert_eq!(text, "line one\n");
    }

    #[test]
    fn dispose_twice_is_noop() {
        let (client, server) = unstarted_pair(ChannellerConfig::default());
        let (client_handler, _crx) = keep_all();
        let (server_handler, _srx) = keep_all();
        client.start(client_handler).unwrap();
        server.start(server_handler).unwrap();

        let channel = client.create_channel(None).unwrap();
        channel.dispose();
        channel.dispose();
        assert_eq!(client.channel_count(), 0);

        client.dispose();
        client.dispose();
        assert!(client.is_disposed());
        assert_eq!(client.closed_reason().as_deref(), Some("disposed locally"));
    }

    #[test]
    fn create_on_disposed_connection_fails_immediately() {
        let (client, _server) = unstarted_pair(ChannellerConfig::default());
        let (handler, _rx) = keep_all();
        client.start(handler).unwrap();
        client.dispose();

        let started = Instant::now();
        let err = client.create_channel(None).unwrap_err();
        assert!(matches!(err, ChannelError::Disconnected(_)));
        assert!(err.is_connection_fatal());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn create_before_start_is_rejected() {
        let (client, _server) = unstarted_pair(ChannellerConfig::default());
        assert!(matches!(
            client.create_channel(None),
            Err(ChannelError::NotStarted)
        ));
    }

    #[test]
    fn start_twice_is_rejected() {
        let (client, _server) = unstarted_pair(ChannellerConfig::default());
        let (handler, _rx) = keep_all();
        client.start(Arc::clone(&handler)).unwrap();
        assert!(matches!(
            client.start(handler),
            Err(ChannelError::AlreadyStarted)
        ));
    }

    #[test]
    fn peer_disposal_fails_blocked_reads() {
        let (client, server) = unstarted_pair(ChannellerConfig::default());
        let (client_handler, _crx) = keep_all();
        let (server_handler, srx) = keep_all();
        client.start(client_handler).unwrap();
        server.start(server_handler).unwrap();

        let channel = client.create_channel(None).unwrap();
        let _remote = srx.recv_timeout(Duration::from_secs(5)).unwrap();

        let reader = Arc::clone(&channel);
        let blocked = thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf)
        });
        thread::sleep(Duration::from_millis(20));
        server.dispose();

        let result = blocked.join().unwrap();
        assert!(matches!(result, Err(ChannelError::Disconnected(_))));
        assert!(client.wait_closed(Some(Duration::from_secs(5))));
    }

    #[test]
    fn connection_lost_is_reported_once() {
        struct Counting(Mutex<Vec<String>>);

        impl RemoteChannelHandler for Counting {
            fn channel_created(&self, _channel: Arc<Channel>, _data: Option<Bytes>) -> Disposition {
                Disposition::AutoDispose
            }

            fn connection_lost(&self, reason: &str) {
                lock(&self.0).push(reason.to_string());
            }
        }

        let (client, server) = unstarted_pair(ChannellerConfig::default());
        let counting = Arc::new(Counting(Mutex::new(Vec::new())));
        client.start(counting.clone()).unwrap();
        let (server_handler, _srx) = keep_all();
        server.start(server_handler).unwrap();

        server.dispose();
        assert!(client.wait_closed(Some(Duration::from_secs(5))));
        client.dispose();

        assert_eq!(
            *lock(&counting.0),
            vec!["connection closed by peer".to_string()]
        );
    }

    #[test]
    fn read_timeout_releases_remote_side() {
        let (client, server) = unstarted_pair(ChannellerConfig::default());
        let (client_handler, _crx) = keep_all();
        let (server_handler, srx) = keep_all();
        client.start(client_handler).unwrap();
        server.start(server_handler).unwrap();

        let channel = client.create_channel(None).unwrap();
        let (remote, _) = srx.recv_timeout(Duration::from_secs(5)).unwrap();

        channel.set_read_timeout(Some(Duration::from_millis(20)));
        let err = channel.read(&mut [0u8; 4]).unwrap_err();
        assert!(matches!(err, ChannelError::ReadTimeout { .. }));
        assert!(!err.is_connection_fatal());

        // The peer sees an orderly close, and the connection survives.
        assert_eq!(remote.read(&mut [0u8; 4]).unwrap(), 0);
        assert!(!client.is_disposed());
        client.create_channel(None).unwrap();
    }

    #[test]
    fn unknown_channel_frames_are_discarded() {
        let (handler, rx) = keep_all();
        let (channeller, mut reader, mut writer) = raw_peer(ChannellerConfig::default(), handler);

        writer.send(99, b"nobody home").unwrap();
        writer.send(CONTROL, b"{garbage").unwrap();
        let created = ControlMessage::ChannelCreated {
            sender_id: 5,
            data: None,
        };
        writer.send(CONTROL, &created.to_payload().unwrap()).unwrap();

        match read_control(&mut reader) {
            ControlMessage::ChannelAssociated {
                sender_id,
                receiver_id,
            } => {
                assert_eq!(receiver_id, 5);
                assert!(sender_id >= FIRST_DYNAMIC_CHANNEL);
            }
            other => panic!("unexpected control message {other:?}"),
        }
        let (channel, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(channel.remote_id(), Some(5));
        assert!(!channeller.is_disposed());
    }

    #[test]
    fn full_send_buffer_flushes_automatically() {
        let config = ChannellerConfig {
            send_buffer_size: 4,
            ..ChannellerConfig::default()
        };
        let handler = Arc::new(|channel: Arc<Channel>, _data: Option<Bytes>| {
            channel.write(b"0123456789").unwrap();
            Disposition::Keep
        });
        let (_channeller, mut reader, mut writer) = raw_peer(config, handler);

        let created = ControlMessage::ChannelCreated {
            sender_id: 11,
            data: None,
        };
        writer.send(CONTROL, &created.to_payload().unwrap()).unwrap();
        let _associated = read_control(&mut reader);

        let first = reader.read_frame().unwrap();
        let second = reader.read_frame().unwrap();
        assert_eq!((first.channel, first.payload.as_ref()), (11, b"0123".as_ref()));
        assert_eq!((second.channel, second.payload.as_ref()), (11, b"4567".as_ref()));
    }

    #[test]
    fn association_timeout_cleans_up() {
        let config = ChannellerConfig {
            association_timeout: Duration::from_millis(50),
            ..ChannellerConfig::default()
        };
        let (handler, _rx) = keep_all();
        let (channeller, mut reader, mut writer) = raw_peer(config, handler);

        let err = channeller.create_channel(None).unwrap_err();
        assert!(matches!(err, ChannelError::AssociationTimeout { .. }));
        assert_eq!(channeller.channel_count(), 0);

        // A late association is answered with a removal.
        let sender_id = match read_control(&mut reader) {
            ControlMessage::ChannelCreated { sender_id, .. } => sender_id,
            other => panic!("unexpected control message {other:?}"),
        };
        let late = ControlMessage::ChannelAssociated {
            sender_id: 40,
            receiver_id: sender_id,
        };
        writer.send(CONTROL, &late.to_payload().unwrap()).unwrap();
        assert_eq!(
            read_control(&mut reader),
            ControlMessage::ChannelRemoved { receiver_id: 40 }
        );
    }

    #[test]
    fn local_dispose_notifies_peer() {
        let (handler, _rx) = keep_all();
        let (channeller, mut reader, mut writer) = raw_peer(ChannellerConfig::default(), handler);

        let creator = {
            let channeller = channeller.clone();
            thread::spawn(move || channeller.create_channel(None))
        };
        let sender_id = match read_control(&mut reader) {
            ControlMessage::ChannelCreated { sender_id, .. } => sender_id,
            other => panic!("unexpected control message {other:?}"),
        };
        let associated = ControlMessage::ChannelAssociated {
            sender_id: 77,
            receiver_id: sender_id,
        };
        writer.send(CONTROL, &associated.to_payload().unwrap()).unwrap();

        let channel = creator.join().unwrap().unwrap();
        channel.write(b"tail").unwrap();
        channel.dispose();

        let data = reader.read_frame().unwrap();
        assert_eq!((data.channel, data.payload.as_ref()), (77, b"tail".as_ref()));
        assert_eq!(
            read_control(&mut reader),
            ControlMessage::ChannelRemoved { receiver_id: 77 }
        );
    }
}
