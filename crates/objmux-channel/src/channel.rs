use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use objmux_frame::Frame;
use tracing::{debug, trace};

use crate::channeller::Core;
use crate::control::ControlMessage;
use crate::error::{ChannelError, Result};

/// Why a channel stopped accepting traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisposeReason {
    /// `dispose` was called on this side.
    Local,
    /// The peer sent `ChannelRemoved`.
    RemoteRemoved,
    /// A read exceeded the channel's read timeout.
    TimedOut(Duration),
    /// The underlying connection failed or was disposed.
    Connection(String),
}

impl DisposeReason {
    fn read_outcome(&self, channel: i32) -> Result<usize> {
        match self {
            DisposeReason::RemoteRemoved => Ok(0),
            DisposeReason::Local => Err(ChannelError::ChannelDisposed(channel)),
            DisposeReason::TimedOut(timeout) => Err(ChannelError::ReadTimeout {
                channel,
                timeout: *timeout,
            }),
            DisposeReason::Connection(reason) => Err(ChannelError::Disconnected(reason.clone())),
        }
    }

    fn write_error(&self, channel: i32) -> ChannelError {
        match self {
            DisposeReason::RemoteRemoved => ChannelError::ChannelClosed(channel),
            DisposeReason::Local | DisposeReason::TimedOut(_) => {
                ChannelError::ChannelDisposed(channel)
            }
            DisposeReason::Connection(reason) => ChannelError::Disconnected(reason.clone()),
        }
    }
}

/// Observable lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created locally, waiting for the peer to associate it.
    Pending,
    /// Bound on both sides.
    Open,
    /// No new traffic; queued inbound data can still be read.
    Disposing,
    /// Terminal.
    Disposed,
}

enum Phase {
    Open,
    Disposing(DisposeReason),
    Disposed(DisposeReason),
}

struct State {
    remote_id: Option<i32>,
    inbound: VecDeque<Bytes>,
    phase: Phase,
}

/// One logical duplex conversation inside a connection.
///
/// Reads block until buffered inbound data exists, the channel is torn down
/// or the read timeout elapses. Writes accumulate in a fixed-size send buffer
/// that becomes one frame on [`Channel::flush`] or when it fills up.
pub struct Channel {
    local_id: i32,
    conn: u64,
    core: Weak<Core>,
    state: Mutex<State>,
    readable: Condvar,
    send_buf: Mutex<BytesMut>,
    send_buffer_size: usize,
    read_timeout: Mutex<Option<Duration>>,
}

impl Channel {
    pub(crate) fn new(
        local_id: i32,
        remote_id: Option<i32>,
        core: Weak<Core>,
        conn: u64,
        send_buffer_size: usize,
    ) -> Arc<Self> {
        let send_buffer_size = send_buffer_size.max(1);
        Arc::new(Self {
            local_id,
            conn,
            core,
            state: Mutex::new(State {
                remote_id,
                inbound: VecDeque::new(),
                phase: Phase::Open,
            }),
            readable: Condvar::new(),
            send_buf: Mutex::new(BytesMut::with_capacity(send_buffer_size)),
            send_buffer_size,
            read_timeout: Mutex::new(None),
        })
    }

    /// Id allocated by this side.
    pub fn local_id(&self) -> i32 {
        self.local_id
    }

    /// Id allocated by the peer, once associated.
    pub fn remote_id(&self) -> Option<i32> {
        self.lock_state().remote_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        let state = self.lock_state();
        match (&state.phase, state.remote_id) {
            (Phase::Open, None) => ChannelState::Pending,
            (Phase::Open, Some(_)) => ChannelState::Open,
            (Phase::Disposing(_), _) => ChannelState::Disposing,
            (Phase::Disposed(_), _) => ChannelState::Disposed,
        }
    }

    /// Whether the channel has reached its terminal state.
    pub fn is_disposed(&self) -> bool {
        self.state() == ChannelState::Disposed
    }

    /// The reason the channel stopped, if it has.
    pub fn dispose_reason(&self) -> Option<DisposeReason> {
        match &self.lock_state().phase {
            Phase::Open => None,
            Phase::Disposing(reason) | Phase::Disposed(reason) => Some(reason.clone()),
        }
    }

    /// Set how long a read may wait for data. `None` waits forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self
            .read_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    /// Current read timeout.
    pub fn read_timeout(&self) -> Option<Duration> {
        *self
            .read_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Read buffered inbound bytes into `buf`.
    ///
    /// Returns `Ok(0)` once the peer removed the channel and every queued
    /// byte has been consumed. A timeout disposes the channel.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let timeout = self.read_timeout();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock_state();

        loop {
            while let Some(front) = state.inbound.front_mut() {
                if front.is_empty() {
                    state.inbound.pop_front();
                    continue;
                }
                let n = buf.len().min(front.len());
                buf[..n].copy_from_slice(&front[..n]);
                front.advance(n);
                if front.is_empty() {
                    state.inbound.pop_front();
                }
                return Ok(n);
            }

            match &state.phase {
                Phase::Open => {}
                Phase::Disposing(reason) => {
                    let reason = reason.clone();
                    state.phase = Phase::Disposed(reason.clone());
                    debug!(conn = self.conn, channel = self.local_id, ?reason, "channel drained");
                    return reason.read_outcome(self.local_id);
                }
                Phase::Disposed(reason) => return reason.read_outcome(self.local_id),
            }

            state = match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(state);
                        self.dispose_with(DisposeReason::TimedOut(timeout));
                        return Err(ChannelError::ReadTimeout {
                            channel: self.local_id,
                            timeout,
                        });
                    }
                    self.readable
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                _ => self
                    .readable
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Fill `buf` completely.
    pub fn read_exact(&self, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.read(buf)?;
            if n == 0 {
                return Err(ChannelError::ChannelClosed(self.local_id));
            }
            buf = &mut buf[n..];
        }
        Ok(())
    }

    /// Append bytes to the send buffer, emitting a frame each time it fills.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.ensure_writable()?;

        let mut send_buf = self.lock_send_buf();
        let mut rest = data;
        while !rest.is_empty() {
            let room = self.send_buffer_size - send_buf.len();
            let take = room.min(rest.len());
            send_buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if send_buf.len() >= self.send_buffer_size {
                self.flush_locked(&mut send_buf)?;
            }
        }
        Ok(data.len())
    }

    /// Queue the send buffer as one frame. Returns once the frame is queued,
    /// not once it reaches the wire.
    pub fn flush(&self) -> Result<()> {
        let mut send_buf = self.lock_send_buf();
        self.flush_locked(&mut send_buf)
    }

    /// Write `data` and flush.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.write(data)?;
        self.flush()
    }

    /// Dispose the channel. Pending written bytes are flushed and the peer is
    /// told, if it knows the channel. Calling this again does nothing.
    pub fn dispose(&self) {
        self.dispose_with(DisposeReason::Local);
    }

    pub(crate) fn dispose_with(&self, reason: DisposeReason) {
        let pending = {
            let mut send_buf = self.lock_send_buf();
            if send_buf.is_empty() || reason != DisposeReason::Local {
                send_buf.clear();
                None
            } else {
                Some(send_buf.split().freeze())
            }
        };

        let (remote_id, notify_peer) = {
            let mut state = self.lock_state();
            let notify_peer = match &state.phase {
                Phase::Disposed(_) => return,
                Phase::Disposing(_) => false,
                Phase::Open => true,
            };
            state.phase = Phase::Disposed(reason.clone());
            state.inbound.clear();
            self.readable.notify_all();
            (state.remote_id, notify_peer)
        };

        debug!(conn = self.conn, channel = self.local_id, ?reason, "channel disposed");

        let Some(core) = self.core.upgrade() else {
            return;
        };
        core.forget(self.local_id);

        if let (true, Some(remote_id)) = (notify_peer, remote_id) {
            if let Some(payload) = pending {
                let _ = core.enqueue_frame(Frame::new(remote_id, payload));
            }
            let _ = core.enqueue_control(&ControlMessage::ChannelRemoved {
                receiver_id: remote_id,
            });
        }
    }

    pub(crate) fn associate(&self, remote_id: i32) -> bool {
        let mut state = self.lock_state();
        if state.remote_id.is_some() || !matches!(state.phase, Phase::Open) {
            return false;
        }
        state.remote_id = Some(remote_id);
        self.readable.notify_all();
        true
    }

    pub(crate) fn wait_associated(&self, timeout: Duration) -> Result<i32> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        loop {
            match (&state.phase, state.remote_id) {
                (Phase::Open, Some(remote_id)) => return Ok(remote_id),
                (Phase::Open, None) => {}
                (Phase::Disposing(reason) | Phase::Disposed(reason), _) => {
                    return Err(reason.write_error(self.local_id));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ChannelError::AssociationTimeout {
                    channel: self.local_id,
                    timeout,
                });
            }
            state = self
                .readable
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub(crate) fn deliver(&self, payload: Bytes) -> bool {
        let mut state = self.lock_state();
        if !matches!(state.phase, Phase::Open) {
            return false;
        }
        trace!(
            conn = self.conn,
            channel = self.local_id,
            len = payload.len(),
            "frame delivered"
        );
        state.inbound.push_back(payload);
        self.readable.notify_all();
        true
    }

    pub(crate) fn remote_removed(&self) {
        self.begin_dispose(DisposeReason::RemoteRemoved);
    }

    pub(crate) fn connection_lost(&self, reason: &str) {
        self.begin_dispose(DisposeReason::Connection(reason.to_string()));
    }

    fn begin_dispose(&self, reason: DisposeReason) {
        let mut state = self.lock_state();
        if !matches!(state.phase, Phase::Open) {
            return;
        }
        debug!(conn = self.conn, channel = self.local_id, ?reason, "channel disposing");
        state.phase = Phase::Disposing(reason);
        self.readable.notify_all();
    }

    fn ensure_writable(&self) -> Result<i32> {
        let state = self.lock_state();
        match (&state.phase, state.remote_id) {
            (Phase::Open, Some(remote_id)) => Ok(remote_id),
            (Phase::Open, None) => Err(ChannelError::NotAssociated(self.local_id)),
            (Phase::Disposing(reason) | Phase::Disposed(reason), _) => {
                Err(reason.write_error(self.local_id))
            }
        }
    }

    fn flush_locked(&self, send_buf: &mut BytesMut) -> Result<()> {
        if send_buf.is_empty() {
            return Ok(());
        }
        let remote_id = self.ensure_writable()?;
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| ChannelError::Disconnected("channeller dropped".to_string()))?;
        core.enqueue_frame(Frame::new(remote_id, send_buf.split().freeze()))
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_send_buf(&self) -> MutexGuard<'_, BytesMut> {
        self.send_buf.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl io::Read for &Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Channel::read(self, buf).map_err(Into::into)
    }
}

impl io::Write for &Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Channel::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Channel::flush(self).map_err(Into::into)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("conn", &self.conn)
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id())
            .field("state", &self.state())
            .finish()
    }
}
