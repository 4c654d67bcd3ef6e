use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use objmux_channel::Channel;

/// Channel-creation payload marking an instruction channel.
pub(crate) const RPC_TAG: &[u8] = b"rpc";
/// Prefix of the creation payload for user channels; the tag follows it.
pub(crate) const USER_PREFIX: &[u8] = b"user:";

/// What a remotely created channel is for, decided from its creation data.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChannelPurpose {
    Rpc,
    User(Bytes),
    Unknown,
}

pub(crate) fn classify(data: Option<&Bytes>) -> ChannelPurpose {
    match data {
        None => ChannelPurpose::Rpc,
        Some(data) if data.as_ref() == RPC_TAG => ChannelPurpose::Rpc,
        Some(data) if data.starts_with(USER_PREFIX) => {
            ChannelPurpose::User(data.slice(USER_PREFIX.len()..))
        }
        Some(_) => ChannelPurpose::Unknown,
    }
}

pub(crate) fn user_data(tag: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(USER_PREFIX.len() + tag.len());
    data.extend_from_slice(USER_PREFIX);
    data.extend_from_slice(tag);
    data
}

/// A raw byte channel opened next to the rpc traffic of a session.
///
/// Implements [`io::Read`] and [`io::Write`]; writes are buffered until
/// `flush`. Dropping the last handle does not close the channel, call
/// [`UserChannel::dispose`].
#[derive(Clone)]
pub struct UserChannel {
    channel: Arc<Channel>,
    tag: Bytes,
}

impl UserChannel {
    pub(crate) fn new(channel: Arc<Channel>, tag: Bytes) -> Self {
        Self { channel, tag }
    }

    /// The tag the opener attached.
    pub fn tag(&self) -> &[u8] {
        &self.tag
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.channel.set_read_timeout(timeout);
    }

    /// Write and flush in one step.
    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        self.channel.send(data).map_err(io::Error::from)
    }

    pub fn dispose(&self) {
        self.channel.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.channel.is_disposed()
    }
}

impl io::Read for UserChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self.channel, buf)
    }
}

impl io::Write for UserChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self.channel, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut &*self.channel)
    }
}

impl std::fmt::Debug for UserChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserChannel")
            .field("channel", &self.channel.local_id())
            .field("tag", &String::from_utf8_lossy(&self.tag))
            .finish()
    }
}
