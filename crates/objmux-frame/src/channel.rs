//! Channel id conventions.
//!
//! Id 0 is the control channel of every connection. Dynamic channels are
//! numbered from 1 upward by whichever side creates them; each side keeps
//! its own counter and frames always carry the *receiver's* id.

/// Control channel (ChannelCreated / ChannelAssociated / ChannelRemoved, handshake).
pub const CONTROL: i32 = 0;

/// First id handed out to a dynamically created channel.
pub const FIRST_DYNAMIC_CHANNEL: i32 = 1;

/// Returns true for the control channel.
pub fn is_control(id: i32) -> bool {
    id == CONTROL
}
