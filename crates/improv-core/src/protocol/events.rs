//! Session notifications

use super::{DeviceState, ErrorCode};

/// Broadcast to every subscriber of a [`Connection`](super::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A CURRENT_STATE frame arrived (sent even when the state is unchanged)
    StateChanged(DeviceState),
    /// An ERROR_STATE frame arrived, or a call timed out
    ErrorChanged(ErrorCode),
    /// The reader stopped; sent once per session
    Disconnected,
}
