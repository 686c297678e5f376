//! Status codes returned by the companion library's `send_message`.
//!
//! The negative codes differ per operating system but map onto the same conditions.

use crate::error::engine::{EngineError, INTERNAL_ERROR_PREFIX};

pub(crate) const CHANNEL_CLOSED_MESSAGE: &str = "desktop app connection channel is closed. Make sure Settings > Developer > Integrate with other apps is enabled, or contact 1Password support";
pub(crate) const CONNECTION_DROPPED_MESSAGE: &str = "connection was unexpectedly dropped by the desktop app. Make sure the desktop app is running and Settings > Developer > Integrate with other apps is enabled, or contact 1Password support";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusCondition {
    Ok,
    ChannelClosed,
    ConnectionDropped,
    Internal(i32),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StatusTable {
    pub channel_closed: i32,
    pub connection_dropped: i32,
}

pub(crate) const MACOS_STATUS_TABLE: StatusTable = StatusTable {
    channel_closed: -3,
    connection_dropped: -7,
};

pub(crate) const DEFAULT_STATUS_TABLE: StatusTable = StatusTable {
    channel_closed: -2,
    connection_dropped: -5,
};

#[cfg(target_os = "macos")]
pub(crate) const PLATFORM_STATUS_TABLE: StatusTable = MACOS_STATUS_TABLE;

#[cfg(not(target_os = "macos"))]
pub(crate) const PLATFORM_STATUS_TABLE: StatusTable = DEFAULT_STATUS_TABLE;

impl StatusTable {
    pub(crate) fn classify(&self, status: i32) -> StatusCondition {
        match status {
            0 => StatusCondition::Ok,
            s if s == self.channel_closed => StatusCondition::ChannelClosed,
            s if s == self.connection_dropped => StatusCondition::ConnectionDropped,
            s => StatusCondition::Internal(s),
        }
    }

    /// `None` for success.
    #[track_caller]
    pub(crate) fn to_error(&self, status: i32) -> Option<EngineError> {
        match self.classify(status) {
            StatusCondition::Ok => None,
            StatusCondition::ChannelClosed => Some(EngineError::unavailable(CHANNEL_CLOSED_MESSAGE)),
            StatusCondition::ConnectionDropped => {
                Some(EngineError::transport(CONNECTION_DROPPED_MESSAGE))
            }
            StatusCondition::Internal(code) => Some(EngineError::transport(format!(
                "{INTERNAL_ERROR_PREFIX}{code}"
            ))),
        }
    }
}
