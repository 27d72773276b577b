use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Lifecycle states a connection record can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// The subject is reachable in the context.
    Connected,
    /// The transport dropped; the grace period is running.
    TemporarilyDisconnected,
    /// The grace period elapsed without a reconnection. Terminal.
    Disconnected,
    /// The subject left on purpose. Terminal.
    GracefullyDisconnected,
}

impl ConnectionState {
    /// Every state, in declaration order.
    pub const ALL: [ConnectionState; 4] = [
        ConnectionState::Connected,
        ConnectionState::TemporarilyDisconnected,
        ConnectionState::Disconnected,
        ConnectionState::GracefullyDisconnected,
    ];

    /// Terminal states accept no further transition; the session they close is over.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::GracefullyDisconnected
        )
    }

    /// Stable identifier used in logs, storage and events.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::TemporarilyDisconnected => "temporarily_disconnected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::GracefullyDisconnected => "gracefully_disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error describing a rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: cannot move from {from:?} to {to}")]
pub struct InvalidTransition {
    /// State of the latest record, `None` when no record exists.
    pub from: Option<ConnectionState>,
    /// Requested target state.
    pub to: ConnectionState,
}

/// Decide whether moving from `current` to `requested` is legal.
///
/// `None` stands for "no record yet" (or a closed session) and only accepts an
/// initial transition into [`ConnectionState::Connected`].
pub fn validate(current: Option<ConnectionState>, requested: ConnectionState) -> bool {
    use ConnectionState::*;

    matches!(
        (current, requested),
        (None, Connected)
            | (Some(Connected), TemporarilyDisconnected)
            | (Some(Connected), GracefullyDisconnected)
            | (Some(TemporarilyDisconnected), Connected)
            | (Some(TemporarilyDisconnected), Disconnected)
    )
}

/// Same table as [`validate`], but returns the rejected pair for logging.
pub fn check(
    current: Option<ConnectionState>,
    requested: ConnectionState,
) -> Result<(), InvalidTransition> {
    if validate(current, requested) {
        Ok(())
    } else {
        Err(InvalidTransition {
            from: current,
            to: requested,
        })
    }
}
