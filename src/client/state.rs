//! Pure connection status transitions
//!
//! The client applies these rules while holding its state lock; nothing in
//! here touches the native layer or the router.

use crate::protocol::ConnectionStatus;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Classification of a `disconnected` event by the status it arrived in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// Arrived while CONNECTING: the connection attempt failed
    ConnectFailed,
    /// Arrived while CONNECTED: the connection was lost
    ConnectionLost,
    /// Arrived while already DISCONNECTED (requested or duplicate)
    AfterDisconnect,
}

/// How the disconnect came about, as reported to disconnect callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisconnectType {
    /// The application had already asked to disconnect
    ForceDisconnected,
    /// Anything else: broker, network, keep alive
    AutoDisconnected,
}

pub fn classify_disconnect(prior: ConnectionStatus) -> DisconnectKind {
    match prior {
        ConnectionStatus::Connecting => DisconnectKind::ConnectFailed,
        ConnectionStatus::Connected => DisconnectKind::ConnectionLost,
        ConnectionStatus::Disconnected => DisconnectKind::AfterDisconnect,
    }
}

pub fn disconnect_type(prior: ConnectionStatus) -> DisconnectType {
    match prior {
        ConnectionStatus::Disconnected => DisconnectType::ForceDisconnected,
        _ => DisconnectType::AutoDisconnected,
    }
}

/// Status after a `connected` event; `None` means the ack is stale
pub fn on_connected(current: ConnectionStatus) -> Option<ConnectionStatus> {
    match current {
        ConnectionStatus::Connecting => Some(ConnectionStatus::Connected),
        _ => None,
    }
}

/// Status after a `disconnected` event
///
/// A client that is still connecting stays CONNECTING: only `connect()`,
/// `disconnect()` or an acknowledgement move it out of that status.
pub fn on_disconnected(current: ConnectionStatus) -> ConnectionStatus {
    match current {
        ConnectionStatus::Connecting => ConnectionStatus::Connecting,
        _ => ConnectionStatus::Disconnected,
    }
}

/// The native connect call is only issued in this status
pub fn can_issue_connect(current: ConnectionStatus) -> bool {
    current == ConnectionStatus::Connecting
}

pub fn log_state_transition(client_id: &str, from: ConnectionStatus, to: ConnectionStatus) {
    match (from, to) {
        (ConnectionStatus::Connecting, ConnectionStatus::Connected) => {
            info!(client_id, "MQTT connection established");
        }
        (ConnectionStatus::Connected, ConnectionStatus::Disconnected) => {
            warn!(client_id, "MQTT connection lost");
        }
        (ConnectionStatus::Connecting, ConnectionStatus::Disconnected) => {
            info!(client_id, "MQTT connection attempt cancelled");
        }
        (from, to) if from == to => {
            debug!(client_id, status = %to, "MQTT connection status unchanged");
        }
        (from, to) => {
            info!(client_id, %from, %to, "MQTT connection status changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert_eq!(
            classify_disconnect(ConnectionStatus::Connecting),
            DisconnectKind::ConnectFailed
        );
        assert_eq!(
            classify_disconnect(ConnectionStatus::Connected),
            DisconnectKind::ConnectionLost
        );
        assert_eq!(
            classify_disconnect(ConnectionStatus::Disconnected),
            DisconnectKind::AfterDisconnect
        );
    }

    #[test]
    fn test_disconnect_type_follows_prior_status() {
        assert_eq!(
            disconnect_type(ConnectionStatus::Disconnected),
            DisconnectType::ForceDisconnected
        );
        assert_eq!(
            disconnect_type(ConnectionStatus::Connected),
            DisconnectType::AutoDisconnected
        );
    }

    #[test]
    fn test_stale_connected_ack_is_ignored() {
        assert_eq!(
            on_connected(ConnectionStatus::Connecting),
            Some(ConnectionStatus::Connected)
        );
        assert_eq!(on_connected(ConnectionStatus::Disconnected), None);
        assert_eq!(on_connected(ConnectionStatus::Connected), None);
    }

    #[test]
    fn test_disconnect_while_connecting_keeps_connecting() {
        assert_eq!(
            on_disconnected(ConnectionStatus::Connecting),
            ConnectionStatus::Connecting
        );
        assert_eq!(
            on_disconnected(ConnectionStatus::Connected),
            ConnectionStatus::Disconnected
        );
        assert_eq!(
            on_disconnected(ConnectionStatus::Disconnected),
            ConnectionStatus::Disconnected
        );
    }

    #[test]
    fn test_connect_guard() {
        assert!(can_issue_connect(ConnectionStatus::Connecting));
        assert!(!can_issue_connect(ConnectionStatus::Connected));
        assert!(!can_issue_connect(ConnectionStatus::Disconnected));
    }

    #[test]
    fn test_disconnect_type_serializes_camel_case() {
        let json = serde_json::to_string(&DisconnectType::ForceDisconnected).unwrap();
        assert_eq!(json, "\"forceDisconnected\"");
    }
}
