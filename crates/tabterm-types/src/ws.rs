//! WebSocket message protocol between a terminal view and the daemon.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ConnectionState;

/// Messages sent from a view to the server (text frames).
///
/// Raw keystrokes travel as binary frames and are not wrapped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    /// Terminal input as text.
    Input { data: String },
    /// Track and run a command (quick command bar).
    Command { text: String },
    Resize { cols: u16, rows: u16 },
    Ping { timestamp: u64 },
}

/// Messages sent from the server to a view (text frames).
///
/// Terminal output travels as binary frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    Attached {
        tab_id: Uuid,
        connection: ConnectionState,
    },
    Error { message: String },
    Pong { timestamp: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_tagging() {
        let msg: WsClientMessage =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(msg, WsClientMessage::Resize { cols: 120, rows: 40 });
    }
}
