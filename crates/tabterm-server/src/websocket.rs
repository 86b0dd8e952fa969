//! Terminal WebSocket: one connection is one mounted view of a tab.
//!
//! Output goes out as binary frames. Input comes in as binary frames (raw
//! keystrokes) or JSON text frames ([`WsClientMessage`]).

use crate::state::AppState;
use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tabterm_core::{SessionManager, TerminalView};
use tabterm_types::{WsClientMessage, WsServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maximum size for JSON text messages (10KB)
const MAX_TEXT_MESSAGE_SIZE: usize = 10 * 1024;

/// Maximum size for terminal input data (64KB - generous for paste operations)
const MAX_TERMINAL_INPUT_SIZE: usize = 64 * 1024;

/// Terminal view that hands output to the connection's send task.
pub struct ChannelView {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelView {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TerminalView for ChannelView {
    fn write(&self, data: &[u8]) {
        let _ = self.tx.send(data.to_vec());
    }
}

fn text_frame(msg: &WsServerMessage) -> Option<Message> {
    serde_json::to_string(msg)
        .ok()
        .map(|json| Message::Text(json.into()))
}

pub async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    tab_id: Uuid,
    size: (u16, u16),
) -> Result<()> {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let manager = state.session_manager.clone();

    let (view, mut output_rx) = ChannelView::new();
    let handle = match manager.mount(tab_id, Arc::new(view), size).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(target: "tabterm::ws", "Cannot mount tab {}: {}", tab_id, e);
            if let Some(frame) = text_frame(&WsServerMessage::Error {
                message: e.to_string(),
            }) {
                ws_tx.send(frame).await?;
            }
            return Ok(());
        }
    };

    let attached = WsServerMessage::Attached {
        tab_id,
        connection: manager.connection_state(tab_id),
    };
    if let Some(frame) = text_frame(&attached) {
        ws_tx.send(frame).await?;
    }
    info!(target: "tabterm::ws", "View attached to tab {} ({}x{})", tab_id, size.0, size.1);

    // Replies produced by the receive side (errors, pongs)
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<WsServerMessage>(32);

    let mut send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(data) = output_rx.recv() => Message::Binary(data.into()),
                Some(msg) = outgoing_rx.recv() => match text_frame(&msg) {
                    Some(frame) => frame,
                    None => continue,
                },
                else => break,
            };
            if let Err(e) = ws_tx.send(frame).await {
                debug!(target: "tabterm::ws", "WebSocket send failed for tab {}: {}", tab_id, e);
                break;
            }
        }
    });

    let recv_manager = manager.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let reply = match msg {
                Message::Binary(data) => {
                    if data.len() > MAX_TERMINAL_INPUT_SIZE {
                        warn!(
                            target: "tabterm::ws",
                            "Terminal input too large ({} bytes) for tab {}, max {} bytes",
                            data.len(), tab_id, MAX_TERMINAL_INPUT_SIZE
                        );
                        continue;
                    }
                    send_input(&recv_manager, tab_id, &data).await
                }
                Message::Text(text) => {
                    if text.len() > MAX_TEXT_MESSAGE_SIZE {
                        warn!(
                            target: "tabterm::ws",
                            "Text message too large ({} bytes) for tab {}, max {} bytes",
                            text.len(), tab_id, MAX_TEXT_MESSAGE_SIZE
                        );
                        continue;
                    }
                    match serde_json::from_str::<WsClientMessage>(text.as_str()) {
                        Ok(client_msg) => {
                            handle_client_message(&recv_manager, tab_id, client_msg).await
                        }
                        Err(e) => Some(WsServerMessage::Error {
                            message: format!("Invalid message: {}", e),
                        }),
                    }
                }
                Message::Close(_) => break,
                _ => None,
            };
            if let Some(reply) = reply {
                if outgoing_tx.send(reply).await.is_err() {
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    // Detach this view only; the tab's process keeps running
    drop(handle);
    info!(target: "tabterm::ws", "View detached from tab {}", tab_id);
    Ok(())
}

async fn send_input(manager: &SessionManager, tab_id: Uuid, data: &[u8]) -> Option<WsServerMessage> {
    match manager.send_input(tab_id, data).await {
        Ok(()) => None,
        Err(e) => Some(WsServerMessage::Error {
            message: e.to_string(),
        }),
    }
}

/// Apply one client message. Returns the reply to send back, if any.
pub async fn handle_client_message(
    manager: &SessionManager,
    tab_id: Uuid,
    msg: WsClientMessage,
) -> Option<WsServerMessage> {
    match msg {
        WsClientMessage::Input { data } => {
            if data.len() > MAX_TERMINAL_INPUT_SIZE {
                warn!(target: "tabterm::ws", "Input too large ({} bytes) for tab {}", data.len(), tab_id);
                return None;
            }
            send_input(manager, tab_id, data.as_bytes()).await
        }
        WsClientMessage::Command { text } => {
            match manager.execute_quick_command(tab_id, &text).await {
                Ok(()) => None,
                Err(e) => Some(WsServerMessage::Error {
                    message: e.to_string(),
                }),
            }
        }
        WsClientMessage::Resize { cols, rows } => {
            if cols == 0 || rows == 0 {
                return Some(WsServerMessage::Error {
                    message: format!("Invalid size {}x{}", cols, rows),
                });
            }
            match manager.resize(tab_id, cols, rows).await {
                Ok(()) => None,
                Err(e) => Some(WsServerMessage::Error {
                    message: e.to_string(),
                }),
            }
        }
        WsClientMessage::Ping { timestamp } => {
            tracing::trace!(target: "tabterm::ws::ping", "Ping from tab {} view", tab_id);
            Some(WsServerMessage::Pong { timestamp })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabterm_core::testing::{FakeExecutionService, ServiceCall};
    use tabterm_core::{SessionManagerConfig, SessionStore};
    use tabterm_types::TabSpec;

    fn manager() -> (Arc<FakeExecutionService>, SessionManager) {
        let fake = Arc::new(FakeExecutionService::new());
        let store = Arc::new(SessionStore::open_in_memory(100).unwrap());
        let manager =
            SessionManager::with_store(SessionManagerConfig::default(), fake.clone(), store);
        (fake, manager)
    }

    fn spec() -> TabSpec {
        TabSpec {
            title: "shell".into(),
            shell: "/bin/sh".into(),
            working_directory: "/tmp".into(),
            closable: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_channel_view_forwards_writes() {
        let (view, mut rx) = ChannelView::new();
        view.write(b"hello");
        view.write(b" world");
        assert_eq!(rx.try_recv().unwrap(), b"hello");
        assert_eq!(rx.try_recv().unwrap(), b" world");
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let (_fake, manager) = manager();
        let reply =
            handle_client_message(&manager, Uuid::new_v4(), WsClientMessage::Ping { timestamp: 7 })
                .await;
        assert_eq!(reply, Some(WsServerMessage::Pong { timestamp: 7 }));
    }

    #[tokio::test]
    async fn test_input_before_connect_is_reported() {
        let (_fake, manager) = manager();
        let tab_id = manager.create_tab(spec()).await.unwrap();
        let reply = handle_client_message(
            &manager,
            tab_id,
            WsClientMessage::Input { data: "ls\n".into() },
        )
        .await;
        assert!(matches!(reply, Some(WsServerMessage::Error { .. })));
    }

    #[tokio::test]
    async fn test_resize_reaches_process() {
        let (fake, manager) = manager();
        let tab_id = manager.create_tab(spec()).await.unwrap();
        manager.set_active_tab(tab_id).await.unwrap();

        let reply = handle_client_message(
            &manager,
            tab_id,
            WsClientMessage::Resize {
                cols: 132,
                rows: 50,
            },
        )
        .await;
        assert!(reply.is_none());
        assert!(fake
            .calls()
            .iter()
            .any(|c| matches!(c, ServiceCall::Resize { cols: 132, rows: 50, .. })));

        let reply = handle_client_message(
            &manager,
            tab_id,
            WsClientMessage::Resize { cols: 0, rows: 50 },
        )
        .await;
        assert!(matches!(reply, Some(WsServerMessage::Error { .. })));
    }
}
