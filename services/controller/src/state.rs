//! Shared controller state.
//!
//! The fleet registry, pending-response map, and token table are owned
//! here and handed to the session layer, the transfer service, and the
//! coordinator.  Everything is behind `Arc` so the state clones into each
//! connection task.

use std::collections::HashMap;
use std::sync::Arc;

use axum_server::Handle;
use bw_protocol::{commands, Frame};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

use crate::capture::CaptureHandle;
use crate::config::ControllerConfig;
use crate::handlers::HandlerExecutor;
use crate::queue::{Queue, QueueEvent};
use crate::registry::{AgentRecord, PendingMap, SessionCommand};
use crate::transfer::tokens::TokenTable;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<ControllerConfig>,
    pub registry: Arc<RwLock<HashMap<String, AgentRecord>>>,
    pub pending: Arc<Mutex<PendingMap>>,
    pub tokens: Arc<TokenTable>,
    pub queue: Arc<Mutex<Queue>>,
    pub queue_tx: mpsc::Sender<QueueEvent>,
    pub capture: Arc<Mutex<Option<CaptureHandle>>>,
    pub handlers: Arc<HandlerExecutor>,
    pub control_handle: Handle,
    pub transfer_handle: Handle,
}

impl AppState {
    pub fn new(cfg: ControllerConfig) -> (Self, mpsc::Receiver<QueueEvent>) {
        let (queue_tx, queue_rx) = mpsc::channel(64);
        let handlers = Arc::new(HandlerExecutor::new(cfg.handlers_dir.clone()));
        let state = AppState {
            cfg: Arc::new(cfg),
            registry: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(PendingMap::new())),
            tokens: Arc::new(TokenTable::new()),
            queue: Arc::new(Mutex::new(Queue::new())),
            queue_tx,
            capture: Arc::new(Mutex::new(None)),
            handlers,
            control_handle: Handle::new(),
            transfer_handle: Handle::new(),
        };
        (state, queue_rx)
    }

    /// Install a freshly-registered agent, evicting any older session that
    /// holds the same id.  Returns the evicted record, if any.
    pub async fn install_agent(&self, record: AgentRecord) -> Option<AgentRecord> {
        let mut registry = self.registry.write().await;
        let evicted = registry.remove(&record.agent_id);
        if let Some(old) = &evicted {
            warn!(agent_id = %old.agent_id, "client already connected, evicting older session");
            let _ = old.tx.try_send(SessionCommand::Close);
        }
        registry.insert(record.agent_id.clone(), record);
        evicted
    }

    /// Remove an agent record, but only when it still belongs to the given
    /// session serial.  An evicted session's cleanup must not remove its
    /// successor.
    pub async fn remove_agent(&self, agent_id: &str, session_serial: uuid::Uuid) -> bool {
        let mut registry = self.registry.write().await;
        match registry.get(agent_id) {
            Some(record) if record.session_serial == session_serial => {
                registry.remove(agent_id);
                true
            }
            _ => false,
        }
    }

    pub async fn touch_agent(&self, agent_id: &str) {
        let mut registry = self.registry.write().await;
        if let Some(record) = registry.get_mut(agent_id) {
            record.last_seen = chrono::Utc::now();
        }
    }

    /// Send `KICK` to every live session and close them.  Used by operator
    /// `kick all` and by shutdown.
    pub async fn kick_all(&self, reason: &str) {
        let drained: Vec<AgentRecord> = {
            let mut registry = self.registry.write().await;
            registry.drain().map(|(_, record)| record).collect()
        };
        for record in drained {
            let kick = Frame::new(commands::KICK).kw("reason", reason);
            let _ = record.tx.send(SessionCommand::Send(kick)).await;
            let _ = record.tx.send(SessionCommand::Close).await;
            info!(agent_id = %record.agent_id, reason = %reason, "kicked");
        }
    }

    /// Full shutdown: kick the fleet, fail every pending correlation,
    /// release every outstanding token, and stop both TLS listeners.
    pub async fn shutdown(&self) {
        info!("shutting down server");
        self.kick_all("Server is shutting down").await;

        {
            let mut pending = self.pending.lock().await;
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err("server shutting down".to_owned()));
            }
        }
        self.tokens.clear().await;

        if let Some(capture) = self.capture.lock().await.take() {
            capture.stop().await;
        }

        self.control_handle.shutdown();
        self.transfer_handle.shutdown();
        info!("server shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MachineInfo;
    use chrono::Utc;
    use uuid::Uuid;

    fn record(agent_id: &str) -> (AgentRecord, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(8);
        (
            AgentRecord {
                agent_id: agent_id.to_owned(),
                session_serial: Uuid::new_v4(),
                machine: MachineInfo {
                    hostname: "pi1".to_owned(),
                    machine: "armv7".to_owned(),
                    system: "Linux".to_owned(),
                    release: "6.1".to_owned(),
                },
                protocol_version: "1.4.0".to_owned(),
                connected_at: Utc::now(),
                last_seen: Utc::now(),
                authenticated: true,
                tx,
            },
            rx,
        )
    }

    fn test_state() -> AppState {
        let (state, _queue_rx) = AppState::new(ControllerConfig::for_tests(&std::env::temp_dir()));
        state
    }

    #[tokio::test]
    async fn install_evicts_the_previous_holder_of_an_id() {
        let state = test_state();
        let (first, mut first_rx) = record("pi1_192.0.2.10");
        let first_serial = first.session_serial;
        let (second, _second_rx) = record("pi1_192.0.2.10");

        assert!(state.install_agent(first).await.is_none());
        let evicted = state.install_agent(second).await.expect("evicted");
        assert_eq!(evicted.session_serial, first_serial);
        assert!(matches!(
            first_rx.recv().await,
            Some(SessionCommand::Close)
        ));

        let registry = state.registry.read().await;
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn stale_cleanup_does_not_remove_the_successor() {
        let state = test_state();
        let (first, _rx1) = record("pi1_192.0.2.10");
        let first_serial = first.session_serial;
        let (second, _rx2) = record("pi1_192.0.2.10");
        let second_serial = second.session_serial;

        state.install_agent(first).await;
        state.install_agent(second).await;

        assert!(!state.remove_agent("pi1_192.0.2.10", first_serial).await);
        assert_eq!(state.registry.read().await.len(), 1);
        assert!(state.remove_agent("pi1_192.0.2.10", second_serial).await);
        assert!(state.registry.read().await.is_empty());
    }

    #[tokio::test]
    async fn kick_all_sends_kick_then_close() {
        let state = test_state();
        let (rec, mut rx) = record("pi1_192.0.2.10");
        state.install_agent(rec).await;

        state.kick_all("Server is shutting down").await;
        match rx.recv().await {
            Some(SessionCommand::Send(frame)) => {
                assert_eq!(frame.command, commands::KICK);
                assert_eq!(frame.kwarg("reason"), Some("Server is shutting down"));
            }
            other => panic!("expected KICK, got {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(SessionCommand::Close)));
        assert!(state.registry.read().await.is_empty());
    }
}
