use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use kviz_core::SocketId;

use crate::config::ServerConfig;
use crate::rooms::GameRegistry;
use crate::sessions::SessionRegistry;
use crate::store::{Store, StoreError};
use crate::write_queue::{DbOp, WriteQueue, write_queue};

/// Composition root: every service hangs off this, nothing is global.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub games: Arc<GameRegistry>,
    pub sessions: Arc<RwLock<SessionRegistry>>,
    pub write_queue: WriteQueue,
    write_rx: Arc<std::sync::Mutex<Option<UnboundedReceiver<DbOp>>>>,
    pub config: Arc<ServerConfig>,
    pub connection_count: Arc<AtomicUsize>,
    next_socket_id: Arc<AtomicU64>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = Arc::new(Store::open(&config.database_path)?);
        let (queue, rx) = write_queue();
        Ok(Self {
            store,
            games: Arc::new(GameRegistry::new()),
            sessions: Arc::new(RwLock::new(SessionRegistry::new())),
            write_queue: queue,
            write_rx: Arc::new(std::sync::Mutex::new(Some(rx))),
            config: Arc::new(config),
            connection_count: Arc::new(AtomicUsize::new(0)),
            next_socket_id: Arc::new(AtomicU64::new(1)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn alloc_socket_id(&self) -> SocketId {
        self.next_socket_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Hand the queue receiver to the flusher task. Yields once.
    pub fn take_write_rx(&self) -> Option<UnboundedReceiver<DbOp>> {
        self.write_rx.lock().unwrap().take()
    }
}

/// RAII guard that decrements the connection counter on drop.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> ServerConfig {
        ServerConfig {
            database_path: ":memory:".to_string(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn connection_guard_increments_and_decrements() {
        let counter = Arc::new(AtomicUsize::new(0));
        let guard = ConnectionGuard::new(Arc::clone(&counter));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        drop(guard);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn socket_ids_are_unique() {
        let state = AppState::new(memory_config()).unwrap();
        let a = state.alloc_socket_id();
        let b = state.alloc_socket_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn write_rx_can_be_taken_once() {
        let state = AppState::new(memory_config()).unwrap();
        assert!(state.take_write_rx().is_some());
        assert!(state.take_write_rx().is_none());
    }
}
