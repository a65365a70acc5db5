//! Lazily created, explicitly closed pooled HTTP client.

use log::{debug, info};
use reqwest::Client;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::error::LlmError;

const MAX_IDLE_PER_HOST: usize = 10;

enum Slot {
    Cold,
    Open(Client),
    Closed,
}

/// Owner of the process-wide connection pool used for LLM service calls.
///
/// The first call to [`ClientHandle::client`] builds the pool; concurrent
/// first calls serialise on the slot mutex so only one pool is ever built.
/// After [`ClientHandle::close`] every further call fails with
/// [`LlmError::ClientClosed`].
pub struct ClientHandle {
    timeout: Duration,
    slot: Mutex<Slot>,
    created: AtomicUsize,
}

impl ClientHandle {
    /// `timeout` bounds connection establishment and each body read.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            slot: Mutex::new(Slot::Cold),
            created: AtomicUsize::new(0),
        }
    }

    /// Builds the pool now instead of on first use.
    pub async fn open(&self) -> Result<(), LlmError> {
        self.client().await.map(|_| ())
    }

    /// Returns the shared client, creating it on first use.
    pub async fn client(&self) -> Result<Client, LlmError> {
        let mut slot = self.slot.lock().await;
        match &*slot {
            Slot::Open(client) => Ok(client.clone()),
            Slot::Closed => Err(LlmError::ClientClosed),
            Slot::Cold => {
                let client = Client::builder()
                    .user_agent(concat!("tabproxy/", env!("TABPROXY_VERSION")))
                    .connect_timeout(self.timeout)
                    .read_timeout(self.timeout)
                    .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
                    .build()
                    .map_err(|e| LlmError::CallFailed(format!("Failed to build HTTP client: {}", e)))?;
                self.created.fetch_add(1, Ordering::SeqCst);
                debug!("HTTP client created (timeout {:?})", self.timeout);
                *slot = Slot::Open(client.clone());
                Ok(client)
            }
        }
    }

    /// Closes the pool. Returns `true` if a live client was dropped.
    pub async fn close(&self) -> bool {
        let mut slot = self.slot.lock().await;
        let was_open = matches!(*slot, Slot::Open(_));
        *slot = Slot::Closed;
        if was_open {
            info!("HTTP client closed");
        }
        was_open
    }

    pub async fn is_closed(&self) -> bool {
        matches!(*self.slot.lock().await, Slot::Closed)
    }

    /// Number of clients built over the handle's lifetime (0 or 1).
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}
