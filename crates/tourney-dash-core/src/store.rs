// Holder of the last accepted settings snapshot.
//
// Writing requires `&mut SettingsStore`, so only its owner (the relay broker)
// can replace the state. Everyone else gets a `StoreReader`, which hands out
// `Arc` snapshots through a `watch` channel: reads never block the writer and
// never observe a half-written value.

use std::sync::Arc;

use tokio::sync::watch;

use crate::settings::SettingsState;

pub struct SettingsStore {
    tx: watch::Sender<Arc<SettingsState>>,
    revision: u64,
}

impl SettingsStore {
    /// A store holding the compiled-in default settings.
    pub fn new() -> Self {
        Self::with_state(SettingsState::default())
    }

    pub fn with_state(state: SettingsState) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(state));
        SettingsStore { tx, revision: 0 }
    }

    /// Snapshot of the current settings.
    pub fn get(&self) -> Arc<SettingsState> {
        self.tx.borrow().clone()
    }

    /// Replace the current settings wholesale.
    pub fn set(&mut self, next: SettingsState) {
        self.tx.send_replace(Arc::new(next));
        self.revision += 1;
    }

    /// Number of accepted writes since the store was created.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn reader(&self) -> StoreReader {
        StoreReader {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of a [`SettingsStore`].
#[derive(Clone)]
pub struct StoreReader {
    rx: watch::Receiver<Arc<SettingsState>>,
}

impl StoreReader {
    pub fn get(&self) -> Arc<SettingsState> {
        self.rx.borrow().clone()
    }

    /// Wait until the store is written again. Returns `false` once the store
    /// has been dropped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
