//! Process-wide registry bridging the callback server thread to awaiting callers
//!
//! Each pending authentication owns one entry: the server thread resolves it
//! when the OAuth redirect lands, the caller's loop awaits the paired
//! receiver. This is the only shared channel between the two threads.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{PocketError, Result};

static GLOBAL: Lazy<FutureStore> = Lazy::new(FutureStore::new);

/// Metadata captured when a future is created, read back during token exchange
#[derive(Debug, Clone, Default)]
pub struct FutureMetadata {
    /// Redirect URI the authorize URL was built with
    pub redirect_uri: Option<String>,
    pub thread_id: String,
    pub profile: String,
}

struct FutureEntry {
    meta: FutureMetadata,
    sender: Option<oneshot::Sender<String>>,
    receiver: Option<oneshot::Receiver<String>>,
    resolved: bool,
}

/// Thread-safe map from future UID to a one-shot resolvable slot
pub struct FutureStore {
    entries: Mutex<HashMap<String, FutureEntry>>,
}

impl FutureStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide store shared with the callback server thread
    pub fn global() -> &'static FutureStore {
        &GLOBAL
    }

    /// Allocate a slot for `uid`. Creating an existing UID is a no-op so a
    /// repeated `prepare` against a pending session reuses the original slot.
    pub fn create(&self, uid: &str, meta: FutureMetadata) {
        let mut entries = self.entries.lock().expect("future store poisoned");
        if entries.contains_key(uid) {
            debug!(uid, "future already exists, keeping the original");
            return;
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(
            uid.to_string(),
            FutureEntry {
                meta,
                sender: Some(tx),
                receiver: Some(rx),
                resolved: false,
            },
        );
    }

    /// Complete the slot exactly once. A second resolve is an error.
    pub fn resolve(&self, uid: &str, value: String) -> Result<()> {
        let mut entries = self.entries.lock().expect("future store poisoned");
        let entry = entries
            .get_mut(uid)
            .ok_or_else(|| PocketError::Future(format!("future not found for uid={}", uid)))?;
        let sender = entry
            .sender
            .take()
            .ok_or_else(|| PocketError::Future(format!("future already resolved: uid={}", uid)))?;
        entry.resolved = true;
        // The receiver may already be dropped when the flow timed out; the
        // resolved flag is still what check() observes.
        let _ = sender.send(value);
        Ok(())
    }

    /// Whether `uid` exists at all
    pub fn contains(&self, uid: &str) -> bool {
        let entries = self.entries.lock().expect("future store poisoned");
        entries.contains_key(uid)
    }

    /// Whether the slot has been resolved. `None` when the UID is unknown.
    pub fn is_done(&self, uid: &str) -> Option<bool> {
        let entries = self.entries.lock().expect("future store poisoned");
        entries.get(uid).map(|e| e.resolved)
    }

    /// Metadata recorded at creation time
    pub fn metadata(&self, uid: &str) -> Option<FutureMetadata> {
        let entries = self.entries.lock().expect("future store poisoned");
        entries.get(uid).map(|e| e.meta.clone())
    }

    /// Take the receiving half for awaiting. Consumable once.
    pub fn take_receiver(&self, uid: &str) -> Result<oneshot::Receiver<String>> {
        let mut entries = self.entries.lock().expect("future store poisoned");
        let entry = entries
            .get_mut(uid)
            .ok_or_else(|| PocketError::Future(format!("future not found for uid={}", uid)))?;
        entry
            .receiver
            .take()
            .ok_or_else(|| PocketError::Future(format!("future already awaited: uid={}", uid)))
    }

    /// Drop the slot. Unknown UIDs are ignored.
    pub fn delete(&self, uid: &str) {
        let mut entries = self.entries.lock().expect("future store poisoned");
        entries.remove(uid);
    }
}

impl Default for FutureStore {
    fn default() -> Self {
        Self::new()
    }
}
