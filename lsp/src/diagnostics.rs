//! The most recent `publishDiagnostics` push per URI.
//!
//! Push-driven: entries change only when the server publishes, so they may
//! lag behind the file on disk. Reads never wait for a push.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use lsp_types::Diagnostic;

use crate::protocol;

#[derive(Debug, Clone, Default)]
pub(crate) struct DiagnosticsCache {
    data: Arc<RwLock<HashMap<String, Vec<Diagnostic>>>>,
}

impl DiagnosticsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the diagnostics for `uri`. An empty list clears the entry.
    pub fn update(&self, uri: &str, items: Vec<Diagnostic>) {
        let key = protocol::normalize_uri(uri);
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        if items.is_empty() {
            data.remove(&key);
        } else {
            data.insert(key, items);
        }
    }

    pub fn get(&self, uri: &str) -> Vec<Diagnostic> {
        let key = protocol::normalize_uri(uri);
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
