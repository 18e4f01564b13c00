// src/session/registry.rs
//
// Set of tabs that have navigated to an http(s) page and are not yet closed.
// It is the fan-out target for settings-changed broadcasts.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::debugger::TabId;

#[derive(Default)]
pub struct ActiveTabRegistry {
    tabs: Mutex<HashSet<TabId>>,
}

impl ActiveTabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the tab was not registered before
    pub fn add(&self, tab: &TabId) -> bool {
        self.tabs
            .lock()
            .map(|mut set| set.insert(tab.clone()))
            .unwrap_or(false)
    }

    /// Returns true if the tab was registered
    pub fn remove(&self, tab: &TabId) -> bool {
        self.tabs
            .lock()
            .map(|mut set| set.remove(tab))
            .unwrap_or(false)
    }

    /// Current members, sorted for stable output
    pub fn list(&self) -> Vec<TabId> {
        let mut tabs: Vec<TabId> = self
            .tabs
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        tabs.sort();
        tabs
    }
}
