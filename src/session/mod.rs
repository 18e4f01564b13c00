// src/session/mod.rs
//
// Per-tab debugging session lifecycle.
// One SessionManager owns a TabSession per tab and reconciles navigation
// events and settings changes against it. Async completions carry the
// generation they were started under; a completion whose generation is no
// longer current is discarded without touching state.

mod events;
mod overrides;
mod registry;

pub use events::{is_http_url, LoadStatus, NavigationEvent};
pub use overrides::{
    ApplyOutcome, OverrideApplier, OverrideStatus, CLEAR_GEOLOCATION, GEOLOCATION_ACCURACY,
    SET_GEOLOCATION, SET_LOCALE, SET_TIMEZONE,
};
pub use registry::ActiveTabRegistry;

use events::{route, Route};
use serde::Serialize;
use serde_json::{json, Map};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::debugger::{bounded, DebugSession, TabId, PROTOCOL_VERSION};
use crate::settings::{SpoofSettings, WarningSignal, FORCED_DETACH_MESSAGE, KEY_ACTIVE_TABS};
use crate::store_manager::SettingsStore;

// ============================================================================
// Types
// ============================================================================

/// Debugging session state of one tab
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Detached,
    Attaching,
    Attached,
    Detaching,
}

/// Lifecycle record for one tab
#[derive(Clone, Debug)]
pub struct TabSession {
    pub state: SessionState,
    /// Bumped on every re-evaluation; stale completions compare against it
    pub generation: u64,
    /// Settings applied during the current Attached period (diagnostics only)
    pub last_applied: Option<SpoofSettings>,
    /// Last known top-level URL
    pub url: Option<String>,
    /// Set by a forced detach; cleared by the next qualifying navigation
    pub suspended: bool,
    /// Held across attach/apply and clear/detach so one generation's teardown
    /// never overlaps the next generation's attach
    lifecycle: Arc<tokio::sync::Mutex<()>>,
}

impl TabSession {
    fn new() -> Self {
        Self {
            state: SessionState::Detached,
            generation: 0,
            last_applied: None,
            url: None,
            suspended: false,
            lifecycle: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Tunables for the manager
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    pub protocol_version: String,
    /// Upper bound for every attach / command / detach call
    pub command_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// Acknowledgement for a settings-changed broadcast
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BroadcastAck {
    /// Tabs whose re-evaluation was started
    pub dispatched: usize,
    /// Tabs left alone because the host force-detached them
    pub skipped: usize,
}

// ============================================================================
// Session Manager
// ============================================================================

pub struct SessionManager {
    debugger: Arc<dyn DebugSession>,
    store: Arc<dyn SettingsStore>,
    applier: OverrideApplier,
    registry: ActiveTabRegistry,
    sessions: Mutex<HashMap<TabId, TabSession>>,
    options: ManagerOptions,
}

impl SessionManager {
    pub fn new(
        debugger: Arc<dyn DebugSession>,
        store: Arc<dyn SettingsStore>,
        options: ManagerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            applier: OverrideApplier::new(debugger.clone(), options.command_timeout),
            debugger,
            store,
            registry: ActiveTabRegistry::new(),
            sessions: Mutex::new(HashMap::new()),
            options,
        })
    }

    /// Handle an event on its own task. Events for different tabs never wait
    /// on each other.
    pub fn dispatch(self: &Arc<Self>, event: NavigationEvent) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.handle_event(event).await;
        });
    }

    /// Process one event to completion.
    pub async fn handle_event(&self, event: NavigationEvent) {
        match event {
            NavigationEvent::TabRemoved { tab } => self.on_removed(&tab),
            NavigationEvent::ForcedDetach { tab, reason } => self.on_forced_detach(&tab, &reason).await,
            other => {
                let tab = other.tab().clone();
                let known_url = self.session(&tab).and_then(|s| s.url);
                match route(&other, known_url.as_deref()) {
                    Route::Ignore => {}
                    Route::Detach { url } => {
                        if let Some(g) = self.next_generation(&tab, url) {
                            self.ensure_detached(&tab, g).await;
                        }
                    }
                    Route::Evaluate { url } => self.evaluate(&tab, url).await,
                }
            }
        }
    }

    /// Re-evaluate every registered tab against fresh settings.
    /// Returns once all re-evaluations are started, not finished.
    pub fn settings_changed(self: &Arc<Self>) -> BroadcastAck {
        let mut ack = BroadcastAck::default();
        for tab in self.registry.list() {
            if self.session(&tab).map(|s| s.suspended).unwrap_or(false) {
                ack.skipped += 1;
                continue;
            }
            let manager = self.clone();
            tokio::spawn(async move {
                manager.reevaluate(&tab).await;
            });
            ack.dispatched += 1;
        }
        tlog!(
            "[SessionManager] Settings changed: re-evaluating {} tab(s), {} suspended",
            ack.dispatched,
            ack.skipped
        );
        ack
    }

    /// Re-evaluate one tab using its last known URL.
    pub async fn reevaluate(&self, tab: &TabId) {
        let Some(url) = self.session(tab).and_then(|s| s.url) else {
            return;
        };
        if is_http_url(&url) {
            self.evaluate(tab, url).await;
        } else if let Some(g) = self.next_generation(tab, None) {
            self.ensure_detached(tab, g).await;
        }
    }

    /// Detach every tab. Called when the daemon stops.
    pub async fn shutdown(&self) {
        let tabs: Vec<TabId> = self
            .sessions
            .lock()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();

        let teardowns = tabs.iter().filter_map(|tab| {
            self.next_generation(tab, None)
                .map(|g| self.ensure_detached(tab, g))
        });
        futures::future::join_all(teardowns).await;

        if let Ok(mut map) = self.sessions.lock() {
            map.clear();
        }
        for tab in &tabs {
            self.registry.remove(tab);
        }
        tlog!("[SessionManager] Shut down, released {} tab(s)", tabs.len());
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn state(&self, tab: &TabId) -> Option<SessionState> {
        self.session(tab).map(|s| s.state)
    }

    /// Copy of the tab's session record
    pub fn session(&self, tab: &TabId) -> Option<TabSession> {
        self.sessions.lock().ok()?.get(tab).cloned()
    }

    pub fn active_tabs(&self) -> Vec<TabId> {
        self.registry.list()
    }

    // ------------------------------------------------------------------------
    // Re-evaluation
    // ------------------------------------------------------------------------

    /// Tab is on an http(s) page: register it, read settings, pick a path.
    async fn evaluate(&self, tab: &TabId, url: String) {
        // The generation is taken before the first await so it follows event order
        let g = {
            let Ok(mut map) = self.sessions.lock() else {
                return;
            };
            let session = map.entry(tab.clone()).or_insert_with(TabSession::new);
            session.url = Some(url);
            session.suspended = false;
            session.generation += 1;
            session.generation
        };

        if self.registry.add(tab) {
            self.mirror_active_tabs().await;
        }

        let settings = match SpoofSettings::load(self.store.as_ref()).await {
            Ok(settings) => settings,
            Err(e) => {
                tlog!(
                    "[SessionManager] Settings read failed for {}, treating as no overrides: {}",
                    tab,
                    e
                );
                SpoofSettings {
                    enabled: false,
                    ..SpoofSettings::default()
                }
            }
        };

        if !self.is_current(tab, g) {
            return;
        }

        if settings.wants_attach() {
            self.ensure_attached(tab, g, settings).await;
        } else {
            self.ensure_detached(tab, g).await;
        }
    }

    /// The tab's lifecycle lock, if `g` is still its current generation.
    fn lifecycle_for(&self, tab: &TabId, g: u64) -> Option<Arc<tokio::sync::Mutex<()>>> {
        let map = self.sessions.lock().ok()?;
        map.get(tab)
            .filter(|s| s.generation == g)
            .map(|s| s.lifecycle.clone())
    }

    /// Make sure the tab has a session and (re)issue every requested override.
    async fn ensure_attached(&self, tab: &TabId, g: u64, settings: SpoofSettings) {
        let Some(lifecycle) = self.lifecycle_for(tab, g) else {
            return;
        };
        // Waits out an older teardown still talking to the browser
        let _guard = lifecycle.lock().await;

        let need_attach = {
            let Ok(mut map) = self.sessions.lock() else {
                return;
            };
            match map.get_mut(tab) {
                Some(session) if session.generation == g => {
                    if session.state == SessionState::Attached {
                        false
                    } else {
                        session.state = SessionState::Attaching;
                        true
                    }
                }
                _ => return,
            }
        };

        if need_attach {
            let attach = self.debugger.attach(tab, &self.options.protocol_version);
            match bounded("attach", self.options.command_timeout, attach).await {
                Ok(()) => {}
                Err(e) if e.is_already_attached() => {
                    tlog!("[SessionManager] {} already attached, reusing session", tab);
                }
                Err(e) => {
                    tlog!("[SessionManager] Attach to {} failed: {}", tab, e);
                    self.settle(tab, g, SessionState::Detached);
                    return;
                }
            }
            if !self.settle(tab, g, SessionState::Attached) {
                tlog!("[SessionManager] Discarding stale attach for {} (generation {})", tab, g);
                return;
            }
        }

        // A new document means a new script context: always re-send
        let outcome = self.applier.apply(tab, &settings).await;
        tlog!("[SessionManager] Overrides for {}: {}", tab, outcome.summary());

        if outcome.session_lost() {
            tlog!("[SessionManager] Session for {} is gone, marking detached", tab);
            self.settle(tab, g, SessionState::Detached);
            return;
        }

        if let Ok(mut map) = self.sessions.lock() {
            if let Some(session) = map.get_mut(tab).filter(|s| s.generation == g) {
                session.last_applied = Some(settings);
            }
        }
    }

    /// Clear overrides and drop the session. No-op when already detached.
    async fn ensure_detached(&self, tab: &TabId, g: u64) {
        let lifecycle = {
            let Ok(mut map) = self.sessions.lock() else {
                return;
            };
            match map.get_mut(tab) {
                Some(session) if session.generation == g && session.state != SessionState::Detached => {
                    session.state = SessionState::Detaching;
                    session.lifecycle.clone()
                }
                _ => return,
            }
        };
        let _guard = lifecycle.lock().await;

        if !self.is_current(tab, g) {
            return;
        }

        let failures = self.applier.clear(tab).await;
        if failures > 0 {
            tlog!("[SessionManager] {} clear command(s) failed on {}, detaching anyway", failures, tab);
        }

        // A newer generation now owns the session; detaching would be stale work
        if !self.is_current(tab, g) {
            tlog!("[SessionManager] Teardown of {} superseded, keeping session", tab);
            return;
        }

        if let Err(e) = bounded("detach", self.options.command_timeout, self.debugger.detach(tab)).await {
            tlog!("[SessionManager] Detach from {} failed: {}", tab, e);
        }

        if self.settle(tab, g, SessionState::Detached) {
            tlog!("[SessionManager] Detached from {}", tab);
        }
    }

    // ------------------------------------------------------------------------
    // Removal and forced detach
    // ------------------------------------------------------------------------

    fn on_removed(&self, tab: &TabId) {
        let removed = self.sessions.lock().ok().and_then(|mut map| map.remove(tab));
        if self.registry.remove(tab) {
            let store = self.store.clone();
            let tabs = self.registry.list();
            tokio::spawn(async move {
                if let Err(e) = store.set(active_tabs_entry(&tabs)).await {
                    tlog!("[SessionManager] Failed to mirror active tabs: {}", e);
                }
            });
        }

        let Some(session) = removed else {
            return;
        };
        tlog!("[SessionManager] Tab {} closed ({:?})", tab, session.state);

        if session.state != SessionState::Detached {
            let debugger = self.debugger.clone();
            let limit = self.options.command_timeout;
            let tab = tab.clone();
            tokio::spawn(async move {
                if let Err(e) = bounded("detach", limit, debugger.detach(&tab)).await {
                    tlog!("[SessionManager] Detach from closed tab {} failed: {}", tab, e);
                }
            });
        }
    }

    /// The host ended a session. If the tab is still open this was not us:
    /// mark it detached, suspend it and raise the warning.
    async fn on_forced_detach(&self, tab: &TabId, reason: &str) {
        let Some(state) = self.state(tab) else {
            return;
        };
        if matches!(state, SessionState::Detached | SessionState::Detaching) {
            // Our own teardown
            return;
        }

        let tab_exists = match bounded("listTargets", self.options.command_timeout, self.debugger.list_targets()).await {
            Ok(targets) => targets.iter().any(|t| &t.tab_id == tab),
            Err(e) => {
                tlog!("[SessionManager] Could not list targets after detach of {}: {}", tab, e);
                false
            }
        };

        {
            let Ok(mut map) = self.sessions.lock() else {
                return;
            };
            let Some(session) = map.get_mut(tab) else {
                return;
            };
            // Authoritative: overrides any in-flight work
            session.generation += 1;
            session.state = SessionState::Detached;
            session.last_applied = None;
            session.suspended = tab_exists;
        }

        if !tab_exists {
            tlog!("[SessionManager] Session for {} ended with its tab ({})", tab, reason);
            return;
        }

        tlog!(
            "[SessionManager] Host detached {} ({}), suspended until next navigation",
            tab,
            reason
        );
        if let Err(e) = WarningSignal::raise(self.store.as_ref(), FORCED_DETACH_MESSAGE).await {
            tlog!("[SessionManager] Failed to raise warning: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Generation bookkeeping
    // ------------------------------------------------------------------------

    /// Start a re-evaluation of an existing session; None if the tab has none.
    fn next_generation(&self, tab: &TabId, url: Option<String>) -> Option<u64> {
        let mut map = self.sessions.lock().ok()?;
        let session = map.get_mut(tab)?;
        if url.is_some() {
            session.url = url;
        }
        session.generation += 1;
        Some(session.generation)
    }

    fn is_current(&self, tab: &TabId, g: u64) -> bool {
        self.sessions
            .lock()
            .ok()
            .and_then(|map| map.get(tab).map(|s| s.generation == g))
            .unwrap_or(false)
    }

    /// Move to `state` if `g` is still current. Returns whether it applied.
    fn settle(&self, tab: &TabId, g: u64, state: SessionState) -> bool {
        let Ok(mut map) = self.sessions.lock() else {
            return false;
        };
        match map.get_mut(tab) {
            Some(session) if session.generation == g => {
                session.state = state;
                if state == SessionState::Detached {
                    session.last_applied = None;
                }
                true
            }
            _ => false,
        }
    }

    async fn mirror_active_tabs(&self) {
        let tabs = self.registry.list();
        if let Err(e) = self.store.set(active_tabs_entry(&tabs)).await {
            tlog!("[SessionManager] Failed to mirror active tabs: {}", e);
        }
    }
}

fn active_tabs_entry(tabs: &[TabId]) -> Map<String, serde_json::Value> {
    let mut entries = Map::new();
    entries.insert(KEY_ACTIVE_TABS.to_string(), json!(tabs));
    entries
}
