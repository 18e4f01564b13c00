// src/debugger/cdp.rs
//
// Chrome DevTools Protocol client.
// One browser-level websocket carries everything: target discovery, flattened
// per-tab sessions, override commands and the navigation events that drive
// the session manager.
//
// Wire format (JSON text frames):
//   -> {"id": 7, "method": "Target.attachToTarget", "params": {...}, "sessionId"?: "..."}
//   <- {"id": 7, "result": {...}} | {"id": 7, "error": {"code": -32000, "message": "..."}}
//   <- {"method": "Target.targetInfoChanged", "params": {...}, "sessionId"?: "..."}

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::{DebugSession, DebuggerError, TabId, TargetInfo};
use crate::session::{LoadStatus, NavigationEvent};

// ============================================================================
// Configuration
// ============================================================================

/// Where to find the browser's remote-debugging endpoint
#[derive(Clone, Debug)]
pub struct CdpConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound for the HTTP discovery request
    pub discovery_timeout: Duration,
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9222,
            discovery_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// Response of `GET /json/version`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    #[serde(default)]
    browser: Option<String>,
    web_socket_debugger_url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Any frame received from the browser
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Incoming {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<ErrorBody>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetInfoWire {
    target_id: String,
    #[serde(rename = "type")]
    target_type: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    attached: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetInfoChangedParams {
    target_info: TargetInfoWire,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetDestroyedParams {
    target_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetachedFromTargetParams {
    session_id: String,
    #[serde(default)]
    target_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameWire {
    #[serde(default)]
    parent_id: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct FrameNavigatedParams {
    frame: FrameWire,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NavigatedWithinDocumentParams {
    frame_id: String,
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachResult {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetTargetsResult {
    target_infos: Vec<TargetInfoWire>,
}

// ============================================================================
// Event Translation
// ============================================================================

/// Translate a browser event into a navigation event.
/// `session_tab` is the tab owning the session the event arrived on, if any.
/// `Target.detachedFromTarget` is handled by the connection state, not here.
fn translate_event(method: &str, params: Value, session_tab: Option<&TabId>) -> Option<NavigationEvent> {
    match method {
        "Target.targetInfoChanged" => {
            let p: TargetInfoChangedParams = serde_json::from_value(params).ok()?;
            if p.target_info.target_type != "page" || p.target_info.url.is_empty() {
                return None;
            }
            Some(NavigationEvent::TabUpdated {
                tab: TabId(p.target_info.target_id),
                url: Some(p.target_info.url),
                status: None,
            })
        }
        "Target.targetDestroyed" => {
            let p: TargetDestroyedParams = serde_json::from_value(params).ok()?;
            Some(NavigationEvent::TabRemoved {
                tab: TabId(p.target_id),
            })
        }
        "Page.frameNavigated" => {
            let tab = session_tab?.clone();
            let p: FrameNavigatedParams = serde_json::from_value(params).ok()?;
            Some(NavigationEvent::BeforeNavigate {
                tab,
                main_frame: p.frame.parent_id.is_none(),
                url: p.frame.url,
            })
        }
        "Page.navigatedWithinDocument" => {
            let tab = session_tab?.clone();
            let p: NavigatedWithinDocumentParams = serde_json::from_value(params).ok()?;
            // A page target's main frame shares the target id
            let main_frame = p.frame_id == tab.0;
            Some(NavigationEvent::HistoryStateUpdated {
                tab,
                main_frame,
                url: p.url,
            })
        }
        "Page.loadEventFired" => Some(NavigationEvent::TabUpdated {
            tab: session_tab?.clone(),
            url: None,
            status: Some(LoadStatus::Complete),
        }),
        _ => None,
    }
}

/// Map a protocol error message onto the primitive's error kinds.
fn classify_error(tab: Option<&TabId>, method: &str, message: String) -> DebuggerError {
    let lower = message.to_ascii_lowercase();
    match tab {
        Some(tab) if lower.contains("no target with given id") => DebuggerError::TargetNotFound(tab.clone()),
        Some(tab) if lower.contains("session with given id not found") => {
            DebuggerError::NotAttached(tab.clone())
        }
        _ => DebuggerError::Command {
            method: method.to_string(),
            message,
        },
    }
}

// ============================================================================
// Connection State
// ============================================================================

struct PendingCall {
    reply: oneshot::Sender<Result<Value, String>>,
}

/// State shared between the client handle and the socket reader task
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, PendingCall>>,
    /// tab -> flattened session id
    sessions: Mutex<HashMap<TabId, String>>,
    /// Session ids we are detaching ourselves
    closing: Mutex<HashSet<String>>,
    /// Request ids of attach calls whose caller gave up waiting
    abandoned_attaches: Mutex<HashSet<u64>>,
}

/// Request id used for fire-and-forget frames. Real calls start at 1.
const UNTRACKED_ID: u64 = 0;

/// Detach frame for a session nobody owns any more
fn release_frame(session_id: &str) -> Message {
    let request = json!({
        "id": UNTRACKED_ID,
        "method": "Target.detachFromTarget",
        "params": { "sessionId": session_id },
    });
    Message::Text(request.to_string().into())
}

impl Shared {
    fn tab_for_session(&self, session_id: &str) -> Option<TabId> {
        self.sessions.lock().ok().and_then(|map| {
            map.iter()
                .find(|(_, sid)| sid.as_str() == session_id)
                .map(|(tab, _)| tab.clone())
        })
    }

    fn session_for_tab(&self, tab: &TabId) -> Option<String> {
        self.sessions.lock().ok().and_then(|map| map.get(tab).cloned())
    }

    /// Mark `session_id` as ours to close
    fn start_closing(&self, session_id: &str) {
        if let Ok(mut set) = self.closing.lock() {
            set.insert(session_id.to_string());
        }
    }

    /// Route one text frame: resolve a pending call or forward an event.
    /// Returns a session to release when an abandoned attach succeeds late.
    fn handle_frame(&self, text: &str, events: &mpsc::UnboundedSender<NavigationEvent>) -> Option<String> {
        let incoming: Incoming = match serde_json::from_str(text) {
            Ok(incoming) => incoming,
            Err(e) => {
                tlog!("[cdp] Dropping unparseable frame: {}", e);
                return None;
            }
        };

        if let Some(id) = incoming.id {
            let (call, abandoned) = match self.pending.lock() {
                Ok(mut map) => match map.remove(&id) {
                    Some(call) => (Some(call), false),
                    None => {
                        let abandoned = self
                            .abandoned_attaches
                            .lock()
                            .map(|mut set| set.remove(&id))
                            .unwrap_or(false);
                        (None, abandoned)
                    }
                },
                Err(_) => (None, false),
            };
            if let Some(call) = call {
                let result = match incoming.error {
                    Some(err) => Err(err.message),
                    None => Ok(incoming.result.unwrap_or(Value::Null)),
                };
                let _ = call.reply.send(result);
                return None;
            }
            if !abandoned {
                return None;
            }
            let session_id = incoming
                .result
                .as_ref()
                .and_then(|r| r.get("sessionId"))
                .and_then(Value::as_str)?
                .to_string();
            tlog!("[cdp] Releasing session {} from an attach that timed out", session_id);
            self.start_closing(&session_id);
            return Some(session_id);
        }

        let method = incoming.method?;

        if method == "Target.detachedFromTarget" {
            if let Some(event) = self.on_detached(incoming.params) {
                let _ = events.send(event);
            }
            return None;
        }

        let session_tab = incoming
            .session_id
            .as_deref()
            .and_then(|sid| self.tab_for_session(sid));
        if let Some(event) = translate_event(&method, incoming.params, session_tab.as_ref()) {
            if let NavigationEvent::TabRemoved { tab } = &event {
                if let Ok(mut map) = self.sessions.lock() {
                    map.remove(tab);
                }
            }
            let _ = events.send(event);
        }
        None
    }

    /// A session ended. Silent when we asked for it, a forced detach otherwise.
    fn on_detached(&self, params: Value) -> Option<NavigationEvent> {
        let p: DetachedFromTargetParams = serde_json::from_value(params).ok()?;
        let ours = self
            .closing
            .lock()
            .map(|mut set| set.remove(&p.session_id))
            .unwrap_or(false);

        let tab = self
            .tab_for_session(&p.session_id)
            .or_else(|| p.target_id.clone().map(TabId));
        if let (Some(tab), Ok(mut map)) = (tab.as_ref(), self.sessions.lock()) {
            if map.get(tab).map(|sid| sid == &p.session_id).unwrap_or(false) {
                map.remove(tab);
            }
        }

        if ours {
            return None;
        }
        Some(NavigationEvent::ForcedDetach {
            tab: tab?,
            reason: "target_detached".to_string(),
        })
    }

    /// Fail every outstanding call once the socket is gone.
    fn fail_pending(&self) {
        if let Ok(mut map) = self.pending.lock() {
            for (_, call) in map.drain() {
                let _ = call.reply.send(Err("browser connection closed".to_string()));
            }
        }
        if let Ok(mut map) = self.sessions.lock() {
            map.clear();
        }
        if let Ok(mut set) = self.abandoned_attaches.lock() {
            set.clear();
        }
    }
}

/// Owns a call's reply channel. Dropping it before the reply was read
/// (e.g. on timeout) removes the pending entry, and for an attach makes
/// sure a session created late is released rather than leaked.
struct PendingGuard<'a> {
    browser: &'a CdpBrowser,
    id: u64,
    attach: bool,
    response: oneshot::Receiver<Result<Value, String>>,
    settled: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let shared = &self.browser.shared;
        let still_pending = match shared.pending.lock() {
            Ok(mut map) => {
                let found = map.remove(&self.id).is_some();
                // Marked under the pending lock so the reader never misses it
                if found && self.attach {
                    if let Ok(mut set) = shared.abandoned_attaches.lock() {
                        set.insert(self.id);
                    }
                }
                found
            }
            Err(_) => false,
        };
        if still_pending || !self.attach {
            return;
        }
        // Answered, but the caller stopped waiting before reading it
        if let Ok(Ok(value)) = self.response.try_recv() {
            if let Some(session_id) = value.get("sessionId").and_then(Value::as_str) {
                tlog!("[cdp] Releasing session {} from an attach that timed out", session_id);
                self.browser.release(session_id);
            }
        }
    }
}

// ============================================================================
// Browser Client
// ============================================================================

/// Connection to a Chromium browser's DevTools endpoint
pub struct CdpBrowser {
    outgoing: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

/// Resolve the browser-level websocket URL via the HTTP discovery endpoint.
async fn discover_websocket_url(config: &CdpConfig) -> Result<Url, DebuggerError> {
    let endpoint = Url::parse(&format!("http://{}:{}/json/version", config.host, config.port))
        .map_err(|e| DebuggerError::Transport(format!("Invalid debugger address: {}", e)))?;

    let client = reqwest::Client::builder()
        .user_agent("tabmask")
        .timeout(config.discovery_timeout)
        .build()
        .map_err(|e| DebuggerError::Transport(format!("Failed to create HTTP client: {}", e)))?;

    let response = client
        .get(endpoint.clone())
        .send()
        .await
        .map_err(|e| DebuggerError::Transport(format!("Failed to reach {}: {}", endpoint, e)))?;

    if !response.status().is_success() {
        return Err(DebuggerError::Transport(format!(
            "Discovery endpoint returned status: {}",
            response.status()
        )));
    }

    let info: VersionInfo = response
        .json()
        .await
        .map_err(|e| DebuggerError::Protocol(format!("Failed to parse version info: {}", e)))?;

    tlog!(
        "[cdp] Found {} at {}",
        info.browser.as_deref().unwrap_or("browser"),
        info.web_socket_debugger_url
    );

    Url::parse(&info.web_socket_debugger_url)
        .map_err(|e| DebuggerError::Protocol(format!("Invalid websocket URL: {}", e)))
}

impl CdpBrowser {
    /// Connect to the browser and start target discovery.
    /// Returns the client and the stream of navigation events it produces.
    /// The stream ends when the browser connection closes.
    pub async fn connect(
        config: &CdpConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<NavigationEvent>), DebuggerError> {
        let ws_url = discover_websocket_url(config).await?;

        let (stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| DebuggerError::Transport(format!("Websocket connect failed: {}", e)))?;
        let (mut sink, mut source) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<NavigationEvent>();
        let shared = Arc::new(Shared::default());

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    tlog!("[cdp] Send failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_shared = shared.clone();
        let releases = outgoing.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Some(session_id) = reader_shared.handle_frame(text.as_str(), &events_tx) {
                            let _ = releases.send(release_frame(&session_id));
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tlog!("[cdp] Receive failed: {}", e);
                        break;
                    }
                }
            }
            reader_shared.fail_pending();
            tlog!("[cdp] Browser connection closed");
        });

        let browser = Arc::new(Self {
            outgoing,
            shared,
            next_id: AtomicU64::new(1),
        });

        browser
            .call(None, None, "Target.setDiscoverTargets", json!({ "discover": true }))
            .await?;

        Ok((browser, events_rx))
    }

    /// Send one request and wait for its response.
    async fn call(
        &self,
        tab: Option<&TabId>,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, DebuggerError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            request["sessionId"] = json!(session_id);
        }

        let (reply, response) = oneshot::channel();
        if let Ok(mut map) = self.shared.pending.lock() {
            map.insert(id, PendingCall { reply });
        }
        let mut guard = PendingGuard {
            browser: self,
            id,
            attach: method == "Target.attachToTarget",
            response,
            settled: false,
        };

        if self.outgoing.send(Message::Text(request.to_string().into())).is_err() {
            guard.settled = true;
            if let Ok(mut map) = self.shared.pending.lock() {
                map.remove(&id);
            }
            return Err(DebuggerError::Closed);
        }

        let reply = (&mut guard.response).await;
        guard.settled = true;
        match reply {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(classify_error(tab, method, message)),
            Err(_) => Err(DebuggerError::Closed),
        }
    }

    /// Detach a session without waiting for the answer
    fn release(&self, session_id: &str) {
        self.shared.start_closing(session_id);
        let _ = self.outgoing.send(release_frame(session_id));
    }
}

#[async_trait]
impl DebugSession for CdpBrowser {
    async fn attach(&self, tab: &TabId, protocol_version: &str) -> Result<(), DebuggerError> {
        if self.shared.session_for_tab(tab).is_some() {
            return Err(DebuggerError::AlreadyAttached(tab.clone()));
        }

        let result = self
            .call(
                Some(tab),
                None,
                "Target.attachToTarget",
                json!({ "targetId": tab.as_str(), "flatten": true }),
            )
            .await?;
        let attached: AttachResult = serde_json::from_value(result)
            .map_err(|e| DebuggerError::Protocol(format!("Bad attachToTarget result: {}", e)))?;

        let raced = match self.shared.sessions.lock() {
            Ok(map) if map.contains_key(tab) => true,
            Ok(mut map) => {
                map.insert(tab.clone(), attached.session_id.clone());
                false
            }
            Err(_) => false,
        };
        if raced {
            // A concurrent attach won; release the duplicate session
            if let Ok(mut set) = self.shared.closing.lock() {
                set.insert(attached.session_id.clone());
            }
            let _ = self
                .call(
                    Some(tab),
                    None,
                    "Target.detachFromTarget",
                    json!({ "sessionId": attached.session_id }),
                )
                .await;
            return Err(DebuggerError::AlreadyAttached(tab.clone()));
        }
        tlog!(
            "[cdp] Attached to {} (session {}, protocol {})",
            tab,
            attached.session_id,
            protocol_version
        );

        // Main-frame navigation events only flow once the Page domain is on
        if let Err(e) = self
            .call(Some(tab), Some(&attached.session_id), "Page.enable", json!({}))
            .await
        {
            tlog!("[cdp] Page.enable failed for {}: {}", tab, e);
        }

        Ok(())
    }

    async fn send_command(
        &self,
        tab: &TabId,
        method: &str,
        params: Value,
    ) -> Result<Value, DebuggerError> {
        let session_id = self
            .shared
            .session_for_tab(tab)
            .ok_or_else(|| DebuggerError::NotAttached(tab.clone()))?;
        self.call(Some(tab), Some(&session_id), method, params).await
    }

    async fn detach(&self, tab: &TabId) -> Result<(), DebuggerError> {
        let session_id = self
            .shared
            .sessions
            .lock()
            .ok()
            .and_then(|mut map| map.remove(tab))
            .ok_or_else(|| DebuggerError::NotAttached(tab.clone()))?;

        if let Ok(mut set) = self.shared.closing.lock() {
            set.insert(session_id.clone());
        }

        let result = self
            .call(
                Some(tab),
                None,
                "Target.detachFromTarget",
                json!({ "sessionId": session_id }),
            )
            .await;

        if result.is_err() {
            if let Ok(mut set) = self.shared.closing.lock() {
                set.remove(&session_id);
            }
        }
        result.map(|_| ())
    }

    async fn list_targets(&self) -> Result<Vec<TargetInfo>, DebuggerError> {
        let result = self.call(None, None, "Target.getTargets", json!({})).await?;
        let parsed: GetTargetsResult = serde_json::from_value(result)
            .map_err(|e| DebuggerError::Protocol(format!("Bad getTargets result: {}", e)))?;
        Ok(parsed
            .target_infos
            .into_iter()
            .filter(|t| t.target_type == "page")
            .map(|t| TargetInfo {
                tab_id: TabId(t.target_id),
                attached: t.attached,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab() -> TabId {
        TabId::from("A1B2")
    }

    #[test]
    fn test_target_info_changed_becomes_tab_update() {
        let params = json!({
            "targetInfo": {
                "targetId": "A1B2",
                "type": "page",
                "title": "Example",
                "url": "https://example.com/",
                "attached": false
            }
        });
        let event = translate_event("Target.targetInfoChanged", params, None);
        assert_eq!(
            event,
            Some(NavigationEvent::TabUpdated {
                tab: tab(),
                url: Some("https://example.com/".to_string()),
                status: None,
            })
        );
    }

    #[test]
    fn test_non_page_targets_ignored() {
        let params = json!({
            "targetInfo": {
                "targetId": "W1",
                "type": "service_worker",
                "url": "https://example.com/sw.js"
            }
        });
        assert_eq!(translate_event("Target.targetInfoChanged", params, None), None);
    }

    #[test]
    fn test_frame_navigated_main_and_sub_frame() {
        let main = json!({ "frame": { "id": "A1B2", "url": "https://example.com/" } });
        let sub = json!({ "frame": { "id": "F9", "parentId": "A1B2", "url": "https://ads.example/" } });

        match translate_event("Page.frameNavigated", main, Some(&tab())) {
            Some(NavigationEvent::BeforeNavigate { main_frame, .. }) => assert!(main_frame),
            other => panic!("unexpected {:?}", other),
        }
        match translate_event("Page.frameNavigated", sub, Some(&tab())) {
            Some(NavigationEvent::BeforeNavigate { main_frame, .. }) => assert!(!main_frame),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_session_events_need_a_known_session() {
        let params = json!({ "frame": { "id": "A1B2", "url": "https://example.com/" } });
        assert_eq!(translate_event("Page.frameNavigated", params, None), None);
    }

    #[test]
    fn test_navigated_within_document() {
        let params = json!({ "frameId": "A1B2", "url": "https://example.com/#next" });
        assert_eq!(
            translate_event("Page.navigatedWithinDocument", params, Some(&tab())),
            Some(NavigationEvent::HistoryStateUpdated {
                tab: tab(),
                main_frame: true,
                url: "https://example.com/#next".to_string(),
            })
        );
    }

    #[test]
    fn test_load_event_is_complete_status() {
        assert_eq!(
            translate_event("Page.loadEventFired", json!({ "timestamp": 1.0 }), Some(&tab())),
            Some(NavigationEvent::TabUpdated {
                tab: tab(),
                url: None,
                status: Some(LoadStatus::Complete),
            })
        );
    }

    #[test]
    fn test_classify_error() {
        let err = classify_error(Some(&tab()), "Target.attachToTarget", "No target with given id found".to_string());
        assert_eq!(err, DebuggerError::TargetNotFound(tab()));

        let err = classify_error(
            Some(&tab()),
            "Emulation.setTimezoneOverride",
            "Timezone override is already in effect".to_string(),
        );
        assert!(err.is_already_in_effect());
    }

    #[test]
    fn test_response_resolves_pending_call() {
        let shared = Shared::default();
        let (reply, mut rx) = oneshot::channel();
        shared.pending.lock().unwrap().insert(3, PendingCall { reply });
        let (events, _events_rx) = mpsc::unbounded_channel();

        shared.handle_frame(r#"{"id":3,"result":{"sessionId":"S1"}}"#, &events);

        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!(result["sessionId"], "S1");
        assert!(shared.pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_error_response_carries_message() {
        let shared = Shared::default();
        let (reply, mut rx) = oneshot::channel();
        shared.pending.lock().unwrap().insert(4, PendingCall { reply });
        let (events, _events_rx) = mpsc::unbounded_channel();

        shared.handle_frame(
            r#"{"id":4,"error":{"code":-32000,"message":"Timezone override is already in effect"}}"#,
            &events,
        );

        assert_eq!(
            rx.try_recv().unwrap(),
            Err("Timezone override is already in effect".to_string())
        );
    }

    #[test]
    fn test_self_initiated_detach_is_silent() {
        let shared = Shared::default();
        shared.sessions.lock().unwrap().insert(tab(), "S1".to_string());
        shared.closing.lock().unwrap().insert("S1".to_string());
        let (events, mut events_rx) = mpsc::unbounded_channel();

        shared.handle_frame(
            r#"{"method":"Target.detachedFromTarget","params":{"sessionId":"S1","targetId":"A1B2"}}"#,
            &events,
        );

        assert!(events_rx.try_recv().is_err());
        assert!(shared.closing.lock().unwrap().is_empty());
    }

    #[test]
    fn test_host_detach_is_forced() {
        let shared = Shared::default();
        shared.sessions.lock().unwrap().insert(tab(), "S1".to_string());
        let (events, mut events_rx) = mpsc::unbounded_channel();

        shared.handle_frame(
            r#"{"method":"Target.detachedFromTarget","params":{"sessionId":"S1","targetId":"A1B2"}}"#,
            &events,
        );

        match events_rx.try_recv() {
            Ok(NavigationEvent::ForcedDetach { tab: t, .. }) => assert_eq!(t, tab()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(shared.session_for_tab(&tab()).is_none());
    }

    #[test]
    fn test_session_event_routed_to_owning_tab() {
        let shared = Shared::default();
        shared.sessions.lock().unwrap().insert(tab(), "S1".to_string());
        let (events, mut events_rx) = mpsc::unbounded_channel();

        shared.handle_frame(
            r#"{"method":"Page.navigatedWithinDocument","sessionId":"S1","params":{"frameId":"A1B2","url":"https://example.com/#a"}}"#,
            &events,
        );

        assert!(matches!(
            events_rx.try_recv(),
            Ok(NavigationEvent::HistoryStateUpdated { main_frame: true, .. })
        ));
    }

    #[test]
    fn test_fail_pending_on_close() {
        let shared = Shared::default();
        let (reply, mut rx) = oneshot::channel();
        shared.pending.lock().unwrap().insert(9, PendingCall { reply });

        shared.fail_pending();

        assert!(rx.try_recv().unwrap().is_err());
    }

    fn offline_browser() -> (CdpBrowser, mpsc::UnboundedReceiver<Message>) {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let browser = CdpBrowser {
            outgoing,
            shared: Arc::new(Shared::default()),
            next_id: AtomicU64::new(1),
        };
        (browser, outgoing_rx)
    }

    #[tokio::test]
    async fn test_timed_out_call_leaves_nothing_pending() {
        let (browser, _sent) = offline_browser();
        let call = browser.call(None, None, "Target.getTargets", json!({}));
        assert!(tokio::time::timeout(Duration::from_millis(10), call).await.is_err());

        assert!(browser.shared.pending.lock().unwrap().is_empty());
        assert!(browser.shared.abandoned_attaches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_late_attach_after_timeout_is_released() {
        let (browser, mut sent) = offline_browser();
        let t = tab();
        let attach = browser.attach(&t, "1.3");
        assert!(tokio::time::timeout(Duration::from_millis(10), attach).await.is_err());

        assert!(browser.shared.pending.lock().unwrap().is_empty());
        assert!(browser.shared.abandoned_attaches.lock().unwrap().contains(&1));
        assert!(sent.try_recv().is_ok());

        let (events, _events_rx) = mpsc::unbounded_channel();
        let released = browser
            .shared
            .handle_frame(r#"{"id":1,"result":{"sessionId":"S9"}}"#, &events);

        assert_eq!(released.as_deref(), Some("S9"));
        assert!(browser.shared.closing.lock().unwrap().contains("S9"));
        assert!(browser.shared.session_for_tab(&tab()).is_none());
        assert!(browser.shared.abandoned_attaches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unread_attach_reply_is_released_on_drop() {
        let (browser, mut sent) = offline_browser();
        let (events, _events_rx) = mpsc::unbounded_channel();
        let t = tab();
        {
            let attach = browser.attach(&t, "1.3");
            tokio::pin!(attach);
            // Send the request, then answer it without letting the caller read the reply
            assert!(futures::poll!(attach.as_mut()).is_pending());
            assert_eq!(
                browser
                    .shared
                    .handle_frame(r#"{"id":1,"result":{"sessionId":"S7"}}"#, &events),
                None
            );
        }

        assert!(browser.shared.closing.lock().unwrap().contains("S7"));
        let _attach_request = sent.try_recv().unwrap();
        let Ok(Message::Text(release)) = sent.try_recv() else {
            panic!("expected a detach frame");
        };
        let release: Value = serde_json::from_str(release.as_str()).unwrap();
        assert_eq!(release["method"], "Target.detachFromTarget");
        assert_eq!(release["params"]["sessionId"], "S7");
    }
}
