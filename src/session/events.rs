// src/session/events.rs
//
// Navigation and lifecycle events consumed by the session manager, and the
// routing decision each one produces before any settings are read.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::debugger::TabId;

/// Page load status carried by a generic tab update
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Loading,
    Complete,
}

/// Events delivered by the navigation event source
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NavigationEvent {
    /// A frame is about to navigate (fresh document)
    BeforeNavigate {
        tab: TabId,
        main_frame: bool,
        url: String,
    },
    /// Same-document navigation (history.pushState and friends)
    HistoryStateUpdated {
        tab: TabId,
        main_frame: bool,
        url: String,
    },
    /// Generic tab update: a new URL and/or load status
    TabUpdated {
        tab: TabId,
        url: Option<String>,
        status: Option<LoadStatus>,
    },
    TabRemoved {
        tab: TabId,
    },
    /// The host ended our debugging session
    ForcedDetach {
        tab: TabId,
        reason: String,
    },
}

impl NavigationEvent {
    pub fn tab(&self) -> &TabId {
        match self {
            NavigationEvent::BeforeNavigate { tab, .. }
            | NavigationEvent::HistoryStateUpdated { tab, .. }
            | NavigationEvent::TabUpdated { tab, .. }
            | NavigationEvent::TabRemoved { tab }
            | NavigationEvent::ForcedDetach { tab, .. } => tab,
        }
    }
}

/// What a navigation-type event asks the manager to do
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Route {
    /// Nothing to do (sub-frame navigation, loading status, ...)
    Ignore,
    /// Tab left http(s): tear down without reading settings
    Detach { url: Option<String> },
    /// Tab is on an http(s) page: read settings and decide
    Evaluate { url: String },
}

/// True for http:// and https:// URLs only.
pub fn is_http_url(url: &str) -> bool {
    Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Route a navigation event. `known_url` is the tab's last recorded URL and is
/// used when a "load complete" update arrives without one.
pub(crate) fn route(event: &NavigationEvent, known_url: Option<&str>) -> Route {
    match event {
        NavigationEvent::BeforeNavigate {
            main_frame, url, ..
        }
        | NavigationEvent::HistoryStateUpdated {
            main_frame, url, ..
        } => {
            if !main_frame {
                Route::Ignore
            } else if is_http_url(url) {
                Route::Evaluate { url: url.clone() }
            } else {
                Route::Detach {
                    url: Some(url.clone()),
                }
            }
        }
        NavigationEvent::TabUpdated { url, status, .. } => {
            let complete = *status == Some(LoadStatus::Complete);
            let url = match (url, status) {
                // Title or attach-flag changes repeat the current URL
                (Some(url), _) if !complete && known_url == Some(url.as_str()) => return Route::Ignore,
                (Some(url), _) => url.clone(),
                (None, Some(LoadStatus::Complete)) => match known_url {
                    Some(known) => known.to_string(),
                    None => return Route::Ignore,
                },
                (None, _) => return Route::Ignore,
            };
            if is_http_url(&url) {
                Route::Evaluate { url }
            } else {
                Route::Detach { url: Some(url) }
            }
        }
        NavigationEvent::TabRemoved { .. } | NavigationEvent::ForcedDetach { .. } => Route::Ignore,
    }
}
