// src/session/overrides.rs
//
// Issues and clears the three Emulation overrides on an attached tab.
// Each command is independent: one failing never blocks or rolls back another.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::debugger::{bounded, DebugSession, DebuggerError, TabId};
use crate::settings::SpoofSettings;

pub const SET_TIMEZONE: &str = "Emulation.setTimezoneOverride";
pub const SET_GEOLOCATION: &str = "Emulation.setGeolocationOverride";
pub const CLEAR_GEOLOCATION: &str = "Emulation.clearGeolocationOverride";
pub const SET_LOCALE: &str = "Emulation.setLocaleOverride";

/// Accuracy in meters reported with spoofed coordinates
pub const GEOLOCATION_ACCURACY: f64 = 1.0;

/// Result of one override command
#[derive(Clone, Debug, PartialEq)]
pub enum OverrideStatus {
    Applied,
    /// Not requested by the settings
    Skipped,
    Failed(DebuggerError),
}

impl OverrideStatus {
    fn from_result(result: Result<Value, DebuggerError>) -> Self {
        match result {
            Ok(_) => OverrideStatus::Applied,
            // Re-applying an identical override is reported as an error by the browser
            Err(e) if e.is_already_in_effect() => OverrideStatus::Applied,
            Err(e) => OverrideStatus::Failed(e),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, OverrideStatus::Failed(_))
    }
}

/// Per-kind outcome of `OverrideApplier::apply`
#[derive(Clone, Debug, PartialEq)]
pub struct ApplyOutcome {
    pub timezone: OverrideStatus,
    pub geolocation: OverrideStatus,
    pub locale: OverrideStatus,
}

impl ApplyOutcome {
    /// A command reported that the tab no longer has our session
    pub fn session_lost(&self) -> bool {
        [&self.timezone, &self.geolocation, &self.locale]
            .into_iter()
            .any(|s| matches!(s, OverrideStatus::Failed(e) if e.is_session_lost()))
    }

    /// Short "timezone=applied geolocation=skipped ..." form for logs
    pub fn summary(&self) -> String {
        fn word(status: &OverrideStatus) -> String {
            match status {
                OverrideStatus::Applied => "applied".to_string(),
                OverrideStatus::Skipped => "skipped".to_string(),
                OverrideStatus::Failed(e) => format!("failed ({})", e),
            }
        }
        format!(
            "timezone={} geolocation={} locale={}",
            word(&self.timezone),
            word(&self.geolocation),
            word(&self.locale)
        )
    }
}

/// Sends override commands through the debugging primitive
#[derive(Clone)]
pub struct OverrideApplier {
    debugger: Arc<dyn DebugSession>,
    timeout: Duration,
}

impl OverrideApplier {
    pub fn new(debugger: Arc<dyn DebugSession>, timeout: Duration) -> Self {
        Self { debugger, timeout }
    }

    async fn send(&self, tab: &TabId, method: &str, params: Value) -> Result<Value, DebuggerError> {
        bounded(method, self.timeout, self.debugger.send_command(tab, method, params)).await
    }

    /// Issue the overrides the settings ask for, concurrently.
    pub async fn apply(&self, tab: &TabId, settings: &SpoofSettings) -> ApplyOutcome {
        let timezone = async {
            match &settings.timezone {
                Some(tz) => OverrideStatus::from_result(
                    self.send(tab, SET_TIMEZONE, json!({ "timezoneId": tz })).await,
                ),
                None => OverrideStatus::Skipped,
            }
        };

        let geolocation = async {
            match settings.coordinates() {
                Some(c) => OverrideStatus::from_result(
                    self.send(
                        tab,
                        SET_GEOLOCATION,
                        json!({
                            "latitude": c.lat,
                            "longitude": c.lon,
                            "accuracy": GEOLOCATION_ACCURACY,
                        }),
                    )
                    .await,
                ),
                None => OverrideStatus::Skipped,
            }
        };

        let locale = async {
            match &settings.locale {
                Some(locale) => OverrideStatus::from_result(
                    self.send(tab, SET_LOCALE, json!({ "locale": locale })).await,
                ),
                None => OverrideStatus::Skipped,
            }
        };

        let (timezone, geolocation, locale) = futures::join!(timezone, geolocation, locale);
        ApplyOutcome {
            timezone,
            geolocation,
            locale,
        }
    }

    /// Clear all three overrides, concurrently and best effort.
    /// Returns the number of clear commands that failed.
    pub async fn clear(&self, tab: &TabId) -> usize {
        let (geo, tz, locale) = futures::join!(
            self.send(tab, CLEAR_GEOLOCATION, json!({})),
            // An empty id restores the host timezone
            self.send(tab, SET_TIMEZONE, json!({ "timezoneId": "" })),
            // Omitting the locale restores the host locale
            self.send(tab, SET_LOCALE, json!({})),
        );

        let mut failures = 0;
        for (method, result) in [(CLEAR_GEOLOCATION, geo), (SET_TIMEZONE, tz), (SET_LOCALE, locale)] {
            if let Err(e) = result {
                tlog!("[OverrideApplier] Clear {} on {} failed: {}", method, tab, e);
                failures += 1;
            }
        }
        failures
    }
}
