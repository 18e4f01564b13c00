// src/settings.rs
//
// Spoof configuration as read from the settings store, and the one-shot
// warning signal written when the browser forcibly ends a session.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::store_manager::{SettingsStore, StoreError};

// Store keys
pub const KEY_ENABLED: &str = "enabled";
pub const KEY_CONFIGURATION: &str = "configuration";
pub const KEY_TIMEZONE: &str = "timezone";
pub const KEY_LOCALE: &str = "locale";
pub const KEY_LAT: &str = "lat";
pub const KEY_LON: &str = "lon";
pub const KEY_ACTIVE_TABS: &str = "activeTabs";
pub const KEY_SHOW_WARNING: &str = "showWarningMessage";
pub const KEY_WARNING_MESSAGE: &str = "warningMessage";

/// Keys making up one settings snapshot
pub const SPOOF_KEYS: [&str; 6] = [
    KEY_ENABLED,
    KEY_CONFIGURATION,
    KEY_TIMEZONE,
    KEY_LOCALE,
    KEY_LAT,
    KEY_LON,
];

/// Shown when the browser ends a session we did not close
pub const FORCED_DETACH_MESSAGE: &str = "The browser closed the debugging session for a tab, so its \
timezone, locale and location are no longer spoofed. Reload the tab to re-apply them.";

/// Coordinates for a geolocation override
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// Where the override values came from. Informational only: the session
/// manager acts on the values, never on this label.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Configuration {
    /// No overrides chosen
    #[default]
    BrowserDefault,
    /// Values typed in by hand
    Custom,
    /// Values looked up from the public IP address
    IpAddress,
    /// A named location preset, e.g. `tokyo`
    Preset(String),
}

impl Configuration {
    pub fn as_str(&self) -> &str {
        match self {
            Configuration::BrowserDefault => "browserDefault",
            Configuration::Custom => "custom",
            Configuration::IpAddress => "ipAddress",
            Configuration::Preset(name) => name,
        }
    }
}

impl From<String> for Configuration {
    fn from(value: String) -> Self {
        match value.trim() {
            "" | "browserDefault" => Configuration::BrowserDefault,
            "custom" => Configuration::Custom,
            "ipAddress" => Configuration::IpAddress,
            name => Configuration::Preset(name.to_string()),
        }
    }
}

impl From<Configuration> for String {
    fn from(value: Configuration) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable snapshot of the spoof configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpoofSettings {
    pub enabled: bool,
    pub configuration: Configuration,
    pub timezone: Option<String>,
    pub locale: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl Default for SpoofSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            configuration: Configuration::BrowserDefault,
            timezone: None,
            locale: None,
            lat: None,
            lon: None,
        }
    }
}

/// Non-empty string, else None. Empty strings mean "not set".
fn string_field(entries: &Map<String, Value>, key: &str) -> Option<String> {
    entries
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Finite number, also accepting numeric strings written by form inputs.
fn number_field(entries: &Map<String, Value>, key: &str) -> Option<f64> {
    let value = entries.get(key)?;
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

impl SpoofSettings {
    /// Build from a store mapping. Unknown or malformed values count as absent.
    pub fn from_entries(entries: &Map<String, Value>) -> Self {
        Self {
            enabled: entries
                .get(KEY_ENABLED)
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            configuration: string_field(entries, KEY_CONFIGURATION)
                .map(Configuration::from)
                .unwrap_or_default(),
            timezone: string_field(entries, KEY_TIMEZONE),
            locale: string_field(entries, KEY_LOCALE),
            lat: number_field(entries, KEY_LAT),
            lon: number_field(entries, KEY_LON),
        }
    }

    /// Read one snapshot from the store
    pub async fn load(store: &dyn SettingsStore) -> Result<Self, StoreError> {
        let entries = store.get(&SPOOF_KEYS).await?;
        Ok(Self::from_entries(&entries))
    }

    /// Store representation; absent fields are written as `null` (deleted).
    pub fn to_entries(&self) -> Map<String, Value> {
        let mut entries = Map::new();
        entries.insert(KEY_ENABLED.to_string(), json!(self.enabled));
        entries.insert(KEY_CONFIGURATION.to_string(), json!(self.configuration));
        entries.insert(KEY_TIMEZONE.to_string(), json!(self.timezone));
        entries.insert(KEY_LOCALE.to_string(), json!(self.locale));
        entries.insert(KEY_LAT.to_string(), json!(self.lat));
        entries.insert(KEY_LON.to_string(), json!(self.lon));
        entries
    }

    /// Latitude and longitude, only when both are set
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(Coordinates { lat, lon }),
            _ => None,
        }
    }

    pub fn has_overrides(&self) -> bool {
        self.timezone.is_some() || self.locale.is_some() || self.coordinates().is_some()
    }

    /// Whether tabs should carry a debugging session under these settings
    pub fn wants_attach(&self) -> bool {
        self.enabled && self.has_overrides()
    }
}

// ============================================================================
// Warning Signal
// ============================================================================

/// One-shot message for the configuration surface
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WarningSignal {
    pub pending: bool,
    pub message: String,
}

impl WarningSignal {
    /// Raise the warning with the given message
    pub async fn raise(store: &dyn SettingsStore, message: &str) -> Result<(), StoreError> {
        let mut entries = Map::new();
        entries.insert(KEY_SHOW_WARNING.to_string(), json!(true));
        entries.insert(KEY_WARNING_MESSAGE.to_string(), json!(message));
        store.set(entries).await
    }

    /// Read the warning and clear it in the same step.
    /// Returns None when nothing is pending.
    pub async fn take(store: &dyn SettingsStore) -> Result<Option<Self>, StoreError> {
        let entries = store.get(&[KEY_SHOW_WARNING, KEY_WARNING_MESSAGE]).await?;
        let pending = entries
            .get(KEY_SHOW_WARNING)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !pending {
            return Ok(None);
        }

        let message = string_field(&entries, KEY_WARNING_MESSAGE).unwrap_or_default();
        let mut cleared = Map::new();
        cleared.insert(KEY_SHOW_WARNING.to_string(), json!(false));
        cleared.insert(KEY_WARNING_MESSAGE.to_string(), json!(""));
        store.set(cleared).await?;

        Ok(Some(Self { pending, message }))
    }
}
