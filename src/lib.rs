#[macro_use]
mod logging;

pub mod config;
pub mod debugger;
pub mod session;
pub mod settings;
pub mod store_manager;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use config::{AppConfig, ConfigError};
use debugger::{CdpBrowser, DebuggerError};
use session::SessionManager;
use settings::{Configuration, SpoofSettings, WarningSignal, KEY_ACTIVE_TABS, KEY_SHOW_WARNING};
use store_manager::{SettingsStore, StoreError, StoreManager};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("browser connection failed: {0}")]
    Debugger(#[from] DebuggerError),
    #[error("failed to start runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("no config directory on this platform, pass --config")]
    NoConfigDir,
}

// ============================================================================
// Command Line
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "tabmask", version, about = "Per-tab timezone, locale and geolocation overrides")]
pub struct Cli {
    /// Config file (default: <config dir>/tabmask/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the browser and keep tabs in line with the settings
    Run(RunArgs),
    /// Change the spoof settings. An empty value removes that override.
    Set(SetArgs),
    /// Remove every override
    Clear,
    /// Print the current settings and active tabs
    Show,
    /// Print and clear a pending warning
    Warning,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Remote-debugging port, overrides the config file
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct SetArgs {
    /// IANA timezone, e.g. Europe/Paris
    #[arg(long)]
    timezone: Option<String>,
    /// BCP 47 locale, e.g. fr-FR
    #[arg(long)]
    locale: Option<String>,
    #[arg(long, requires = "lon", allow_negative_numbers = true)]
    lat: Option<f64>,
    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    lon: Option<f64>,
    /// Label recorded with the values (custom, ipAddress or a preset name).
    /// Defaults to custom when any value is given.
    #[arg(long)]
    configuration: Option<String>,
    #[arg(long, conflicts_with = "disable")]
    enable: bool,
    #[arg(long)]
    disable: bool,
}

impl SetArgs {
    fn apply_to(self, settings: &mut SpoofSettings) {
        let edits_values =
            self.timezone.is_some() || self.locale.is_some() || self.lat.is_some();
        match self.configuration {
            Some(label) => settings.configuration = Configuration::from(label),
            None if edits_values => settings.configuration = Configuration::Custom,
            None => {}
        }
        if let Some(timezone) = self.timezone {
            settings.timezone = non_empty(timezone);
        }
        if let Some(locale) = self.locale {
            settings.locale = non_empty(locale);
        }
        if let (Some(lat), Some(lon)) = (self.lat, self.lon) {
            settings.lat = Some(lat);
            settings.lon = Some(lon);
        }
        if self.enable {
            settings.enabled = true;
        }
        if self.disable {
            settings.enabled = false;
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

// ============================================================================
// Entry Point
// ============================================================================

pub fn run() -> Result<(), AppError> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_path().ok_or(AppError::NoConfigDir)?,
    };
    let mut config = AppConfig::load(&config_path)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(AppError::Runtime)?;

    runtime.block_on(async move {
        match cli.command {
            Command::Run(args) => {
                if let Some(port) = args.port {
                    config.debugger.port = port;
                }
                serve(config).await
            }
            Command::Set(args) => set_settings(&config, args).await,
            Command::Clear => clear_settings(&config).await,
            Command::Show => show(&config).await,
            Command::Warning => take_warning(&config).await,
        }
    })
}

// ============================================================================
// Daemon
// ============================================================================

async fn serve(config: AppConfig) -> Result<(), AppError> {
    if let Some(dir) = &config.logging.dir {
        match logging::init_file_logging(dir) {
            Ok(path) => tlog!("[tabmask] Logging to {}", path.display()),
            Err(e) => tlog!("[tabmask] File logging disabled: {}", e),
        }
    }

    let store = StoreManager::open(config.store_path())?;
    let cdp = config.cdp();
    tlog!("[tabmask] Connecting to browser at {}:{}", cdp.host, cdp.port);
    let (browser, mut events) = CdpBrowser::connect(&cdp).await?;

    let manager = SessionManager::new(browser, store.clone(), config.manager_options());
    let mut current = match SpoofSettings::load(store.as_ref()).await {
        Ok(settings) => settings,
        Err(e) => {
            tlog!("[tabmask] Could not read settings: {}", e);
            SpoofSettings::default()
        }
    };

    let mut poll = tokio::time::interval(config.poll_interval());
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => manager.dispatch(event),
                None => {
                    tlog!("[tabmask] Browser connection ended");
                    break;
                }
            },
            _ = poll.tick() => {
                if let Some(next) = poll_settings(&store, &current).await {
                    current = next;
                    manager.settings_changed();
                }
            }
            _ = &mut interrupted => {
                tlog!("[tabmask] Interrupted, releasing tabs");
                break;
            }
        }
    }

    manager.shutdown().await;
    store.flush()?;
    logging::stop_file_logging();
    Ok(())
}

/// Pick up external edits. Returns the new settings when they differ from `current`.
async fn poll_settings(store: &Arc<StoreManager>, current: &SpoofSettings) -> Option<SpoofSettings> {
    match store.reload_if_changed() {
        Ok(true) => {}
        Ok(false) => return None,
        Err(e) => {
            tlog!("[tabmask] Settings reload failed: {}", e);
            return None;
        }
    }
    match SpoofSettings::load(store.as_ref()).await {
        Ok(next) if &next != current => Some(next),
        Ok(_) => None,
        Err(e) => {
            tlog!("[tabmask] Could not read settings: {}", e);
            None
        }
    }
}

// ============================================================================
// Settings Commands
// ============================================================================

async fn set_settings(config: &AppConfig, args: SetArgs) -> Result<(), AppError> {
    let store = StoreManager::open(config.store_path())?;
    let mut settings = SpoofSettings::load(store.as_ref()).await?;
    args.apply_to(&mut settings);
    store.set(settings.to_entries()).await?;
    store.flush()?;
    print_json(&json!(settings));
    Ok(())
}

/// No overrides, back to the browser's own values. `enabled` is kept.
fn cleared(previous: &SpoofSettings) -> SpoofSettings {
    SpoofSettings {
        enabled: previous.enabled,
        configuration: Configuration::BrowserDefault,
        ..SpoofSettings::default()
    }
}

async fn clear_settings(config: &AppConfig) -> Result<(), AppError> {
    let store = StoreManager::open(config.store_path())?;
    let settings = cleared(&SpoofSettings::load(store.as_ref()).await?);
    store.set(settings.to_entries()).await?;
    store.flush()?;
    println!("All overrides removed");
    Ok(())
}

async fn show(config: &AppConfig) -> Result<(), AppError> {
    let store = StoreManager::open(config.store_path())?;
    let settings = SpoofSettings::load(store.as_ref()).await?;
    print_json(&json!({
        "settings": settings,
        "activeTabs": store.get_value(KEY_ACTIVE_TABS).unwrap_or_else(|| json!([])),
        "warningPending": store.get_value(KEY_SHOW_WARNING).unwrap_or(json!(false)),
        "store": config.store_path(),
    }));
    Ok(())
}

async fn take_warning(config: &AppConfig) -> Result<(), AppError> {
    let store = StoreManager::open(config.store_path())?;
    match WarningSignal::take(store.as_ref()).await? {
        Some(warning) => println!("{}", warning.message),
        None => println!("No pending warning"),
    }
    store.flush()?;
    Ok(())
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => tlog!("[tabmask] Failed to format output: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("tabmask").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_set_applies_only_given_fields() {
        let Command::Set(args) = parse(&["set", "--timezone", "Asia/Tokyo", "--lat", "-33.87", "--lon", "151.21"]).command
        else {
            panic!("expected set");
        };
        let mut settings = SpoofSettings {
            locale: Some("ja-JP".to_string()),
            ..SpoofSettings::default()
        };
        args.apply_to(&mut settings);

        assert_eq!(settings.timezone.as_deref(), Some("Asia/Tokyo"));
        assert_eq!(settings.locale.as_deref(), Some("ja-JP"));
        assert_eq!(settings.lat, Some(-33.87));
        assert_eq!(settings.lon, Some(151.21));
        assert!(settings.enabled);
        assert_eq!(settings.configuration, Configuration::Custom);
    }

    #[test]
    fn test_set_records_given_configuration() {
        let Command::Set(args) =
            parse(&["set", "--configuration", "tokyo", "--timezone", "Asia/Tokyo"]).command
        else {
            panic!("expected set");
        };
        let mut settings = SpoofSettings::default();
        args.apply_to(&mut settings);
        assert_eq!(settings.configuration, Configuration::Preset("tokyo".to_string()));

        let Command::Set(args) = parse(&["set", "--disable"]).command else {
            panic!("expected set");
        };
        let mut settings = SpoofSettings {
            configuration: Configuration::IpAddress,
            ..SpoofSettings::default()
        };
        args.apply_to(&mut settings);
        assert_eq!(settings.configuration, Configuration::IpAddress);
    }

    #[test]
    fn test_clear_resets_to_browser_default() {
        let previous = SpoofSettings {
            enabled: false,
            configuration: Configuration::Custom,
            timezone: Some("Europe/Paris".to_string()),
            lat: Some(48.85),
            lon: Some(2.35),
            ..SpoofSettings::default()
        };
        let settings = cleared(&previous);
        assert_eq!(settings.configuration, Configuration::BrowserDefault);
        assert!(!settings.enabled);
        assert!(!settings.has_overrides());
    }

    #[test]
    fn test_set_empty_value_removes_override() {
        let Command::Set(args) = parse(&["set", "--locale", "", "--disable"]).command else {
            panic!("expected set");
        };
        let mut settings = SpoofSettings {
            locale: Some("fr-FR".to_string()),
            ..SpoofSettings::default()
        };
        args.apply_to(&mut settings);

        assert_eq!(settings.locale, None);
        assert!(!settings.enabled);
    }

    #[test]
    fn test_coordinates_must_come_in_pairs() {
        let result = Cli::try_parse_from(["tabmask", "set", "--lat", "48.85"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_enable_and_disable_conflict() {
        let result = Cli::try_parse_from(["tabmask", "set", "--enable", "--disable"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_accepts_port_and_global_config() {
        let cli = parse(&["run", "--port", "9333", "--config", "/tmp/tabmask.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/tabmask.toml")));
        match cli.command {
            Command::Run(args) => assert_eq!(args.port, Some(9333)),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
