//! Autosave settings.
//!
//! Settings are persisted to localStorage so they survive page reloads.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Debounce tuning for the autosave controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutosaveSettings {
    /// Quiet period after the last edit before a save fires.
    pub debounce_ms: u32,
}

impl Default for AutosaveSettings {
    fn default() -> Self {
        Self { debounce_ms: 1000 }
    }
}

impl AutosaveSettings {
    /// localStorage key for persisting settings.
    const STORAGE_KEY: &'static str = "ouvidoria_autosave_settings";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce_ms(mut self, debounce_ms: u32) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(u64::from(self.debounce_ms))
    }

    /// Parses stored settings, falling back to defaults on malformed input.
    pub fn from_json(json: &str) -> Self {
        match serde_json::from_str(json) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Failed to parse autosave settings: {}", e);
                Self::default()
            }
        }
    }

    /// Load settings from localStorage.
    #[cfg(target_arch = "wasm32")]
    pub fn load() -> Self {
        let window = match web_sys::window() {
            Some(w) => w,
            None => return Self::default(),
        };

        let storage = match window.local_storage() {
            Ok(Some(s)) => s,
            _ => return Self::default(),
        };

        match storage.get_item(Self::STORAGE_KEY) {
            Ok(Some(json)) => {
                log::info!("Loaded autosave settings from localStorage");
                Self::from_json(&json)
            }
            _ => Self::default(),
        }
    }

    /// Native builds have no localStorage; defaults apply.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn load() -> Self {
        Self::default()
    }

    /// Save settings to localStorage.
    #[cfg(target_arch = "wasm32")]
    pub fn save(&self) {
        let Some(storage) = web_sys::window().and_then(|w| w.local_storage().ok().flatten()) else {
            return;
        };

        let json = match serde_json::to_string(self) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("Failed to serialize autosave settings: {}", e);
                return;
            }
        };

        if let Err(e) = storage.set_item(Self::STORAGE_KEY, &json) {
            log::warn!("Failed to save autosave settings: {:?}", e);
        } else {
            log::info!("Saved autosave settings to localStorage");
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn save(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_parsing() {
        assert_eq!(AutosaveSettings::default().debounce(), Duration::from_secs(1));
        assert_eq!(
            AutosaveSettings::from_json(r#"{"debounceMs":250}"#),
            AutosaveSettings::new().with_debounce_ms(250)
        );
        assert_eq!(AutosaveSettings::from_json("{}"), AutosaveSettings::default());
        assert_eq!(AutosaveSettings::from_json("oops"), AutosaveSettings::default());
    }
}
