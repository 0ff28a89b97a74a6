//! # eman-settings
//!
//! Configuration for the Eman broker, loaded from three layers (in priority
//! order):
//! 1. **Compiled defaults**: [`EmanSettings::default()`]
//! 2. **Settings file**: `~/.eman/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `EMAN_*` and `PORT` overrides
//!
//! Command-line flags are applied on top by the binary.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, load_with_env, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = EmanSettings::default();
        let path = settings_path();
        assert!(path.ends_with(".eman/settings.json"));
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = EmanSettings::default();
        assert!(loader::validate(&settings).is_ok());
        assert_eq!(settings.server.port, 9001);
        assert_eq!(settings.handshake.timeout_ms, 2000);
        assert_eq!(settings.logging.level, "info");
    }
}
