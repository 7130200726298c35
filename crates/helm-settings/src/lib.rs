//! # helm-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`Settings::default()`]
//! 2. **User file**: `~/.helm/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `HELM_*` overrides (highest priority)
//!
//! There is no global instance. The composition root loads settings once and
//! passes what each component needs.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, helm_home, load_settings, load_settings_from_path, settings_path};
pub use types::*;
