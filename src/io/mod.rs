//! Configuration loading.

pub mod settings;

pub use settings::{load_settings, OrbSettings, Settings, TrackerSettings};
