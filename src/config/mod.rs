//! Node configuration
//!
//! Defaults, an optional TOML file and environment variables, merged into
//! one [`Settings`] value that the binary threads through explicitly.

pub mod settings;

pub use settings::Settings;
