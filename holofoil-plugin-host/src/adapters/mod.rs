//! Contracts between plugins and the viewer's UI layers.
//!
//! Activation wires a plugin's entry points into these adapters;
//! deactivation removes them again without touching the sandbox.

pub mod mechanic;
pub mod settings;
pub mod source;
pub mod theme;

pub use mechanic::{MechanicAdapter, PluginMechanic};
pub use settings::{SettingView, SettingsAdapter, SettingsGroup};
pub use source::{
    CollectionFetcher, EndpointCollectionFetcher, PluginCollectionFetcher, PluginSource, SourceAdapter,
};
pub use theme::{PluginTheme, ThemeAdapter};
