//! Theme adapter. At most one plugin theme is applied at a time.

use holofoil_types::{PluginId, ThemeEntry};
use std::fmt::Write as _;
use std::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct PluginTheme {
    pub plugin_id: PluginId,
    pub theme: ThemeEntry,
    /// Contents of the theme's stylesheet asset, if it ships one.
    pub stylesheet: Option<String>,
}

#[derive(Default)]
pub struct ThemeAdapter {
    current: RwLock<Option<PluginTheme>>,
}

impl ThemeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a theme, replacing the current one. Returns the plugin whose
    /// theme was displaced, if it was a different plugin.
    pub fn apply_theme(&self, theme: PluginTheme) -> Option<PluginId> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let previous = current
            .take()
            .map(|t| t.plugin_id)
            .filter(|id| *id != theme.plugin_id);
        info!(plugin_id = %theme.plugin_id, theme = %theme.theme.name, "theme applied");
        *current = Some(theme);
        previous
    }

    pub fn remove_current_theme(&self) -> Option<PluginId> {
        self.current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(|t| t.plugin_id)
    }

    /// Removes the theme only if `plugin_id` owns it.
    pub fn remove_theme_of(&self, plugin_id: &PluginId) -> bool {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().is_some_and(|t| t.plugin_id == *plugin_id) {
            *current = None;
            true
        } else {
            false
        }
    }

    pub fn get_current_theme_id(&self) -> Option<PluginId> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|t| t.plugin_id.clone())
    }

    /// CSS for the current theme: custom properties on `:root`, then the
    /// stylesheet. Empty when no theme is applied.
    pub fn export_theme_css(&self) -> String {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        let Some(theme) = current.as_ref() else {
            return String::new();
        };

        let mut css = format!("/* {} ({}) */\n:root {{\n", theme.theme.name, theme.plugin_id);
        for (name, value) in &theme.theme.variables {
            if !is_css_ident(name) || !is_safe_css_value(value) {
                warn!(plugin_id = %theme.plugin_id, variable = %name, "skipping unsafe theme variable");
                continue;
            }
            let _ = writeln!(css, "  --{name}: {value};");
        }
        css.push_str("}\n");
        if let Some(sheet) = &theme.stylesheet {
            css.push_str(sheet);
            if !sheet.ends_with('\n') {
                css.push('\n');
            }
        }
        css
    }
}

fn is_css_ident(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn is_safe_css_value(value: &str) -> bool {
    !value.chars().any(|c| matches!(c, ';' | '{' | '}' | '<' | '>'))
}
