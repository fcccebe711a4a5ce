//
// config.rs
//
// Engine configuration and parsing from LSP settings
//

use std::path::Path;
use std::time::Duration;

use crate::types::Severity;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Quiet period before a burst of graph mutations is announced
    pub references_debounce_ms: u64,
    /// File suffixes (without the dot) treated as documents
    pub document_extensions: Vec<String>,
    /// Severity reported for links whose target document is unknown
    pub unresolved_link_severity: Severity,
    /// Directory names skipped while scanning and watching
    pub ignored_dirs: Vec<String>,
    /// Whether the built-in filesystem watcher runs
    pub watcher_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            references_debounce_ms: 300,
            document_extensions: vec!["md".to_string()],
            unresolved_link_severity: Severity::Warn,
            ignored_dirs: vec!["node_modules".to_string(), ".git".to_string()],
            watcher_enabled: true,
        }
    }
}

impl Config {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.references_debounce_ms)
    }

    /// Whether `path` ends in one of the document extensions.
    pub fn is_document_path(&self, path: &str) -> bool {
        let file_name = path.rsplit('/').next().unwrap_or(path);
        match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => self
                .document_extensions
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(ext)),
            _ => false,
        }
    }

    pub fn is_document_file(&self, path: &Path) -> bool {
        path.to_str().is_some_and(|p| self.is_document_path(p))
    }

    /// Whether any component of `path` is an ignored directory.
    pub fn is_ignored(&self, path: &Path) -> bool {
        path.components().any(|component| match component {
            std::path::Component::Normal(name) => name
                .to_str()
                .is_some_and(|name| self.ignored_dirs.iter().any(|dir| dir == name)),
            _ => false,
        })
    }
}

/// Read the `markmark` section of client settings.
///
/// Returns `None` when the section is absent; unknown or mistyped keys keep
/// their defaults.
pub fn parse_config(settings: &serde_json::Value) -> Option<Config> {
    let section = settings.get("markmark")?;

    let mut config = Config::default();

    if let Some(v) = section.get("debounceMs").and_then(|v| v.as_u64()) {
        config.references_debounce_ms = v;
    }
    if let Some(exts) = section.get("documentExtensions").and_then(|v| v.as_array()) {
        let exts: Vec<String> = exts
            .iter()
            .filter_map(|e| e.as_str())
            .map(|e| e.trim_start_matches('.').to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if !exts.is_empty() {
            config.document_extensions = exts;
        }
    }
    if let Some(sev) = section
        .get("unresolvedLinkSeverity")
        .and_then(|v| v.as_str())
    {
        config.unresolved_link_severity = Severity::parse(sev);
    }
    if let Some(dirs) = section.get("ignoredDirs").and_then(|v| v.as_array()) {
        config.ignored_dirs = dirs
            .iter()
            .filter_map(|d| d.as_str())
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(v) = section.get("watch").and_then(|v| v.as_bool()) {
        config.watcher_enabled = v;
    }

    log::info!("Configuration loaded from LSP settings:");
    log::info!("  references_debounce_ms: {}", config.references_debounce_ms);
    log::info!("  document_extensions: {:?}", config.document_extensions);
    log::info!(
        "  unresolved_link_severity: {}",
        config.unresolved_link_severity
    );
    log::info!("  ignored_dirs: {:?}", config.ignored_dirs);
    log::info!("  watcher_enabled: {}", config.watcher_enabled);

    Some(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.references_debounce_ms, 300);
        assert_eq!(config.debounce(), Duration::from_millis(300));
        assert_eq!(config.unresolved_link_severity, Severity::Warn);
        assert!(config.watcher_enabled);
    }

    #[test]
    fn test_parse_missing_section() {
        assert!(parse_config(&json!({ "other": {} })).is_none());
    }

    #[test]
    fn test_parse_overrides() {
        let config = parse_config(&json!({
            "markmark": {
                "debounceMs": 50,
                "documentExtensions": [".md", "markdown", ""],
                "unresolvedLinkSeverity": "error",
                "ignoredDirs": ["build"],
                "watch": false
            }
        }))
        .unwrap();

        assert_eq!(config.references_debounce_ms, 50);
        assert_eq!(config.document_extensions, vec!["md", "markdown"]);
        assert_eq!(config.unresolved_link_severity, Severity::Error);
        assert_eq!(config.ignored_dirs, vec!["build"]);
        assert!(!config.watcher_enabled);
    }

    #[test]
    fn test_mistyped_values_keep_defaults() {
        let config = parse_config(&json!({
            "markmark": { "debounceMs": "soon", "documentExtensions": [] }
        }))
        .unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_document_path() {
        let config = Config::default();
        assert!(config.is_document_path("/notes/IDEAS.md"));
        assert!(config.is_document_path("./ANCHOR.MD"));
        assert!(!config.is_document_path("/notes/image.png"));
        assert!(!config.is_document_path("/notes/.md"));
        assert!(!config.is_document_path("README"));
    }

    #[test]
    fn test_ignored_dirs() {
        let config = Config::default();
        assert!(config.is_ignored(Path::new("/w/node_modules/pkg/README.md")));
        assert!(config.is_ignored(Path::new("/w/.git/HEAD")));
        assert!(!config.is_ignored(Path::new("/w/notes/IDEAS.md")));
    }
}
