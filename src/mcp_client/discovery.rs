//! MCP Server Discovery: find config files in the project and user dirs.
//!
//! Servers can be declared in several well-known files so a project can ship
//! its own set while users keep personal servers in their config dir. The
//! explicit config handed to the registry stays the final word.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::config::{load_config_file, ServerConfig};

/// Overrides the working directory as the project root.
pub const PROJECT_ROOT_ENV: &str = "MCPHUB_PROJECT_ROOT";

/// Project-relative config files, in lookup order.
const PROJECT_CONFIG_FILES: [&str; 3] = [".mcp.json", ".mcp/servers.json", ".mcphub/mcp.json"];

/// Config file under the user config dir.
const USER_CONFIG_FILE: &str = "mcphub/mcp.json";

// ─── Paths ───────────────────────────────────────────────────────────────────

/// `MCPHUB_PROJECT_ROOT` when set and non-empty, otherwise `cwd`.
pub fn resolve_project_root(cwd: &Path) -> PathBuf {
    match std::env::var(PROJECT_ROOT_ENV) {
        Ok(root) if !root.trim().is_empty() => PathBuf::from(root),
        _ => cwd.to_path_buf(),
    }
}

/// Candidate config files, highest precedence first.
pub fn candidate_paths(project_root: &Path, user_config_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = PROJECT_CONFIG_FILES
        .iter()
        .map(|rel| project_root.join(rel))
        .collect();
    if let Some(dir) = user_config_dir {
        paths.push(dir.join(USER_CONFIG_FILE));
    }
    paths
}

// ─── Discovery ──────────────────────────────────────────────────────────────

/// Load every existing candidate file and collect its servers.
///
/// The first file to declare a server name wins. Missing files are skipped
/// silently; unreadable or malformed ones are logged and skipped.
pub fn discover_servers(
    project_root: &Path,
    user_config_dir: Option<&Path>,
) -> BTreeMap<String, ServerConfig> {
    let mut configs = BTreeMap::new();

    for path in candidate_paths(project_root, user_config_dir) {
        if !path.is_file() {
            continue;
        }
        let document = match load_config_file(&path) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping MCP config file");
                continue;
            }
        };

        for (name, config) in document.servers {
            if configs.contains_key(&name) {
                tracing::debug!(
                    server = %name,
                    path = %path.display(),
                    "server already discovered from a higher-precedence file"
                );
                continue;
            }
            tracing::debug!(server = %name, path = %path.display(), "discovered MCP server");
            configs.insert(name, config);
        }
    }

    configs
}

// ─── Merge ──────────────────────────────────────────────────────────────────

/// Layer `overrides` on top of `base`.
///
/// Override entries **fully replace** base entries for the same server name.
pub fn merge_configs(
    mut base: BTreeMap<String, ServerConfig>,
    overrides: BTreeMap<String, ServerConfig>,
) -> BTreeMap<String, ServerConfig> {
    for (name, config) in overrides {
        base.insert(name, config);
    }
    base
}

/// Merge sources in increasing precedence: built-in, discovered, explicit.
pub fn merge_sources(
    builtin: BTreeMap<String, ServerConfig>,
    discovered: BTreeMap<String, ServerConfig>,
    explicit: BTreeMap<String, ServerConfig>,
) -> BTreeMap<String, ServerConfig> {
    merge_configs(merge_configs(builtin, discovered), explicit)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, body: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn test_candidate_order() {
        let paths = candidate_paths(Path::new("/proj"), Some(Path::new("/home/u/.config")));
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/proj/.mcp.json"),
                PathBuf::from("/proj/.mcp/servers.json"),
                PathBuf::from("/proj/.mcphub/mcp.json"),
                PathBuf::from("/home/u/.config/mcphub/mcp.json"),
            ]
        );
        assert_eq!(candidate_paths(Path::new("/proj"), None).len(), 3);
    }

    #[test]
    fn test_first_match_wins() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("proj");
        let user = tmp.path().join("config");
        write(
            &project.join(".mcp.json"),
            r#"{"mcpServers": {"git": {"command": "git-mcp"}}}"#,
        );
        write(
            &project.join(".mcp/servers.json"),
            r#"{"servers": {"git": {"command": "other-git"}, "fs": {"command": "fs-mcp"}}}"#,
        );
        write(
            &user.join("mcphub/mcp.json"),
            r#"{"servers": {"fs": {"command": "user-fs"}, "web": {"url": "http://localhost:9/mcp"}}}"#,
        );

        let configs = discover_servers(&project, Some(&user));
        assert_eq!(configs.len(), 3);
        assert_eq!(configs["git"].command.as_deref(), Some("git-mcp"));
        assert_eq!(configs["fs"].command.as_deref(), Some("fs-mcp"));
        assert_eq!(configs["web"].url.as_deref(), Some("http://localhost:9/mcp"));
    }

    #[test]
    fn test_malformed_file_is_skipped() {
        let tmp = TempDir::new().unwrap();
        write(&tmp.path().join(".mcp.json"), "{ not json");
        write(
            &tmp.path().join(".mcphub/mcp.json"),
            r#"{"servers": {"ok": {"command": "ok-mcp"}}}"#,
        );

        let configs = discover_servers(tmp.path(), None);
        assert_eq!(configs.keys().collect::<Vec<_>>(), vec!["ok"]);
    }

    #[test]
    fn test_missing_files() {
        let configs = discover_servers(Path::new("/nonexistent/project"), None);
        assert!(configs.is_empty());
    }

    #[test]
    fn test_merge_override_replaces() {
        let mut base = BTreeMap::new();
        base.insert("fs".to_string(), ServerConfig::stdio("npx", &["fs-mcp"]));
        base.insert("ocr".to_string(), ServerConfig::stdio("npx", &["ocr-mcp"]));

        let mut overrides = BTreeMap::new();
        overrides.insert("fs".to_string(), ServerConfig::stdio("node", &["dist/index.js"]));

        let merged = merge_configs(base, overrides);
        assert_eq!(merged["fs"].command.as_deref(), Some("node"));
        assert_eq!(merged["ocr"].command.as_deref(), Some("npx"));
    }

    #[test]
    fn test_merge_sources_precedence() {
        let mut builtin = BTreeMap::new();
        builtin.insert("a".to_string(), ServerConfig::stdio("builtin-a", &[]));
        builtin.insert("b".to_string(), ServerConfig::stdio("builtin-b", &[]));
        let mut discovered = BTreeMap::new();
        discovered.insert("b".to_string(), ServerConfig::stdio("found-b", &[]));
        discovered.insert("c".to_string(), ServerConfig::stdio("found-c", &[]));
        let mut explicit = BTreeMap::new();
        explicit.insert("c".to_string(), ServerConfig::stdio("explicit-c", &[]));

        let merged = merge_sources(builtin, discovered, explicit);
        assert_eq!(merged["a"].command.as_deref(), Some("builtin-a"));
        assert_eq!(merged["b"].command.as_deref(), Some("found-b"));
        assert_eq!(merged["c"].command.as_deref(), Some("explicit-c"));
    }
}
