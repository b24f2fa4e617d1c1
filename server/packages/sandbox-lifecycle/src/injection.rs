use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::control::{ExecOptions, SandboxCallError, SandboxControl};
use crate::session::Session;

/// Line separating project rules from the user-editable section of the
/// merged rules file.
pub const USER_RULES_MARKER: &str = "<!-- session-relay:user-rules -->";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    pub path: String,
    pub contents: String,
}

/// Everything the agent expects on the sandbox filesystem before it starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigBundle {
    #[serde(default)]
    pub project_rules: String,
    #[serde(default)]
    pub user_rules: String,
    #[serde(default)]
    pub mcp_servers: Map<String, Value>,
    /// Paths relative to the plugin directory.
    #[serde(default)]
    pub plugin_files: Vec<BundleFile>,
    #[serde(default)]
    pub user_overrides: Vec<BundleFile>,
    #[serde(default)]
    pub credential_files: Vec<BundleFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionLayout {
    pub rules_path: String,
    pub mcp_path: String,
    pub plugin_dir: String,
    pub stamp_path: String,
}

impl Default for InjectionLayout {
    fn default() -> Self {
        Self {
            rules_path: "/home/user/.agent/AGENTS.md".to_string(),
            mcp_path: "/home/user/.agent/mcp.json".to_string(),
            plugin_dir: "/home/user/.agent/plugins".to_string(),
            stamp_path: "/home/user/.agent/.relay-stamp".to_string(),
        }
    }
}

/// Where per-user bundles come from and where edited user rules go back to.
pub trait BundleSource: Send + Sync + 'static {
    fn load(
        &self,
        user_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ConfigBundle, String>> + Send + '_>>;

    fn save_user_rules(
        &self,
        user_id: &str,
        rules: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>>;
}

/// Writes a configuration bundle into one sandbox.
pub struct ConfigInjector<'a> {
    control: &'a dyn SandboxControl,
    layout: &'a InjectionLayout,
}

impl<'a> ConfigInjector<'a> {
    pub fn new(control: &'a dyn SandboxControl, layout: &'a InjectionLayout) -> Self {
        Self { control, layout }
    }

    /// Writes every bundle file, then the stamp. Order matters: user
    /// overrides land after plugin files so they win on conflicting paths.
    pub async fn inject_all(
        &self,
        session: &Session,
        bundle: &ConfigBundle,
    ) -> Result<(), SandboxCallError> {
        let sandbox_id = session.sandbox_id.as_str();
        let mut dirs = HashSet::new();

        let rules = merge_rules(&bundle.project_rules, &bundle.user_rules);
        self.write(sandbox_id, &self.layout.rules_path, &rules, &mut dirs)
            .await?;

        let mcp = serde_json::to_string_pretty(&json!({ "mcpServers": bundle.mcp_servers }))
            .map_err(|err| SandboxCallError::Remote(format!("failed to encode mcp config: {err}")))?;
        self.write(sandbox_id, &self.layout.mcp_path, &mcp, &mut dirs)
            .await?;

        self.reset_plugin_dir(sandbox_id).await?;
        dirs.insert(self.layout.plugin_dir.clone());
        for file in &bundle.plugin_files {
            let Some(path) = plugin_path(&self.layout.plugin_dir, &file.path) else {
                tracing::warn!(
                    session_id = %session.id,
                    path = %file.path,
                    "skipping plugin file outside plugin directory"
                );
                continue;
            };
            self.write(sandbox_id, &path, &file.contents, &mut dirs)
                .await?;
        }

        for file in bundle.user_overrides.iter().chain(&bundle.credential_files) {
            self.write(sandbox_id, &file.path, &file.contents, &mut dirs)
                .await?;
        }

        let stamp = format!("{}:{}", session.id, Utc::now().to_rfc3339());
        self.write(sandbox_id, &self.layout.stamp_path, &stamp, &mut dirs)
            .await?;

        tracing::info!(
            session_id = %session.id,
            sandbox_id = %sandbox_id,
            plugin_files = bundle.plugin_files.len(),
            override_files = bundle.user_overrides.len(),
            credential_files = bundle.credential_files.len(),
            "configuration injected"
        );
        Ok(())
    }

    /// Skips injection when the stamp names this session. Returns whether a
    /// full injection ran.
    pub async fn ensure_injected(
        &self,
        session: &Session,
        bundle: &ConfigBundle,
    ) -> Result<bool, SandboxCallError> {
        match self
            .control
            .read_file(&session.sandbox_id, &self.layout.stamp_path)
            .await
        {
            Ok(Some(stamp)) if stamp_matches(&stamp, &session.id) => {
                tracing::debug!(session_id = %session.id, "configuration stamp current");
                return Ok(false);
            }
            Ok(Some(_)) => {
                tracing::info!(session_id = %session.id, "configuration stamp belongs to another session");
            }
            Ok(None) => {
                tracing::info!(session_id = %session.id, "configuration stamp missing");
            }
            Err(err) => {
                tracing::warn!(session_id = %session.id, error = %err, "failed to read configuration stamp");
            }
        }
        self.inject_all(session, bundle).await?;
        Ok(true)
    }

    pub async fn read_user_rules(&self, session: &Session) -> Result<Option<String>, SandboxCallError> {
        let merged = self
            .control
            .read_file(&session.sandbox_id, &self.layout.rules_path)
            .await?;
        Ok(merged.as_deref().and_then(extract_user_rules))
    }

    /// Copies edited user rules back to the bundle source. Best effort:
    /// failures are logged and dropped.
    pub async fn sync_back(&self, session: &Session, user_id: &str, source: &dyn BundleSource) {
        let rules = match self.read_user_rules(session).await {
            Ok(Some(rules)) => rules,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(session_id = %session.id, error = %err, "failed to read user rules for sync");
                return;
            }
        };
        let current = match source.load(user_id).await {
            Ok(bundle) => bundle.user_rules,
            Err(err) => {
                tracing::warn!(session_id = %session.id, error = %err, "failed to load bundle for sync");
                return;
            }
        };
        if current.trim() == rules {
            return;
        }
        match source.save_user_rules(user_id, rules).await {
            Ok(()) => tracing::info!(session_id = %session.id, user_id = %user_id, "user rules synced back"),
            Err(err) => {
                tracing::warn!(session_id = %session.id, error = %err, "failed to save synced user rules")
            }
        }
    }

    async fn write(
        &self,
        sandbox_id: &str,
        path: &str,
        contents: &str,
        dirs: &mut HashSet<String>,
    ) -> Result<(), SandboxCallError> {
        if let Some(dir) = parent_dir(path) {
            if dirs.insert(dir.to_string()) {
                self.control.mkdir(sandbox_id, dir).await?;
            }
        }
        self.control.write_file(sandbox_id, path, contents).await
    }

    async fn reset_plugin_dir(&self, sandbox_id: &str) -> Result<(), SandboxCallError> {
        let dir = shell_quote(&self.layout.plugin_dir);
        let command = format!("rm -rf {dir} && mkdir -p {dir}");
        let output = self
            .control
            .exec(sandbox_id, &command, &ExecOptions::default())
            .await?;
        if !output.success() {
            return Err(SandboxCallError::Remote(format!(
                "failed to reset plugin directory (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

pub fn merge_rules(project_rules: &str, user_rules: &str) -> String {
    let mut merged = String::new();
    let project_rules = project_rules.trim();
    if !project_rules.is_empty() {
        merged.push_str(project_rules);
        merged.push_str("\n\n");
    }
    merged.push_str(USER_RULES_MARKER);
    merged.push('\n');
    let user_rules = user_rules.trim();
    if !user_rules.is_empty() {
        merged.push_str(user_rules);
        merged.push('\n');
    }
    merged
}

pub fn extract_user_rules(merged: &str) -> Option<String> {
    let (_, user_rules) = merged.split_once(USER_RULES_MARKER)?;
    Some(user_rules.trim().to_string())
}

fn stamp_matches(stamp: &str, session_id: &str) -> bool {
    stamp
        .trim()
        .strip_prefix(session_id)
        .is_some_and(|rest| rest.starts_with(':'))
}

fn plugin_path(plugin_dir: &str, relative: &str) -> Option<String> {
    let relative = relative.trim_start_matches("./");
    if relative.is_empty()
        || relative.starts_with('/')
        || relative.split('/').any(|part| part == "..")
    {
        return None;
    }
    Some(format!("{}/{}", plugin_dir.trim_end_matches('/'), relative))
}

fn parent_dir(path: &str) -> Option<&str> {
    path.rsplit_once('/')
        .map(|(dir, _)| dir)
        .filter(|dir| !dir.is_empty())
}

pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockSandbox, SandboxOp};

    fn bundle() -> ConfigBundle {
        let mut mcp_servers = Map::new();
        mcp_servers.insert("github".to_string(), json!({"command": "gh-mcp"}));
        ConfigBundle {
            project_rules: "Use tabs.".to_string(),
            user_rules: "Be terse.".to_string(),
            mcp_servers,
            plugin_files: vec![
                BundleFile {
                    path: "agents/reviewer.md".to_string(),
                    contents: "review".to_string(),
                },
                BundleFile {
                    path: "../escape.md".to_string(),
                    contents: "nope".to_string(),
                },
            ],
            user_overrides: vec![BundleFile {
                path: "/home/user/.agent/plugins/agents/reviewer.md".to_string(),
                contents: "mine".to_string(),
            }],
            credential_files: vec![BundleFile {
                path: "/home/user/.config/gh/hosts.yml".to_string(),
                contents: "token: x".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn inject_all_writes_in_order_and_stamps_last() {
        let sandbox = MockSandbox::new();
        let layout = InjectionLayout::default();
        let session = Session::new("s-1", "sbx-1");
        ConfigInjector::new(&sandbox, &layout)
            .inject_all(&session, &bundle())
            .await
            .expect("inject");

        let paths: Vec<String> = sandbox.writes().into_iter().map(|(path, _)| path).collect();
        assert_eq!(
            paths,
            vec![
                "/home/user/.agent/AGENTS.md",
                "/home/user/.agent/mcp.json",
                "/home/user/.agent/plugins/agents/reviewer.md",
                "/home/user/.agent/plugins/agents/reviewer.md",
                "/home/user/.config/gh/hosts.yml",
                "/home/user/.agent/.relay-stamp",
            ]
        );
        assert_eq!(
            sandbox.file("/home/user/.agent/plugins/agents/reviewer.md").as_deref(),
            Some("mine")
        );
        let stamp = sandbox
            .file("/home/user/.agent/.relay-stamp")
            .expect("stamp written");
        assert!(stamp.starts_with("s-1:"));
        let mcp: Value = serde_json::from_str(
            &sandbox.file("/home/user/.agent/mcp.json").expect("mcp written"),
        )
        .expect("mcp json");
        assert_eq!(mcp["mcpServers"]["github"]["command"], "gh-mcp");
        assert!(sandbox
            .execs()
            .iter()
            .any(|command| command.starts_with("rm -rf '/home/user/.agent/plugins'")));
    }

    #[tokio::test]
    async fn matching_stamp_skips_with_zero_writes() {
        let sandbox = MockSandbox::new().with_file(
            "/home/user/.agent/.relay-stamp",
            "s-1:2026-01-01T00:00:00+00:00",
        );
        let layout = InjectionLayout::default();
        let session = Session::new("s-1", "sbx-1");
        let injected = ConfigInjector::new(&sandbox, &layout)
            .ensure_injected(&session, &bundle())
            .await
            .expect("ensure");
        assert!(!injected);
        assert_eq!(
            sandbox.ops(),
            vec![SandboxOp::ReadFile {
                path: "/home/user/.agent/.relay-stamp".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn foreign_or_missing_stamp_triggers_full_injection() {
        for stamp in [Some("s-10:2026-01-01T00:00:00+00:00"), None] {
            let mut sandbox = MockSandbox::new();
            if let Some(stamp) = stamp {
                sandbox = sandbox.with_file("/home/user/.agent/.relay-stamp", stamp);
            }
            let layout = InjectionLayout::default();
            let session = Session::new("s-1", "sbx-1");
            let injected = ConfigInjector::new(&sandbox, &layout)
                .ensure_injected(&session, &bundle())
                .await
                .expect("ensure");
            assert!(injected);
            assert_eq!(sandbox.writes().len(), 6);
        }
    }

    #[test]
    fn user_rules_round_trip_through_merged_file() {
        let merged = merge_rules("Project\n", "  Mine  ");
        assert_eq!(
            merged,
            format!("Project\n\n{USER_RULES_MARKER}\nMine\n")
        );
        assert_eq!(extract_user_rules(&merged).as_deref(), Some("Mine"));
        assert_eq!(extract_user_rules("no marker"), None);
    }

    #[test]
    fn stamp_prefix_must_match_whole_session_id() {
        assert!(stamp_matches("s-1:2026", "s-1"));
        assert!(!stamp_matches("s-10:2026", "s-1"));
        assert!(!stamp_matches("s-1", "s-1"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
