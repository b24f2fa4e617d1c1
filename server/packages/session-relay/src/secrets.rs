use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use serde::Deserialize;

/// Environment names user secrets may never set. Anything starting with
/// `RELAY_` is reserved as well.
pub const RESERVED_ENV_NAMES: [&str; 10] = [
    "PATH",
    "HOME",
    "LANG",
    "TERM",
    "USER",
    "SHELL",
    "PWD",
    "TMPDIR",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
];
const RESERVED_ENV_PREFIX: &str = "RELAY_";

type SecretFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HashMap<String, String>, String>> + Send + 'a>>;

pub trait SecretStore: Send + Sync + 'static {
    fn project_secrets(&self) -> SecretFuture<'_>;

    fn user_secrets(&self, user_id: &str) -> SecretFuture<'_>;
}

/// Secrets loaded once at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticSecretStore {
    #[serde(default)]
    project: HashMap<String, String>,
    #[serde(default)]
    users: HashMap<String, HashMap<String, String>>,
}

impl StaticSecretStore {
    pub fn new(
        project: HashMap<String, String>,
        users: HashMap<String, HashMap<String, String>>,
    ) -> Self {
        Self { project, users }
    }

    /// Reads `{"project": {...}, "users": {"<userId>": {...}}}`.
    pub fn from_file(path: &Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

impl SecretStore for StaticSecretStore {
    fn project_secrets(&self) -> SecretFuture<'_> {
        let secrets = self.project.clone();
        Box::pin(async move { Ok(secrets) })
    }

    fn user_secrets(&self, user_id: &str) -> SecretFuture<'_> {
        let secrets = self.users.get(user_id).cloned().unwrap_or_default();
        Box::pin(async move { Ok(secrets) })
    }
}

pub fn is_reserved_env_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper.starts_with(RESERVED_ENV_PREFIX) || RESERVED_ENV_NAMES.contains(&upper.as_str())
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Drops user secrets that would shadow reserved names or are not valid
/// environment variable names.
pub fn filter_user_secrets(user_id: &str, secrets: HashMap<String, String>) -> HashMap<String, String> {
    secrets
        .into_iter()
        .filter(|(name, _)| {
            let keep = is_valid_env_name(name) && !is_reserved_env_name(name);
            if !keep {
                tracing::warn!(user_id = %user_id, name = %name, "dropping reserved or invalid user secret");
            }
            keep
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_secrets_cannot_shadow_reserved_names() {
        let secrets = HashMap::from([
            ("PATH".to_string(), "/evil".to_string()),
            ("home".to_string(), "/evil".to_string()),
            ("RELAY_CALLBACK_TOKEN".to_string(), "forged".to_string()),
            ("1BAD".to_string(), "x".to_string()),
            ("GITHUB_TOKEN".to_string(), "ghp".to_string()),
        ]);
        let filtered = filter_user_secrets("u-1", secrets);
        assert_eq!(
            filtered,
            HashMap::from([("GITHUB_TOKEN".to_string(), "ghp".to_string())])
        );
    }

    #[tokio::test]
    async fn static_store_serves_project_and_user_sets() {
        let store: StaticSecretStore = serde_json::from_str(
            r#"{"project": {"API_KEY": "p"}, "users": {"u-1": {"GITHUB_TOKEN": "g"}}}"#,
        )
        .expect("parse secrets");
        assert_eq!(
            store.project_secrets().await.expect("project")["API_KEY"],
            "p"
        );
        assert_eq!(
            store.user_secrets("u-1").await.expect("user")["GITHUB_TOKEN"],
            "g"
        );
        assert!(store.user_secrets("u-2").await.expect("user").is_empty());
    }
}
