use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::RwLock;

use serde::Deserialize;
use session_relay_sandbox_lifecycle::{BundleSource, ConfigBundle};

#[derive(Debug, Default, Deserialize)]
struct BundleFileFormat {
    #[serde(default)]
    default: ConfigBundle,
    #[serde(default)]
    users: HashMap<String, ConfigBundle>,
}

/// Configuration bundles held in memory. Users without an entry get the
/// default bundle; synced user rules are kept per user.
#[derive(Debug, Default)]
pub struct StaticBundleSource {
    default: ConfigBundle,
    users: RwLock<HashMap<String, ConfigBundle>>,
}

impl StaticBundleSource {
    pub fn new(default: ConfigBundle) -> Self {
        Self {
            default,
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_user(self, user_id: &str, bundle: ConfigBundle) -> Self {
        self.users
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(user_id.to_string(), bundle);
        self
    }

    /// Reads `{"default": {...}, "users": {"<userId>": {...}}}`.
    pub fn from_file(path: &Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        let parsed: BundleFileFormat = serde_json::from_str(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        Ok(Self {
            default: parsed.default,
            users: RwLock::new(parsed.users),
        })
    }

    fn bundle_for(&self, user_id: &str) -> ConfigBundle {
        self.users
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl BundleSource for StaticBundleSource {
    fn load(
        &self,
        user_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ConfigBundle, String>> + Send + '_>> {
        let bundle = self.bundle_for(user_id);
        Box::pin(async move { Ok(bundle) })
    }

    fn save_user_rules(
        &self,
        user_id: &str,
        rules: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        let mut bundle = self.bundle_for(user_id);
        bundle.user_rules = rules;
        self.users
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(user_id.to_string(), bundle);
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saved_rules_shadow_the_default_bundle() {
        let source = StaticBundleSource::new(ConfigBundle {
            project_rules: "shared".to_string(),
            ..ConfigBundle::default()
        });
        source
            .save_user_rules("u-1", "mine".to_string())
            .await
            .expect("save");
        let bundle = source.load("u-1").await.expect("load");
        assert_eq!(bundle.project_rules, "shared");
        assert_eq!(bundle.user_rules, "mine");
        assert_eq!(source.load("u-2").await.expect("load").user_rules, "");
    }
}
