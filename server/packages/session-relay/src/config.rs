use std::collections::HashMap;
use std::time::Duration;

use url::Url;

pub const DEFAULT_BRIDGE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_PROMPT_DIR: &str = "/home/user/.relay/prompts";
pub const DEFAULT_AGENT_COMMAND: &str = "agent-runner --prompt-file \"$RELAY_PROMPT_FILE\"";
pub const DEFAULT_CALLBACK_BASE_URL: &str = "http://127.0.0.1:2468";

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const DEFAULT_HOME: &str = "/home/user";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Externally reachable base URL the agent posts its callback to.
    pub callback_base_url: String,
    pub agent_command: String,
    pub prompt_dir: String,
    /// How long an unattached bridge waits for its callback.
    pub bridge_timeout: Duration,
    /// How long a session coordinator with no pending bridge stays alive.
    pub idle_timeout: Duration,
    pub path: String,
    pub home: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            callback_base_url: DEFAULT_CALLBACK_BASE_URL.to_string(),
            agent_command: DEFAULT_AGENT_COMMAND.to_string(),
            prompt_dir: DEFAULT_PROMPT_DIR.to_string(),
            bridge_timeout: DEFAULT_BRIDGE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            path: DEFAULT_PATH.to_string(),
            home: DEFAULT_HOME.to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Callback endpoint of `session_id`, with the id as one encoded path
    /// segment.
    pub fn callback_url(&self, session_id: &str) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.callback_base_url)?;
        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(["v1", "sessions", session_id, "callback"]);
        Ok(url)
    }

    pub fn prompt_path(&self, execution_id: &str) -> String {
        format!("{}/{}.json", self.prompt_dir.trim_end_matches('/'), execution_id)
    }

    /// Variables every agent process starts with.
    pub fn system_env(&self) -> HashMap<String, String> {
        HashMap::from([
            ("PATH".to_string(), self.path.clone()),
            ("HOME".to_string(), self.home.clone()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("TERM".to_string(), "dumb".to_string()),
        ])
    }
}
