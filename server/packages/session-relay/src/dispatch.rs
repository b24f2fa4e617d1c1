//! Starting one agent execution inside a session's sandbox.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use session_relay_error::RelayError;
use session_relay_sandbox_lifecycle::{LifecycleError, Session};
use session_relay_stream_bridge::StreamFormat;
use utoipa::ToSchema;

use crate::config::CoordinatorConfig;
use crate::coordinator::RelayServices;
use crate::secrets::filter_user_secrets;

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomy: Option<String>,
    #[serde(default)]
    pub format: StreamFormat,
}

/// JSON file the agent reads its instructions from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPayload {
    pub prompt: String,
    pub execution_id: String,
    pub continuity_id: Option<String>,
    pub mode: Option<String>,
    pub model: Option<String>,
    pub autonomy: Option<String>,
    pub callback_url: String,
}

pub(crate) fn lifecycle_error(err: LifecycleError) -> RelayError {
    match err {
        LifecycleError::SessionNotFound(session_id) => RelayError::SessionNotFound { session_id },
        LifecycleError::SandboxUnavailable { session_id, reason } => {
            RelayError::SandboxUnavailable { session_id, reason }
        }
        LifecycleError::Provisioning { step, message } => RelayError::ProvisioningFailed {
            step: step.to_string(),
            message,
        },
        other => RelayError::DispatchFailed {
            message: other.to_string(),
        },
    }
}

/// Environment of the agent process. Nothing is inherited from the
/// sandbox; reserved names always win over secrets.
#[allow(clippy::too_many_arguments)]
pub(crate) fn agent_env(
    config: &CoordinatorConfig,
    project_secrets: HashMap<String, String>,
    user_secrets: HashMap<String, String>,
    callback_url: &str,
    token: &str,
    execution_id: &str,
    session_id: &str,
    prompt_path: &str,
) -> HashMap<String, String> {
    let mut env = project_secrets;
    env.extend(user_secrets);
    env.extend(config.system_env());
    env.insert("RELAY_CALLBACK_URL".to_string(), callback_url.to_string());
    env.insert("RELAY_CALLBACK_TOKEN".to_string(), token.to_string());
    env.insert("RELAY_EXECUTION_ID".to_string(), execution_id.to_string());
    env.insert("RELAY_SESSION_ID".to_string(), session_id.to_string());
    env.insert("RELAY_PROMPT_FILE".to_string(), prompt_path.to_string());
    env
}

/// Wakes the sandbox, writes the prompt payload and starts the agent.
/// Callers hold the session's sandbox lane for the whole call.
pub(crate) async fn dispatch(
    services: &RelayServices,
    session_id: &str,
    execution_id: &str,
    request: &ChatRequest,
) -> Result<(), RelayError> {
    let started = Instant::now();
    let record = services
        .lifecycle
        .load(session_id)
        .await
        .map_err(lifecycle_error)?;

    let bundle = match record.user_id.as_deref() {
        Some(user_id) => Some(services.bundles.load(user_id).await.map_err(|message| {
            RelayError::DispatchFailed {
                message: format!("failed to load configuration bundle: {message}"),
            }
        })?),
        None => None,
    };
    let session = services
        .lifecycle
        .get_or_wake(session_id, bundle.as_ref())
        .await
        .map_err(lifecycle_error)?;

    let (project_secrets, user_secrets) = load_secrets(services, &session).await?;

    let token = services
        .signer
        .sign(execution_id, session_id)
        .map_err(|err| RelayError::Internal {
            message: format!("failed to sign callback token: {err}"),
        })?;

    let config = &services.config;
    let callback_url = config
        .callback_url(session_id)
        .map_err(|err| RelayError::Internal {
            message: format!("invalid callback base url: {err}"),
        })?
        .to_string();
    let prompt_path = config.prompt_path(execution_id);
    let payload = PromptPayload {
        prompt: request.prompt.clone(),
        execution_id: execution_id.to_string(),
        continuity_id: session.continuity_id.clone(),
        mode: request.mode.clone(),
        model: request.model.clone(),
        autonomy: request.autonomy.clone(),
        callback_url: callback_url.clone(),
    };
    let contents = serde_json::to_string(&payload).map_err(|err| RelayError::Internal {
        message: err.to_string(),
    })?;
    services
        .lifecycle
        .mkdir(&session, &config.prompt_dir)
        .await
        .map_err(lifecycle_error)?;
    services
        .lifecycle
        .write_file(&session, &prompt_path, &contents)
        .await
        .map_err(lifecycle_error)?;

    let env = agent_env(
        config,
        project_secrets,
        user_secrets,
        &callback_url,
        &token,
        execution_id,
        session_id,
        &prompt_path,
    );
    let process = services
        .lifecycle
        .start_background_process(&session, &config.agent_command, &env)
        .await
        .map_err(lifecycle_error)?;

    tracing::info!(
        session_id = %session_id,
        execution_id = %execution_id,
        sandbox_id = %session.sandbox_id,
        process_id = %process.id,
        resumed = session.continuity_id.is_some(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "agent dispatched"
    );
    Ok(())
}

async fn load_secrets(
    services: &RelayServices,
    session: &Session,
) -> Result<(HashMap<String, String>, HashMap<String, String>), RelayError> {
    let secret_error = |message: String| RelayError::DispatchFailed {
        message: format!("failed to load secrets: {message}"),
    };
    let project = services
        .secrets
        .project_secrets()
        .await
        .map_err(secret_error)?;
    let user = match session.user_id.as_deref() {
        Some(user_id) => filter_user_secrets(
            user_id,
            services
                .secrets
                .user_secrets(user_id)
                .await
                .map_err(secret_error)?,
        ),
        None => HashMap::new(),
    };
    Ok((project, user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_variables_override_secrets() {
        let config = CoordinatorConfig::default();
        let project = HashMap::from([
            ("API_KEY".to_string(), "p".to_string()),
            ("HOME".to_string(), "/tmp/evil".to_string()),
        ]);
        let user = HashMap::from([("API_KEY".to_string(), "u".to_string())]);
        let callback_url = "http://127.0.0.1:2468/v1/sessions/s-1/callback";
        let env = agent_env(
            &config,
            project,
            user,
            callback_url,
            "tok",
            "e-1",
            "s-1",
            "/p/e-1.json",
        );

        assert_eq!(env["API_KEY"], "u");
        assert_eq!(env["HOME"], config.home);
        assert_eq!(env["PATH"], config.path);
        assert_eq!(env["LANG"], "C.UTF-8");
        assert_eq!(env["TERM"], "dumb");
        assert_eq!(env["RELAY_CALLBACK_TOKEN"], "tok");
        assert_eq!(env["RELAY_EXECUTION_ID"], "e-1");
        assert_eq!(env["RELAY_SESSION_ID"], "s-1");
        assert_eq!(env["RELAY_PROMPT_FILE"], "/p/e-1.json");
        assert_eq!(env["RELAY_CALLBACK_URL"], callback_url);
    }

    #[test]
    fn chat_request_defaults_to_event_format() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"prompt": "hi", "model": "fast"}"#).expect("parse");
        assert_eq!(request.format, StreamFormat::Events);
        assert_eq!(request.model.as_deref(), Some("fast"));
        assert_eq!(request.mode, None);
    }

    #[test]
    fn prompt_payload_uses_camel_case_keys() {
        let payload = PromptPayload {
            prompt: "hi".to_string(),
            execution_id: "e-1".to_string(),
            continuity_id: Some("c-1".to_string()),
            mode: None,
            model: None,
            autonomy: Some("high".to_string()),
            callback_url: "http://relay/cb".to_string(),
        };
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(value["executionId"], "e-1");
        assert_eq!(value["continuityId"], "c-1");
        assert_eq!(value["callbackUrl"], "http://relay/cb");
        assert!(value["mode"].is_null());
    }
}
