use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::sleep;

use crate::control::{
    ExecOptions, ExecOutput, OutputStream, ProcessHandle, SandboxCallError, SandboxControl,
};
use crate::error::{LifecycleError, ProvisionStep};
use crate::injection::{shell_quote, BundleSource, ConfigBundle, ConfigInjector, InjectionLayout};
use crate::session::{Session, SessionStatus, SessionStore};

pub const HEALTH_CHECK_COMMAND: &str = "echo ready";
const DEFAULT_WORKSPACE_DIR: &str = "/home/user/workspace";

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub health_timeout: Duration,
    pub ready_attempts: usize,
    pub ready_delay: Duration,
    /// Idle time after which an `active` session may have been suspended.
    pub sleep_after: Duration,
    pub layout: InjectionLayout,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(5),
            ready_attempts: 5,
            ready_delay: Duration::from_secs(2),
            sleep_after: Duration::from_secs(2 * 60),
            layout: InjectionLayout::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub env: HashMap<String, String>,
    /// Cloned into the workspace when set; otherwise an empty workspace is
    /// created.
    pub repository_url: Option<String>,
    pub workspace_dir: Option<String>,
    pub relay_command: Option<String>,
    pub relay_env: HashMap<String, String>,
}

/// Outcome of a batch command. Sandbox failures are reported here rather
/// than as an `Err`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl ExecResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }
}

impl From<ExecOutput> for ExecResult {
    fn from(output: ExecOutput) -> Self {
        Self {
            exit_code: Some(output.exit_code),
            stdout: output.stdout,
            stderr: output.stderr,
            error: None,
        }
    }
}

#[derive(Clone)]
pub struct SandboxLifecycle {
    control: Arc<dyn SandboxControl>,
    store: Arc<dyn SessionStore>,
    config: LifecycleConfig,
}

impl fmt::Debug for SandboxLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxLifecycle")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SandboxLifecycle {
    pub fn new(
        control: Arc<dyn SandboxControl>,
        store: Arc<dyn SessionStore>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            control,
            store,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn injector(&self) -> ConfigInjector<'_> {
        ConfigInjector::new(self.control.as_ref(), &self.config.layout)
    }

    pub async fn load(&self, session_id: &str) -> Result<Session, LifecycleError> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| LifecycleError::SessionNotFound(session_id.to_string()))
    }

    /// One `echo` round trip bounded by the health timeout.
    pub async fn health_check(&self, session: &Session) -> bool {
        let options = ExecOptions {
            timeout: Some(self.config.health_timeout),
            ..ExecOptions::default()
        };
        let call = self
            .control
            .exec(&session.sandbox_id, HEALTH_CHECK_COMMAND, &options);
        match tokio::time::timeout(self.config.health_timeout, call).await {
            Ok(Ok(output)) if output.success() => true,
            Ok(Ok(output)) => {
                tracing::debug!(
                    session_id = %session.id,
                    exit_code = output.exit_code,
                    "health check exited non-zero"
                );
                false
            }
            Ok(Err(err)) => {
                tracing::debug!(session_id = %session.id, error = %err, "health check failed");
                false
            }
            Err(_) => {
                tracing::debug!(session_id = %session.id, "health check timed out");
                false
            }
        }
    }

    /// Polls `health_check` a bounded number of times.
    pub async fn wait_for_ready(&self, session: &Session) -> bool {
        let started = Instant::now();
        for attempt in 1..=self.config.ready_attempts {
            if self.health_check(session).await {
                tracing::info!(
                    session_id = %session.id,
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "sandbox ready"
                );
                return true;
            }
            if attempt < self.config.ready_attempts {
                sleep(self.config.ready_delay).await;
            }
        }
        tracing::warn!(
            session_id = %session.id,
            sandbox_id = %session.sandbox_id,
            attempts = self.config.ready_attempts,
            "sandbox did not become ready"
        );
        false
    }

    /// Provisions a fresh sandbox. Failures are final: the session is marked
    /// terminated with the step-tagged error and nothing is retried.
    pub async fn create_sandbox(
        &self,
        mut session: Session,
        user_id: &str,
        bundle: &ConfigBundle,
        options: &CreateOptions,
    ) -> Result<Session, LifecycleError> {
        let started = Instant::now();
        session.user_id = Some(user_id.to_string());
        session.status = SessionStatus::Creating;
        self.store.put(&session).await?;

        match self.provision(&session, bundle, options).await {
            Ok(()) => {
                let now = Utc::now();
                session.status = SessionStatus::Active;
                session.last_active_at = now;
                session.metadata.last_config_check_at = Some(now);
                session.metadata.last_error = None;
                self.store.put(&session).await?;
                tracing::info!(
                    session_id = %session.id,
                    sandbox_id = %session.sandbox_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "sandbox provisioned"
                );
                Ok(session)
            }
            Err(err) => {
                session.status = SessionStatus::Terminated;
                session.metadata.last_error = Some(err.to_string());
                if let Err(store_err) = self.store.put(&session).await {
                    tracing::warn!(
                        session_id = %session.id,
                        error = %store_err,
                        "failed to persist provisioning failure"
                    );
                }
                tracing::error!(
                    session_id = %session.id,
                    sandbox_id = %session.sandbox_id,
                    error = %err,
                    "sandbox provisioning failed"
                );
                Err(err)
            }
        }
    }

    async fn provision(
        &self,
        session: &Session,
        bundle: &ConfigBundle,
        options: &CreateOptions,
    ) -> Result<(), LifecycleError> {
        let sandbox_id = session.sandbox_id.as_str();

        if !options.env.is_empty() {
            self.control
                .set_env(sandbox_id, &options.env)
                .await
                .map_err(|err| LifecycleError::provisioning(ProvisionStep::Env, err))?;
        }

        self.injector()
            .inject_all(session, bundle)
            .await
            .map_err(|err| LifecycleError::provisioning(ProvisionStep::Config, err))?;

        let workspace = options
            .workspace_dir
            .as_deref()
            .unwrap_or(DEFAULT_WORKSPACE_DIR);
        match &options.repository_url {
            Some(repository) => {
                let command = format!(
                    "git clone --depth 1 {} {}",
                    shell_quote(repository),
                    shell_quote(workspace)
                );
                let output = self
                    .control
                    .exec(sandbox_id, &command, &ExecOptions::default())
                    .await
                    .map_err(|err| LifecycleError::provisioning(ProvisionStep::Workspace, err))?;
                if !output.success() {
                    return Err(LifecycleError::provisioning(
                        ProvisionStep::Workspace,
                        format!(
                            "git clone exited with {}: {}",
                            output.exit_code,
                            output.stderr.trim()
                        ),
                    ));
                }
            }
            None => {
                self.control
                    .mkdir(sandbox_id, workspace)
                    .await
                    .map_err(|err| LifecycleError::provisioning(ProvisionStep::Workspace, err))?;
            }
        }

        if !self.wait_for_ready(session).await {
            return Err(LifecycleError::provisioning(
                ProvisionStep::Ready,
                "sandbox did not become ready",
            ));
        }

        if let Some(command) = &options.relay_command {
            let handle = self
                .control
                .start_background_process(sandbox_id, command, &options.relay_env)
                .await
                .map_err(|err| LifecycleError::provisioning(ProvisionStep::Relay, err))?;
            tracing::info!(
                session_id = %session.id,
                process_id = %handle.id,
                "relay process started"
            );
        }
        Ok(())
    }

    /// Returns an awake, configured session or explains why it cannot.
    ///
    /// Wake failures leave the session `sleeping` so a later call can retry.
    pub async fn get_or_wake(
        &self,
        session_id: &str,
        bundle: Option<&ConfigBundle>,
    ) -> Result<Session, LifecycleError> {
        let mut session = self.load(session_id).await?;
        if session.is_gone() {
            tracing::debug!(session_id = %session_id, status = ?session.status, "session is gone");
            return Err(LifecycleError::SessionNotFound(session_id.to_string()));
        }
        if session.status == SessionStatus::Creating {
            return Err(LifecycleError::SandboxUnavailable {
                session_id: session_id.to_string(),
                reason: "sandbox is still being provisioned".to_string(),
            });
        }

        if session.possibly_asleep(Utc::now(), self.config.sleep_after) {
            let started = Instant::now();
            let awake = self.health_check(&session).await || self.wait_for_ready(&session).await;
            if !awake {
                let reason = format!(
                    "sandbox did not answer {} health checks",
                    self.config.ready_attempts + 1
                );
                session.status = SessionStatus::Sleeping;
                session.metadata.last_wake_error = Some(reason.clone());
                self.store.put(&session).await?;
                tracing::warn!(
                    session_id = %session_id,
                    sandbox_id = %session.sandbox_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "sandbox wake failed"
                );
                return Err(LifecycleError::SandboxUnavailable {
                    session_id: session_id.to_string(),
                    reason,
                });
            }
            tracing::info!(
                session_id = %session_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "sandbox awake"
            );
        }

        if let Some(bundle) = bundle {
            if let Err(err) = self.injector().ensure_injected(&session, bundle).await {
                let reason = format!("configuration check failed: {err}");
                session.metadata.last_wake_error = Some(reason.clone());
                self.store.put(&session).await?;
                tracing::warn!(session_id = %session_id, error = %err, "configuration check failed");
                return Err(LifecycleError::SandboxUnavailable {
                    session_id: session_id.to_string(),
                    reason,
                });
            }
            session.metadata.last_config_check_at = Some(Utc::now());
        }

        session.status = SessionStatus::Active;
        session.last_active_at = Utc::now();
        session.metadata.last_wake_error = None;
        self.store.put(&session).await?;
        Ok(session)
    }

    pub async fn exec(&self, session: &Session, command: &str, options: &ExecOptions) -> ExecResult {
        let sandbox_id = session.sandbox_id.as_str();
        let result = self
            .with_ready_retry(session, "exec", move || {
                self.control.exec(sandbox_id, command, options)
            })
            .await;
        match result {
            Ok(output) => output.into(),
            Err(err) => ExecResult::failed(err.to_string()),
        }
    }

    pub async fn exec_stream(
        &self,
        session: &Session,
        command: &str,
        options: &ExecOptions,
    ) -> Result<OutputStream, LifecycleError> {
        let sandbox_id = session.sandbox_id.as_str();
        Ok(self
            .with_ready_retry(session, "exec_stream", move || {
                self.control.exec_stream(sandbox_id, command, options)
            })
            .await?)
    }

    pub async fn write_file(
        &self,
        session: &Session,
        path: &str,
        contents: &str,
    ) -> Result<(), LifecycleError> {
        let sandbox_id = session.sandbox_id.as_str();
        Ok(self
            .with_ready_retry(session, "write_file", move || {
                self.control.write_file(sandbox_id, path, contents)
            })
            .await?)
    }

    pub async fn mkdir(&self, session: &Session, path: &str) -> Result<(), LifecycleError> {
        let sandbox_id = session.sandbox_id.as_str();
        Ok(self
            .with_ready_retry(session, "mkdir", move || self.control.mkdir(sandbox_id, path))
            .await?)
    }

    pub async fn start_background_process(
        &self,
        session: &Session,
        command: &str,
        env: &HashMap<String, String>,
    ) -> Result<ProcessHandle, LifecycleError> {
        let sandbox_id = session.sandbox_id.as_str();
        Ok(self
            .with_ready_retry(session, "start_process", move || {
                self.control.start_background_process(sandbox_id, command, env)
            })
            .await?)
    }

    pub async fn ensure_injected(
        &self,
        session: &Session,
        bundle: &ConfigBundle,
    ) -> Result<bool, LifecycleError> {
        Ok(self.injector().ensure_injected(session, bundle).await?)
    }

    pub async fn sync_back(&self, session: &Session, user_id: &str, source: &dyn BundleSource) {
        self.injector().sync_back(session, user_id, source).await;
    }

    /// Records the owning user. Safe to repeat.
    pub async fn assign_user(&self, session_id: &str, user_id: &str) -> Result<Session, LifecycleError> {
        let mut session = self.load(session_id).await?;
        session.user_id = Some(user_id.to_string());
        self.store.put(&session).await?;
        Ok(session)
    }

    pub async fn touch(&self, session_id: &str) -> Result<(), LifecycleError> {
        let mut session = self.load(session_id).await?;
        session.last_active_at = Utc::now();
        self.store.put(&session).await?;
        Ok(())
    }

    pub async fn record_continuity(
        &self,
        session_id: &str,
        continuity_id: &str,
    ) -> Result<(), LifecycleError> {
        let mut session = self.load(session_id).await?;
        if session.continuity_id.as_deref() == Some(continuity_id) {
            return Ok(());
        }
        session.continuity_id = Some(continuity_id.to_string());
        self.store.put(&session).await?;
        tracing::debug!(session_id = %session_id, "continuity id recorded");
        Ok(())
    }

    /// Marks the session deleted without contacting its sandbox.
    pub async fn delete_session(
        &self,
        session_id: &str,
        pending: bool,
    ) -> Result<Session, LifecycleError> {
        let mut session = self.load(session_id).await?;
        session.status = if pending {
            SessionStatus::PendingDelete
        } else {
            SessionStatus::Terminated
        };
        self.store.put(&session).await?;
        tracing::info!(session_id = %session_id, status = ?session.status, "session deleted");
        Ok(session)
    }

    /// Runs `call`, and after a not-ready error waits for the sandbox and
    /// runs it exactly once more.
    async fn with_ready_retry<T, F, Fut>(
        &self,
        session: &Session,
        operation: &'static str,
        call: F,
    ) -> Result<T, SandboxCallError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SandboxCallError>>,
    {
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_not_ready() {
            return Err(err);
        }
        tracing::warn!(
            session_id = %session.id,
            operation,
            error = %err,
            "sandbox not ready; waiting before retry"
        );
        if !self.wait_for_ready(session).await {
            return Err(err);
        }
        call().await
    }
}
