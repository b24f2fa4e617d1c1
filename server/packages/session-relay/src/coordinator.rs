//! Per-session coordination of chat executions and their callbacks.
//!
//! Each session id gets one actor task that exclusively owns the session's
//! pending bridges. Handles talk to it over an mpsc channel; sandbox work
//! runs on spawned tasks that share the session's sandbox lane.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use session_relay_callback_token::{extract_bearer, CallbackClaims, CallbackTokenSigner};
use session_relay_error::RelayError;
use session_relay_sandbox_lifecycle::{BundleSource, CreateOptions, SandboxLifecycle, Session};
use session_relay_stream_bridge::{
    BridgeFailure, BridgeOutcome, BridgeSink, CompletionWaiter, OutboundFrame, StreamBridge,
    StreamFormat, OUTPUT_CHANNEL_CAPACITY,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::dispatch::{dispatch, lifecycle_error, ChatRequest};
use crate::secrets::SecretStore;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

type SessionMap = Mutex<HashMap<String, SessionCoordinator>>;

/// Everything a coordinator needs from the outside world.
pub struct RelayServices {
    pub lifecycle: SandboxLifecycle,
    pub secrets: Arc<dyn SecretStore>,
    pub bundles: Arc<dyn BundleSource>,
    pub signer: CallbackTokenSigner,
    pub config: CoordinatorConfig,
}

impl RelayServices {
    /// Verifies the execution token of a callback addressed to `session_id`.
    pub fn authorize_callback(
        &self,
        session_id: &str,
        authorization: Option<&str>,
    ) -> Result<CallbackClaims, RelayError> {
        let token = extract_bearer(authorization).ok_or_else(|| RelayError::TokenInvalid {
            message: Some("missing bearer token".to_string()),
        })?;
        let claims = self.signer.verify(token).map_err(|err| {
            tracing::warn!(session_id = %session_id, reason = err.code(), "callback token rejected");
            RelayError::TokenInvalid {
                message: Some(err.to_string()),
            }
        })?;
        if claims.session_id != session_id {
            tracing::warn!(
                session_id = %session_id,
                token_session_id = %claims.session_id,
                execution_id = %claims.execution_id,
                "callback token issued for another session"
            );
            return Err(RelayError::TokenInvalid {
                message: Some("token does not belong to this session".to_string()),
            });
        }
        Ok(claims)
    }
}

/// Client half of a started chat.
#[derive(Debug)]
pub struct ChatStream {
    pub execution_id: String,
    pub format: StreamFormat,
    pub frames: mpsc::Receiver<OutboundFrame>,
    pub completion: CompletionWaiter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CallbackReport {
    pub execution_id: String,
    pub lines: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuity_id: Option<String>,
}

type Settlement = Result<BridgeOutcome, BridgeFailure>;

enum Command {
    StartChat {
        request: ChatRequest,
        reply: oneshot::Sender<ChatStream>,
    },
    Attach {
        execution_id: String,
        reply: oneshot::Sender<Option<BridgeSink>>,
    },
    Finish {
        execution_id: String,
        result: Settlement,
        reply: oneshot::Sender<()>,
    },
    DispatchFailed {
        execution_id: String,
        message: String,
    },
    BridgeTimeout {
        execution_id: String,
    },
}

fn actor_gone(session_id: &str) -> RelayError {
    RelayError::Internal {
        message: format!("coordinator for session {session_id} stopped"),
    }
}

/// Handle to one session's coordinator.
#[derive(Clone)]
pub struct SessionCoordinator {
    session_id: String,
    commands: mpsc::Sender<Command>,
    lane: Arc<Mutex<()>>,
    services: Arc<RelayServices>,
}

impl SessionCoordinator {
    fn spawn(session_id: &str, services: Arc<RelayServices>, registry: Weak<SessionMap>) -> Self {
        let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let lane = Arc::new(Mutex::new(()));
        let actor = SessionActor {
            session_id: session_id.to_string(),
            services: services.clone(),
            lane: lane.clone(),
            commands: commands.downgrade(),
            registry,
            bridges: HashMap::new(),
        };
        tokio::spawn(actor.run(receiver));
        Self {
            session_id: session_id.to_string(),
            commands,
            lane,
            services,
        }
    }

    /// Records the owning user. Safe to repeat.
    pub async fn init(&self, user_id: &str) -> Result<Session, RelayError> {
        let _lane = self.lane.lock().await;
        let session = self
            .services
            .lifecycle
            .assign_user(&self.session_id, user_id)
            .await
            .map_err(lifecycle_error)?;
        tracing::info!(session_id = %self.session_id, user_id = %user_id, "session initialized");
        Ok(session)
    }

    /// Provisions the session's sandbox for `user_id`.
    pub async fn provision(
        &self,
        sandbox_id: &str,
        user_id: &str,
        options: CreateOptions,
    ) -> Result<Session, RelayError> {
        let _lane = self.lane.lock().await;
        let lifecycle = &self.services.lifecycle;
        let existing = lifecycle
            .store()
            .get(&self.session_id)
            .await
            .map_err(|err| RelayError::Internal {
                message: err.to_string(),
            })?;
        if existing.is_some_and(|session| !session.is_gone()) {
            return Err(RelayError::InvalidRequest {
                message: format!("session {} already exists", self.session_id),
            });
        }
        let bundle = self
            .services
            .bundles
            .load(user_id)
            .await
            .map_err(|message| RelayError::ProvisioningFailed {
                step: "config".to_string(),
                message,
            })?;
        lifecycle
            .create_sandbox(
                Session::new(self.session_id.clone(), sandbox_id),
                user_id,
                &bundle,
                &options,
            )
            .await
            .map_err(lifecycle_error)
    }

    pub async fn delete(&self, pending: bool) -> Result<Session, RelayError> {
        let _lane = self.lane.lock().await;
        self.services
            .lifecycle
            .delete_session(&self.session_id, pending)
            .await
            .map_err(lifecycle_error)
    }

    /// Opens the output stream for a new execution and dispatches the agent
    /// in the background. Dispatch errors arrive on the stream.
    pub async fn start_chat(&self, request: ChatRequest) -> Result<ChatStream, RelayError> {
        if request.prompt.trim().is_empty() {
            return Err(RelayError::InvalidRequest {
                message: "prompt must not be empty".to_string(),
            });
        }
        self.request(|reply| Command::StartChat { request, reply })
            .await
    }

    /// Streams a verified callback body to the client waiting on the
    /// token's execution.
    ///
    /// The client stream closes only once the actor has settled the bridge
    /// and persisted its continuity id.
    async fn stream_callback<S, E>(
        &self,
        claims: CallbackClaims,
        body: S,
    ) -> Result<CallbackReport, RelayError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let execution_id = claims.execution_id;
        let mut sink = self
            .request(|reply| Command::Attach {
                execution_id: execution_id.clone(),
                reply,
            })
            .await?
            .ok_or_else(|| RelayError::NoActiveStream {
                execution_id: execution_id.clone(),
            })?;
        let mut finish = CallbackFinish::new(&execution_id, self.commands.clone());

        let result = sink.pump(body).await;
        let settled = finish
            .report(result.clone())
            .await
            .ok_or_else(|| actor_gone(&self.session_id))?;
        settled.await.map_err(|_| actor_gone(&self.session_id))?;
        drop(sink);

        match result {
            Ok(outcome) => Ok(CallbackReport {
                execution_id,
                lines: outcome.lines,
                continuity_id: outcome.continuity_id,
            }),
            Err(failure) => Err(RelayError::StreamError {
                message: failure.to_string(),
            }),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RelayError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| actor_gone(&self.session_id))?;
        response.await.map_err(|_| actor_gone(&self.session_id))
    }
}

/// Reports the end of an attached callback to the actor. Dropped before
/// `report` ran, it reports the callback as interrupted.
struct CallbackFinish {
    execution_id: String,
    commands: mpsc::Sender<Command>,
    unreported: Option<Settlement>,
}

impl CallbackFinish {
    fn new(execution_id: &str, commands: mpsc::Sender<Command>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            commands,
            unreported: Some(Err(BridgeFailure::Read("callback dropped".to_string()))),
        }
    }

    async fn report(&mut self, result: Settlement) -> Option<oneshot::Receiver<()>> {
        self.unreported = Some(result.clone());
        let (reply, settled) = oneshot::channel();
        let command = Command::Finish {
            execution_id: self.execution_id.clone(),
            result,
            reply,
        };
        let sent = self.commands.send(command).await;
        self.unreported = None;
        sent.ok().map(|()| settled)
    }
}

impl Drop for CallbackFinish {
    fn drop(&mut self) {
        let Some(result) = self.unreported.take() else {
            return;
        };
        tracing::warn!(execution_id = %self.execution_id, "callback request dropped mid-stream");
        let (reply, _) = oneshot::channel();
        let command = Command::Finish {
            execution_id: std::mem::take(&mut self.execution_id),
            result,
            reply,
        };
        if let Err(TrySendError::Full(command)) = self.commands.try_send(command) {
            let commands = self.commands.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = commands.send(command).await;
                });
            }
        }
    }
}

struct PendingBridge {
    bridge: StreamBridge,
    timer: JoinHandle<()>,
}

struct SessionActor {
    session_id: String,
    services: Arc<RelayServices>,
    lane: Arc<Mutex<()>>,
    commands: mpsc::WeakSender<Command>,
    registry: Weak<SessionMap>,
    bridges: HashMap<String, PendingBridge>,
}

impl SessionActor {
    async fn run(mut self, mut receiver: mpsc::Receiver<Command>) {
        tracing::debug!(session_id = %self.session_id, "coordinator started");
        let idle_timeout = self.services.config.idle_timeout;
        loop {
            match tokio::time::timeout(idle_timeout, receiver.recv()).await {
                Ok(Some(command)) => self.handle(command),
                Ok(None) => break,
                Err(_) => {
                    if !self.retire().await {
                        continue;
                    }
                    receiver.close();
                    while let Some(command) = receiver.recv().await {
                        self.handle(command);
                    }
                    break;
                }
            }
        }
        for (execution_id, mut pending) in self.bridges.drain() {
            pending.timer.abort();
            pending.bridge.fail(BridgeFailure::Abandoned);
            tracing::debug!(execution_id = %execution_id, "bridge abandoned at shutdown");
        }
        tracing::debug!(session_id = %self.session_id, "coordinator stopped");
    }

    /// Leaves the registry when nothing references this coordinator: no
    /// pending bridge, no handle in use and no sandbox work on the lane.
    async fn retire(&self) -> bool {
        if !self.bridges.is_empty() {
            return false;
        }
        let Some(registry) = self.registry.upgrade() else {
            return true;
        };
        let mut sessions = registry.lock().await;
        if let Some(entry) = sessions.get(&self.session_id) {
            if Arc::ptr_eq(&entry.lane, &self.lane) {
                // The actor and the registry entry hold the only lane references.
                if Arc::strong_count(&self.lane) > 2 {
                    return false;
                }
                sessions.remove(&self.session_id);
            }
        }
        tracing::debug!(
            session_id = %self.session_id,
            active = sessions.len(),
            "idle coordinator retired"
        );
        true
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::StartChat { request, reply } => {
                let stream = self.start_chat(request);
                let _ = reply.send(stream);
            }
            Command::Attach {
                execution_id,
                reply,
            } => {
                let _ = reply.send(self.attach(&execution_id));
            }
            Command::Finish {
                execution_id,
                result,
                reply,
            } => self.finish(execution_id, result, reply),
            Command::DispatchFailed {
                execution_id,
                message,
            } => self.dispatch_failed(&execution_id, message),
            Command::BridgeTimeout { execution_id } => self.bridge_timeout(&execution_id),
        }
    }

    fn start_chat(&mut self, request: ChatRequest) -> ChatStream {
        let execution_id = Uuid::new_v4().to_string();
        let format = request.format;
        let (sender, frames) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (bridge, completion) = StreamBridge::new(execution_id.clone(), format, sender);
        let timer = self.arm_timeout(&execution_id);
        self.bridges
            .insert(execution_id.clone(), PendingBridge { bridge, timer });

        tracing::info!(
            session_id = %self.session_id,
            execution_id = %execution_id,
            format = ?format,
            "chat started"
        );
        self.spawn_dispatch(execution_id.clone(), request);

        ChatStream {
            execution_id,
            format,
            frames,
            completion,
        }
    }

    fn arm_timeout(&self, execution_id: &str) -> JoinHandle<()> {
        let commands = self.commands.clone();
        let timeout = self.services.config.bridge_timeout;
        let execution_id = execution_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::BridgeTimeout { execution_id }).await;
            }
        })
    }

    fn spawn_dispatch(&self, execution_id: String, request: ChatRequest) {
        let services = self.services.clone();
        let lane = self.lane.clone();
        let commands = self.commands.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let result = {
                let _lane = lane.lock().await;
                dispatch(&services, &session_id, &execution_id, &request).await
            };
            let Err(err) = result else {
                return;
            };
            tracing::warn!(
                session_id = %session_id,
                execution_id = %execution_id,
                error = %err,
                "dispatch failed"
            );
            if let Some(commands) = commands.upgrade() {
                let _ = commands
                    .send(Command::DispatchFailed {
                        execution_id,
                        message: err.to_string(),
                    })
                    .await;
            }
        });
    }

    fn attach(&mut self, execution_id: &str) -> Option<BridgeSink> {
        let pending = self.bridges.get_mut(execution_id)?;
        let sink = pending.bridge.attach()?;
        pending.timer.abort();
        tracing::info!(
            session_id = %self.session_id,
            execution_id = %execution_id,
            waited_ms = pending.bridge.age().as_millis() as u64,
            "callback attached"
        );
        Some(sink)
    }

    fn finish(&mut self, execution_id: String, result: Settlement, reply: oneshot::Sender<()>) {
        let Some(pending) = self.bridges.remove(&execution_id) else {
            let _ = reply.send(());
            return;
        };
        pending.timer.abort();
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(failure) => {
                pending.bridge.reject(failure);
                let _ = reply.send(());
                return;
            }
        };
        let continuity_id = outcome.continuity_id.clone();
        pending.bridge.resolve(outcome);

        let services = self.services.clone();
        let lane = self.lane.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let _lane = lane.lock().await;
            let lifecycle = &services.lifecycle;
            if let Some(continuity_id) = continuity_id {
                if let Err(err) = lifecycle.record_continuity(&session_id, &continuity_id).await {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %err,
                        "failed to record continuity id"
                    );
                }
            }
            if let Err(err) = lifecycle.touch(&session_id).await {
                tracing::debug!(session_id = %session_id, error = %err, "failed to mark session active");
            }
            let _ = reply.send(());

            let session = match lifecycle.load(&session_id).await {
                Ok(session) => session,
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "skipping user rules sync");
                    return;
                }
            };
            if let Some(user_id) = session.user_id.clone() {
                lifecycle
                    .sync_back(&session, &user_id, services.bundles.as_ref())
                    .await;
            }
        });
    }

    fn dispatch_failed(&mut self, execution_id: &str, message: String) {
        let failure = BridgeFailure::Dispatch(message);
        let attached = match self.bridges.get(execution_id) {
            Some(pending) => pending.bridge.is_attached(),
            None => return,
        };
        if attached {
            // The callback owns the sink; only the signal can be settled.
            if let Some(pending) = self.bridges.get(execution_id) {
                pending.bridge.reject(failure);
            }
            return;
        }
        if let Some(mut pending) = self.bridges.remove(execution_id) {
            pending.timer.abort();
            pending.bridge.fail(failure);
        }
    }

    fn bridge_timeout(&mut self, execution_id: &str) {
        let expired = self
            .bridges
            .get(execution_id)
            .is_some_and(|pending| !pending.bridge.is_attached());
        if !expired {
            return;
        }
        if let Some(mut pending) = self.bridges.remove(execution_id) {
            tracing::warn!(
                session_id = %self.session_id,
                execution_id = %execution_id,
                timeout_secs = self.services.config.bridge_timeout.as_secs(),
                "no callback received, closing stream"
            );
            pending
                .bridge
                .fail(BridgeFailure::Timeout(self.services.config.bridge_timeout));
        }
    }
}

/// Lazily spawned coordinators keyed by session id. Idle coordinators
/// remove themselves.
pub struct CoordinatorRegistry {
    services: Arc<RelayServices>,
    sessions: Arc<SessionMap>,
}

impl CoordinatorRegistry {
    pub fn new(services: RelayServices) -> Self {
        Self {
            services: Arc::new(services),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn services(&self) -> &RelayServices {
        &self.services
    }

    /// Coordinator for `session_id`, spawned if none is running.
    pub async fn get(&self, session_id: &str) -> SessionCoordinator {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, coordinator| !coordinator.commands.is_closed());
        if let Some(coordinator) = sessions.get(session_id) {
            return coordinator.clone();
        }
        let coordinator = SessionCoordinator::spawn(
            session_id,
            self.services.clone(),
            Arc::downgrade(&self.sessions),
        );
        sessions.insert(session_id.to_string(), coordinator.clone());
        tracing::debug!(session_id = %session_id, active = sessions.len(), "coordinator spawned");
        coordinator
    }

    /// Like [`Self::get`], but only for sessions the store knows about.
    pub async fn open(&self, session_id: &str) -> Result<SessionCoordinator, RelayError> {
        self.session(session_id).await?;
        Ok(self.get(session_id).await)
    }

    pub async fn session(&self, session_id: &str) -> Result<Session, RelayError> {
        self.services
            .lifecycle
            .load(session_id)
            .await
            .map_err(lifecycle_error)
    }

    pub async fn active_sessions(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .filter(|coordinator| !coordinator.commands.is_closed())
            .count()
    }

    /// Verifies the execution token, then streams `body` to the waiting
    /// client. Forged callbacks never reach a coordinator, and valid ones
    /// never spawn one.
    pub async fn handle_callback<S, E>(
        &self,
        session_id: &str,
        authorization: Option<&str>,
        body: S,
    ) -> Result<CallbackReport, RelayError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let claims = self.services.authorize_callback(session_id, authorization)?;
        let running = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(session_id)
                .filter(|coordinator| !coordinator.commands.is_closed())
                .cloned()
        };
        let Some(coordinator) = running else {
            return Err(RelayError::NoActiveStream {
                execution_id: claims.execution_id,
            });
        };
        coordinator.stream_callback(claims, body).await
    }
}
