use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

/// Error text fragments the sandbox host reports while the sandbox is still
/// booting or was just recycled.
pub const NOT_READY_SIGNATURES: [&str; 4] = [
    "shell has died",
    "disconnected prematurely",
    "not ready",
    "sandbox is not ready",
];

/// Deadline of one non-streaming sandbox call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SandboxCallError {
    #[error("sandbox request failed: {0}")]
    Transport(String),
    #[error("sandbox responded with {status}: {message}")]
    Status { status: u16, message: String },
    #[error("sandbox call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("{0}")]
    Remote(String),
}

impl SandboxCallError {
    /// Transient failures worth one wait-for-ready and a single retry.
    pub fn is_not_ready(&self) -> bool {
        let text = self.to_string().to_ascii_lowercase();
        NOT_READY_SIGNATURES
            .iter()
            .any(|signature| text.contains(signature))
    }
}

impl SandboxCallError {
    fn from_reqwest(err: reqwest::Error, deadline: Duration) -> Self {
        if err.is_timeout() {
            return Self::Timeout(deadline);
        }
        Self::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(
        default,
        rename = "timeoutMs",
        with = "duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub id: String,
}

pub type OutputStream = Pin<Box<dyn Stream<Item = Result<Bytes, SandboxCallError>> + Send>>;

pub type SandboxFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, SandboxCallError>> + Send + 'a>>;

/// Remote command and filesystem primitives of one sandbox host.
///
/// The host runs one command at a time per sandbox; callers sequence their
/// calls. `start_background_process` replaces the process environment
/// instead of merging it.
pub trait SandboxControl: Send + Sync + 'static {
    fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        options: &ExecOptions,
    ) -> SandboxFuture<'_, ExecOutput>;

    fn exec_stream(
        &self,
        sandbox_id: &str,
        command: &str,
        options: &ExecOptions,
    ) -> SandboxFuture<'_, OutputStream>;

    fn write_file(&self, sandbox_id: &str, path: &str, contents: &str) -> SandboxFuture<'_, ()>;

    /// `Ok(None)` when the file does not exist.
    fn read_file(&self, sandbox_id: &str, path: &str) -> SandboxFuture<'_, Option<String>>;

    fn mkdir(&self, sandbox_id: &str, path: &str) -> SandboxFuture<'_, ()>;

    fn set_env(&self, sandbox_id: &str, env: &HashMap<String, String>) -> SandboxFuture<'_, ()>;

    fn start_background_process(
        &self,
        sandbox_id: &str,
        command: &str,
        env: &HashMap<String, String>,
    ) -> SandboxFuture<'_, ProcessHandle>;
}

/// `SandboxControl` over the sandbox host's HTTP API.
///
/// Batch calls carry a per-request deadline. Streaming exec is bounded only
/// by the connect timeout, since its body can last for many minutes.
#[derive(Debug, Clone)]
pub struct HttpSandboxControl {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    request_timeout: Duration,
}

impl HttpSandboxControl {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, SandboxCallError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|err| SandboxCallError::Transport(format!("invalid sandbox url: {err}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| SandboxCallError::from_reqwest(err, CONNECT_TIMEOUT))?;
        Ok(Self {
            client,
            base_url,
            token,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn url(&self, sandbox_id: &str, resource: &str) -> Result<Url, SandboxCallError> {
        self.base_url
            .join(&format!("v1/sandboxes/{sandbox_id}/{resource}"))
            .map_err(|err| SandboxCallError::Transport(format!("invalid sandbox url: {err}")))
    }

    /// Request bounded by the per-call deadline.
    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.streaming_request(method, url)
            .timeout(self.request_timeout)
    }

    fn streaming_request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn call_error(&self, err: reqwest::Error) -> SandboxCallError {
        SandboxCallError::from_reqwest(err, self.request_timeout)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, SandboxCallError> {
        let response = builder.send().await.map_err(|err| self.call_error(err))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(SandboxCallError::Status {
            status: status.as_u16(),
            message: error_message(&message),
        })
    }
}

/// Pulls `message`/`error` out of a JSON error body, else the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .or_else(|| value.get("error"))
                .or_else(|| value.get("detail"))
                .and_then(|message| message.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

impl SandboxControl for HttpSandboxControl {
    fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        options: &ExecOptions,
    ) -> SandboxFuture<'_, ExecOutput> {
        let url = self.url(sandbox_id, "exec");
        let payload = exec_payload(command, options);
        Box::pin(async move {
            let response = self
                .send(self.request(Method::POST, url?).json(&payload))
                .await?;
            response
                .json::<ExecOutput>()
                .await
                .map_err(|err| self.call_error(err))
        })
    }

    fn exec_stream(
        &self,
        sandbox_id: &str,
        command: &str,
        options: &ExecOptions,
    ) -> SandboxFuture<'_, OutputStream> {
        let url = self.url(sandbox_id, "exec/stream");
        let payload = exec_payload(command, options);
        Box::pin(async move {
            let response = self
                .send(self.streaming_request(Method::POST, url?).json(&payload))
                .await?;
            let stream = response
                .bytes_stream()
                .map_err(|err| SandboxCallError::Transport(err.to_string()));
            Ok(stream.boxed() as OutputStream)
        })
    }

    fn write_file(&self, sandbox_id: &str, path: &str, contents: &str) -> SandboxFuture<'_, ()> {
        let url = self.url(sandbox_id, "files");
        let path = path.to_string();
        let contents = contents.to_string();
        Box::pin(async move {
            self.send(
                self.request(Method::PUT, url?)
                    .query(&[("path", path.as_str())])
                    .body(contents),
            )
            .await?;
            Ok(())
        })
    }

    fn read_file(&self, sandbox_id: &str, path: &str) -> SandboxFuture<'_, Option<String>> {
        let url = self.url(sandbox_id, "files");
        let path = path.to_string();
        Box::pin(async move {
            let response = self
                .request(Method::GET, url?)
                .query(&[("path", path.as_str())])
                .send()
                .await
                .map_err(|err| self.call_error(err))?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let status = response.status();
            let body = response.text().await.map_err(|err| self.call_error(err))?;
            if !status.is_success() {
                return Err(SandboxCallError::Status {
                    status: status.as_u16(),
                    message: error_message(&body),
                });
            }
            Ok(Some(body))
        })
    }

    fn mkdir(&self, sandbox_id: &str, path: &str) -> SandboxFuture<'_, ()> {
        let url = self.url(sandbox_id, "directories");
        let payload = json!({ "path": path, "recursive": true });
        Box::pin(async move {
            self.send(self.request(Method::POST, url?).json(&payload))
                .await?;
            Ok(())
        })
    }

    fn set_env(&self, sandbox_id: &str, env: &HashMap<String, String>) -> SandboxFuture<'_, ()> {
        let url = self.url(sandbox_id, "env");
        let payload = json!({ "env": env });
        Box::pin(async move {
            self.send(self.request(Method::PUT, url?).json(&payload))
                .await?;
            Ok(())
        })
    }

    fn start_background_process(
        &self,
        sandbox_id: &str,
        command: &str,
        env: &HashMap<String, String>,
    ) -> SandboxFuture<'_, ProcessHandle> {
        let url = self.url(sandbox_id, "processes");
        let payload = json!({ "command": command, "env": env, "background": true });
        Box::pin(async move {
            let response = self
                .send(self.request(Method::POST, url?).json(&payload))
                .await?;
            response
                .json::<ProcessHandle>()
                .await
                .map_err(|err| self.call_error(err))
        })
    }
}

fn exec_payload(command: &str, options: &ExecOptions) -> serde_json::Value {
    let mut payload = serde_json::to_value(options).unwrap_or_else(|_| json!({}));
    if let Some(object) = payload.as_object_mut() {
        object.insert("command".to_string(), json!(command));
    }
    payload
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_u64(duration.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
