//! In-memory `SandboxControl` that records every call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::stream;

use crate::control::{
    ExecOptions, ExecOutput, OutputStream, ProcessHandle, SandboxCallError, SandboxControl,
    SandboxFuture,
};
use crate::manager::HEALTH_CHECK_COMMAND;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxOp {
    Exec {
        command: String,
        env: HashMap<String, String>,
    },
    ExecStream {
        command: String,
    },
    WriteFile {
        path: String,
        contents: String,
    },
    ReadFile {
        path: String,
    },
    Mkdir {
        path: String,
    },
    SetEnv {
        env: HashMap<String, String>,
    },
    StartProcess {
        command: String,
        env: HashMap<String, String>,
    },
}

#[derive(Debug, Default)]
struct MockState {
    ops: Vec<SandboxOp>,
    files: HashMap<String, String>,
    exec_failures: VecDeque<SandboxCallError>,
    failing_health_checks: usize,
    unhealthy: bool,
    stream_chunks: Vec<String>,
    failing_writes: HashSet<String>,
    set_env_failure: Option<SandboxCallError>,
    process_failure: Option<SandboxCallError>,
    next_process: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MockSandbox {
    state: Arc<Mutex<MockState>>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, contents: &str) -> Self {
        self.state()
            .files
            .insert(path.to_string(), contents.to_string());
        self
    }

    /// When false every health check fails until set back to true.
    pub fn set_healthy(&self, healthy: bool) {
        self.state().unhealthy = !healthy;
    }

    /// Fails the next `count` health checks.
    pub fn fail_health_checks(&self, count: usize) {
        self.state().failing_health_checks = count;
    }

    /// Queues an error for the next non-health command.
    pub fn push_exec_failure(&self, err: SandboxCallError) {
        self.state().exec_failures.push_back(err);
    }

    pub fn fail_writes_to(&self, path: &str) {
        self.state().failing_writes.insert(path.to_string());
    }

    pub fn fail_set_env(&self, err: SandboxCallError) {
        self.state().set_env_failure = Some(err);
    }

    pub fn fail_process_start(&self, err: SandboxCallError) {
        self.state().process_failure = Some(err);
    }

    pub fn set_stream_output(&self, chunks: &[&str]) {
        self.state().stream_chunks = chunks.iter().map(|chunk| chunk.to_string()).collect();
    }

    pub fn ops(&self) -> Vec<SandboxOp> {
        self.state().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state().ops.clear();
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    pub fn writes(&self) -> Vec<(String, String)> {
        self.state()
            .ops
            .iter()
            .filter_map(|op| match op {
                SandboxOp::WriteFile { path, contents } => Some((path.clone(), contents.clone())),
                _ => None,
            })
            .collect()
    }

    /// Commands run through `exec`, health checks excluded.
    pub fn execs(&self) -> Vec<String> {
        self.state()
            .ops
            .iter()
            .filter_map(|op| match op {
                SandboxOp::Exec { command, .. } if command != HEALTH_CHECK_COMMAND => {
                    Some(command.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn health_checks(&self) -> usize {
        self.state()
            .ops
            .iter()
            .filter(|op| matches!(op, SandboxOp::Exec { command, .. } if command == HEALTH_CHECK_COMMAND))
            .count()
    }

    pub fn started_processes(&self) -> Vec<(String, HashMap<String, String>)> {
        self.state()
            .ops
            .iter()
            .filter_map(|op| match op {
                SandboxOp::StartProcess { command, env } => Some((command.clone(), env.clone())),
                _ => None,
            })
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_exec(&self, command: &str, options: &ExecOptions) -> Result<ExecOutput, SandboxCallError> {
        let mut state = self.state();
        state.ops.push(SandboxOp::Exec {
            command: command.to_string(),
            env: options.env.clone(),
        });
        if command == HEALTH_CHECK_COMMAND {
            if state.unhealthy {
                return Err(SandboxCallError::Remote("sandbox is not ready".to_string()));
            }
            if state.failing_health_checks > 0 {
                state.failing_health_checks -= 1;
                return Err(SandboxCallError::Remote("sandbox is not ready".to_string()));
            }
            return Ok(ExecOutput {
                exit_code: 0,
                stdout: "ready\n".to_string(),
                stderr: String::new(),
            });
        }
        if let Some(err) = state.exec_failures.pop_front() {
            return Err(err);
        }
        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

impl SandboxControl for MockSandbox {
    fn exec(
        &self,
        _sandbox_id: &str,
        command: &str,
        options: &ExecOptions,
    ) -> SandboxFuture<'_, ExecOutput> {
        let result = self.run_exec(command, options);
        Box::pin(async move { result })
    }

    fn exec_stream(
        &self,
        _sandbox_id: &str,
        command: &str,
        _options: &ExecOptions,
    ) -> SandboxFuture<'_, OutputStream> {
        let mut state = self.state();
        state.ops.push(SandboxOp::ExecStream {
            command: command.to_string(),
        });
        let result = match state.exec_failures.pop_front() {
            Some(err) => Err(err),
            None => {
                let chunks: Vec<Result<Bytes, SandboxCallError>> = state
                    .stream_chunks
                    .iter()
                    .map(|chunk| Ok(Bytes::from(chunk.clone())))
                    .collect();
                Ok(Box::pin(stream::iter(chunks)) as OutputStream)
            }
        };
        Box::pin(async move { result })
    }

    fn write_file(&self, _sandbox_id: &str, path: &str, contents: &str) -> SandboxFuture<'_, ()> {
        let mut state = self.state();
        state.ops.push(SandboxOp::WriteFile {
            path: path.to_string(),
            contents: contents.to_string(),
        });
        let result = if state.failing_writes.contains(path) {
            Err(SandboxCallError::Remote(format!("write to {path} failed")))
        } else {
            state.files.insert(path.to_string(), contents.to_string());
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn read_file(&self, _sandbox_id: &str, path: &str) -> SandboxFuture<'_, Option<String>> {
        let mut state = self.state();
        state.ops.push(SandboxOp::ReadFile {
            path: path.to_string(),
        });
        let result = Ok(state.files.get(path).cloned());
        Box::pin(async move { result })
    }

    fn mkdir(&self, _sandbox_id: &str, path: &str) -> SandboxFuture<'_, ()> {
        self.state().ops.push(SandboxOp::Mkdir {
            path: path.to_string(),
        });
        Box::pin(async move { Ok(()) })
    }

    fn set_env(&self, _sandbox_id: &str, env: &HashMap<String, String>) -> SandboxFuture<'_, ()> {
        let mut state = self.state();
        state.ops.push(SandboxOp::SetEnv { env: env.clone() });
        let result = match state.set_env_failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        Box::pin(async move { result })
    }

    fn start_background_process(
        &self,
        _sandbox_id: &str,
        command: &str,
        env: &HashMap<String, String>,
    ) -> SandboxFuture<'_, ProcessHandle> {
        let mut state = self.state();
        state.ops.push(SandboxOp::StartProcess {
            command: command.to_string(),
            env: env.clone(),
        });
        let result = match state.process_failure.take() {
            Some(err) => Err(err),
            None => {
                state.next_process += 1;
                Ok(ProcessHandle {
                    id: format!("proc-{}", state.next_process),
                })
            }
        };
        Box::pin(async move { result })
    }
}
