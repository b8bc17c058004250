//! Worker process supervision.
//!
//! The channel consumes process supervision as a capability: start an OS
//! process asynchronously, expose its PID, wait for termination, kill it.
//! [`OsProcessSupervisor`] is the real implementation on
//! `tokio::process`; tests substitute their own.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::error::{CoreError, Result};

const PROCESS_START_DELAY: Duration = Duration::from_millis(100);

/// Description of a worker executable and how to launch it.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerDescription {
    /// Language tag (node, python, java, powershell, ...).
    pub language: String,
    /// Directory the worker runs from.
    pub worker_directory: PathBuf,
    /// Worker executable.
    pub executable: PathBuf,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Extra environment passed to the process.
    #[serde(default)]
    pub environment: Vec<(String, String)>,
}

impl WorkerDescription {
    /// Creates a description with no arguments or extra environment.
    #[must_use]
    pub fn new(
        language: impl Into<String>,
        worker_directory: impl Into<PathBuf>,
        executable: impl Into<PathBuf>,
    ) -> Self {
        Self {
            language: language.into(),
            worker_directory: worker_directory.into(),
            executable: executable.into(),
            arguments: Vec::new(),
            environment: Vec::new(),
        }
    }
}

/// A handle to a running worker process.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id.
    fn pid(&self) -> u32;

    /// Waits for the process to exit and returns its exit code.
    async fn wait(&mut self) -> Result<i32>;

    /// Kills the process.
    async fn kill(&mut self) -> Result<()>;
}

/// Spawns worker processes.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Starts a worker process from its description.
    async fn spawn(&self, description: &WorkerDescription) -> Result<Box<dyn WorkerProcess>>;
}

/// Process supervisor backed by real OS processes.
#[derive(Debug, Default)]
pub struct OsProcessSupervisor;

impl OsProcessSupervisor {
    /// Creates a new supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessSupervisor for OsProcessSupervisor {
    async fn spawn(&self, description: &WorkerDescription) -> Result<Box<dyn WorkerProcess>> {
        info!(
            language = %description.language,
            executable = %description.executable.display(),
            "starting worker process"
        );

        let mut command = Command::new(&description.executable);
        command
            .args(&description.arguments)
            .current_dir(&description.worker_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        for (key, value) in &description.environment {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| CoreError::Spawn(e.to_string()))?;

        tokio::time::sleep(PROCESS_START_DELAY).await;

        if let Ok(Some(status)) = child.try_wait() {
            return Err(CoreError::ExitedImmediately(status.to_string()));
        }

        let pid = child.id().unwrap_or(0);
        debug!(pid, "worker process started");

        Ok(Box::new(OsWorkerProcess { pid, child }))
    }
}

/// An OS worker process handle.
#[derive(Debug)]
pub struct OsWorkerProcess {
    pid: u32,
    child: Child,
}

#[async_trait]
impl WorkerProcess for OsWorkerProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| CoreError::Process(e.to_string()))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .await
            .map_err(|e| CoreError::Process(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_defaults() {
        let description = WorkerDescription::new("node", "/opt/workers/node", "/usr/bin/node");
        assert_eq!(description.language, "node");
        assert!(description.arguments.is_empty());
        assert!(description.environment.is_empty());
    }

    #[tokio::test]
    async fn spawn_missing_executable_fails() {
        let supervisor = OsProcessSupervisor::new();
        let description =
            WorkerDescription::new("node", "/tmp", "/nonexistent/meridian-test-worker");

        let result = supervisor.spawn(&description).await;
        assert!(matches!(result, Err(CoreError::Spawn(_))));
    }
}
