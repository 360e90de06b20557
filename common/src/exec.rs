use std::{
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    time::timeout,
};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start {program}: {source}")]
    Start {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with code {code}: {stderr}")]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },
    #[error("timed out waiting for {program} to return")]
    Timeout { program: String, output: String },
}

/// Runs external programs on behalf of the rest of the crate. Everything that
/// shells out (device discovery, fio itself, the cache drop) goes through this
/// trait so tests can script the command transcript.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a program to completion, logging its output.
    async fn command(&self, program: &str, args: &[&str]) -> Result<(), ExecError>;

    /// Run a program and return its trimmed stdout.
    async fn command_with_output(&self, program: &str, args: &[&str])
    -> Result<String, ExecError>;

    /// Run a program and return stdout followed by stderr.
    async fn command_with_combined_output(
        &self,
        program: &str,
        args: &[&str],
    ) -> Result<String, ExecError>;

    /// Run a program, escalating interrupt -> kill once `limit` elapses. The
    /// timeout error carries whatever output was captured before the process
    /// went away.
    async fn command_with_timeout(
        &self,
        limit: Duration,
        program: &str,
        args: &[&str],
    ) -> Result<String, ExecError>;
}

pub struct CommandExecutor;

fn log_command(program: &str, args: &[&str]) {
    debug!("running command: {program} {}", args.join(" "));
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).trim().to_owned()
}

fn append_stderr(output: &mut String, stderr: &str) {
    if stderr.is_empty() {
        return;
    }
    if !output.is_empty() {
        output.push('\n');
    }
    output.push_str(stderr);
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn command(&self, program: &str, args: &[&str]) -> Result<(), ExecError> {
        let output = self.command_with_combined_output(program, args).await?;
        if !output.is_empty() {
            debug!("{output}");
        }
        Ok(())
    }

    async fn command_with_output(
        &self,
        program: &str,
        args: &[&str],
    ) -> Result<String, ExecError> {
        log_command(program, args);
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| ExecError::Start {
                program: program.to_owned(),
                source,
            })?;
        if !output.status.success() {
            return Err(ExecError::Failed {
                program: program.to_owned(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    async fn command_with_combined_output(
        &self,
        program: &str,
        args: &[&str],
    ) -> Result<String, ExecError> {
        log_command(program, args);
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| ExecError::Start {
                program: program.to_owned(),
                source,
            })?;
        let mut combined = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        append_stderr(
            &mut combined,
            String::from_utf8_lossy(&output.stderr).trim(),
        );
        if !output.status.success() {
            return Err(ExecError::Failed {
                program: program.to_owned(),
                code: output.status.code().unwrap_or(-1),
                stderr: combined,
            });
        }
        Ok(combined)
    }

    async fn command_with_timeout(
        &self,
        limit: Duration,
        program: &str,
        args: &[&str],
    ) -> Result<String, ExecError> {
        log_command(program, args);
        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Start {
                program: program.to_owned(),
                source,
            })?;
        let out_task = tokio::spawn(read_pipe(child.stdout.take()));
        let err_task = tokio::spawn(read_pipe(child.stderr.take()));

        enum Waited {
            Done(std::process::ExitStatus),
            Killed,
        }

        let mut interrupted = false;
        let waited = loop {
            match timeout(limit, child.wait()).await {
                Ok(status) => {
                    break Waited::Done(status.map_err(|source| ExecError::Start {
                        program: program.to_owned(),
                        source,
                    })?);
                }
                Err(_) if !interrupted => {
                    warn!("timeout waiting for {program} to return, sending interrupt signal");
                    if let Some(id) = child.id() {
                        if let Err(err) = kill(Pid::from_raw(id as i32), Signal::SIGINT) {
                            warn!("failed to send interrupt signal to {program}: {err}");
                        }
                    }
                    interrupted = true;
                }
                Err(_) => {
                    warn!("timeout waiting for {program} after interrupt, sending kill signal");
                    if let Err(err) = child.kill().await {
                        warn!("failed to kill {program}: {err}");
                    }
                    break Waited::Killed;
                }
            }
        };

        let mut output = out_task.await.unwrap_or_default();
        append_stderr(&mut output, &err_task.await.unwrap_or_default());
        match waited {
            Waited::Killed => Err(ExecError::Timeout {
                program: program.to_owned(),
                output,
            }),
            Waited::Done(_) if interrupted => Err(ExecError::Timeout {
                program: program.to_owned(),
                output,
            }),
            Waited::Done(status) if !status.success() => Err(ExecError::Failed {
                program: program.to_owned(),
                code: status.code().unwrap_or(-1),
                stderr: output,
            }),
            Waited::Done(_) => Ok(output),
        }
    }
}

pub type CommandFn = Arc<dyn Fn(&str, &[&str]) -> Result<String, ExecError> + Send + Sync>;

/// Scripted executor for tests. Replays canned output keyed on the command
/// line and keeps a gauge of how many invocations are in flight, so tests can
/// assert on the dispatcher's concurrency ceiling.
pub struct MockExecutor {
    pub on_command: CommandFn,
    pub delay: Duration,
    pub calls: Arc<AtomicUsize>,
    pub concurrent: Arc<AtomicUsize>,
    pub peak_concurrent: Arc<AtomicUsize>,
}

impl MockExecutor {
    pub fn new(on_command: CommandFn) -> Self {
        Self {
            on_command,
            delay: Duration::ZERO,
            calls: Arc::default(),
            concurrent: Arc::default(),
            peak_concurrent: Arc::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn invoke(&self, program: &str, args: &[&str]) -> Result<String, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrent.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = (self.on_command)(program, args);
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn command(&self, program: &str, args: &[&str]) -> Result<(), ExecError> {
        self.invoke(program, args).await.map(|_| ())
    }

    async fn command_with_output(
        &self,
        program: &str,
        args: &[&str],
    ) -> Result<String, ExecError> {
        self.invoke(program, args).await
    }

    async fn command_with_combined_output(
        &self,
        program: &str,
        args: &[&str],
    ) -> Result<String, ExecError> {
        self.invoke(program, args).await
    }

    async fn command_with_timeout(
        &self,
        _limit: Duration,
        program: &str,
        args: &[&str],
    ) -> Result<String, ExecError> {
        self.invoke(program, args).await
    }
}
