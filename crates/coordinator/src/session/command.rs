//! Shell-command worker backend
//!
//! Runs the task payload through the configured shell. The child talks back
//! on stdout with a tiny line protocol:
//!
//! ```text
//! PROGRESS 40 compiling crate
//! NOTE waiting for lock on schema.sql
//! ```
//!
//! Any other stdout line is kept as the candidate result. Exit status 0 means
//! done; otherwise the last stderr line becomes the error.

use super::{SessionHandle, SessionId, SessionPoll, WorkerBackend};
use ai_agent_common::{Agent, Task, WorkerConfig};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One parsed stdout line
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerLine {
    Progress { percent: u8, note: Option<String> },
    Note(String),
    Output(String),
}

pub fn parse_worker_line(line: &str) -> WorkerLine {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix("PROGRESS ") {
        let mut parts = rest.trim().splitn(2, char::is_whitespace);
        let percent = parts
            .next()
            .and_then(|p| p.trim_end_matches('%').parse::<f64>().ok())
            .filter(|p| p.is_finite());
        if let Some(percent) = percent {
            let note = parts
                .next()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string);
            return WorkerLine::Progress {
                percent: percent.clamp(0.0, 100.0).round() as u8,
                note,
            };
        }
    }

    if let Some(rest) = line.strip_prefix("NOTE ") {
        return WorkerLine::Note(rest.trim().to_string());
    }

    WorkerLine::Output(line.to_string())
}

enum Exit {
    Success,
    Failed(String),
}

#[derive(Default)]
struct Observed {
    percent: Option<u8>,
    note: Option<String>,
    last_output: Option<String>,
    last_stderr: Option<String>,
    exit: Option<Exit>,
}

struct CommandSession {
    observed: Arc<Mutex<Observed>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    cancel: CancellationToken,
}

pub struct CommandBackend {
    shell: String,
    default_command: Option<String>,
    workdir: Option<PathBuf>,
    sessions: DashMap<SessionId, Arc<CommandSession>>,
}

impl CommandBackend {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            default_command: config.default_command.clone(),
            workdir: None,
            sessions: DashMap::new(),
        }
    }

    /// Run every command from `dir`
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn session(&self, id: &SessionId) -> Result<Arc<CommandSession>> {
        self.sessions
            .get(id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| anyhow!("Unknown session {}", id))
    }
}

#[async_trait]
impl WorkerBackend for CommandBackend {
    async fn start(&self, agent: &Agent, task: &Task) -> Result<SessionHandle> {
        let command = task
            .payload
            .clone()
            .or_else(|| self.default_command.clone())
            .ok_or_else(|| anyhow!("Task {} has no command to run", task.id))?;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&command)
            .env("AGENT_NAME", &agent.name)
            .env("AGENT_ROLE", &agent.role)
            .env("TASK_ID", task.id.as_str())
            .env("TASK_DESCRIPTION", &task.description)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn `{}` for task {}", command, task.id))?;
        let stdout = child.stdout.take().context("Child stdout was not captured")?;
        let stderr = child.stderr.take().context("Child stderr was not captured")?;
        let stdin = child.stdin.take();

        let handle = SessionHandle::new(&agent.name, task.id.clone());
        let observed = Arc::new(Mutex::new(Observed::default()));
        let cancel = CancellationToken::new();

        let out = Arc::clone(&observed);
        let stdout_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut observed = out.lock();
                match parse_worker_line(&line) {
                    WorkerLine::Progress { percent, note } => {
                        observed.percent = Some(percent);
                        if note.is_some() {
                            observed.note = note;
                        }
                    }
                    WorkerLine::Note(note) => observed.note = Some(note),
                    WorkerLine::Output(text) if !text.is_empty() => {
                        observed.last_output = Some(text)
                    }
                    WorkerLine::Output(_) => {}
                }
            }
        });

        let err = Arc::clone(&observed);
        let stderr_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if !line.is_empty() {
                    err.lock().last_stderr = Some(line.to_string());
                }
            }
        });

        let watched = Arc::clone(&observed);
        let token = cancel.clone();
        let session_id = handle.id;
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill session {}: {}", session_id, e);
                    }
                    return;
                }
            };

            // Drain both pipes so the final lines land before the exit does
            let _ = stdout_reader.await;
            let _ = stderr_reader.await;

            let mut observed = watched.lock();
            let last_stderr = observed.last_stderr.clone();
            observed.exit = Some(match status {
                Ok(status) if status.success() => Exit::Success,
                Ok(status) => Exit::Failed(last_stderr.unwrap_or_else(|| format!("command {}", status))),
                Err(e) => Exit::Failed(format!("failed to wait for command: {}", e)),
            });
        });

        self.sessions.insert(
            handle.id,
            Arc::new(CommandSession {
                observed,
                stdin: tokio::sync::Mutex::new(stdin),
                cancel,
            }),
        );

        info!("Started session {} for task {} on {}", handle.id, task.id, agent.name);
        Ok(handle)
    }

    async fn cancel(&self, handle: &SessionHandle) -> Result<()> {
        if let Some((_, session)) = self.sessions.remove(&handle.id) {
            session.cancel.cancel();
            debug!("Cancelled session {}", handle.id);
        }
        Ok(())
    }

    async fn poll(&self, handle: &SessionHandle) -> Result<SessionPoll> {
        let session = self.session(&handle.id)?;

        let (poll, finished) = {
            let observed = session.observed.lock();
            let poll = match &observed.exit {
                None => SessionPoll::running(observed.percent, observed.note.as_deref()),
                Some(Exit::Success) => SessionPoll {
                    note: observed.note.clone(),
                    ..SessionPoll::finished(observed.last_output.clone())
                },
                Some(Exit::Failed(reason)) => SessionPoll {
                    progress: observed.percent,
                    note: observed.note.clone(),
                    ..SessionPoll::failed(reason.clone())
                },
            };
            (poll, observed.exit.is_some())
        };

        if finished {
            self.sessions.remove(&handle.id);
        }
        Ok(poll)
    }

    async fn nudge(&self, handle: &SessionHandle, task: &Task) -> Result<()> {
        let session = self.session(&handle.id)?;
        let mut stdin = session.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            bail!("Session {} has no stdin", handle.id);
        };

        let message = format!("NUDGE {}: {}\n", task.id, task.description);
        pipe.write_all(message.as_bytes())
            .await
            .context("Failed to nudge worker")?;
        pipe.flush().await.context("Failed to nudge worker")?;
        Ok(())
    }
}
