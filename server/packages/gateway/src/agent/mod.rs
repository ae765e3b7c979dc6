//! Runs a CLI agent inside a sandbox and turns its transcript into
//! [`InternalEvent`]s.
//!
//! The run owns its [`SandboxLease`] from provisioning until the final
//! event, so the sandbox is terminated exactly once on every exit path:
//! completion, failure, timeout, or the client going away.

pub mod environment;
pub mod prompt;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use janus_agent_schema::{preview, Artifact, InternalEvent, TranscriptEvent, TranscriptParser};
use janus_completion::ChatMessage;
use janus_error::GatewayError;
use janus_sandbox::{ExecFrame, ExecRequest, SandboxAuth, SandboxLease, SandboxOrchestrator, WarmPool};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactMaterializer, RawFile};
use crate::capability::GenerationFlags;
use crate::config::AgentConfig;
use crate::errors::{error_event, map_orchestrator_error, map_platform_error, map_transcript_error};
use crate::EventStream;

const CHANNEL_CAPACITY: usize = 64;
const STDERR_TAIL_LINES: usize = 20;
const PROMPT_PLACEHOLDER: &str = "{prompt_file}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunState {
    Starting,
    Streaming,
    Completed,
    Failed,
    TimedOut,
}

impl AgentRunState {
    pub fn can_transition_to(self, next: AgentRunState) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Streaming | Self::Failed | Self::TimedOut)
                | (Self::Streaming, Self::Completed | Self::Failed | Self::TimedOut)
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

/// One agent process inside one sandbox.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub sandbox_id: String,
    pub exec_id: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub state: AgentRunState,
    pub started_at: OffsetDateTime,
}

impl AgentRun {
    fn transition(&mut self, next: AgentRunState) {
        if !self.state.can_transition_to(next) {
            warn!(
                sandbox_id = %self.sandbox_id,
                from = ?self.state,
                to = ?next,
                "ignoring invalid agent run transition"
            );
            return;
        }
        info!(
            sandbox_id = %self.sandbox_id,
            exec_id = %self.exec_id,
            from = ?self.state,
            to = ?next,
            "agent run state changed"
        );
        self.state = next;
    }
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub request_id: String,
    pub messages: Vec<ChatMessage>,
    pub flags: GenerationFlags,
}

enum RunEnd {
    Completed,
    Failed(GatewayError),
    ClientGone,
}

/// Deadlines for tool calls that are still open.
struct ToolClock {
    timeout: Duration,
    open: HashMap<String, (String, Instant)>,
}

impl ToolClock {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            open: HashMap::new(),
        }
    }

    fn start(&mut self, call_id: &str, name: &str) {
        self.open
            .insert(call_id.to_string(), (name.to_string(), Instant::now()));
    }

    fn finish(&mut self, call_id: &str) {
        self.open.remove(call_id);
    }

    /// The earlier of the run budget and the oldest open tool's deadline,
    /// with the tool's name when it is the tool.
    fn next_deadline(&self, budget_deadline: Instant) -> (Instant, Option<String>) {
        self.open
            .values()
            .map(|(name, started)| (*started + self.timeout, name))
            .min_by_key(|(deadline, _)| *deadline)
            .filter(|(deadline, _)| *deadline < budget_deadline)
            .map(|(deadline, name)| (deadline, Some(name.clone())))
            .unwrap_or((budget_deadline, None))
    }
}

#[derive(Clone)]
pub struct AgentAdapter {
    inner: Arc<AdapterInner>,
}

struct AdapterInner {
    orchestrator: SandboxOrchestrator,
    pool: Option<WarmPool>,
    config: AgentConfig,
    materializer: ArtifactMaterializer,
    sandbox_credential: String,
}

async fn emit(tx: &mpsc::Sender<InternalEvent>, event: InternalEvent) -> bool {
    tx.send(event).await.is_ok()
}

impl AgentAdapter {
    pub fn new(
        orchestrator: SandboxOrchestrator,
        pool: Option<WarmPool>,
        config: AgentConfig,
        materializer: ArtifactMaterializer,
        sandbox_credential: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                orchestrator,
                pool: pool.filter(WarmPool::is_enabled),
                config,
                materializer,
                sandbox_credential: sandbox_credential.into(),
            }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Provisions a sandbox (warm pool first) and runs the agent in it.
    /// Dropping the returned stream cancels the run and its sandbox.
    pub fn start(&self, request: AgentRequest) -> EventStream {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let adapter = self.clone();
        tokio::spawn(async move {
            let request_id = request.request_id.clone();
            tokio::select! {
                _ = tx.closed() => {
                    info!(request_id = %request_id, "client went away; agent run cancelled");
                }
                _ = adapter.provision_and_run(request, &tx) => {}
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }

    async fn provision_and_run(&self, request: AgentRequest, tx: &mpsc::Sender<InternalEvent>) {
        let lease = match self.acquire(&request.request_id).await {
            Ok(lease) => lease,
            Err(err) => {
                warn!(request_id = %request.request_id, error = %err, "sandbox provisioning failed");
                if emit(tx, error_event(&err)).await {
                    emit(tx, InternalEvent::Done).await;
                }
                return;
            }
        };
        let ready = InternalEvent::lifecycle("sandbox.ready", Some(lease.id().to_string()));
        if !emit(tx, ready).await {
            return;
        }
        self.run(lease, &request, tx).await;
    }

    async fn acquire(&self, request_id: &str) -> Result<SandboxLease, GatewayError> {
        let ports = &self.inner.config.expose_ports;
        if let Some(pool) = &self.inner.pool {
            let ttl = self.inner.orchestrator.config().default_ttl;
            if let Some(lease) = pool.acquire(request_id, ttl, ports).await {
                debug!(request_id, sandbox_id = %lease.id(), "using warm sandbox");
                return Ok(lease);
            }
        }
        let auth = SandboxAuth::new(self.inner.sandbox_credential.clone(), request_id);
        self.inner
            .orchestrator
            .create(auth, None, ports)
            .await
            .map_err(map_orchestrator_error)
    }

    /// Runs the agent in `lease`'s sandbox, then terminates it. Every path
    /// ends with `Done`, preceded by `Error` when the process failed.
    pub async fn run(
        &self,
        lease: SandboxLease,
        request: &AgentRequest,
        tx: &mpsc::Sender<InternalEvent>,
    ) {
        let end = self.execute(&lease, request, tx).await;
        let sandbox_id = lease.id().to_string();
        if let Err(err) = lease.terminate().await {
            warn!(sandbox_id = %sandbox_id, error = %err, "sandbox terminate failed");
        }
        match end {
            RunEnd::Completed => {}
            RunEnd::ClientGone => return,
            RunEnd::Failed(err) => {
                warn!(sandbox_id = %sandbox_id, error = %err, "agent run failed");
                if !emit(tx, error_event(&err)).await {
                    return;
                }
            }
        }
        emit(tx, InternalEvent::Done).await;
    }

    async fn execute(
        &self,
        lease: &SandboxLease,
        request: &AgentRequest,
        tx: &mpsc::Sender<InternalEvent>,
    ) -> RunEnd {
        let config = &self.inner.config;
        let orchestrator = &self.inner.orchestrator;
        let sandbox_id = lease.id();
        let required = request.flags.required();

        let prompt_path = config.prompt_path();
        let prompt = prompt::render_prompt(&request.messages, &required, &config.artifact_dir);
        if let Err(err) = orchestrator
            .write_file(sandbox_id, &prompt_path, prompt.as_bytes())
            .await
        {
            return RunEnd::Failed(map_orchestrator_error(err));
        }

        let environment = environment::build_environment(
            config,
            lease.sandbox(),
            &request.request_id,
            &required,
        );
        let command = render_command(&config.command, &prompt_path);
        let exec = ExecRequest::new(command.clone())
            .with_env(environment.clone())
            .with_cwd(config.workspace_dir.clone());
        let mut run = AgentRun {
            sandbox_id: sandbox_id.to_string(),
            exec_id: exec.exec_id.clone(),
            command,
            environment,
            state: AgentRunState::Starting,
            started_at: OffsetDateTime::now_utc(),
        };

        let mut frames = match orchestrator.exec_stream(sandbox_id, &exec).await {
            Ok(frames) => frames,
            Err(err) => {
                run.transition(AgentRunState::Failed);
                return RunEnd::Failed(map_orchestrator_error(err));
            }
        };
        run.transition(AgentRunState::Streaming);
        if !emit(tx, InternalEvent::lifecycle("agent.started", Some(run.exec_id.clone()))).await {
            return RunEnd::ClientGone;
        }

        let mut parser = TranscriptParser::new(config.transcript_format, config.artifact_dir.clone());
        let mut tools = ToolClock::new(config.tool_timeout);
        let budget_deadline = Instant::now() + config.budget;
        let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut partial_output = false;

        let exit_code = loop {
            let (deadline, tool) = tools.next_deadline(budget_deadline);
            let next = if Instant::now() >= deadline {
                None
            } else {
                tokio::time::timeout_at(deadline, frames.next()).await.ok()
            };
            let Some(frame) = next else {
                return self.time_limit_exceeded(&mut run, tool, partial_output, true).await;
            };

            match frame {
                None => break None,
                Some(Err(err)) => {
                    run.transition(AgentRunState::Failed);
                    return RunEnd::Failed(map_platform_error(err));
                }
                Some(Ok(ExecFrame::Exit { code })) => break code,
                Some(Ok(ExecFrame::Stderr { line })) => {
                    debug!(sandbox_id, line = %line, "agent stderr");
                    if stderr_tail.len() == STDERR_TAIL_LINES {
                        stderr_tail.pop_front();
                    }
                    stderr_tail.push_back(line);
                }
                Some(Ok(ExecFrame::Stdout { line })) => {
                    for event in parser.push_line(&line) {
                        // Artifact reads spend the same budget as the process.
                        let translated = tokio::time::timeout_at(
                            budget_deadline,
                            self.translate(sandbox_id, event, &mut tools),
                        )
                        .await;
                        let Ok(translated) = translated else {
                            return self
                                .time_limit_exceeded(&mut run, None, partial_output, true)
                                .await;
                        };
                        let Some(event) = translated else {
                            continue;
                        };
                        partial_output |= event.is_content();
                        if !emit(tx, event).await {
                            return RunEnd::ClientGone;
                        }
                    }
                }
            }
        };

        if exit_code != Some(0) {
            run.transition(AgentRunState::Failed);
            let stderr = (!stderr_tail.is_empty())
                .then(|| Vec::from(stderr_tail).join("\n"));
            return RunEnd::Failed(GatewayError::AgentProcessExited { exit_code, stderr });
        }

        let swept = tokio::time::timeout_at(
            budget_deadline,
            self.sweep_artifacts(sandbox_id, &mut parser, tx),
        )
        .await;
        match swept {
            Ok(true) => {}
            Ok(false) => return RunEnd::ClientGone,
            Err(_) => {
                return self
                    .time_limit_exceeded(&mut run, None, partial_output, false)
                    .await
            }
        }
        run.transition(AgentRunState::Completed);
        let elapsed = OffsetDateTime::now_utc() - run.started_at;
        info!(
            sandbox_id,
            elapsed_ms = elapsed.whole_milliseconds() as i64,
            "agent run completed"
        );
        RunEnd::Completed
    }

    /// `tool` names the stalled call when its own timeout fired first.
    async fn time_limit_exceeded(
        &self,
        run: &mut AgentRun,
        tool: Option<String>,
        partial_output: bool,
        process_running: bool,
    ) -> RunEnd {
        let config = &self.inner.config;
        run.transition(AgentRunState::TimedOut);
        warn!(
            sandbox_id = %run.sandbox_id,
            exec_id = %run.exec_id,
            tool = tool.as_deref().unwrap_or("-"),
            process_running,
            "agent run exceeded its time limit"
        );
        if process_running {
            if let Err(err) = self
                .inner
                .orchestrator
                .kill_exec(&run.sandbox_id, &run.exec_id)
                .await
            {
                warn!(sandbox_id = %run.sandbox_id, error = %err, "killing timed-out agent failed");
            }
        }
        let limit = if tool.is_some() {
            config.tool_timeout
        } else {
            config.budget
        };
        RunEnd::Failed(GatewayError::AgentProcessTimeout {
            budget_secs: limit.as_secs(),
            tool,
            partial_output,
        })
    }

    async fn translate(
        &self,
        sandbox_id: &str,
        event: TranscriptEvent,
        tools: &mut ToolClock,
    ) -> Option<InternalEvent> {
        match event {
            TranscriptEvent::Content(text) => (!text.is_empty()).then(|| InternalEvent::content(text)),
            TranscriptEvent::Reasoning(text) => {
                (!text.is_empty()).then(|| InternalEvent::reasoning(text))
            }
            TranscriptEvent::ToolStarted {
                call_id,
                name,
                args_preview,
            } => {
                tools.start(&call_id, &name);
                Some(InternalEvent::ToolStart {
                    name,
                    call_id: Some(call_id),
                    args_preview,
                })
            }
            TranscriptEvent::ToolFinished {
                call_id,
                name,
                result_preview,
                is_error,
            } => {
                tools.finish(&call_id);
                if is_error {
                    let err = GatewayError::ToolCallFailed {
                        tool: name.clone(),
                        message: result_preview.clone(),
                    };
                    warn!(sandbox_id, error = %err, recoverable = err.is_recoverable(), "agent tool call failed");
                }
                Some(InternalEvent::ToolEnd {
                    name,
                    call_id: Some(call_id),
                    result_preview,
                    is_error,
                })
            }
            TranscriptEvent::ArtifactFinalized {
                path,
                mime_type,
                display_name,
            } => self
                .collect_artifact(sandbox_id, path, mime_type, display_name)
                .await
                .map(|artifact| InternalEvent::ArtifactReady { artifact }),
            TranscriptEvent::Finished { is_error, message } => {
                if is_error {
                    warn!(sandbox_id, message = message.as_deref().unwrap_or(""), "agent reported an unsuccessful result");
                }
                None
            }
            TranscriptEvent::Unparsed { error, raw } => {
                let err = map_transcript_error(error);
                warn!(sandbox_id, error = %err, line = %preview(&raw, 120), "skipping agent output line");
                None
            }
        }
    }

    async fn collect_artifact(
        &self,
        sandbox_id: &str,
        path: String,
        mime_type: Option<String>,
        display_name: Option<String>,
    ) -> Option<Artifact> {
        let bytes = match self.inner.orchestrator.read_file(sandbox_id, &path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(sandbox_id, path = %path, error = %err, "reading artifact failed");
                return None;
            }
        };
        let raw = RawFile {
            path,
            bytes,
            mime_type,
            display_name,
        };
        match self.inner.materializer.materialize(raw).await {
            Ok(artifact) => Some(artifact),
            Err(err) => {
                warn!(sandbox_id, error = %err, recoverable = err.is_recoverable(), "artifact dropped");
                None
            }
        }
    }

    /// Delivers files left in the artifact directory that were never
    /// announced. Returns false when the client went away.
    async fn sweep_artifacts(
        &self,
        sandbox_id: &str,
        parser: &mut TranscriptParser,
        tx: &mpsc::Sender<InternalEvent>,
    ) -> bool {
        let entries = match self
            .inner
            .orchestrator
            .list_files(sandbox_id, parser.artifact_dir())
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                warn!(sandbox_id, error = %err, "artifact sweep failed");
                return true;
            }
        };
        for entry in entries {
            if !parser.mark_finalized(&entry.path) {
                continue;
            }
            debug!(sandbox_id, path = %entry.path, "unannounced artifact found");
            if let Some(artifact) = self.collect_artifact(sandbox_id, entry.path, None, None).await {
                if !emit(tx, InternalEvent::ArtifactReady { artifact }).await {
                    return false;
                }
            }
        }
        true
    }
}

fn render_command(template: &[String], prompt_path: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace(PROMPT_PLACEHOLDER, prompt_path))
        .collect()
}
