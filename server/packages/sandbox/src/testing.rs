//! In-memory sandbox platform for tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::platform::{
    CreateSandboxRequest, CreatedSandbox, ExecFrame, ExecOutput, ExecRequest, ExecStream,
    FileEntry, PlatformError, SandboxAuth, SandboxPlatform,
};

/// One step of a scripted streaming exec.
#[derive(Debug, Clone)]
pub enum FakeStep {
    Stdout(String),
    Stderr(String),
    Sleep(Duration),
    /// Writes a file into the executing sandbox.
    WriteFile { path: String, contents: Vec<u8> },
    Exit(Option<i32>),
}

impl FakeStep {
    pub fn stdout(line: impl Into<String>) -> Self {
        Self::Stdout(line.into())
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::Stdout(value.to_string())
    }
}

#[derive(Debug, Default)]
struct FakeState {
    next_id: u64,
    creates: Vec<(SandboxAuth, CreateSandboxRequest)>,
    created_ids: Vec<String>,
    live: BTreeSet<String>,
    terminate_calls: HashMap<String, usize>,
    execs: Vec<(String, ExecRequest)>,
    killed: Vec<String>,
    files: HashMap<(String, String), Vec<u8>>,
    preload: Vec<(String, Vec<u8>)>,
    script: Vec<FakeStep>,
    exec_output: ExecOutput,
    exec_delay: Option<Duration>,
    read_delay: Option<Duration>,
    fail_create: bool,
    unreachable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FakeSandboxPlatform {
    state: Arc<Mutex<FakeState>>,
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FakeSandboxPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_create(&self, fail: bool) {
        lock(&self.state).fail_create = fail;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Steps replayed by every streaming exec.
    pub fn set_script(&self, steps: Vec<FakeStep>) {
        lock(&self.state).script = steps;
    }

    pub fn set_exec_output(&self, output: ExecOutput) {
        lock(&self.state).exec_output = output;
    }

    pub fn set_exec_delay(&self, delay: Option<Duration>) {
        lock(&self.state).exec_delay = delay;
    }

    /// Slows `read_file` and `list_files` by `delay`.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        lock(&self.state).read_delay = delay;
    }

    /// Copied into every sandbox created afterwards.
    pub fn preload_file(&self, path: impl Into<String>, contents: Vec<u8>) {
        lock(&self.state).preload.push((path.into(), contents));
    }

    pub fn create_count(&self) -> usize {
        lock(&self.state).creates.len()
    }

    pub fn created_ids(&self) -> Vec<String> {
        lock(&self.state).created_ids.clone()
    }

    pub fn last_create(&self) -> Option<(SandboxAuth, CreateSandboxRequest)> {
        lock(&self.state).creates.last().cloned()
    }

    pub fn live_count(&self) -> usize {
        lock(&self.state).live.len()
    }

    pub fn terminate_count(&self, sandbox_id: &str) -> usize {
        lock(&self.state)
            .terminate_calls
            .get(sandbox_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_terminate_calls(&self) -> usize {
        lock(&self.state).terminate_calls.values().sum()
    }

    pub fn exec_requests(&self) -> Vec<(String, ExecRequest)> {
        lock(&self.state).execs.clone()
    }

    pub fn killed_execs(&self) -> Vec<String> {
        lock(&self.state).killed.clone()
    }

    pub fn file(&self, sandbox_id: &str, path: &str) -> Option<Vec<u8>> {
        lock(&self.state)
            .files
            .get(&(sandbox_id.to_string(), path.to_string()))
            .cloned()
    }

    fn ensure_live(&self, sandbox_id: &str) -> Result<(), PlatformError> {
        let state = lock(&self.state);
        if state.unreachable {
            return Err(PlatformError::Unreachable("fake platform offline".to_string()));
        }
        if state.live.contains(sandbox_id) {
            Ok(())
        } else {
            Err(PlatformError::NotFound(sandbox_id.to_string()))
        }
    }

    async fn read_pause(&self) {
        let delay = lock(&self.state).read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SandboxPlatform for FakeSandboxPlatform {
    async fn create(
        &self,
        auth: &SandboxAuth,
        request: &CreateSandboxRequest,
    ) -> Result<CreatedSandbox, PlatformError> {
        let mut state = lock(&self.state);
        if state.unreachable {
            return Err(PlatformError::Unreachable("fake platform offline".to_string()));
        }
        if state.fail_create {
            return Err(PlatformError::Status {
                status: 503,
                message: "no capacity".to_string(),
            });
        }
        state.next_id += 1;
        let id = format!("fake-sb-{}", state.next_id);
        state.creates.push((auth.clone(), request.clone()));
        state.created_ids.push(id.clone());
        state.live.insert(id.clone());
        let preload = state.preload.clone();
        for (path, contents) in preload {
            state.files.insert((id.clone(), path), contents);
        }
        Ok(CreatedSandbox {
            public_url: Some(format!("https://{id}.sandbox.test")),
            id,
        })
    }

    async fn exec(
        &self,
        _auth: &SandboxAuth,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, PlatformError> {
        self.ensure_live(sandbox_id)?;
        let (delay, output) = {
            let mut state = lock(&self.state);
            state.execs.push((sandbox_id.to_string(), request.clone()));
            (state.exec_delay, state.exec_output.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(output)
    }

    async fn exec_stream(
        &self,
        _auth: &SandboxAuth,
        sandbox_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecStream, PlatformError> {
        self.ensure_live(sandbox_id)?;
        let steps = {
            let mut state = lock(&self.state);
            state.execs.push((sandbox_id.to_string(), request.clone()));
            state.script.clone()
        };
        let shared = self.state.clone();
        let sandbox_id = sandbox_id.to_string();
        let stream = futures::stream::unfold(
            (steps.into_iter(), false),
            move |(mut steps, exited)| {
                let shared = shared.clone();
                let sandbox_id = sandbox_id.clone();
                async move {
                    if exited {
                        return None;
                    }
                    loop {
                        match steps.next() {
                            None => return Some((Ok(ExecFrame::Exit { code: Some(0) }), (steps, true))),
                            Some(FakeStep::Sleep(delay)) => tokio::time::sleep(delay).await,
                            Some(FakeStep::WriteFile { path, contents }) => {
                                lock(&shared).files.insert((sandbox_id.clone(), path), contents);
                            }
                            Some(FakeStep::Stdout(line)) => {
                                return Some((Ok(ExecFrame::Stdout { line }), (steps, false)))
                            }
                            Some(FakeStep::Stderr(line)) => {
                                return Some((Ok(ExecFrame::Stderr { line }), (steps, false)))
                            }
                            Some(FakeStep::Exit(code)) => {
                                return Some((Ok(ExecFrame::Exit { code }), (steps, true)))
                            }
                        }
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn kill_exec(
        &self,
        _auth: &SandboxAuth,
        sandbox_id: &str,
        exec_id: &str,
    ) -> Result<(), PlatformError> {
        self.ensure_live(sandbox_id)?;
        lock(&self.state).killed.push(exec_id.to_string());
        Ok(())
    }

    async fn write_file(
        &self,
        _auth: &SandboxAuth,
        sandbox_id: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), PlatformError> {
        self.ensure_live(sandbox_id)?;
        lock(&self.state)
            .files
            .insert((sandbox_id.to_string(), path.to_string()), contents.to_vec());
        Ok(())
    }

    async fn read_file(
        &self,
        _auth: &SandboxAuth,
        sandbox_id: &str,
        path: &str,
    ) -> Result<Vec<u8>, PlatformError> {
        self.ensure_live(sandbox_id)?;
        self.read_pause().await;
        lock(&self.state)
            .files
            .get(&(sandbox_id.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(path.to_string()))
    }

    async fn list_files(
        &self,
        _auth: &SandboxAuth,
        sandbox_id: &str,
        dir: &str,
    ) -> Result<Vec<FileEntry>, PlatformError> {
        self.ensure_live(sandbox_id)?;
        self.read_pause().await;
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let state = lock(&self.state);
        let mut entries: Vec<FileEntry> = state
            .files
            .iter()
            .filter(|((id, path), _)| id == sandbox_id && path.starts_with(&prefix))
            .map(|((_, path), contents)| FileEntry {
                path: path.clone(),
                size_bytes: contents.len() as u64,
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn expose_port(
        &self,
        _auth: &SandboxAuth,
        sandbox_id: &str,
        port: u16,
    ) -> Result<String, PlatformError> {
        self.ensure_live(sandbox_id)?;
        Ok(format!("https://{sandbox_id}-{port}.sandbox.test"))
    }

    async fn terminate(&self, _auth: &SandboxAuth, sandbox_id: &str) -> Result<(), PlatformError> {
        let mut state = lock(&self.state);
        *state
            .terminate_calls
            .entry(sandbox_id.to_string())
            .or_insert(0) += 1;
        state.live.remove(sandbox_id);
        Ok(())
    }

    async fn health(&self) -> Result<(), PlatformError> {
        if lock(&self.state).unreachable {
            Err(PlatformError::Unreachable("fake platform offline".to_string()))
        } else {
            Ok(())
        }
    }
}
