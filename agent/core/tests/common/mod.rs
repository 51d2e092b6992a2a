// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared fixtures: a scripted in-process container engine and a fully
//! wired service stack over the in-memory repositories.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use hearth_core::application::console::ConsoleService;
use hearth_core::application::files::FileService;
use hearth_core::application::lifecycle::{
    CreateServerCommand, LifecycleSettings, RetryPolicy, StandardLifecycleService,
};
use hearth_core::application::provisioning::ProvisioningSettings;
use hearth_core::application::telemetry::TelemetryService;
use hearth_core::application::terminal::TerminalSessions;
use hearth_core::domain::access::AccessGuard;
use hearth_core::domain::blueprint::{BlockedFile, Blueprint, BlueprintId};
use hearth_core::domain::engine::{
    AttachedIo, ContainerEngine, ContainerSpec, EngineError, ShellSpec, StopGrace, VolumeInfo,
};
use hearth_core::domain::repository::{BlueprintRepository, ServerRepository};
use hearth_core::domain::server::{ResourceLimit, Server, ServerAllocation, ServerId, ServerStatus, UserId};
use hearth_core::domain::telemetry::StatsSample;
use hearth_core::infrastructure::access::RegistryAccessGuard;
use hearth_core::infrastructure::repositories::{InMemoryBlueprintRepository, InMemoryServerRepository};

pub const SETUP_SCRIPT: &str = "echo installing > installed.txt";

pub fn blueprint(id: &str) -> Blueprint {
    Blueprint {
        id: BlueprintId::new(id).unwrap(),
        version: 1,
        images: vec!["img:java21".to_string()],
        blocked_files: vec![
            BlockedFile {
                path: "/secret.key".to_string(),
                visible: false,
                readable: false,
            },
            BlockedFile {
                path: "/server.properties".to_string(),
                visible: true,
                readable: true,
            },
        ],
        server_binary: "server.jar".to_string(),
        start_command: "java -Xmx{{$env::SERVER_MEMORY}}M -jar {{$env::SERVER_BINARY}} --port {{$env::SERVER_PORT}}"
            .to_string(),
        stop_command: "stop".to_string(),
        setup_script_base64: base64::engine::general_purpose::STANDARD.encode(SETUP_SCRIPT),
        setup_image: "img:installer".to_string(),
        setup_interpreter: "bash".to_string(),
    }
}

pub fn create_command(sid: &str, port: u16) -> CreateServerCommand {
    CreateServerCommand {
        sid: ServerId::new(sid).unwrap(),
        owner: UserId::new("owner").unwrap(),
        users: vec![UserId::new("friend").unwrap()],
        allocations: vec![ServerAllocation {
            ip: "10.0.0.5".parse().unwrap(),
            port,
        }],
        resource_limit: ResourceLimit {
            cpu_percent: 50,
            ram_mb: 1024,
            swap_mb: 0,
            storage_mb: 4096,
        },
        image: "img:java21".to_string(),
        blueprint_id: BlueprintId::new("bp1").unwrap(),
    }
}

// ============================================================================
// FakeEngine
// ============================================================================

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub running: bool,
    pub exit_code: i64,
}

#[derive(Default)]
struct EngineState {
    volumes: HashMap<String, VolumeInfo>,
    duplicate_volumes: HashSet<String>,
    networks: HashSet<String>,
    containers: HashMap<String, FakeContainer>,
    calls: Vec<String>,
    setup_exit_codes: VecDeque<i64>,
    failures: HashMap<String, u32>,
    console_outputs: HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>,
    console_input: Vec<String>,
    shell_input: Vec<String>,
    exec_sessions: u32,
    logs: HashMap<String, Vec<String>>,
    stats: Vec<StatsSample>,
}

/// In-process `ContainerEngine`. Setup containers exit as soon as they are
/// started with the next scripted exit code (default 0), or keep running
/// when `setup_hangs` is set; runtime containers run until stopped, or until
/// the console receives the stop command when `honor_stop_command` is set.
pub struct FakeEngine {
    this: Weak<FakeEngine>,
    root: tempfile::TempDir,
    state: Mutex<EngineState>,
    changed: watch::Sender<u64>,
    pub honor_stop_command: AtomicBool,
    pub setup_hangs: AtomicBool,
    /// When set, `stats` streams never end on their own
    pub endless_stats: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        let (changed, _) = watch::channel(0);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            root: tempfile::tempdir().unwrap(),
            state: Mutex::new(EngineState::default()),
            changed,
            honor_stop_command: AtomicBool::new(true),
            setup_hangs: AtomicBool::new(false),
            endless_stats: AtomicBool::new(false),
        })
    }

    fn handle(&self) -> Weak<Self> {
        self.this.clone()
    }

    fn bump(&self) {
        self.changed.send_modify(|generation| *generation += 1);
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn take_failure(&self, op: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::Api(format!("scripted {} failure", op)));
            }
        }
        Ok(())
    }

    // -- scripting ----------------------------------------------------------

    /// Fail the next `times` calls of `op` (e.g. `"pull_image"`).
    pub fn fail(&self, op: &str, times: u32) {
        self.state.lock().unwrap().failures.insert(op.to_string(), times);
    }

    pub fn push_setup_exit_code(&self, code: i64) {
        self.state.lock().unwrap().setup_exit_codes.push_back(code);
    }

    pub fn add_duplicate_volume(&self, name: &str) {
        self.state.lock().unwrap().duplicate_volumes.insert(name.to_string());
    }

    pub fn add_network(&self, name: &str) {
        self.state.lock().unwrap().networks.insert(name.to_string());
    }

    pub fn set_logs(&self, name: &str, lines: Vec<String>) {
        self.state.lock().unwrap().logs.insert(name.to_string(), lines);
    }

    pub fn set_stats(&self, samples: Vec<StatsSample>) {
        self.state.lock().unwrap().stats = samples;
    }

    /// Print a line on every attached console of `name`.
    pub fn emit(&self, name: &str, line: &str) {
        let state = self.state.lock().unwrap();
        if let Some(outputs) = state.console_outputs.get(name) {
            for output in outputs {
                let _ = output.send(Bytes::from(format!("{}\n", line)));
            }
        }
    }

    /// Let a runtime container exit on its own.
    pub fn exit(&self, name: &str, code: i64) {
        self.set_stopped(name, code);
    }

    // -- inspection ---------------------------------------------------------

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls().into_iter().filter(|c| c.starts_with(prefix)).collect()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().unwrap().containers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().unwrap().volumes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().unwrap().volumes.contains_key(name)
    }

    pub fn volume_path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    pub fn console_input(&self) -> Vec<String> {
        self.state.lock().unwrap().console_input.clone()
    }

    pub fn shell_input(&self) -> Vec<String> {
        self.state.lock().unwrap().shell_input.clone()
    }

    pub fn exec_sessions(&self) -> u32 {
        self.state.lock().unwrap().exec_sessions
    }

    // -- internals ----------------------------------------------------------

    fn set_stopped(&self, name: &str, code: i64) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(container) = state.containers.get_mut(name) {
                container.running = false;
                container.exit_code = code;
            }
            state.console_outputs.remove(name);
        }
        self.bump();
    }

    fn on_console_line(&self, name: &str, line: String) {
        let stop = {
            let mut state = self.state.lock().unwrap();
            state.console_input.push(line.clone());
            line == "stop" && self.honor_stop_command.load(Ordering::SeqCst)
        };
        if stop {
            self.set_stopped(name, 0);
        }
    }

    fn on_shell_bytes(&self, bytes: &[u8]) -> Vec<Bytes> {
        let mut echoes = Vec::new();
        let mut state = self.state.lock().unwrap();
        for chunk in String::from_utf8_lossy(bytes).split_inclusive('\n') {
            if chunk == "\x03" {
                state.shell_input.push("^C".to_string());
                continue;
            }
            let line = chunk.trim_end_matches('\n').to_string();
            echoes.push(Bytes::from(format!("$ {}\n", line)));
            state.shell_input.push(line);
        }
        echoes
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.record(format!("pull_image:{}", image));
        self.take_failure("pull_image")
    }

    async fn list_volumes(&self, name: &str) -> Result<Vec<VolumeInfo>, EngineError> {
        let state = self.state.lock().unwrap();
        let mut found: Vec<VolumeInfo> = state.volumes.get(name).cloned().into_iter().collect();
        if state.duplicate_volumes.contains(name) {
            found.push(VolumeInfo {
                name: name.to_string(),
                mountpoint: self.root.path().join(format!("{}-dup", name)),
            });
        }
        Ok(found)
    }

    async fn create_volume(&self, name: &str) -> Result<VolumeInfo, EngineError> {
        self.record(format!("create_volume:{}", name));
        let mountpoint = self.root.path().join(name);
        std::fs::create_dir_all(&mountpoint).map_err(|e| EngineError::Api(e.to_string()))?;
        let info = VolumeInfo {
            name: name.to_string(),
            mountpoint,
        };
        self.state
            .lock()
            .unwrap()
            .volumes
            .insert(name.to_string(), info.clone());
        Ok(info)
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo, EngineError> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("volume {}", name)))
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.record(format!("remove_volume:{}", name));
        self.take_failure("remove_volume")?;
        match self.state.lock().unwrap().volumes.remove(name) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(format!("volume {}", name))),
        }
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.record(format!("remove_network:{}", name));
        self.take_failure("remove_network")?;
        if self.state.lock().unwrap().networks.remove(name) {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("network {}", name)))
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.record(format!("create_container:{}", spec.name));
        self.take_failure("create_container")?;
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(&spec.name) {
            return Err(EngineError::Conflict(format!("container {}", spec.name)));
        }
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
                exit_code: 0,
            },
        );
        Ok(format!("id-{}", spec.name))
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        self.record(format!("start_container:{}", name));
        self.take_failure("start_container")?;
        let setup_hangs = self.setup_hangs.load(Ordering::SeqCst);
        {
            let mut state = self.state.lock().unwrap();
            let setup_code = if name.ends_with("_install") && !setup_hangs {
                Some(state.setup_exit_codes.pop_front().unwrap_or(0))
            } else {
                None
            };
            let container = state
                .containers
                .get_mut(name)
                .ok_or_else(|| EngineError::NotFound(format!("container {}", name)))?;
            match setup_code {
                Some(code) => {
                    container.running = false;
                    container.exit_code = code;
                }
                None => container.running = true,
            }
        }
        self.bump();
        Ok(())
    }

    async fn stop_container(&self, name: &str, grace: StopGrace) -> Result<(), EngineError> {
        self.record(format!("stop_container:{}:{:?}", name, grace));
        self.take_failure("stop_container")?;
        if self.container(name).is_none() {
            return Err(EngineError::NotFound(format!("container {}", name)));
        }
        let code = match grace {
            StopGrace::Immediate => 137,
            StopGrace::EngineDefault => 0,
        };
        self.set_stopped(name, code);
        Ok(())
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), EngineError> {
        self.record(format!("remove_container:{}:{}", name, force));
        self.take_failure("remove_container")?;
        let removed = {
            let mut state = self.state.lock().unwrap();
            match state.containers.get(name) {
                None => None,
                Some(c) if c.running && !force => {
                    return Err(EngineError::Conflict(format!("container {} is running", name)));
                }
                Some(_) => {
                    state.console_outputs.remove(name);
                    state.containers.remove(name)
                }
            }
        };
        self.bump();
        match removed {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(format!("container {}", name))),
        }
    }

    async fn container_exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.container(name).is_some())
    }

    async fn is_running(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.container(name).is_some_and(|c| c.running))
    }

    async fn wait_until_stopped(&self, name: &str) -> Result<i64, EngineError> {
        self.take_failure("wait_until_stopped")?;
        let mut changes = self.changed.subscribe();
        loop {
            match self.container(name) {
                None => return Err(EngineError::NotFound(format!("container {}", name))),
                Some(c) if !c.running => return Ok(c.exit_code),
                Some(_) => {}
            }
            if changes.changed().await.is_err() {
                return Err(EngineError::Connection("engine dropped".to_string()));
            }
        }
    }

    async fn attach(&self, name: &str) -> Result<AttachedIo, EngineError> {
        self.record(format!("attach:{}", name));
        if !self.is_running(name).await? {
            return Err(EngineError::Conflict(format!("container {} is not running", name)));
        }

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .unwrap()
            .console_outputs
            .entry(name.to_string())
            .or_default()
            .push(output_tx);

        let (input, mut far_end) = tokio::io::duplex(4096);
        let engine = self.handle();
        let container = name.to_string();
        tokio::spawn(async move {
            let mut pending = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let Ok(n) = far_end.read(&mut buf).await else { break };
                if n == 0 {
                    break;
                }
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line).trim_end().to_string();
                    if let Some(engine) = engine.upgrade() {
                        engine.on_console_line(&container, line);
                    }
                }
            }
        });

        Ok(AttachedIo {
            output: UnboundedReceiverStream::new(output_rx).map(Ok).boxed(),
            input: Box::pin(input),
        })
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>, EngineError> {
        let state = self.state.lock().unwrap();
        let lines = state.logs.get(name).cloned().unwrap_or_default();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines.into_iter().skip(skip).collect())
    }

    async fn exec_shell(&self, name: &str, _spec: &ShellSpec) -> Result<AttachedIo, EngineError> {
        self.record(format!("exec_shell:{}", name));
        if !self.is_running(name).await? {
            return Err(EngineError::Conflict(format!("container {} is not running", name)));
        }
        self.state.lock().unwrap().exec_sessions += 1;

        let (output_tx, output_rx) = mpsc::unbounded_channel::<Bytes>();
        let (input, mut far_end) = tokio::io::duplex(4096);
        let engine = self.handle();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let Ok(n) = far_end.read(&mut buf).await else { break };
                if n == 0 {
                    break;
                }
                let Some(engine) = engine.upgrade() else { break };
                for echo in engine.on_shell_bytes(&buf[..n]) {
                    let _ = output_tx.send(echo);
                }
            }
        });

        Ok(AttachedIo {
            output: UnboundedReceiverStream::new(output_rx).map(Ok).boxed(),
            input: Box::pin(input),
        })
    }

    async fn stats(
        &self,
        name: &str,
    ) -> Result<BoxStream<'static, Result<StatsSample, EngineError>>, EngineError> {
        self.record(format!("stats:{}", name));
        let samples = self.state.lock().unwrap().stats.clone();
        let finite = futures::stream::iter(samples.into_iter().map(Ok));
        if self.endless_stats.load(Ordering::SeqCst) {
            Ok(finite.chain(futures::stream::pending()).boxed())
        } else {
            Ok(finite.boxed())
        }
    }
}

// ============================================================================
// Service stack
// ============================================================================

pub struct Harness {
    pub engine: Arc<FakeEngine>,
    pub servers: Arc<InMemoryServerRepository>,
    pub blueprints: Arc<InMemoryBlueprintRepository>,
    pub lifecycle: Arc<StandardLifecycleService>,
    pub console: Arc<ConsoleService>,
    pub telemetry: Arc<TelemetryService>,
    pub files: Arc<FileService>,
}

pub fn fast_settings() -> LifecycleSettings {
    LifecycleSettings {
        lock_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_millis(200),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        },
        provisioning: ProvisioningSettings::default(),
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(fast_settings()).await
    }

    pub async fn with_settings(settings: LifecycleSettings) -> Self {
        let engine = FakeEngine::new();
        let servers = Arc::new(InMemoryServerRepository::new());
        let blueprints = Arc::new(InMemoryBlueprintRepository::new());
        blueprints.upsert(&blueprint("bp1")).await.unwrap();

        let engine_port: Arc<dyn ContainerEngine> = engine.clone();
        let server_port: Arc<dyn ServerRepository> = servers.clone();
        let blueprint_port: Arc<dyn BlueprintRepository> = blueprints.clone();
        let guard: Arc<dyn AccessGuard> = Arc::new(RegistryAccessGuard::new(server_port.clone()));
        let terminals = Arc::new(TerminalSessions::new(engine_port.clone()));

        let lifecycle = Arc::new(StandardLifecycleService::new(
            server_port.clone(),
            blueprint_port.clone(),
            engine_port.clone(),
            guard.clone(),
            terminals.clone(),
            settings,
        ));
        let console = Arc::new(ConsoleService::new(
            engine_port.clone(),
            server_port.clone(),
            guard.clone(),
            terminals,
            10,
        ));
        let telemetry = Arc::new(TelemetryService::new(
            engine_port.clone(),
            server_port.clone(),
            guard.clone(),
            Duration::from_millis(20),
        ));
        let files = Arc::new(FileService::new(engine_port, server_port, blueprint_port, guard));

        Self {
            engine,
            servers,
            blueprints,
            lifecycle,
            console,
            telemetry,
            files,
        }
    }

    pub async fn server(&self, sid: &str) -> Option<Server> {
        self.servers
            .find_by_id(&ServerId::new(sid).unwrap())
            .await
            .unwrap()
    }

    /// Poll the registry until `check` holds, failing after two seconds.
    pub async fn wait_for<F>(&self, sid: &str, check: F) -> Server
    where
        F: Fn(&Server) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(server) = self.server(sid).await {
                if check(&server) {
                    return server;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("server {} never reached the expected state: {:?}", sid, self.server(sid).await);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Create `sid` and wait until it is running.
    pub async fn running_server(&self, sid: &str) -> Server {
        use hearth_core::application::lifecycle::LifecycleService;
        use hearth_core::domain::access::Caller;

        self.lifecycle
            .create_server(&Caller::Backend, create_command(sid, 25565))
            .await
            .unwrap();
        self.lifecycle.wait_idle(&ServerId::new(sid).unwrap()).await.unwrap();
        self.wait_for(sid, |s| s.status == ServerStatus::Starting).await
    }
}
