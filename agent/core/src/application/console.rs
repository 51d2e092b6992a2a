// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Console and terminal streaming.
//!
//! Callers hand in a pair of channels: `inbound` carries what the user types,
//! `outbound` receives what the server prints. Dropping either end finishes
//! the call; a caller hanging up is not an error.

use chrono::{DateTime, Local};
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::application::error::ServiceError;
use crate::application::terminal::TerminalSessions;
use crate::application::StreamGauge;
use crate::domain::access::{AccessGuard, Caller};
use crate::domain::engine::{AttachedIo, ContainerEngine};
use crate::domain::repository::ServerRepository;
use crate::domain::server::{Server, ServerId};

const CLOCK_FORMAT: &str = "%H:%M:%S";

/// Rewrite one engine log line (`<RFC 3339> <text>`) as `[HH:MM:SS] text`.
/// Lines without a parsable timestamp pass through unchanged.
pub fn format_log_line(raw: &str) -> String {
    let raw = raw.trim_end_matches(['\r', '\n']);
    if let Some((stamp, text)) = raw.split_once(' ') {
        if let Ok(at) = DateTime::parse_from_rfc3339(stamp) {
            return format!("[{}] {}", at.with_timezone(&Local).format(CLOCK_FORMAT), text);
        }
    }
    raw.to_string()
}

/// Prefix live output with the time it was forwarded.
pub fn stamp_now(line: &str) -> String {
    format!("[{}] {}", Local::now().format(CLOCK_FORMAT), line)
}

/// Pump attached stdio until either side closes.
pub async fn relay_console(
    io: AttachedIo,
    mut inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
) -> Result<(), ServiceError> {
    let AttachedIo { output, mut input } = io;
    let mut reader = StreamReader::new(
        output.map(|chunk| chunk.map_err(|e| std::io::Error::other(e.to_string()))),
    );

    let forward = async {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|e| ServiceError::Dependency(format!("console output: {}", e)))?;
            if read == 0 {
                debug!("Console output closed");
                return Ok(());
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\r', '\n']);
            if outbound.send(stamp_now(line)).await.is_err() {
                return Ok(());
            }
        }
    };

    let feed = async {
        while let Some(command) = inbound.recv().await {
            let payload = format!("{}\n", command);
            input
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| ServiceError::Dependency(format!("console input: {}", e)))?;
            input
                .flush()
                .await
                .map_err(|e| ServiceError::Dependency(format!("console input: {}", e)))?;
        }
        Ok(())
    };

    tokio::select! {
        result = forward => result,
        result = feed => result,
    }
}

pub struct ConsoleService {
    engine: Arc<dyn ContainerEngine>,
    servers: Arc<dyn ServerRepository>,
    guard: Arc<dyn AccessGuard>,
    terminals: Arc<TerminalSessions>,
    tail_lines: usize,
}

impl ConsoleService {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        servers: Arc<dyn ServerRepository>,
        guard: Arc<dyn AccessGuard>,
        terminals: Arc<TerminalSessions>,
        tail_lines: usize,
    ) -> Self {
        Self {
            engine,
            servers,
            guard,
            terminals,
            tail_lines,
        }
    }

    async fn installed_server(&self, caller: &Caller, sid: &ServerId) -> Result<Server, ServiceError> {
        self.guard.check_access(caller, sid).await?;
        let server = self
            .servers
            .find_by_id(sid)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("server {}", sid)))?;
        server.require_container()?;
        Ok(server)
    }

    /// Replay recent logs, then relay the live console.
    pub async fn console(
        &self,
        caller: &Caller,
        sid: &ServerId,
        inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<String>,
    ) -> Result<(), ServiceError> {
        self.installed_server(caller, sid).await?;
        let _gauge = StreamGauge::open("console");
        let name = sid.engine_name();

        for line in self.engine.logs(&name, self.tail_lines).await? {
            if outbound.send(format_log_line(&line)).await.is_err() {
                return Ok(());
            }
        }

        let io = self.engine.attach(&name).await?;
        info!(sid = %sid, caller = %caller, "Console attached");
        let result = relay_console(io, inbound, outbound).await;
        info!(sid = %sid, "Console detached");
        result
    }

    /// Relay the cached interactive shell of the server.
    pub async fn terminal(
        &self,
        caller: &Caller,
        sid: &ServerId,
        inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<String>,
    ) -> Result<(), ServiceError> {
        self.installed_server(caller, sid).await?;
        let _gauge = StreamGauge::open("terminal");
        info!(sid = %sid, caller = %caller, "Terminal attached");
        self.terminals.relay(sid, inbound, outbound).await
    }

    /// Type one line into the server's shell without watching the output.
    pub async fn terminal_command(&self, caller: &Caller, sid: &ServerId, text: &str) -> Result<(), ServiceError> {
        self.installed_server(caller, sid).await?;
        self.terminals.send(sid, text).await
    }
}
