// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cached interactive shell sessions, one per server.
//!
//! Each server gets a slot guarded by its own lock. Opening the session, and
//! replacing a dead one, happens under that lock; writing and reading use
//! separate locks on the session so `terminal_command` can type into a shell
//! another caller is watching.

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::application::error::ServiceError;
use crate::domain::engine::{AttachedIo, ContainerEngine, EngineError, ShellSpec};
use crate::domain::server::ServerId;

/// ETX, what a tty sends for Ctrl+C.
pub const INTERRUPT: &[u8] = b"\x03";

pub struct TerminalSession {
    input: Mutex<Pin<Box<dyn AsyncWrite + Send>>>,
    output: Mutex<BoxStream<'static, Result<Bytes, EngineError>>>,
    closed: AtomicBool,
}

impl TerminalSession {
    fn new(io: AttachedIo) -> Self {
        Self {
            input: Mutex::new(io.input),
            output: Mutex::new(io.output),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<(), ServiceError> {
        let mut input = self.input.lock().await;
        let result = async {
            input.write_all(bytes).await?;
            input.flush().await
        }
        .await;
        result.map_err(|e| {
            self.mark_closed();
            ServiceError::Dependency(format!("terminal input closed: {}", e))
        })
    }

    pub async fn write_line(&self, text: &str) -> Result<(), ServiceError> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.write_raw(&line).await
    }

    pub async fn interrupt(&self) -> Result<(), ServiceError> {
        self.write_raw(INTERRUPT).await
    }
}

type Slot = Arc<Mutex<Option<Arc<TerminalSession>>>>;

pub struct TerminalSessions {
    engine: Arc<dyn ContainerEngine>,
    shell: ShellSpec,
    slots: DashMap<ServerId, Slot>,
}

impl TerminalSessions {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self::with_shell(engine, ShellSpec::default())
    }

    pub fn with_shell(engine: Arc<dyn ContainerEngine>, shell: ShellSpec) -> Self {
        Self {
            engine,
            shell,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, sid: &ServerId) -> Slot {
        self.slots
            .entry(sid.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// The live session for `sid`, opening a shell if there is none.
    pub async fn session(&self, sid: &ServerId) -> Result<Arc<TerminalSession>, ServiceError> {
        let slot = self.slot(sid);
        let mut slot = slot.lock().await;
        if let Some(session) = slot.as_ref() {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            debug!(sid = %sid, "Replacing closed terminal session");
        }

        let io = self.engine.exec_shell(&sid.engine_name(), &self.shell).await?;
        let session = Arc::new(TerminalSession::new(io));
        *slot = Some(session.clone());
        info!(sid = %sid, "Terminal session opened");
        Ok(session)
    }

    pub fn is_cached(&self, sid: &ServerId) -> bool {
        self.slots
            .get(sid)
            .and_then(|slot| slot.try_lock().ok().map(|s| s.is_some()))
            .unwrap_or(false)
    }

    /// Type `text` followed by a newline into the session.
    pub async fn send(&self, sid: &ServerId, text: &str) -> Result<(), ServiceError> {
        let session = self.session(sid).await?;
        session.write_line(text).await
    }

    /// Interrupt the shell and forget the session.
    pub async fn teardown(&self, sid: &ServerId) {
        let Some(slot) = self.slots.get(sid).map(|s| s.clone()) else {
            return;
        };
        let session = slot.lock().await.take();
        drop(slot);
        if let Some(session) = session {
            if let Err(e) = session.interrupt().await {
                debug!(sid = %sid, error = %e, "Terminal already closed at teardown");
            }
            session.mark_closed();
            info!(sid = %sid, "Terminal session torn down");
        }
        self.slots.remove_if(sid, |_, slot| Arc::strong_count(slot) == 1);
    }

    /// Relay one caller stream to the cached session until either side
    /// closes. Only one caller may watch a session at a time.
    pub async fn relay(
        &self,
        sid: &ServerId,
        mut inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<String>,
    ) -> Result<(), ServiceError> {
        let session = self.session(sid).await?;
        let mut output = session.output.try_lock().map_err(|_| {
            ServiceError::Conflict(format!("a terminal is already attached to server {}", sid))
        })?;

        let result = loop {
            tokio::select! {
                chunk = output.next() => match chunk {
                    Some(Ok(bytes)) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if outbound.send(text).await.is_err() {
                            break Ok(());
                        }
                    }
                    Some(Err(e)) => {
                        session.mark_closed();
                        break Err(ServiceError::from(e));
                    }
                    None => {
                        session.mark_closed();
                        break Ok(());
                    }
                },
                message = inbound.recv() => match message {
                    Some(text) => {
                        if let Err(e) = session.write_line(&text).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
            }
        };
        drop(output);

        if session.is_closed() {
            self.teardown(sid).await;
        } else if let Err(e) = session.interrupt().await {
            warn!(sid = %sid, error = %e, "Failed to interrupt terminal after detach");
        }

        result
    }
}
