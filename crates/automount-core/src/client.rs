//! Unix-socket client for the privileged helper.
//!
//! A single connection is opened lazily and shared by every caller. Requests
//! are tagged with an id and a reader task hands each reply to the caller
//! waiting on that id, so any number of requests can be in flight. When the
//! connection fails the reader stops and the next call reconnects.

use crate::error::{AutomountError, AutomountResult};
use crate::protocol::{HelperCommand, HelperReply, HelperRequest};
use crate::provider::HelperLink;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Callers waiting for a reply, by request id. `None` once the reader has
/// stopped and no further replies will arrive.
type Waiters = Arc<std::sync::Mutex<Option<HashMap<u64, oneshot::Sender<HelperReply>>>>>;

struct Connection {
    writer: OwnedWriteHalf,
    waiters: Waiters,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Register interest in reply `id`. `None` if the connection is dead.
    fn register(&self, id: u64) -> Option<oneshot::Receiver<HelperReply>> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().ok()?;
        waiters.as_mut()?.insert(id, tx);
        Some(rx)
    }

    fn forget(&self, id: u64) {
        if let Ok(mut waiters) = self.waiters.lock() {
            if let Some(map) = waiters.as_mut() {
                map.remove(&id);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// [`HelperLink`] over the helper's Unix domain socket.
pub struct HelperClient {
    socket: PathBuf,
    request_timeout: Duration,
    next_id: AtomicU64,
    conn: Mutex<Option<Connection>>,
}

impl HelperClient {
    pub fn new(socket: impl Into<PathBuf>, request_timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            request_timeout,
            next_id: AtomicU64::new(1),
            conn: Mutex::new(None),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn connect(&self) -> AutomountResult<Connection> {
        let stream = UnixStream::connect(&self.socket).await.map_err(|err| {
            AutomountError::Channel(format!(
                "cannot reach helper at {}: {err}",
                self.socket.display()
            ))
        })?;
        debug!("connected to helper at {}", self.socket.display());
        let (read, writer) = stream.into_split();
        let waiters: Waiters = Arc::new(std::sync::Mutex::new(Some(HashMap::new())));
        let reader = tokio::spawn(route_replies(read, waiters.clone()));
        Ok(Connection {
            writer,
            waiters,
            reader,
        })
    }

    /// Send one frame and return the slot its reply will arrive in.
    ///
    /// The connection lock is held only while writing.
    async fn send(
        &self,
        id: u64,
        frame: &[u8],
        label: &str,
    ) -> AutomountResult<oneshot::Receiver<HelperReply>> {
        let mut guard = self.conn.lock().await;
        let reply = match guard.as_ref().and_then(|conn| conn.register(id)) {
            Some(reply) => reply,
            None => {
                let conn = self.connect().await?;
                let reply = conn.register(id).ok_or_else(|| {
                    AutomountError::Channel("helper connection unavailable".into())
                })?;
                *guard = Some(conn);
                reply
            }
        };
        let Some(conn) = guard.as_mut() else {
            return Err(AutomountError::Channel("helper connection unavailable".into()));
        };

        let written = match timeout(self.request_timeout, write_frame(&mut conn.writer, frame)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "helper is not reading requests",
            )),
        };
        if let Err(err) = written {
            *guard = None;
            warn!("helper connection dropped during {label}: {err}");
            return Err(AutomountError::Channel(format!("{label}: {err}")));
        }
        Ok(reply)
    }

    async fn forget(&self, id: u64) {
        if let Some(conn) = self.conn.lock().await.as_ref() {
            conn.forget(id);
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Reader task: deliver each reply to whoever waits on its id.
async fn route_replies(read: OwnedReadHalf, waiters: Waiters) {
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("helper closed the connection");
                break;
            }
            Err(err) => {
                warn!("reading from helper failed: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply: HelperReply = match serde_json::from_str(line.trim_end()) {
            Ok(reply) => reply,
            Err(err) => {
                warn!("undecodable helper reply, dropping connection: {err}");
                break;
            }
        };
        let waiter = waiters
            .lock()
            .ok()
            .and_then(|mut waiters| waiters.as_mut().and_then(|map| map.remove(&reply.id)));
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!("discarding reply {} nobody is waiting for", reply.id),
        }
    }
    // Dropping the senders wakes every remaining caller with an error.
    if let Ok(mut waiters) = waiters.lock() {
        waiters.take();
    }
}

#[async_trait]
impl HelperLink for HelperClient {
    async fn execute(&self, command: HelperCommand) -> AutomountResult<String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = command.to_string();
        let mut frame = serde_json::to_vec(&HelperRequest { id, command })?;
        frame.push(b'\n');

        let reply = self.send(id, &frame, &label).await?;
        match timeout(self.request_timeout, reply).await {
            Ok(Ok(reply)) => {
                debug!("helper replied to {label}: success={}", reply.is_success());
                reply.into_result()
            }
            Ok(Err(_)) => Err(AutomountError::Channel(format!(
                "{label}: helper closed the connection"
            ))),
            Err(_) => {
                self.forget(id).await;
                warn!("helper did not answer {label} within {:?}", self.request_timeout);
                Err(AutomountError::Channel(format!(
                    "{label}: no reply within {:?}",
                    self.request_timeout
                )))
            }
        }
    }
}
