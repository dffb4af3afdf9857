//! Unix-socket front end of the helper.

use crate::executor::Dispatcher;
use anyhow::{Context, Result};
use automount_core::protocol::HelperReply;
use automount_zfs::CommandExecutor;
use log::{debug, info, warn};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

/// Bind `path`, replacing a stale socket, and apply `mode`.
pub fn bind(path: &Path, mode: u32) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create socket directory {}", parent.display()))?;
    }
    match fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("remove stale socket {}", path.display()))
        }
    }
    let listener =
        UnixListener::bind(path).with_context(|| format!("bind {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {:o} {}", mode, path.display()))?;
    info!("listening on {} (mode {:o})", path.display(), mode);
    Ok(listener)
}

/// Which peers may issue commands.
#[derive(Debug, Clone, Default)]
pub struct PeerPolicy {
    allowed_uids: Vec<u32>,
}

impl PeerPolicy {
    pub fn new(allowed_uids: Vec<u32>) -> Self {
        Self { allowed_uids }
    }

    /// Root is always admitted; an empty list admits whoever the socket
    /// permissions let through.
    pub fn admits(&self, uid: u32) -> bool {
        uid == 0 || self.allowed_uids.is_empty() || self.allowed_uids.contains(&uid)
    }
}

/// Accept connections until the listener fails.
pub async fn serve<E>(
    listener: UnixListener,
    dispatcher: Arc<Dispatcher<E>>,
    policy: PeerPolicy,
) -> Result<()>
where
    E: CommandExecutor + 'static,
{
    let policy = Arc::new(policy);
    loop {
        let (stream, _) = listener.accept().await.context("accept helper connection")?;
        let dispatcher = dispatcher.clone();
        let policy = policy.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, dispatcher, policy).await {
                warn!("helper connection ended with error: {err:#}");
            }
        });
    }
}

async fn handle_connection<E: CommandExecutor + 'static>(
    stream: UnixStream,
    dispatcher: Arc<Dispatcher<E>>,
    policy: Arc<PeerPolicy>,
) -> Result<()> {
    let uid = stream.peer_cred().context("read peer credentials")?.uid();
    let (read, mut write) = stream.into_split();

    if !policy.admits(uid) {
        warn!("rejecting connection from uid {uid}");
        let reply = HelperReply::failure(0, format!("uid {uid} is not allowed to use the helper"));
        write_reply(&mut write, &reply).await?;
        return Ok(());
    }
    debug!("accepted connection from uid {uid}");

    // Frames run concurrently; replies funnel through one writer and are
    // matched to requests by id on the client side.
    let (replies, mut outbox) = mpsc::unbounded_channel::<HelperReply>();
    let writer = tokio::spawn(async move {
        while let Some(reply) = outbox.recv().await {
            write_reply(&mut write, &reply).await?;
        }
        Ok::<_, anyhow::Error>(())
    });

    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let dispatcher = dispatcher.clone();
        let replies = replies.clone();
        tokio::spawn(async move {
            let reply = dispatcher.handle_line(&line).await;
            if replies.send(reply).is_err() {
                debug!("connection closed before a reply could be sent");
            }
        });
    }
    drop(replies);
    debug!("uid {uid} disconnected");
    writer.await.context("reply writer panicked")?
}

async fn write_reply<W: AsyncWriteExt + Unpin>(writer: &mut W, reply: &HelperReply) -> Result<()> {
    let mut frame = serde_json::to_vec(reply)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use automount_core::client::HelperClient;
    use automount_core::error::{AutomountError, AutomountResult};
    use automount_core::keystore::FileCredentialStore;
    use automount_core::protocol::HelperCommand;
    use automount_core::provider::HelperLink;
    use automount_zfs::{Output, SystemZfs};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::Barrier;

    struct Succeed;

    #[async_trait]
    impl CommandExecutor for Succeed {
        async fn run(&self, _binary: &Path, _args: &[&str]) -> AutomountResult<Output> {
            Ok(Output::default())
        }
    }

    #[test]
    fn policy_admits_root_and_listed_uids() {
        let open = PeerPolicy::default();
        assert!(open.admits(501));
        let strict = PeerPolicy::new(vec![501]);
        assert!(strict.admits(0));
        assert!(strict.admits(501));
        assert!(!strict.admits(502));
    }

    #[tokio::test]
    async fn client_round_trips_through_socket() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("run").join("helper.sock");
        let listener = bind(&socket, 0o600).unwrap();
        let mode = fs::metadata(&socket).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let store = Arc::new(FileCredentialStore::new("system", dir.path(), "svc"));
        let zfs = SystemZfs::with_executor("/sbin/zfs", "/sbin/zpool", Succeed);
        let dispatcher = Arc::new(Dispatcher::new(zfs, store));
        let server = tokio::spawn(serve(listener, dispatcher, PeerPolicy::default()));

        let client = HelperClient::new(&socket, Duration::from_secs(5));
        assert_eq!(
            client
                .execute(HelperCommand::ScrubPool {
                    pool: "tank".into()
                })
                .await
                .unwrap(),
            "Scrub started on tank"
        );
        let err = client
            .execute(HelperCommand::LoadKey {
                dataset: "tank/enc1".into(),
                format: automount_core::model::KeyEncoding::Raw,
                key: "xyz".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AutomountError::Helper(_)));
        server.abort();
    }

    /// Holds every command until `parties` of them are running at once.
    struct Rendezvous {
        barrier: Barrier,
    }

    #[async_trait]
    impl CommandExecutor for Rendezvous {
        async fn run(&self, _binary: &Path, _args: &[&str]) -> AutomountResult<Output> {
            self.barrier.wait().await;
            Ok(Output::default())
        }
    }

    #[tokio::test]
    async fn commands_on_one_connection_run_concurrently() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("helper.sock");
        let listener = bind(&socket, 0o600).unwrap();
        let store = Arc::new(FileCredentialStore::new("system", dir.path(), "svc"));
        let zfs = SystemZfs::with_executor(
            "/sbin/zfs",
            "/sbin/zpool",
            Rendezvous {
                barrier: Barrier::new(2),
            },
        );
        let dispatcher = Arc::new(Dispatcher::new(zfs, store));
        let server = tokio::spawn(serve(listener, dispatcher, PeerPolicy::default()));

        let client = HelperClient::new(&socket, Duration::from_secs(5));
        let (a, b) = tokio::join!(
            client.execute(HelperCommand::ScrubPool { pool: "a".into() }),
            client.execute(HelperCommand::TrimPool { pool: "b".into() }),
        );
        assert_eq!(a.unwrap(), "Scrub started on a");
        assert_eq!(b.unwrap(), "TRIM started on b");
        server.abort();
    }

    #[tokio::test]
    async fn rebinding_replaces_stale_socket() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("helper.sock");
        drop(bind(&socket, 0o660).unwrap());
        assert!(bind(&socket, 0o660).is_ok());
    }
}
