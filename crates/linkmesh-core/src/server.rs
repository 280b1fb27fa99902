//! Unix domain socket listener that feeds accepted connections to a router.
//!
//! Every accepted connection becomes an untrusted link; it must authenticate
//! before the router will forward anything for it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UnixListener;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::RouterConfig;
use crate::router::{LinkKind, Router};
use crate::transport::spawn_stream;
use crate::{MeshError, Result};

/// Handle to a running listener. Dropping shuts it down and removes the
/// socket file.
pub struct MeshServerHandle {
    path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MeshServerHandle {
    /// Path of the listening socket.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting and close every link this listener accepted.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for MeshServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct MeshServer;

impl MeshServer {
    /// Listen on `path`, replacing a stale socket file if one is left over.
    pub async fn start_unix(router: Router, path: impl AsRef<Path>) -> Result<MeshServerHandle> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(&path).map_err(|e| MeshError::Io {
                message: format!("cannot remove stale socket {}: {}", path.display(), e),
                source: Some(e),
            })?;
        }
        let listener = UnixListener::bind(&path).map_err(|e| MeshError::Io {
            message: format!("cannot listen on {}: {}", path.display(), e),
            source: Some(e),
        })?;

        info!("Mesh listening on {}", path.display());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            router,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(MeshServerHandle {
            path,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: UnixListener,
        router: Router,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        let accepted = AtomicU64::new(0);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Mesh listener shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            if router.link_count() >= RouterConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting connection: at max capacity ({})",
                                    RouterConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }
                            let n = accepted.fetch_add(1, Ordering::Relaxed) + 1;
                            let transport = spawn_stream(stream, format!("unix#{}", n));
                            let closer = transport.closer.clone();
                            let link = router.register_link(transport, LinkKind::Untrusted);
                            debug!("Accepted connection unix#{} as link {}", n, link);

                            let mut conn_shutdown = conn_shutdown_rx.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = conn_shutdown.wait_for(|stop| *stop) => closer.close(),
                                    _ = closer.closed() => {}
                                }
                            });
                        }
                        Err(e) => {
                            error!("Mesh accept error: {}", e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::spawn_stream;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn test_accepted_connection_starts_untrusted() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("mesh.sock");
        let router = Router::builder().build().unwrap();
        let handle = MeshServer::start_unix(router.clone(), &sock).await.unwrap();
        assert_eq!(handle.path(), sock.as_path());

        let stream = UnixStream::connect(&sock).await.unwrap();
        let _link = spawn_stream(stream, "client");
        while router.link_count() == 0 {
            tokio::task::yield_now().await;
        }
        let snapshot = router.snapshot();
        assert_eq!(snapshot.links[0].kind, LinkKind::Untrusted);
    }

    #[tokio::test]
    async fn test_shutdown_closes_links_and_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("mesh.sock");
        let router = Router::builder().build().unwrap();
        let handle = MeshServer::start_unix(router.clone(), &sock).await.unwrap();

        let stream = UnixStream::connect(&sock).await.unwrap();
        let mut link = spawn_stream(stream, "client");
        while router.link_count() == 0 {
            tokio::task::yield_now().await;
        }

        drop(handle);
        assert!(link.inbound.recv().await.is_none());
        assert!(!sock.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("mesh.sock");
        std::fs::write(&sock, b"stale").unwrap();
        let router = Router::builder().build().unwrap();
        assert!(MeshServer::start_unix(router, &sock).await.is_ok());
    }
}
