//! Distribution-side RPC server
//!
//! Serves peer requests against the local content store: artifact bytes,
//! reference status and the set of cached references, plus a liveness ping.
//! All handlers are read-only with respect to the store and this node never
//! fetches on a requester's behalf: it serves what it already has, or
//! answers not-found.

use crate::downloader::DownloadRegistry;
use crate::protocol::{ReferenceStatus, Request, Response, ServeFileResult, read_frame, write_frame};
use crate::store::ContentStore;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to a running distribution server
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the server is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting peer connections and wait for the accept loop to end
    pub async fn stop(self, grace: Duration) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(grace, self.join).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::anyhow!("distribution server task panicked: {}", e)),
            Err(_) => Err(anyhow::anyhow!(
                "distribution server did not stop within {:?}",
                grace
            )),
        }
    }
}

/// RPC server answering peer requests from the local store
#[derive(Debug)]
pub struct DistributionServer {
    store: Arc<ContentStore>,
    registry: Arc<DownloadRegistry>,
}

impl DistributionServer {
    pub fn new(store: Arc<ContentStore>, registry: Arc<DownloadRegistry>) -> Self {
        Self { store, registry }
    }

    /// Bind `addr` and serve peers until the handle is stopped
    pub async fn spawn(self, addr: SocketAddr) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("distribution server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Arc::new(self);
        let join = tokio::spawn(server.accept_loop(listener, shutdown_rx));

        Ok(ServerHandle {
            local_addr,
            shutdown_tx,
            join,
        })
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_peer(stream, peer_addr).await {
                                    debug!("peer {} connection ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("accept failed: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("distribution server stopping");
                    break;
                }
            }
        }
    }

    /// Serve one peer connection: a sequence of request/response frames
    async fn handle_peer(&self, mut stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        debug!("peer connected from {}", peer_addr);
        while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
            let response = self.dispatch(request).await;
            write_frame(&mut stream, &response).await?;
        }
        debug!("peer {} disconnected", peer_addr);
        Ok(())
    }

    /// Dispatch one request over the closed request set
    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::ServeFile { reference } => {
                let result = match self.store.read(&reference).await {
                    Ok(Some(payload)) => ServeFileResult::Found { payload },
                    Ok(None) => ServeFileResult::NotFound {
                        reason: format!("'{}' is not cached on this node", reference),
                    },
                    Err(e) => {
                        warn!("failed reading '{}' for a peer: {}", reference, e);
                        ServeFileResult::NotFound {
                            reason: format!("local read error: {}", e),
                        }
                    }
                };
                Response::ServeFile { result }
            }
            Request::FileReferenceStatus { reference } => {
                let status = if self.registry.contains(&reference) {
                    ReferenceStatus::Pending
                } else if self.store.contains(&reference) {
                    ReferenceStatus::Available
                } else {
                    ReferenceStatus::Unknown
                };
                Response::FileReferenceStatus { status }
            }
            Request::ActiveFileReferences => {
                let mut references = self.store.references();
                references.sort();
                Response::ActiveFileReferences { references }
            }
            Request::Ping => Response::Pong,
        }
    }
}
