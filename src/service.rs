//! Top-level service wiring and ordered shutdown
//!
//! Ties the content store, connection pool, download coordinator, RPC
//! server and cache maintainer together behind one start/close pair.
//! Shutdown order: the RPC server stops accepting work first, then the
//! maintainer is cancelled, then in-flight downloads get a bounded grace
//! period to drain. A failed drain is reported as an error, never
//! swallowed.

use crate::config::Config;
use crate::downloader::FileDownloader;
use crate::maintenance::{ActiveReferences, CachedFilesMaintainer};
use crate::pool::ConnectionPool;
use crate::server::{DistributionServer, ServerHandle};
use crate::store::ContentStore;
use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Running distribution service
pub struct FileDistributionService {
    downloader: FileDownloader,
    server: ServerHandle,
    maintainer: Option<(JoinHandle<()>, watch::Sender<bool>)>,
}

impl FileDistributionService {
    /// Build and start every component from a validated configuration
    ///
    /// When no active-reference oracle is supplied the maintainer is not
    /// started and the cache only ever grows.
    pub async fn start(
        config: Config,
        oracle: Option<Arc<dyn ActiveReferences>>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(ContentStore::open(&config.store_dir)?);
        let pool = Arc::new(ConnectionPool::new(config.sources.clone())?);
        let downloader = FileDownloader::new(
            Arc::clone(&store),
            pool,
            config.retry,
            config.verify_content,
        );

        let listen = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.listen_port);
        let server = DistributionServer::new(Arc::clone(&store), Arc::clone(downloader.registry()))
            .spawn(listen)
            .await?;

        let maintainer = match oracle {
            Some(oracle) => {
                let maintainer = CachedFilesMaintainer::new(
                    store,
                    Arc::clone(downloader.registry()),
                    oracle,
                    config.maintenance,
                );
                Some(maintainer.spawn())
            }
            None => {
                info!("no active-reference source configured; cache maintenance disabled");
                None
            }
        };

        Ok(Self {
            downloader,
            server,
            maintainer,
        })
    }

    /// The download coordinator, for local fetch/is_cached callers
    #[must_use]
    pub fn downloader(&self) -> &FileDownloader {
        &self.downloader
    }

    /// Address the distribution server is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Ordered shutdown with a bounded drain grace period
    pub async fn close(self, grace: Duration) -> Result<()> {
        // New fetches fail fast from here on; in-flight ones may finish
        self.downloader.begin_shutdown();

        self.server.stop(grace).await?;

        if let Some((join, shutdown_tx)) = self.maintainer {
            let _ = shutdown_tx.send(true);
            match tokio::time::timeout(grace, join).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => anyhow::bail!("cache maintainer panicked: {}", e),
                Err(_) => anyhow::bail!("cache maintainer did not stop within {:?}", grace),
            }
        }

        let registry = Arc::clone(self.downloader.registry());
        let deadline = tokio::time::Instant::now() + grace;
        while !registry.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "{} downloads still in flight after {:?} shutdown grace",
                    registry.len(),
                    grace
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        info!("file distribution service stopped");
        Ok(())
    }
}
