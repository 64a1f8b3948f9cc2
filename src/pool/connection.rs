//! A single RPC connection to a source node
//!
//! Wraps a tuned TCP stream with the framed request/response round trip.
//! Connections are owned by the pool; the coordinator borrows them through
//! [`crate::pool::PooledConnection`].

use crate::config::SourceConfig;
use crate::connection_error::ConnectionError;
use crate::constants::pool::CONNECT_TIMEOUT_MS;
use crate::protocol::{Request, Response, read_frame, write_frame};
use crate::types::SourceId;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// One live RPC connection to a source node
#[derive(Debug)]
pub struct SourceConnection {
    stream: TcpStream,
    source_id: SourceId,
    source_name: String,
}

impl SourceConnection {
    /// Open a new connection to `config`, bounded by the connect timeout
    pub async fn connect(
        source_id: SourceId,
        config: &SourceConfig,
    ) -> Result<Self, ConnectionError> {
        let addr = config.address();
        let connect = TcpStream::connect(&addr);
        let stream = match tokio::time::timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            connect,
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ConnectionError::Connect {
                    host: config.host.clone(),
                    port: config.port,
                    source: e,
                });
            }
            Err(_) => {
                return Err(ConnectionError::ConnectTimeout {
                    host: config.host.clone(),
                    port: config.port,
                });
            }
        };

        tune_socket(&stream);
        debug!("connected to source '{}' at {}", config.name, addr);

        Ok(Self {
            stream,
            source_id,
            source_name: config.name.clone(),
        })
    }

    /// Which configured source this connection reaches
    #[must_use]
    #[inline]
    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    /// Source name for logging
    #[must_use]
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// One request/response round trip, bounded by `timeout`
    pub async fn request(
        &mut self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, ConnectionError> {
        let exchange = async {
            write_frame(&mut self.stream, request).await?;
            read_frame::<_, Response>(&mut self.stream)
                .await?
                .ok_or_else(|| ConnectionError::UnexpectedEof {
                    source: self.source_name.clone(),
                })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::RequestTimeout {
                source: self.source_name.clone(),
            }),
        }
    }

    /// Liveness round trip used by pool health checks
    pub async fn ping(&mut self, timeout: Duration) -> bool {
        matches!(self.request(&Request::Ping, timeout).await, Ok(Response::Pong))
    }

    /// Probe whether an idle connection is still usable
    ///
    /// An idle connection has no request outstanding, so the peer should not
    /// be sending anything: a zero-byte read means it closed on us, pending
    /// data means a desynchronized exchange, and `WouldBlock` means healthy.
    #[must_use]
    pub fn is_idle_alive(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.try_read(&mut probe) {
            Ok(0) => false,
            Ok(_) => false,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }
}

/// Apply socket options suited to request/response RPC traffic
fn tune_socket(stream: &TcpStream) {
    use socket2::SockRef;

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY: {}", e);
    }
    if let Err(e) = sock_ref.set_keepalive(true) {
        debug!("failed to enable keepalive: {}", e);
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(10));
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            debug!("failed to set keepalive timing: {}", e);
        }
    }
}
