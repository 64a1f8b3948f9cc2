//! Connection and wire-level error types
//!
//! This module provides detailed error types for RPC connection management,
//! making it easier to diagnose and handle the different failure scenarios
//! the pool and the codec run into.

use std::fmt;

/// Errors that can occur while talking to a source node
#[derive(Debug)]
#[non_exhaustive]
pub enum ConnectionError {
    /// TCP connection failed
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    /// TCP connection did not complete within the connect timeout
    ConnectTimeout { host: String, port: u16 },

    /// All connection slots for a source are in use
    PoolSaturated { source: String, max_size: usize },

    /// The source did not answer a request within the request timeout
    RequestTimeout { source: String },

    /// A frame exceeded the configured size cap
    FrameTooLarge { size: usize, max: usize },

    /// A frame could not be encoded or decoded
    Codec { detail: String },

    /// The peer closed the connection mid-frame
    UnexpectedEof { source: String },

    /// The peer answered with a response kind the request does not allow
    UnexpectedResponse { source: String, got: &'static str },

    /// I/O error during communication
    Io(std::io::Error),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { host, port, source } => {
                write!(f, "failed to connect to {}:{}: {}", host, port, source)
            }
            Self::ConnectTimeout { host, port } => {
                write!(f, "timed out connecting to {}:{}", host, port)
            }
            Self::PoolSaturated { source, max_size } => {
                write!(
                    f,
                    "connection pool saturated for source '{}' (max size: {})",
                    source, max_size
                )
            }
            Self::RequestTimeout { source } => {
                write!(f, "request to source '{}' timed out", source)
            }
            Self::FrameTooLarge { size, max } => {
                write!(f, "frame of {} bytes exceeds cap of {} bytes", size, max)
            }
            Self::Codec { detail } => write!(f, "frame codec error: {}", detail),
            Self::UnexpectedEof { source } => {
                write!(f, "source '{}' closed the connection mid-frame", source)
            }
            Self::UnexpectedResponse { source, got } => {
                write!(f, "source '{}' sent unexpected response kind {}", source, got)
            }
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connect { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl ConnectionError {
    /// Check if this failure is tied to one connection rather than the source
    ///
    /// Retryable failures leave the source as a candidate; the coordinator
    /// discards the connection and may open a fresh one.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::ConnectTimeout { .. }
                | Self::PoolSaturated { .. }
                | Self::RequestTimeout { .. }
                | Self::UnexpectedEof { .. }
                | Self::Io(_)
        )
    }

    /// Get the appropriate log level for this error
    #[must_use]
    pub fn log_level(&self) -> tracing::Level {
        match self {
            // Frame violations mean a misbehaving peer, worth attention
            Self::FrameTooLarge { .. } | Self::Codec { .. } | Self::UnexpectedResponse { .. } => {
                tracing::Level::ERROR
            }
            // Saturation clears on its own once slots free up
            Self::PoolSaturated { .. } => tracing::Level::DEBUG,
            // Everything else is transient network weather
            _ => tracing::Level::WARN,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
