//! Typed RPC messages and wire codec
//!
//! The distribution protocol is a closed set of request/response kinds
//! exchanged as length-prefixed JSON frames: a 4-byte big-endian length
//! followed by the serialized message. Oversized frames are rejected before
//! allocation so a misbehaving peer cannot balloon memory.

use crate::connection_error::ConnectionError;
use crate::constants::frame;
use crate::types::ArtifactReference;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Requests served by the distribution RPC server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// Return the artifact bytes if cached locally
    ServeFile { reference: ArtifactReference },
    /// Report what this node knows about a reference
    FileReferenceStatus { reference: ArtifactReference },
    /// Enumerate the references this node currently has cached
    ActiveFileReferences,
    /// Liveness check
    Ping,
}

/// What a node knows about a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceStatus {
    /// A download for the reference is in flight on this node
    Pending,
    /// The artifact is present in the local store
    Available,
    /// This node has never seen the reference
    Unknown,
}

/// Outcome of a serve-file request
///
/// A node only serves what it already has cached; it never fetches on a
/// requester's behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServeFileResult {
    Found { payload: Vec<u8> },
    NotFound { reason: String },
}

/// Responses produced by the distribution RPC server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    ServeFile { result: ServeFileResult },
    FileReferenceStatus { status: ReferenceStatus },
    ActiveFileReferences { references: Vec<ArtifactReference> },
    Pong,
    /// Catch-all for malformed or unserviceable requests
    Error { reason: String },
}

impl Response {
    /// Short name of the response kind, for logs and error messages
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ServeFile { .. } => "serve_file",
            Self::FileReferenceStatus { .. } => "file_reference_status",
            Self::ActiveFileReferences { .. } => "active_file_references",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }
}

/// Write one length-prefixed frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message).map_err(|e| ConnectionError::Codec {
        detail: e.to_string(),
    })?;
    if body.len() > frame::MAX_FRAME {
        return Err(ConnectionError::FrameTooLarge {
            size: body.len(),
            max: frame::MAX_FRAME,
        });
    }

    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
///
/// Returns `Ok(None)` on clean EOF at a frame boundary (peer closed the
/// connection between requests).
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, ConnectionError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; frame::LEN_PREFIX];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > frame::MAX_FRAME {
        return Err(ConnectionError::FrameTooLarge {
            size: len,
            max: frame::MAX_FRAME,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let message = serde_json::from_slice(&body).map_err(|e| ConnectionError::Codec {
        detail: e.to_string(),
    })?;
    Ok(Some(message))
}
