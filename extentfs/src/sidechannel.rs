//! Request/response channel for pseudo-files.
//!
//! Pseudo-files (control files, pipes) have no extents. A read on one is forwarded to
//! the service behind the channel together with the identity of the node the
//! pseudo-file was opened under.

use crate::error::{ReadError, Result};
use crate::file::FileIdentity;
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideChannelOp {
    /// Read the reply to an earlier control request.
    ControlRead,
    /// Read from a named pipe.
    PipeRead,
}

#[derive(Debug, Clone)]
pub struct SideChannelRequest {
    pub opcode: SideChannelOp,
    pub parent: FileIdentity,
    pub request_id: u64,
    pub offset: u64,
    pub payload: Bytes,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideChannelStatus {
    Success,
    EndOfFile,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct SideChannelResponse {
    pub payload: Bytes,
    pub bytes_processed: usize,
    pub status: SideChannelStatus,
}

impl SideChannelResponse {
    /// The bytes the service reports as read, or the error its status stands for.
    pub fn into_data(self, offset: u64) -> Result<Bytes> {
        match self.status {
            SideChannelStatus::Success => {
                let n = self.bytes_processed.min(self.payload.len());
                Ok(self.payload.slice(..n))
            }
            SideChannelStatus::EndOfFile => Err(ReadError::EndOfFile { offset, size: offset }),
            SideChannelStatus::Failed(msg) => Err(ReadError::io(anyhow!(msg))),
        }
    }
}

#[async_trait]
pub trait SideChannel: Send + Sync {
    async fn request(&self, request: SideChannelRequest) -> anyhow::Result<SideChannelResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_status_mapping() {
        let ok = SideChannelResponse {
            payload: Bytes::from_static(b"hello world"),
            bytes_processed: 5,
            status: SideChannelStatus::Success,
        };
        assert_eq!(&ok.into_data(0).unwrap()[..], b"hello");

        let eof = SideChannelResponse {
            payload: Bytes::new(),
            bytes_processed: 0,
            status: SideChannelStatus::EndOfFile,
        };
        assert!(eof.into_data(3).unwrap_err().is_eof());

        let failed = SideChannelResponse {
            payload: Bytes::new(),
            bytes_processed: 0,
            status: SideChannelStatus::Failed("denied".into()),
        };
        let err = failed.into_data(0).unwrap_err();
        assert!(err.to_string().contains("denied"));
    }
}
