// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! rss error types

use std::{
    error::Error,
    fmt::{Display, Formatter},
    io, result,
};

use crate::protocol::ErrorKind;

/// Result type alias for rss operations.
pub type Result<T> = result::Result<T, RssError>;

/// rss error types for the shuffle master, worker and client.
#[derive(Debug)]
pub enum RssError {
    /// General error with a descriptive message.
    General(String),
    /// Internal error indicating a bug or unexpected state.
    Internal(String),
    /// Configuration error with invalid settings.
    Configuration(String),
    /// Allocation found zero live workers for the requested datacenter/cluster.
    NoShuffleWorkers(String),
    /// The control channel token pool stayed exhausted past the caller deadline.
    NoToken(String),
    /// Transient memory pressure on a worker; the caller should retry.
    Backpressure(String),
    /// A block with an already-seen `(map, attempt, seq)` fingerprint. Informational.
    DuplicateBlock(String),
    /// The reader waited past its limit for the stage success marker.
    InputNotReady(String),
    /// DFS operation failed. Terminal once bounded retries are exhausted.
    Dfs(object_store::Error),
    /// Data read back from the DFS failed checksum or framing validation.
    Corrupt(String),
    /// The stage (or one of its partitions) has been aborted or superseded.
    StageAborted(String),
    /// Malformed or out-of-contract wire traffic. Never retried.
    Protocol(String),
    /// The request deadline elapsed before the server processed it.
    Expired(String),
    /// Coordination service failure.
    Registry(String),
    /// Failure establishing or using a network connection.
    Connection(String),
    /// I/O operation error.
    IoError(io::Error),
    /// Tokio task join error.
    TokioError(tokio::task::JoinError),
    /// Operation was cancelled.
    Cancelled,
}

#[allow(clippy::from_over_into)]
impl<T> Into<Result<T>> for RssError {
    fn into(self) -> Result<T> {
        Err(self)
    }
}

/// Creates a general rss error from a string message.
pub fn rss_error(message: &str) -> RssError {
    RssError::General(message.to_owned())
}

impl RssError {
    /// True for failures that a client is expected to retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RssError::Backpressure(_) | RssError::Connection(_) | RssError::IoError(_)
        )
    }

    /// Maps this error onto the wire-level error kind carried in replies.
    pub fn wire_kind(&self) -> ErrorKind {
        match self {
            RssError::NoShuffleWorkers(_) => ErrorKind::NoShuffleWorkers,
            RssError::NoToken(_) => ErrorKind::NoToken,
            RssError::Backpressure(_) => ErrorKind::Backpressure,
            RssError::DuplicateBlock(_) => ErrorKind::DuplicateBlock,
            RssError::InputNotReady(_) => ErrorKind::InputNotReady,
            RssError::Dfs(_) | RssError::Corrupt(_) => ErrorKind::Dfs,
            RssError::StageAborted(_) => ErrorKind::StageAborted,
            RssError::Configuration(_) => ErrorKind::Config,
            RssError::Protocol(_) => ErrorKind::Protocol,
            RssError::Expired(_) => ErrorKind::Expired,
            _ => ErrorKind::Internal,
        }
    }

    /// Reconstructs a typed error from a wire-level reply.
    pub fn from_wire(kind: ErrorKind, message: String) -> RssError {
        match kind {
            ErrorKind::NoShuffleWorkers => RssError::NoShuffleWorkers(message),
            ErrorKind::NoToken => RssError::NoToken(message),
            ErrorKind::Backpressure => RssError::Backpressure(message),
            ErrorKind::DuplicateBlock => RssError::DuplicateBlock(message),
            ErrorKind::InputNotReady => RssError::InputNotReady(message),
            ErrorKind::Dfs => RssError::General(format!("remote DFS error: {message}")),
            ErrorKind::StageAborted => RssError::StageAborted(message),
            ErrorKind::Config => RssError::Configuration(message),
            ErrorKind::Protocol => RssError::Protocol(message),
            ErrorKind::Expired => RssError::Expired(message),
            ErrorKind::Ok | ErrorKind::Internal => RssError::General(message),
        }
    }

    /// Process exit code for daemon binaries, distinguishing the startup
    /// failure classes operators need to tell apart.
    pub fn exit_code(&self) -> i32 {
        match self {
            RssError::Configuration(_) => 2,
            RssError::Registry(_) => 3,
            RssError::IoError(e) if e.kind() == io::ErrorKind::AddrInUse => 4,
            RssError::Dfs(_) => 5,
            _ => 1,
        }
    }
}

impl From<String> for RssError {
    fn from(e: String) -> Self {
        RssError::General(e)
    }
}

impl From<io::Error> for RssError {
    fn from(e: io::Error) -> Self {
        RssError::IoError(e)
    }
}

impl From<object_store::Error> for RssError {
    fn from(e: object_store::Error) -> Self {
        RssError::Dfs(e)
    }
}

impl From<etcd_client::Error> for RssError {
    fn from(e: etcd_client::Error) -> Self {
        RssError::Registry(format!("etcd error: {e}"))
    }
}

impl From<serde_json::Error> for RssError {
    fn from(e: serde_json::Error) -> Self {
        RssError::Protocol(format!("invalid message encoding: {e}"))
    }
}

impl From<tokio::task::JoinError> for RssError {
    fn from(e: tokio::task::JoinError) -> Self {
        RssError::TokioError(e)
    }
}

impl From<tokio::time::error::Elapsed> for RssError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RssError::Expired("operation timed out".to_owned())
    }
}

impl Display for RssError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            RssError::General(desc) => write!(f, "General error: {desc}"),
            RssError::Internal(desc) => write!(f, "Internal rss error: {desc}"),
            RssError::Configuration(desc) => write!(f, "Configuration error: {desc}"),
            RssError::NoShuffleWorkers(desc) => {
                write!(f, "No live shuffle workers: {desc}")
            }
            RssError::NoToken(desc) => write!(f, "Connection token exhausted: {desc}"),
            RssError::Backpressure(desc) => write!(f, "Worker backpressure: {desc}"),
            RssError::DuplicateBlock(desc) => write!(f, "Duplicate block: {desc}"),
            RssError::InputNotReady(desc) => write!(f, "Shuffle input not ready: {desc}"),
            RssError::Dfs(desc) => write!(f, "DFS error: {desc}"),
            RssError::Corrupt(desc) => write!(f, "Corrupt shuffle data: {desc}"),
            RssError::StageAborted(desc) => write!(f, "Stage aborted: {desc}"),
            RssError::Protocol(desc) => write!(f, "Protocol error: {desc}"),
            RssError::Expired(desc) => write!(f, "Deadline exceeded: {desc}"),
            RssError::Registry(desc) => write!(f, "Registry error: {desc}"),
            RssError::Connection(desc) => write!(f, "Connection error: {desc}"),
            RssError::IoError(desc) => write!(f, "IO error: {desc}"),
            RssError::TokioError(desc) => write!(f, "Tokio join error: {desc}"),
            RssError::Cancelled => write!(f, "Task cancelled"),
        }
    }
}

impl Error for RssError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_kind_round_trip() {
        let e = RssError::Backpressure("worker-1 over threshold".to_owned());
        let kind = e.wire_kind();
        let back = RssError::from_wire(kind, "worker-1 over threshold".to_owned());
        assert!(matches!(back, RssError::Backpressure(_)));
        assert!(back.is_retryable());
    }

    #[test]
    fn protocol_errors_are_not_retryable() {
        assert!(!RssError::Protocol("bad frame".to_owned()).is_retryable());
        assert!(!RssError::StageAborted("superseded".to_owned()).is_retryable());
    }

    #[test]
    fn exit_codes_distinguish_startup_failures() {
        assert_eq!(RssError::Configuration("x".into()).exit_code(), 2);
        assert_eq!(RssError::Registry("down".into()).exit_code(), 3);
        let port = io::Error::new(io::ErrorKind::AddrInUse, "in use");
        assert_eq!(RssError::IoError(port).exit_code(), 4);
    }
}
