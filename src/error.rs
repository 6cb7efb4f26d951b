// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Error type for watcher and ledger operations
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("broadcast failed: {0}")]
    Broadcast(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid amount: {0}")]
    Amount(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Whether this error is transient (the poll loop should retry on the
    /// next tick rather than abort)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RelayError::Rpc(_) | RelayError::InvalidResponse(_))
    }

    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayError::Rpc(_) => "rpc_error",
            RelayError::InvalidResponse(_) => "invalid_response",
            RelayError::Broadcast(_) => "broadcast_failed",
            RelayError::Checkpoint(_) => "checkpoint_error",
            RelayError::Config(_) => "invalid_config",
            RelayError::Amount(_) => "invalid_amount",
            RelayError::ChannelClosed => "channel_closed",
            RelayError::Other(_) => "other",
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
