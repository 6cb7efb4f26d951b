// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-chain checkpoint persistence
//!
//! The checkpoint is the highest fully-processed block height for one chain,
//! stored as decimal text in a single file. It is read once on startup and
//! overwritten after each processed block; a restart resumes at
//! `checkpoint + 1`. The write happens only after every deposit in the block
//! has been emitted and accepted downstream.

use crate::error::{RelayError, RelayResult};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    chain: String,
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(chain: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            chain: chain.into(),
            path: path.into(),
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Last persisted checkpoint, or `None` if no checkpoint exists yet
    pub fn load(&self) -> RelayResult<Option<u64>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let height = contents.trim().parse::<u64>().map_err(|e| {
                    RelayError::Checkpoint(format!(
                        "[{}] corrupt checkpoint file {}: {e}",
                        self.chain,
                        self.path.display()
                    ))
                })?;
                Ok(Some(height))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RelayError::Checkpoint(format!(
                "[{}] failed to read checkpoint file {}: {e}",
                self.chain,
                self.path.display()
            ))),
        }
    }

    /// Persist a new checkpoint. Writes a temp file and renames it into
    /// place so a crash mid-write never leaves a torn value.
    pub fn save(&self, height: u64) -> RelayResult<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, height.to_string()).map_err(|e| {
            RelayError::Checkpoint(format!(
                "[{}] failed to write checkpoint file {}: {e}",
                self.chain,
                tmp.display()
            ))
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            RelayError::Checkpoint(format!(
                "[{}] failed to replace checkpoint file {}: {e}",
                self.chain,
                self.path.display()
            ))
        })
    }
}
