/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use thiserror::Error;

/// Errors raised while bucketing, estimating or aggregating a workflow footprint.
///
/// None of these are retried. A run either produces complete totals or stops at the first
/// failing task or bucket.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FootprintError {
    #[error("Invalid task record [{task}]: {reason}")]
    InvalidRecord { task: String, reason: String },

    #[error("No carbon intensity interval found for key [{key}]")]
    MissingCiInterval { key: String },

    #[error("No min/max wattage configured for CPU model [{model}] and no default pair set")]
    MissingCpuSpec { model: String },
}

impl FootprintError {
    pub fn invalid_record(task: &str, reason: impl Into<String>) -> Self {
        FootprintError::InvalidRecord {
            task: task.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FootprintError>;
