// snap2s3 is a tool for migrating EBS snapshots to S3 object storage.
// Copyright (C) 2025  snap2s3 contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] snap2s3_common::ConfigError),
    #[error("Preflight check failed: {0}")]
    Preflight(#[from] snap2s3_common::PreflightError),

    #[error("{0}")]
    SnapshotsMissing(#[from] snap2s3_common::SnapshotsMissing),
    #[error("{0}")]
    Migration(#[from] snap2s3_common::MigrationError),
    #[error("{0}")]
    Validation(#[from] snap2s3_common::ValidationError),
    #[error("{0}")]
    Pipeline(#[from] snap2s3_common::PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
