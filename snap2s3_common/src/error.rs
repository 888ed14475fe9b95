// snap2s3_common is the main snap2s3 library implementing the migration core.
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

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// A `ConfigError` indicates an invalid option or a disallowed
/// combination of options. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The mount point must be a usable directory prefix.
    #[error("Mount point must not be empty or \"/\"")]
    InvalidMountPoint,
    /// A KMS key id only makes sense with KMS-managed encryption.
    #[error("An SSE KMS key id requires server-side encryption \"aws:kms\"")]
    KmsKeyWithoutKms,
}

/// A `PreflightError` indicates that the host is missing a required
/// external tool or cannot reach the instance metadata service.
/// Fatal at startup.
#[derive(Debug, Error)]
pub enum PreflightError {
    /// A required external tool is not installed or not on `PATH`.
    #[error("Required tool \"{tool}\" not found in PATH: {source}")]
    MissingTool {
        tool: &'static str,
        source: which::Error,
    },
    /// The instance metadata service did not answer or returned garbage.
    /// This tool only works when run on an EC2 instance.
    #[error("Unable to query instance metadata: {0}")]
    Metadata(String),
}

/// A `ProbeError` indicates a failure enumerating or interpreting the
/// block devices of an attached volume.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The block device enumerator exited unsuccessfully.
    #[error("lsblk exited with {0}")]
    Lsblk(ExitStatus),
    /// The enumerator reported a device type other than `disk` or `part`.
    #[error("Unknown device type \"{0}\"")]
    UnknownDeviceType(String),
    /// A multi-device volume had no partition entries left
    /// after removing the whole-disk entry.
    #[error("Volume has no partitions")]
    NoPartitions,
    /// The raw-disk view requires exactly one whole-disk device.
    #[error("Expected exactly one whole-disk device, found {0}")]
    DiskCount(usize),
    /// No kernel block device could be matched to the volume.
    #[error("No block device found for volume \"{0}\"")]
    NotFound(String),

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The enumerator's JSON output could not be decoded.
    #[error("Unable to parse lsblk output: {0}")]
    Json(#[from] serde_json::Error),
}

/// A `PipelineError` indicates a failure in any stage of a snapshot's
/// processing: cloud API calls, attach, mount, read, compress, upload
/// or a child process exiting unsuccessfully.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A child stage exited unsuccessfully.
    #[error("\"{tool}\" exited with {status}")]
    Stage { tool: String, status: ExitStatus },
    /// A child stage did not provide a stdin pipe.
    #[error("\"{0}\" does not have stdin")]
    NoStageInput(&'static str),
    /// A child stage did not provide a stdout pipe.
    #[error("\"{0}\" does not have stdout")]
    NoStageOutput(&'static str),

    /// An AWS API call failed. The SDK's own retries are already spent
    /// by the time this surfaces.
    #[error("AWS API error: {0}")]
    Api(String),
    /// The multipart upload did not return an upload id.
    #[error("Object store did not return an upload id for \"{0}\"")]
    NoUploadId(String),

    /// A long-poll operation ran out of its retry budget.
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    /// An interrupt signal arrived while an upload was in flight.
    /// The multipart upload has been aborted by the time this surfaces.
    #[error("Upload interrupted by signal")]
    Interrupted,

    /// All device names in the reserved attachment range are taken.
    #[error("No free attachment device letters on this instance")]
    NoFreeDevice,
    /// The mountpoint directory exists and is not empty.
    #[error("Mountpoint \"{0}\" is not empty")]
    MountpointNotEmpty(PathBuf),
    /// The device is already mounted somewhere else.
    #[error("Device \"{device}\" is already mounted at \"{mountpoint}\"")]
    MountedElsewhere { device: PathBuf, mountpoint: PathBuf },

    /// There was a failure probing block devices.
    #[error("Block device probe failed: {0}")]
    Probe(#[from] ProbeError),

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A `ClaimError` indicates that a snapshot could not be claimed
/// for a state transition.
#[derive(Debug, Error)]
pub enum ClaimError {
    /// Another worker wrote its own nonce concurrently and won the race.
    /// The snapshot is theirs; skip it.
    #[error("Snapshot \"{0}\" is already marked by another worker")]
    Lost(String),
    /// The claim could not be written or read back.
    #[error(transparent)]
    Api(#[from] PipelineError),
}

/// A single difference between the local tree and the remote archive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HashDiff {
    /// The path exists locally but not in the remote archive.
    MissingOnRemote(String),
    /// The path exists in the remote archive but not locally.
    MissingOnLocal(String),
    /// The path exists on both sides with different content.
    Mismatch {
        path: String,
        local: String,
        remote: String,
    },
}

impl fmt::Display for HashDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingOnRemote(path) => write!(f, "\"{}\": missing on remote", path),
            Self::MissingOnLocal(path) => write!(f, "\"{}\": missing on local", path),
            Self::Mismatch {
                path,
                local,
                remote,
            } => write!(
                f,
                "\"{}\": hash differs (local {}, remote {})",
                path, local, remote
            ),
        }
    }
}

/// A `ValidationFailure` indicates that an uploaded object does not
/// reproduce the snapshot data, or is missing entirely.
#[derive(Debug)]
pub enum ValidationFailure {
    /// The expected object does not exist in the bucket.
    MissingObject(String),
    /// Whole-stream hashes disagree.
    HashMismatch { local: String, remote: String },
    /// Per-file hash lists disagree.
    TreeMismatch(Vec<HashDiff>),
    /// The comparator's matched count disagrees with the line counts
    /// it was fed. This is a defect in the comparator, not in the data.
    CountMismatch {
        matched: u64,
        local: u64,
        remote: u64,
    },
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingObject(key) => write!(f, "Remote object \"{}\" does not exist", key),
            Self::HashMismatch { local, remote } => {
                write!(f, "Hash mismatch: local {}, remote {}", local, remote)
            }
            Self::TreeMismatch(diffs) => {
                write!(f, "{} entries differ:", diffs.len())?;
                for diff in diffs {
                    write!(f, "\n  {}", diff)?;
                }
                Ok(())
            }
            Self::CountMismatch {
                matched,
                local,
                remote,
            } => write!(
                f,
                "Comparator matched {} entries but saw {} local and {} remote",
                matched, local, remote
            ),
        }
    }
}

impl std::error::Error for ValidationFailure {}

/// A `TaskError` is the per-snapshot failure cause: a lost claim,
/// a pipeline failure or a validation failure.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The claim protocol failed or was lost.
    #[error("Claim failed: {0}")]
    Claim(#[from] ClaimError),
    /// Some stage of the processing pipeline failed.
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    /// The uploaded data does not reproduce the snapshot.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationFailure),
}

impl From<ProbeError> for TaskError {
    fn from(e: ProbeError) -> Self {
        Self::Pipeline(e.into())
    }
}

impl From<io::Error> for TaskError {
    fn from(e: io::Error) -> Self {
        Self::Pipeline(e.into())
    }
}

/// A `MigrationError` tags a [`TaskError`] with the snapshot it affected.
/// Migration of a list halts at the first one of these so that the
/// temporary volume can be inspected.
#[derive(Debug, Error)]
#[error("Migration of \"{snapshot_id}\" failed: {source}")]
pub struct MigrationError {
    pub snapshot_id: String,
    #[source]
    pub source: TaskError,
}

/// A `ValidationError` accumulates the failures of a validation run
/// over multiple snapshots, preserving the set of ids that passed.
#[derive(Debug)]
pub struct ValidationError {
    pub failures: Vec<(String, TaskError)>,
    pub succeeded: Vec<String>,
}

impl std::error::Error for ValidationError {}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Validation failed for {} snapshot(s) ({} passed)",
            self.failures.len(),
            self.succeeded.len()
        )?;
        for (snapshot_id, e) in &self.failures {
            write!(f, "\n{}: {}", snapshot_id, e)?;
        }
        Ok(())
    }
}

/// A `SnapshotsMissing` error lists requested snapshot ids that the
/// cloud provider does not know about.
#[derive(Debug)]
pub struct SnapshotsMissing {
    pub ids: Vec<String>,
}

impl std::error::Error for SnapshotsMissing {}

impl fmt::Display for SnapshotsMissing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Snapshots not found: {}", self.ids.join(", "))
    }
}
