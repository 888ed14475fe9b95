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

use crate::blockdev::{self, BlockDevice};
use crate::claim::{ClaimState, Coordinator};
use crate::cloud::{Ec2, SnapshotInfo};
use crate::config::MigrateConfig;
use crate::hash;
use crate::pipeline::{self, StderrGate};
use crate::progress::{self, CountingReader, UnitCounter};
use crate::store::{self, ObjectStore};
use crate::volume::{partition_label, VolumeLifecycle};
use crate::{PipelineError, TaskError, ValidationFailure};

use std::io;
use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio_util::io::SyncIoBridge;
use tracing::{info, warn};

/// A `Validator` independently proves that the objects uploaded for a
/// snapshot exactly reproduce its data.
pub struct Validator<'a> {
    ec2: &'a Ec2,
    store: &'a ObjectStore,
    config: &'a MigrateConfig,
}

impl<'a> Validator<'a> {
    pub fn new(ec2: &'a Ec2, store: &'a ObjectStore, config: &'a MigrateConfig) -> Self {
        Self { ec2, store, config }
    }

    /// Validates one snapshot under a `validating` claim. On success
    /// the snapshot ends tagged `validated`; on failure its tag falls
    /// back to the collapsed pre-claim value.
    pub async fn validate_snapshot(&self, snapshot: &SnapshotInfo) -> Result<(), TaskError> {
        let coordinator = Coordinator::new(self.ec2, self.config);
        let claim = coordinator.claim(snapshot, ClaimState::Validating).await?;

        match self.validate_claimed(snapshot).await {
            Ok(()) => {
                coordinator
                    .release(&claim, ClaimState::Validated)
                    .await
                    .map_err(TaskError::Pipeline)?;

                info!("validated {}", snapshot.id);
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = coordinator.rollback_validation(&claim).await {
                    warn!("cannot roll back claim on {}: {}", snapshot.id, rollback);
                }

                Err(e)
            }
        }
    }

    async fn validate_claimed(&self, snapshot: &SnapshotInfo) -> Result<(), TaskError> {
        let lifecycle = VolumeLifecycle::new(self.ec2, self.config);
        let volume = lifecycle.provision(snapshot).await?;

        let result = self
            .validate_volume(snapshot, &lifecycle, &volume.volume_id, &volume.device)
            .await;

        // Validation runs keep going past failures, so the volume is
        // torn down either way.
        if let Err(e) = lifecycle.destroy(volume).await {
            if result.is_ok() {
                return Err(e.into());
            }

            warn!("cannot destroy volume of {}: {}", snapshot.id, e);
        }

        result
    }

    async fn validate_volume(
        &self,
        snapshot: &SnapshotInfo,
        lifecycle: &VolumeLifecycle<'_>,
        volume_id: &str,
        device: &Path,
    ) -> Result<(), TaskError> {
        let devices = blockdev::probe_volume(volume_id, device).await?;

        // Which key shape exists decides the mode the snapshot was
        // uploaded in.
        let image_key = store::image_key(snapshot);
        if let Some(object) = self.store.head(&image_key).await? {
            let disk = blockdev::raw_disk_view(&devices)?;
            let digest =
                device_against_object(self.store, &disk.path, disk.size, &image_key, object.size)
                    .await?;

            info!("{} reproduces {} ({})", image_key, snapshot.id, digest);
            return Ok(());
        }

        self.validate_archives(snapshot, lifecycle, &devices).await
    }

    async fn validate_archives(
        &self,
        snapshot: &SnapshotInfo,
        lifecycle: &VolumeLifecycle<'_>,
        devices: &[BlockDevice],
    ) -> Result<(), TaskError> {
        let view = blockdev::filesystem_view(devices)?;

        for device in view {
            if self
                .config
                .skip_partitions
                .iter()
                .any(|skip| *skip == device.name)
            {
                info!("skipping partition {} (skip list)", device.name);
                continue;
            }

            let label = partition_label(device);
            let key = store::tar_key(snapshot, label);

            let object = self
                .store
                .head(&key)
                .await?
                .ok_or_else(|| ValidationFailure::MissingObject(key.clone()))?;

            let mounted = lifecycle.mount_partition(&snapshot.id, device)?;

            let result = async {
                let dir_size = {
                    let dir = mounted.mountpoint.clone();
                    tokio::task::spawn_blocking(move || hash::tree_size(&dir))
                        .await
                        .map_err(|e| PipelineError::Io(io::Error::other(e)))??
                };

                directory_against_archive(
                    self.store,
                    &mounted.mountpoint,
                    dir_size,
                    &key,
                    object.size,
                )
                .await
            }
            .await;

            match result {
                Ok(matched) => {
                    lifecycle.unmount(mounted)?;
                    info!("{} reproduces {} files", key, matched);
                }
                Err(e) => {
                    if let Err(unmount) = lifecycle.unmount(mounted) {
                        warn!("cannot unmount after failed validation: {}", unmount);
                    }

                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

/// Raw validation: the device and the decompressed object are hashed
/// by two pipelines racing under one progress view; the common digest
/// is returned, a disagreement fails with both sides.
pub async fn device_against_object(
    store: &ObjectStore,
    device: &Path,
    device_size: u64,
    key: &str,
    object_size: u64,
) -> Result<String, TaskError> {
    let bar = progress::unit_bar((device_size + object_size) / 1024, key.to_string());

    let local = async {
        let file = tokio::fs::File::open(device).await?;
        let reader = CountingReader::with_unit(file, bar.clone(), 1024);

        Ok::<String, PipelineError>(hash::md5_of_reader(reader).await?)
    };

    let remote = async {
        let gate = StderrGate::new();
        let mut lz4 = pipeline::decompressor().spawn(&gate)?;
        let mut stdin = lz4.take_stdin()?;
        let stdout = lz4.take_stdout()?;

        let mut counter = UnitCounter::new(bar.clone(), 1024);
        let feed = async {
            store.download(key, object_size, &mut stdin, &mut counter).await?;
            stdin.shutdown().await?;
            drop(stdin);
            Ok::<(), PipelineError>(())
        };
        let digest = async { Ok::<String, PipelineError>(hash::md5_of_reader(stdout).await?) };

        let ((), digest) = tokio::try_join!(feed, digest)?;
        lz4.wait(&gate).await?;

        Ok::<String, PipelineError>(digest)
    };

    let joined = tokio::try_join!(local, remote);
    match joined {
        Ok((local_digest, remote_digest)) => {
            bar.finish();

            if local_digest != remote_digest {
                return Err(ValidationFailure::HashMismatch {
                    local: local_digest,
                    remote: remote_digest,
                }
                .into());
            }

            Ok(local_digest)
        }
        Err(e) => {
            bar.abandon();
            Err(e.into())
        }
    }
}

/// Archive validation: the remote tar is stream-parsed into a sorted
/// per-file hash list, the local tree is walked into another, and the
/// two sorted lists are compared line by line. Returns the matched
/// count, which must agree with both line counts.
pub async fn directory_against_archive(
    store: &ObjectStore,
    dir: &Path,
    dir_size: u64,
    key: &str,
    object_size: u64,
) -> Result<u64, TaskError> {
    let scratch = tempfile::tempdir().map_err(PipelineError::from)?;
    let local_list = scratch.path().join("local.md5");
    let remote_list = scratch.path().join("remote.md5");

    let bar = progress::unit_bar((dir_size + object_size) / 1024, key.to_string());

    let local = async {
        let root = dir.to_path_buf();
        let bar = bar.clone();

        let mut lines = tokio::task::spawn_blocking(move || {
            let mut counter = UnitCounter::new(bar, 1024);
            hash::md5_of_dir(&root, &mut counter)
        })
        .await
        .map_err(|e| PipelineError::Io(io::Error::other(e)))??;

        Ok::<u64, PipelineError>(hash::write_sorted(&mut lines, &local_list)?)
    };

    let remote = async {
        let gate = StderrGate::new();
        let mut lz4 = pipeline::decompressor().spawn(&gate)?;
        let mut stdin = lz4.take_stdin()?;
        let stdout = lz4.take_stdout()?;

        let mut counter = UnitCounter::new(bar.clone(), 1024);
        let feed = async {
            store.download(key, object_size, &mut stdin, &mut counter).await?;
            stdin.shutdown().await?;
            drop(stdin);
            Ok::<(), PipelineError>(())
        };

        // The archive is parsed as it streams in, never materialized.
        let bridge = SyncIoBridge::new(stdout);
        let parse = tokio::task::spawn_blocking(move || hash::md5_of_tar_stream(bridge));
        let entries = async {
            parse
                .await
                .map_err(|e| PipelineError::Io(io::Error::other(e)))?
                .map_err(PipelineError::from)
        };

        let ((), mut lines) = tokio::try_join!(feed, entries)?;
        lz4.wait(&gate).await?;

        Ok::<u64, PipelineError>(hash::write_sorted(&mut lines, &remote_list)?)
    };

    let joined = tokio::try_join!(local, remote);
    let (local_count, remote_count) = match joined {
        Ok(counts) => {
            bar.finish();
            counts
        }
        Err(e) => {
            bar.abandon();
            return Err(e.into());
        }
    };

    let (matched, diffs) =
        hash::compare_hash_files(&local_list, &remote_list).map_err(PipelineError::from)?;

    if !diffs.is_empty() {
        return Err(ValidationFailure::TreeMismatch(diffs).into());
    }

    if matched != local_count || matched != remote_count {
        return Err(ValidationFailure::CountMismatch {
            matched,
            local: local_count,
            remote: remote_count,
        }
        .into());
    }

    Ok(matched)
}
