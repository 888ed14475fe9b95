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
use crate::progress::{self, CountingReader};
use crate::store::{self, ObjectStore, UploadTarget};
use crate::validate;
use crate::volume::{partition_label, Mounted, VolumeLifecycle};
use crate::{PipelineError, TaskError, ValidationFailure};

use std::io;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{info, warn};

/// A `Migrator` runs the upload pipeline of one snapshot at a time:
/// claim, volume up, stream-compress-upload, optional inline
/// validation, volume down, release.
pub struct Migrator<'a> {
    ec2: &'a Ec2,
    store: &'a ObjectStore,
    config: &'a MigrateConfig,
}

impl<'a> Migrator<'a> {
    pub fn new(ec2: &'a Ec2, store: &'a ObjectStore, config: &'a MigrateConfig) -> Self {
        Self { ec2, store, config }
    }

    /// Migrates one snapshot under a `migrating` claim. On success the
    /// snapshot ends tagged `migrated`; on failure it is re-tagged
    /// `migrate` and the temporary volume is left for inspection.
    pub async fn migrate_snapshot(&self, snapshot: &SnapshotInfo) -> Result<(), TaskError> {
        let coordinator = Coordinator::new(self.ec2, self.config);
        let claim = coordinator.claim(snapshot, ClaimState::Migrating).await?;

        match self.migrate_claimed(snapshot).await {
            Ok(()) => {
                coordinator
                    .release(&claim, ClaimState::Migrated)
                    .await
                    .map_err(TaskError::Pipeline)?;

                info!("migrated {}", snapshot.id);
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = coordinator.rollback_migration(&claim).await {
                    warn!("cannot roll back claim on {}: {}", snapshot.id, rollback);
                }

                Err(e)
            }
        }
    }

    async fn migrate_claimed(&self, snapshot: &SnapshotInfo) -> Result<(), TaskError> {
        let lifecycle = VolumeLifecycle::new(self.ec2, self.config);
        let volume = lifecycle.provision(snapshot).await?;

        let devices = blockdev::probe_volume(&volume.volume_id, &volume.device).await?;

        if self.config.dd {
            self.upload_raw(snapshot, &devices).await?;
        } else {
            self.upload_partitions(snapshot, &lifecycle, &devices).await?;
        }

        lifecycle.destroy(volume).await?;
        Ok(())
    }

    /// dd mode: the whole disk streamed as one raw image object.
    async fn upload_raw(
        &self,
        snapshot: &SnapshotInfo,
        devices: &[BlockDevice],
    ) -> Result<(), TaskError> {
        let disk = blockdev::raw_disk_view(devices)?;
        let target = self.upload_target(snapshot, store::image_key(snapshot), disk.size);

        info!("uploading {} as {}", disk.path.display(), target.key);

        let source = tokio::io::BufReader::with_capacity(
            hash::BLOCK_SIZE,
            tokio::fs::File::open(&disk.path).await?,
        );
        self.upload_via_compressor(source, &target, snapshot.id.clone())
            .await?;

        if self.config.validate {
            self.validate_inline_raw(&disk.path, disk.size, &target.key)
                .await?;
        }

        Ok(())
    }

    /// tar mode: one archive object per partition, strictly in order;
    /// a partition is mounted only after its predecessor is uploaded
    /// and unmounted again.
    async fn upload_partitions(
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
            let mounted = lifecycle.mount_partition(&snapshot.id, device)?;

            match self
                .upload_one_partition(snapshot, &mounted, label, key)
                .await
            {
                Ok(()) => lifecycle.unmount(mounted)?,
                // The mount is left in place for inspection.
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn upload_one_partition(
        &self,
        snapshot: &SnapshotInfo,
        mounted: &Mounted,
        label: &str,
        key: String,
    ) -> Result<(), TaskError> {
        let estimate = {
            let dir = mounted.mountpoint.clone();
            tokio::task::spawn_blocking(move || hash::tree_size(&dir))
                .await
                .map_err(|e| PipelineError::Io(io::Error::other(e)))??
        };

        let target = self.upload_target(snapshot, key, estimate);
        info!(
            "uploading {} as {}",
            mounted.mountpoint.display(),
            target.key
        );

        let gate = StderrGate::new();
        let mut tar = pipeline::archiver(&mounted.mountpoint).spawn(&gate)?;
        let source = tar.take_stdout()?;

        let message = if label.is_empty() {
            snapshot.id.clone()
        } else {
            format!("{} {}", snapshot.id, label)
        };
        let upload = self.upload_via_compressor(source, &target, message).await;

        match upload {
            Ok(()) => tar.wait(&gate).await?,
            Err(e) => {
                gate.trip();
                return Err(e.into());
            }
        }

        if self.config.validate {
            self.validate_inline_tar(&mounted.mountpoint, estimate, &target.key)
                .await?;
        }

        Ok(())
    }

    /// The streaming upload contract: source bytes flow through the
    /// progress counter into the compressor child, whose stdout feeds
    /// the multipart uploader. All actors settle together.
    async fn upload_via_compressor<R: AsyncRead + Unpin>(
        &self,
        source: R,
        target: &UploadTarget,
        message: String,
    ) -> Result<(), PipelineError> {
        let bar = progress::byte_bar(target.estimate, message);
        let gate = StderrGate::new();

        let mut lz4 = pipeline::compressor(self.config.compression_level).spawn(&gate)?;
        let mut stdin = lz4.take_stdin()?;
        let stdout = lz4.take_stdout()?;

        let mut counted = CountingReader::raising(source, bar.clone());
        let feed = async {
            tokio::io::copy(&mut counted, &mut stdin).await?;
            stdin.shutdown().await?;
            drop(stdin);
            Ok::<(), PipelineError>(())
        };

        let upload = self
            .store
            .upload_stream(stdout, target, self.config.upload_streams);

        let result = tokio::try_join!(feed, upload);
        match result {
            Ok(_) => {
                lz4.wait(&gate).await?;
                bar.finish();
                Ok(())
            }
            Err(e) => {
                gate.trip();
                bar.abandon();
                Err(e)
            }
        }
    }

    async fn validate_inline_raw(
        &self,
        device: &Path,
        device_size: u64,
        key: &str,
    ) -> Result<(), TaskError> {
        let object = self
            .store
            .head(key)
            .await?
            .ok_or_else(|| ValidationFailure::MissingObject(key.to_string()))?;

        let digest =
            validate::device_against_object(self.store, device, device_size, key, object.size)
                .await?;

        info!("validated {} ({})", key, digest);
        Ok(())
    }

    async fn validate_inline_tar(
        &self,
        dir: &Path,
        dir_size: u64,
        key: &str,
    ) -> Result<(), TaskError> {
        let object = self
            .store
            .head(key)
            .await?
            .ok_or_else(|| ValidationFailure::MissingObject(key.to_string()))?;

        let matched =
            validate::directory_against_archive(self.store, dir, dir_size, key, object.size)
                .await?;

        info!("validated {} ({} files)", key, matched);
        Ok(())
    }

    fn upload_target(&self, snapshot: &SnapshotInfo, key: String, estimate: u64) -> UploadTarget {
        UploadTarget {
            key,
            metadata: store::upload_metadata(snapshot, estimate),
            tags: store::object_tags(
                &snapshot.tags,
                &self.config.tag,
                &self.config.nonce_tag(),
            ),
            sse: self.config.sse.clone(),
            sse_kms_key_id: self.config.sse_kms_key_id.clone(),
            estimate,
        }
    }
}
