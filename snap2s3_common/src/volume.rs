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

use crate::blockdev::{self, BlockDevice, DeviceType};
use crate::claim::VOLUME_IN_PROGRESS;
use crate::cloud::{Ec2, SnapshotInfo};
use crate::config::MigrateConfig;
use crate::{PipelineError, ProbeError};

use std::collections::HashSet;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sys_mount::{FilesystemType, Mount, MountFlags, UnmountFlags};
use tokio::time::sleep;
use tracing::{info, warn};

/// Poll budget for the kernel to report a freshly attached device.
pub const ATTACH_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const ATTACH_POLL_ATTEMPTS: u32 = 60;

/// Poll budget for volume state transitions and partition visibility.
pub const VOLUME_POLL_INTERVAL: Duration = Duration::from_secs(4);
pub const VOLUME_POLL_ATTEMPTS: u32 = 75;

/// The reserved attachment device letter range.
pub const DEVICE_LETTERS: RangeInclusive<char> = 'f'..='p';

/// The `Name` tag every temporary volume is created with.
pub const VOLUME_NAME: &str = "Temp for snap-to-s3";

fn device_letter(name: &str) -> Option<char> {
    let name = name.strip_prefix("/dev/").unwrap_or(name);
    let rest = name
        .strip_prefix("xvd")
        .or_else(|| name.strip_prefix("sd"))?;

    rest.chars().next()
}

/// Picks the first device name in the reserved range not in use on
/// this instance. `sd` and `xvd` spellings count as the same letter.
pub fn pick_device(used: &HashSet<String>) -> Option<String> {
    let used_letters: HashSet<char> = used.iter().filter_map(|name| device_letter(name)).collect();

    DEVICE_LETTERS
        .clone()
        .find(|letter| !used_letters.contains(letter))
        .map(|letter| format!("/dev/sd{}", letter))
}

/// Derives the mountpoint of one partition of a snapshot's volume.
pub fn mountpoint_for(config: &MigrateConfig, snapshot_id: &str, partition: &str) -> PathBuf {
    let mut name = snapshot_id.to_string();

    if !partition.is_empty() {
        name.push('-');
        name.push_str(partition);
    }

    config.mount_root().join(name)
}

/// The partition name a device contributes to keys and mountpoints:
/// empty for a whole disk without a partition table.
pub fn partition_label(device: &BlockDevice) -> &str {
    match device.device_type {
        DeviceType::Disk => "",
        DeviceType::Part => &device.name,
    }
}

/// A `TempVolume` is a temporary volume attached to this instance
/// with its kernel block device resolved.
#[derive(Debug)]
pub struct TempVolume {
    pub volume_id: String,
    /// The device name the attachment was requested under.
    pub attach_device: PathBuf,
    /// The whole-disk node the kernel actually exposes.
    pub device: PathBuf,
}

/// A `Mounted` is one partition mounted read-only at its derived
/// mountpoint. Unmounting is explicit; partition ordering depends
/// on it.
#[derive(Debug)]
pub struct Mounted {
    pub mountpoint: PathBuf,
}

/// A `VolumeLifecycle` materializes snapshots as attached volumes and
/// tears them down again (unless configured to keep them around).
pub struct VolumeLifecycle<'a> {
    ec2: &'a Ec2,
    config: &'a MigrateConfig,
}

impl<'a> VolumeLifecycle<'a> {
    pub fn new(ec2: &'a Ec2, config: &'a MigrateConfig) -> Self {
        Self { ec2, config }
    }

    /// Finds or creates the snapshot's temporary volume, attaches it
    /// to this instance and waits until its block devices are visible.
    pub async fn provision(&self, snapshot: &SnapshotInfo) -> Result<TempVolume, PipelineError> {
        let volume_id = self.find_or_create(snapshot).await?;
        let attach_device = self.find_or_attach(&volume_id).await?;
        let device = self.wait_device_node(&volume_id, &attach_device).await?;
        self.wait_partitions(&volume_id, &device).await?;

        Ok(TempVolume {
            volume_id,
            attach_device,
            device,
        })
    }

    async fn find_or_create(&self, snapshot: &SnapshotInfo) -> Result<String, PipelineError> {
        let me = &self.ec2.identity().instance_id;

        let adoptable = self
            .ec2
            .volumes_for_snapshot(&self.config.tag, &snapshot.id)
            .await?
            .into_iter()
            .find(|volume| {
                volume
                    .attachments
                    .iter()
                    .all(|attachment| attachment.instance_id == *me)
            });

        if let Some(volume) = adoptable {
            info!("adopting existing volume {} for {}", volume.id, snapshot.id);
            self.wait_volume_state(&volume.id, &["available", "in-use"])
                .await?;
            return Ok(volume.id);
        }

        let volume_id = self
            .ec2
            .create_volume_from(
                &snapshot.id,
                &self.config.volume_type,
                &[
                    ("Name".to_string(), VOLUME_NAME.to_string()),
                    (self.config.tag.clone(), VOLUME_IN_PROGRESS.to_string()),
                ],
            )
            .await?;

        info!("created volume {} from {}", volume_id, snapshot.id);
        self.wait_volume_state(&volume_id, &["available"]).await?;

        Ok(volume_id)
    }

    async fn find_or_attach(&self, volume_id: &str) -> Result<PathBuf, PipelineError> {
        let me = &self.ec2.identity().instance_id;

        let volume = self
            .ec2
            .describe_volume(volume_id)
            .await?
            .ok_or_else(|| PipelineError::Api(format!("volume {} disappeared", volume_id)))?;

        if let Some(attachment) = volume.attachment_for(me) {
            let device = PathBuf::from(&attachment.device);
            if attachment.state != "attached" {
                self.wait_attached(volume_id).await?;
            }
            return Ok(device);
        }

        let used = self.ec2.attached_devices().await?;
        let device = pick_device(&used).ok_or(PipelineError::NoFreeDevice)?;

        info!("attaching {} at {}", volume_id, device);
        self.ec2.attach_volume(volume_id, &device).await?;
        self.wait_attached(volume_id).await?;

        Ok(PathBuf::from(device))
    }

    async fn wait_volume_state(
        &self,
        volume_id: &str,
        targets: &[&str],
    ) -> Result<(), PipelineError> {
        for _ in 0..VOLUME_POLL_ATTEMPTS {
            if let Some(volume) = self.ec2.describe_volume(volume_id).await? {
                if targets.contains(&volume.state.as_str()) {
                    return Ok(());
                }
            }

            sleep(VOLUME_POLL_INTERVAL).await;
        }

        Err(PipelineError::Timeout(format!(
            "volume {} to become {}",
            volume_id,
            targets.join("/")
        )))
    }

    async fn wait_attached(&self, volume_id: &str) -> Result<(), PipelineError> {
        let me = &self.ec2.identity().instance_id;

        for _ in 0..ATTACH_POLL_ATTEMPTS {
            if let Some(volume) = self.ec2.describe_volume(volume_id).await? {
                if volume
                    .attachment_for(me)
                    .is_some_and(|attachment| attachment.state == "attached")
                {
                    return Ok(());
                }
            }

            sleep(ATTACH_POLL_INTERVAL).await;
        }

        Err(PipelineError::Timeout(format!(
            "volume {} to attach to this instance",
            volume_id
        )))
    }

    async fn wait_device_node(
        &self,
        volume_id: &str,
        attach_device: &Path,
    ) -> Result<PathBuf, PipelineError> {
        for _ in 0..ATTACH_POLL_ATTEMPTS {
            if let Some(device) = blockdev::find_device_node(volume_id, attach_device).await? {
                return Ok(device);
            }

            sleep(ATTACH_POLL_INTERVAL).await;
        }

        Err(PipelineError::Timeout(format!(
            "kernel device node of volume {}",
            volume_id
        )))
    }

    /// Blocks until the kernel shows at least one partition for the
    /// device, or accepts a lone disk as a volume without a partition
    /// table (early when the disk itself carries a filesystem
    /// signature, otherwise once the poll budget is spent).
    async fn wait_partitions(
        &self,
        volume_id: &str,
        device: &Path,
    ) -> Result<Vec<BlockDevice>, PipelineError> {
        for _ in 0..VOLUME_POLL_ATTEMPTS {
            match blockdev::probe_volume(volume_id, device).await {
                Ok(devices) => {
                    if devices
                        .iter()
                        .any(|device| device.device_type == DeviceType::Part)
                    {
                        return Ok(devices);
                    }

                    if let [disk] = devices.as_slice() {
                        if disk.fstype.is_some() {
                            return Ok(devices);
                        }
                    }
                }
                Err(ProbeError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }

            sleep(VOLUME_POLL_INTERVAL).await;
        }

        match blockdev::probe_volume(volume_id, device).await {
            Ok(devices) if matches!(devices.as_slice(), [_]) => Ok(devices),
            Ok(_) | Err(ProbeError::NotFound(_)) => Err(PipelineError::Timeout(format!(
                "partitions of volume {} to appear",
                volume_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Mounts one partition read-only at its derived mountpoint.
    /// A device already mounted at that mountpoint is adopted;
    /// a non-empty mountpoint directory is refused.
    pub fn mount_partition(
        &self,
        snapshot_id: &str,
        device: &BlockDevice,
    ) -> Result<Mounted, PipelineError> {
        let mountpoint = mountpoint_for(self.config, snapshot_id, partition_label(device));

        match &device.mountpoint {
            Some(current) if *current == mountpoint => {
                info!("{} already mounted at {}", device.name, mountpoint.display());
                return Ok(Mounted { mountpoint });
            }
            Some(current) => {
                return Err(PipelineError::MountedElsewhere {
                    device: device.path.clone(),
                    mountpoint: current.clone(),
                });
            }
            None => {}
        }

        fs::create_dir_all(&mountpoint)?;
        if fs::read_dir(&mountpoint)?.next().is_some() {
            return Err(PipelineError::MountpointNotEmpty(mountpoint));
        }

        let mut builder = Mount::builder().flags(MountFlags::RDONLY);
        if let Some(fstype) = &device.fstype {
            builder = builder.fstype(FilesystemType::Manual(fstype.as_str()));
        }

        builder.mount(&device.path, &mountpoint)?;
        info!("mounted {} at {}", device.name, mountpoint.display());

        Ok(Mounted { mountpoint })
    }

    /// Unmounts a partition and removes its mountpoint directory,
    /// unless volumes are being kept around for inspection.
    pub fn unmount(&self, mounted: Mounted) -> Result<(), PipelineError> {
        if self.config.keep_temp_volumes {
            warn!(
                "keeping {} mounted (keep-temp-volumes)",
                mounted.mountpoint.display()
            );
            return Ok(());
        }

        sys_mount::unmount(&mounted.mountpoint, UnmountFlags::empty())?;

        if let Err(e) = fs::remove_dir(&mounted.mountpoint) {
            warn!(
                "cannot remove mountpoint {}: {}",
                mounted.mountpoint.display(),
                e
            );
        }

        Ok(())
    }

    /// Detaches and deletes the temporary volume, unless volumes are
    /// being kept around for inspection.
    pub async fn destroy(&self, volume: TempVolume) -> Result<(), PipelineError> {
        if self.config.keep_temp_volumes {
            warn!(
                "keeping volume {} attached at {} (keep-temp-volumes)",
                volume.volume_id,
                volume.attach_device.display()
            );
            return Ok(());
        }

        self.ec2.detach_volume(&volume.volume_id).await?;
        self.wait_volume_state(&volume.volume_id, &["available"])
            .await?;
        self.ec2.delete_volume(&volume.volume_id).await?;

        info!("deleted volume {}", volume.volume_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mount_point: &str) -> MigrateConfig {
        MigrateConfig::new(
            "snap-to-s3".to_string(),
            mount_point.to_string(),
            "backups".to_string(),
            "standard".to_string(),
            1.0,
            4.0,
            false,
            false,
            false,
            None,
            None,
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn picks_first_free_letter() {
        let used = HashSet::new();
        assert_eq!(pick_device(&used).unwrap(), "/dev/sdf");

        let used: HashSet<String> = ["/dev/sdf", "/dev/xvdg"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(pick_device(&used).unwrap(), "/dev/sdh");
    }

    #[test]
    fn no_device_left_when_range_is_exhausted() {
        let used: HashSet<String> = DEVICE_LETTERS.map(|l| format!("/dev/sd{}", l)).collect();
        assert_eq!(pick_device(&used), None);
    }

    #[test]
    fn xvd_and_sd_spellings_share_letters() {
        assert_eq!(device_letter("/dev/sdf"), Some('f'));
        assert_eq!(device_letter("/dev/xvdf"), Some('f'));
        assert_eq!(device_letter("xvdf1"), Some('f'));
        assert_eq!(device_letter("/dev/nvme1n1"), None);
    }

    #[test]
    fn mountpoints_embed_snapshot_and_partition() {
        let config = config("/mnt/snap");

        assert_eq!(
            mountpoint_for(&config, "snap-a", ""),
            PathBuf::from("/mnt/snap/snap-a")
        );
        assert_eq!(
            mountpoint_for(&config, "snap-a", "xvdf1"),
            PathBuf::from("/mnt/snap/snap-a-xvdf1")
        );
    }
}
