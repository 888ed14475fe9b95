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

use crate::ProbeError;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Deserializer};
use tokio::process::Command;

/// The kind of a kernel block device, as classified by the enumerator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceType {
    /// A whole disk, with or without a partition table.
    Disk,
    /// A partition of a disk.
    Part,
}

impl TryFrom<&str> for DeviceType {
    type Error = ProbeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "disk" => Ok(Self::Disk),
            "part" => Ok(Self::Part),
            other => Err(ProbeError::UnknownDeviceType(other.to_string())),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk => write!(f, "disk"),
            Self::Part => write!(f, "part"),
        }
    }
}

/// A `BlockDevice` is one kernel-visible device belonging to an
/// attached volume: the whole disk or one of its partitions.
#[derive(Clone, Debug)]
pub struct BlockDevice {
    /// Kernel name, e.g. `xvdf1` or `nvme1n1p1`. Doubles as the
    /// partition name in object keys and mountpoints.
    pub name: String,
    /// Full device path under `/dev`.
    pub path: PathBuf,
    pub device_type: DeviceType,
    /// Filesystem signature, if the kernel detected one.
    pub fstype: Option<String>,
    /// Current mountpoint, if mounted.
    pub mountpoint: Option<PathBuf>,
    /// Size in bytes.
    pub size: u64,
}

// Older util-linux releases emit SIZE as a string even with --bytes.
fn u64_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Number(n) => Ok(n),
        Size::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Clone, Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(rename = "type")]
    device_type: String,
    fstype: Option<String>,
    mountpoint: Option<String>,
    #[serde(deserialize_with = "u64_or_string")]
    size: u64,
    serial: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkReport {
    blockdevices: Vec<LsblkDevice>,
}

impl LsblkDevice {
    fn to_block_device(&self) -> Result<BlockDevice, ProbeError> {
        Ok(BlockDevice {
            name: self.name.clone(),
            path: Path::new("/dev").join(&self.name),
            device_type: DeviceType::try_from(self.device_type.as_str())?,
            fstype: self.fstype.clone(),
            mountpoint: self.mountpoint.clone().map(PathBuf::from),
            size: self.size,
        })
    }

    /// Reports whether this top-level device exposes the given volume:
    /// either the NVMe serial carries the volume id, or the kernel name
    /// matches the attachment device (or its `xvd` alias).
    fn matches_volume(&self, volume_id: &str, attach_device: &Path) -> bool {
        if let Some(serial) = &self.serial {
            if *serial == volume_id.replace('-', "") {
                return true;
            }
        }

        let attach_name = match attach_device.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return false,
        };

        self.name == attach_name || self.name == attach_name.replace("sd", "xvd")
    }
}

async fn enumerate() -> Result<Vec<LsblkDevice>, ProbeError> {
    let output = Command::new("lsblk")
        .args([
            "--json",
            "--bytes",
            "--output",
            "NAME,TYPE,FSTYPE,MOUNTPOINT,SIZE,SERIAL",
        ])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(ProbeError::Lsblk(output.status));
    }

    let report: LsblkReport = serde_json::from_slice(&output.stdout)?;
    Ok(report.blockdevices)
}

/// Returns the device path of the volume's whole-disk node,
/// or `None` if the kernel does not know the volume yet.
pub async fn find_device_node(
    volume_id: &str,
    attach_device: &Path,
) -> Result<Option<PathBuf>, ProbeError> {
    let devices = enumerate().await?;

    Ok(devices
        .iter()
        .find(|device| device.matches_volume(volume_id, attach_device))
        .map(|device| Path::new("/dev").join(&device.name)))
}

/// Returns the block devices of the given attached volume: the whole
/// disk first, followed by its partitions in enumeration order.
pub async fn probe_volume(
    volume_id: &str,
    attach_device: &Path,
) -> Result<Vec<BlockDevice>, ProbeError> {
    let devices = enumerate().await?;

    let top = devices
        .iter()
        .find(|device| device.matches_volume(volume_id, attach_device))
        .ok_or_else(|| ProbeError::NotFound(volume_id.to_string()))?;

    let mut result = vec![top.to_block_device()?];
    for child in &top.children {
        result.push(child.to_block_device()?);
    }

    Ok(result)
}

/// The raw-disk view: exactly one `disk` device, returned.
/// dd-mode reads this device end to end.
pub fn raw_disk_view(devices: &[BlockDevice]) -> Result<&BlockDevice, ProbeError> {
    let disks: Vec<&BlockDevice> = devices
        .iter()
        .filter(|device| device.device_type == DeviceType::Disk)
        .collect();

    match disks.as_slice() {
        [disk] => Ok(disk),
        _ => Err(ProbeError::DiskCount(disks.len())),
    }
}

/// The filesystem view: a singleton list is returned as-is (a volume
/// without a partition table); otherwise the single `disk` entry is
/// dropped and the remaining partitions are returned.
pub fn filesystem_view(devices: &[BlockDevice]) -> Result<Vec<&BlockDevice>, ProbeError> {
    if devices.is_empty() {
        return Err(ProbeError::NoPartitions);
    }

    if devices.len() == 1 {
        return Ok(devices.iter().collect());
    }

    let disks = devices
        .iter()
        .filter(|device| device.device_type == DeviceType::Disk)
        .count();
    if disks != 1 {
        return Err(ProbeError::DiskCount(disks));
    }

    let parts: Vec<&BlockDevice> = devices
        .iter()
        .filter(|device| device.device_type == DeviceType::Part)
        .collect();

    if parts.is_empty() {
        return Err(ProbeError::NoPartitions);
    }

    // Dropping one disk must account for every other entry.
    debug_assert_eq!(parts.len(), devices.len() - 1);

    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(name: &str, size: u64) -> BlockDevice {
        BlockDevice {
            name: name.to_string(),
            path: Path::new("/dev").join(name),
            device_type: DeviceType::Disk,
            fstype: None,
            mountpoint: None,
            size,
        }
    }

    fn part(name: &str, size: u64) -> BlockDevice {
        BlockDevice {
            name: name.to_string(),
            path: Path::new("/dev").join(name),
            device_type: DeviceType::Part,
            fstype: Some("ext4".to_string()),
            mountpoint: None,
            size,
        }
    }

    #[test]
    fn parses_lsblk_report() {
        let json = r#"{
            "blockdevices": [
                {
                    "name": "nvme1n1",
                    "type": "disk",
                    "fstype": null,
                    "mountpoint": null,
                    "size": 8589934592,
                    "serial": "vol0123456789abcdef0",
                    "children": [
                        {
                            "name": "nvme1n1p1",
                            "type": "part",
                            "fstype": "ext4",
                            "mountpoint": null,
                            "size": "8587837440",
                            "serial": null
                        }
                    ]
                }
            ]
        }"#;

        let report: LsblkReport = serde_json::from_str(json).unwrap();
        let top = &report.blockdevices[0];

        assert!(top.matches_volume("vol-0123456789abcdef0", Path::new("/dev/sdf")));
        assert_eq!(top.children.len(), 1);
        assert_eq!(top.children[0].size, 8587837440);
    }

    #[test]
    fn matches_xvd_alias() {
        let device = LsblkDevice {
            name: "xvdf".to_string(),
            device_type: "disk".to_string(),
            fstype: None,
            mountpoint: None,
            size: 0,
            serial: None,
            children: Vec::new(),
        };

        assert!(device.matches_volume("vol-fffffffffffffffff", Path::new("/dev/sdf")));
        assert!(!device.matches_volume("vol-ffffffffffffffff", Path::new("/dev/sdg")));
    }

    #[test]
    fn raw_view_requires_exactly_one_disk() {
        let devices = vec![disk("xvdf", 100), part("xvdf1", 90)];
        assert_eq!(raw_disk_view(&devices).unwrap().name, "xvdf");

        let devices = vec![disk("xvdf", 100), disk("xvdg", 100)];
        assert!(matches!(raw_disk_view(&devices), Err(ProbeError::DiskCount(2))));

        let devices = vec![part("xvdf1", 90)];
        assert!(matches!(raw_disk_view(&devices), Err(ProbeError::DiskCount(0))));
    }

    #[test]
    fn filesystem_view_returns_singleton_unchanged() {
        let devices = vec![disk("xvdf", 100)];
        let view = filesystem_view(&devices).unwrap();

        assert_eq!(view.len(), 1);
        assert_eq!(view[0].name, "xvdf");
    }

    #[test]
    fn filesystem_view_drops_the_disk() {
        let devices = vec![disk("xvdf", 100), part("xvdf1", 50), part("xvdf2", 49)];
        let view = filesystem_view(&devices).unwrap();

        assert_eq!(view.len(), 2);
        assert!(view.iter().all(|d| d.device_type == DeviceType::Part));
    }

    #[test]
    fn filesystem_view_rejects_empty_and_double_disk_lists() {
        assert!(matches!(filesystem_view(&[]), Err(ProbeError::NoPartitions)));

        let devices = vec![disk("xvdf", 100), disk("xvdg", 100)];
        assert!(matches!(filesystem_view(&devices), Err(ProbeError::DiskCount(2))));
    }

    #[test]
    fn unknown_device_types_fail_classification() {
        assert!(matches!(
            DeviceType::try_from("rom"),
            Err(ProbeError::UnknownDeviceType(_))
        ));
    }
}
