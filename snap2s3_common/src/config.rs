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

use crate::ConfigError;

use std::path::Path;

/// A `MigrateConfig` holds the validated, normalized options
/// a migration or validation run operates under.
#[derive(Clone, Debug)]
pub struct MigrateConfig {
    /// The user tag key driving the claim protocol.
    pub tag: String,
    /// Root under which per-partition mountpoints live.
    /// Normalized to a trailing slash.
    pub mount_point: String,
    /// The destination bucket.
    pub bucket: String,
    /// The type of the temporary volumes created from snapshots.
    pub volume_type: String,
    /// LZ4 compression level, clamped to 1..=9.
    pub compression_level: u32,
    /// Number of multipart upload parts in flight at once.
    pub upload_streams: usize,
    /// Skip unmount/detach/delete of the temporary volumes.
    /// Debug affordance, warned about on every successful run.
    pub keep_temp_volumes: bool,
    /// Upload whole-volume raw images instead of per-partition archives.
    pub dd: bool,
    /// Hash-compare each uploaded object right after its upload.
    pub validate: bool,
    /// Server-side encryption algorithm, e.g. "AES256" or "aws:kms".
    pub sse: Option<String>,
    /// KMS key id, only valid together with `sse = "aws:kms"`.
    pub sse_kms_key_id: Option<String>,
    /// Partition names excluded from tar-mode migration and validation.
    pub skip_partitions: Vec<String>,
}

impl MigrateConfig {
    /// Validates and normalizes the raw option values.
    ///
    /// The mount point is rejected if empty or `/` and gains a trailing
    /// slash; the compression level and stream count are rounded and
    /// clamped to their legal ranges; a KMS key id without KMS
    /// encryption is rejected.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tag: String,
        mount_point: String,
        bucket: String,
        volume_type: String,
        compression_level: f64,
        upload_streams: f64,
        keep_temp_volumes: bool,
        dd: bool,
        validate: bool,
        sse: Option<String>,
        sse_kms_key_id: Option<String>,
        skip_partitions: Vec<String>,
    ) -> Result<Self, ConfigError> {
        if mount_point.is_empty() || mount_point == "/" {
            return Err(ConfigError::InvalidMountPoint);
        }

        if sse_kms_key_id.is_some() && sse.as_deref() != Some("aws:kms") {
            return Err(ConfigError::KmsKeyWithoutKms);
        }

        let mount_point = if mount_point.ends_with('/') {
            mount_point
        } else {
            format!("{}/", mount_point)
        };

        Ok(Self {
            tag,
            mount_point,
            bucket,
            volume_type,
            compression_level: (compression_level.round() as i64).clamp(1, 9) as u32,
            upload_streams: (upload_streams.round() as i64).max(1) as usize,
            keep_temp_volumes,
            dd,
            validate,
            sse,
            sse_kms_key_id,
            skip_partitions,
        })
    }

    /// Returns the mountpoint root as a path.
    pub fn mount_root(&self) -> &Path {
        Path::new(&self.mount_point)
    }

    /// Returns the tag key carrying the claim nonce.
    pub fn nonce_tag(&self) -> String {
        format!("{}-id", self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mount_point: &str, level: f64, streams: f64) -> Result<MigrateConfig, ConfigError> {
        MigrateConfig::new(
            "snap-to-s3".to_string(),
            mount_point.to_string(),
            "backups".to_string(),
            "standard".to_string(),
            level,
            streams,
            false,
            false,
            false,
            None,
            None,
            Vec::new(),
        )
    }

    #[test]
    fn mount_point_gains_trailing_slash() {
        let config = config("/mnt/snap", 1.0, 4.0).unwrap();
        assert_eq!(config.mount_point, "/mnt/snap/");
    }

    #[test]
    fn mount_point_keeps_existing_slash() {
        let config = config("/mnt/snap/", 1.0, 4.0).unwrap();
        assert_eq!(config.mount_point, "/mnt/snap/");
    }

    #[test]
    fn root_and_empty_mount_points_are_rejected() {
        assert!(matches!(config("", 1.0, 4.0), Err(ConfigError::InvalidMountPoint)));
        assert!(matches!(config("/", 1.0, 4.0), Err(ConfigError::InvalidMountPoint)));
    }

    #[test]
    fn compression_level_is_rounded_and_clamped() {
        assert_eq!(config("/mnt/snap", 2.6, 4.0).unwrap().compression_level, 3);
        assert_eq!(config("/mnt/snap", 0.0, 4.0).unwrap().compression_level, 1);
        assert_eq!(config("/mnt/snap", 99.0, 4.0).unwrap().compression_level, 9);
    }

    #[test]
    fn upload_streams_have_a_floor_of_one() {
        assert_eq!(config("/mnt/snap", 1.0, 0.2).unwrap().upload_streams, 1);
        assert_eq!(config("/mnt/snap", 1.0, 7.5).unwrap().upload_streams, 8);
    }

    #[test]
    fn kms_key_requires_kms_sse() {
        let result = MigrateConfig::new(
            "snap-to-s3".to_string(),
            "/mnt/snap".to_string(),
            "backups".to_string(),
            "standard".to_string(),
            1.0,
            4.0,
            false,
            false,
            false,
            Some("AES256".to_string()),
            Some("alias/backups".to_string()),
            Vec::new(),
        );
        assert!(matches!(result, Err(ConfigError::KmsKeyWithoutKms)));
    }

    #[test]
    fn nonce_tag_appends_id_suffix() {
        let config = config("/mnt/snap", 1.0, 4.0).unwrap();
        assert_eq!(config.nonce_tag(), "snap-to-s3-id");
    }
}
