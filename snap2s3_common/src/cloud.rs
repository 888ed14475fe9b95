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

use crate::{PipelineError, PreflightError, SnapshotsMissing};

use std::collections::HashSet;

use aws_sdk_ec2::error::{DisplayErrorContext, SdkError};
use aws_sdk_ec2::types::{Filter, ResourceType, Tag, TagSpecification, VolumeType};
use chrono::{DateTime, Utc};
use serde::Deserialize;

fn api_error<E, R>(e: SdkError<E, R>) -> PipelineError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    PipelineError::Api(DisplayErrorContext(e).to_string())
}

/// The identity of the instance this process runs on, as reported by
/// the instance metadata service.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceIdentity {
    pub region: String,
    pub availability_zone: String,
    pub instance_id: String,
    pub account_id: String,
}

/// Queries the instance metadata service for this instance's identity.
/// Failing here means the tool is not running on a cloud instance.
pub async fn instance_identity() -> Result<InstanceIdentity, PreflightError> {
    let client = aws_config::imds::Client::builder().build();

    let document = client
        .get("/latest/dynamic/instance-identity/document")
        .await
        .map_err(|e| PreflightError::Metadata(e.to_string()))?;

    serde_json::from_str(document.as_ref()).map_err(|e| PreflightError::Metadata(e.to_string()))
}

/// Loads the shared AWS configuration pinned to this instance's
/// region. API calls rely on the SDK's default retry behavior.
pub async fn sdk_config(identity: &InstanceIdentity) -> aws_config::SdkConfig {
    aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(identity.region.clone()))
        .load()
        .await
}

/// Returns an EC2 client over the shared configuration.
pub fn ec2_client(config: &aws_config::SdkConfig) -> aws_sdk_ec2::Client {
    aws_sdk_ec2::Client::new(config)
}

/// Returns an S3 client over the shared configuration.
pub fn s3_client(config: &aws_config::SdkConfig) -> aws_sdk_s3::Client {
    aws_sdk_s3::Client::new(config)
}

/// A `SnapshotInfo` is the identity of a snapshot to migrate:
/// its tags are the sole coordination surface between workers.
#[derive(Clone, Debug)]
pub struct SnapshotInfo {
    pub id: String,
    pub volume_id: String,
    /// Size in gibibytes.
    pub size_gib: i32,
    pub start_time: DateTime<Utc>,
    pub description: String,
    pub tags: Vec<(String, String)>,
}

impl SnapshotInfo {
    fn from_api(snapshot: aws_sdk_ec2::types::Snapshot) -> Option<Self> {
        let start_time = snapshot.start_time?;

        Some(Self {
            id: snapshot.snapshot_id?,
            volume_id: snapshot.volume_id?,
            size_gib: snapshot.volume_size.unwrap_or(0),
            start_time: DateTime::from_timestamp(start_time.secs(), start_time.subsec_nanos())
                .unwrap_or(DateTime::UNIX_EPOCH),
            description: snapshot.description.unwrap_or_default(),
            tags: snapshot
                .tags
                .unwrap_or_default()
                .into_iter()
                .filter_map(|tag| Some((tag.key?, tag.value.unwrap_or_default())))
                .collect(),
        })
    }

    /// Returns the value of the given tag key, if present.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the snapshot start time in ISO 8601 form with a
    /// numeric offset, the format object keys embed.
    pub fn start_time_iso(&self) -> String {
        self.start_time.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
    }
}

/// One attachment of a volume to an instance.
#[derive(Clone, Debug)]
pub struct VolumeAttachment {
    pub instance_id: String,
    pub device: String,
    pub state: String,
}

/// The state of a (temporary) volume as the cloud API reports it.
#[derive(Clone, Debug)]
pub struct VolumeInfo {
    pub id: String,
    pub state: String,
    pub attachments: Vec<VolumeAttachment>,
}

impl VolumeInfo {
    fn from_api(volume: aws_sdk_ec2::types::Volume) -> Option<Self> {
        Some(Self {
            id: volume.volume_id?,
            state: volume
                .state
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            attachments: volume
                .attachments
                .unwrap_or_default()
                .into_iter()
                .filter_map(|a| {
                    Some(VolumeAttachment {
                        instance_id: a.instance_id?,
                        device: a.device.unwrap_or_default(),
                        state: a.state.map(|s| s.as_str().to_string()).unwrap_or_default(),
                    })
                })
                .collect(),
        })
    }

    /// Returns the attachment for the given instance, if any.
    pub fn attachment_for(&self, instance_id: &str) -> Option<&VolumeAttachment> {
        self.attachments
            .iter()
            .find(|a| a.instance_id == instance_id)
    }
}

/// An `Ec2` wraps the snapshot, volume and tagging APIs the pipelines
/// consume, scoped to the identity of the running instance.
pub struct Ec2 {
    client: aws_sdk_ec2::Client,
    identity: InstanceIdentity,
}

impl Ec2 {
    pub fn new(client: aws_sdk_ec2::Client, identity: InstanceIdentity) -> Self {
        Self { client, identity }
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    async fn describe_snapshots(&self, filter: Filter) -> Result<Vec<SnapshotInfo>, PipelineError> {
        let mut pages = self
            .client
            .describe_snapshots()
            .owner_ids("self")
            .filters(filter)
            .into_paginator()
            .send();

        let mut snapshots = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(api_error)?;
            snapshots.extend(
                page.snapshots
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(SnapshotInfo::from_api),
            );
        }

        Ok(snapshots)
    }

    /// Returns the requested snapshots in the requested order.
    /// Ids the provider does not know are a [`SnapshotsMissing`] error.
    pub async fn snapshots_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Result<Vec<SnapshotInfo>, SnapshotsMissing>, PipelineError> {
        // A filter query silently drops unknown ids instead of failing
        // the whole describe, which is what allows listing them.
        let filter = Filter::builder()
            .name("snapshot-id")
            .set_values(Some(ids.to_vec()))
            .build();

        let found = self.describe_snapshots(filter).await?;

        let known: HashSet<&str> = found.iter().map(|s| s.id.as_str()).collect();
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !known.contains(id.as_str()))
            .cloned()
            .collect();

        if !missing.is_empty() {
            return Ok(Err(SnapshotsMissing { ids: missing }));
        }

        let mut ordered = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(snapshot) = found.iter().find(|s| &s.id == id) {
                ordered.push(snapshot.clone());
            }
        }

        Ok(Ok(ordered))
    }

    /// Returns all own snapshots whose claim tag carries `value`.
    pub async fn snapshots_tagged(
        &self,
        tag_key: &str,
        value: &str,
    ) -> Result<Vec<SnapshotInfo>, PipelineError> {
        let filter = Filter::builder()
            .name(format!("tag:{}", tag_key))
            .values(value)
            .build();

        self.describe_snapshots(filter).await
    }

    /// Re-reads all tags currently on the snapshot.
    pub async fn snapshot_tags(&self, id: &str) -> Result<Vec<(String, String)>, PipelineError> {
        let filter = Filter::builder().name("snapshot-id").values(id).build();

        Ok(self
            .describe_snapshots(filter)
            .await?
            .into_iter()
            .find(|s| s.id == id)
            .map(|s| s.tags)
            .unwrap_or_default())
    }

    /// Writes the given tags on a resource in one atomic call.
    pub async fn tag_resource(
        &self,
        id: &str,
        tags: &[(String, String)],
    ) -> Result<(), PipelineError> {
        let mut request = self.client.create_tags().resources(id);
        for (key, value) in tags {
            request = request.tags(Tag::builder().key(key).value(value).build());
        }

        request.send().await.map_err(api_error)?;
        Ok(())
    }

    /// Deletes the given tag keys from a resource.
    pub async fn untag_resource(&self, id: &str, keys: &[&str]) -> Result<(), PipelineError> {
        let mut request = self.client.delete_tags().resources(id);
        for key in keys {
            request = request.tags(Tag::builder().key(*key).build());
        }

        request.send().await.map_err(api_error)?;
        Ok(())
    }

    /// Returns the temporary-volume candidates for a snapshot: volumes
    /// in this availability zone carrying the coordination tag key and
    /// sourced from the snapshot.
    pub async fn volumes_for_snapshot(
        &self,
        tag_key: &str,
        snapshot_id: &str,
    ) -> Result<Vec<VolumeInfo>, PipelineError> {
        let response = self
            .client
            .describe_volumes()
            .filters(
                Filter::builder()
                    .name("availability-zone")
                    .values(&self.identity.availability_zone)
                    .build(),
            )
            .filters(Filter::builder().name("snapshot-id").values(snapshot_id).build())
            .filters(Filter::builder().name("tag-key").values(tag_key).build())
            .send()
            .await
            .map_err(api_error)?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .filter_map(VolumeInfo::from_api)
            .collect())
    }

    /// Returns the current state of a single volume.
    pub async fn describe_volume(&self, id: &str) -> Result<Option<VolumeInfo>, PipelineError> {
        let response = self
            .client
            .describe_volumes()
            .filters(Filter::builder().name("volume-id").values(id).build())
            .send()
            .await
            .map_err(api_error)?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .filter_map(VolumeInfo::from_api)
            .next())
    }

    /// Creates a volume from the snapshot in this availability zone.
    pub async fn create_volume_from(
        &self,
        snapshot_id: &str,
        volume_type: &str,
        tags: &[(String, String)],
    ) -> Result<String, PipelineError> {
        let mut spec = TagSpecification::builder().resource_type(ResourceType::Volume);
        for (key, value) in tags {
            spec = spec.tags(Tag::builder().key(key).value(value).build());
        }

        let response = self
            .client
            .create_volume()
            .snapshot_id(snapshot_id)
            .availability_zone(&self.identity.availability_zone)
            .volume_type(VolumeType::from(volume_type))
            .tag_specifications(spec.build())
            .send()
            .await
            .map_err(api_error)?;

        response
            .volume_id
            .ok_or_else(|| PipelineError::Api("create-volume returned no volume id".to_string()))
    }

    /// Attaches the volume to this instance at the given device name.
    pub async fn attach_volume(&self, volume_id: &str, device: &str) -> Result<(), PipelineError> {
        self.client
            .attach_volume()
            .volume_id(volume_id)
            .instance_id(&self.identity.instance_id)
            .device(device)
            .send()
            .await
            .map_err(api_error)?;

        Ok(())
    }

    /// Detaches the volume from this instance.
    pub async fn detach_volume(&self, volume_id: &str) -> Result<(), PipelineError> {
        self.client
            .detach_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(api_error)?;

        Ok(())
    }

    /// Deletes the volume.
    pub async fn delete_volume(&self, volume_id: &str) -> Result<(), PipelineError> {
        self.client
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(api_error)?;

        Ok(())
    }

    /// Returns the device names of all volumes attached to this
    /// instance, used to pick a free attachment point.
    pub async fn attached_devices(&self) -> Result<HashSet<String>, PipelineError> {
        let response = self
            .client
            .describe_volumes()
            .filters(
                Filter::builder()
                    .name("attachment.instance-id")
                    .values(&self.identity.instance_id)
                    .build(),
            )
            .send()
            .await
            .map_err(api_error)?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .filter_map(VolumeInfo::from_api)
            .flat_map(|volume| {
                volume
                    .attachments
                    .into_iter()
                    .map(|attachment| attachment.device)
            })
            .collect())
    }
}
