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

use crate::cloud::SnapshotInfo;
use crate::progress::UnitCounter;
use crate::PipelineError;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    ChecksumAlgorithm, CompletedMultipartUpload, CompletedPart, ServerSideEncryption,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

/// The provider's multipart part-count ceiling.
pub const MAX_PARTS: u64 = 10_000;
/// The provider's minimum part size (5 MiB).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Headroom added to the size estimate before part sizing, so streams
/// that run past their estimate still fit under the part-count ceiling.
pub const SIZE_SLACK: u64 = 10 * 1024 * 1024;

/// Size of one ranged GET while streaming an object back (8 MiB).
pub const RANGE_CHUNK: u64 = 8 * 1024 * 1024;

/// Chooses the multipart part size for an uncompressed-size estimate.
/// Only 90% of the part budget is planned for, leaving room for the
/// actual stream to exceed the estimate.
pub fn part_size_for(estimate: u64) -> u64 {
    let planned_parts = MAX_PARTS * 9 / 10;
    (estimate + SIZE_SLACK).div_ceil(planned_parts).max(MIN_PART_SIZE)
}

fn key_stem(snapshot: &SnapshotInfo) -> String {
    let mut stem = format!(
        "{}/{} {}",
        snapshot.volume_id,
        snapshot.start_time_iso(),
        snapshot.id
    );

    if !snapshot.description.is_empty() {
        stem.push_str(" - ");
        stem.push_str(&snapshot.description);
    }

    stem
}

/// Returns the object key of the snapshot's whole-volume raw image.
pub fn image_key(snapshot: &SnapshotInfo) -> String {
    format!("{}.img.lz4", key_stem(snapshot))
}

/// Returns the object key of one partition's archive. An empty
/// partition name (a volume without a partition table) omits the
/// partition component.
pub fn tar_key(snapshot: &SnapshotInfo, partition: &str) -> String {
    let mut key = key_stem(snapshot);

    if !partition.is_empty() {
        key.push('.');
        key.push_str(partition);
    }

    key.push_str(".tar.lz4");
    key
}

/// Replaces every character the object-tagging API rejects with `_`.
pub fn sanitize_tag(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c.is_whitespace() || "+=._:/-".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Returns the snapshot's user tags with the two coordination tags
/// removed and all keys and values sanitized.
pub fn object_tags(
    tags: &[(String, String)],
    claim_tag: &str,
    nonce_tag: &str,
) -> Vec<(String, String)> {
    tags.iter()
        .filter(|(key, _)| key != claim_tag && key != nonce_tag)
        .map(|(key, value)| (sanitize_tag(key), sanitize_tag(value)))
        .collect()
}

fn query_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());

    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }

    out
}

/// Renders object tags as the URL-encoded query string the multipart
/// creation call expects. Empty tag sets yield `None`.
pub fn tagging_query(tags: &[(String, String)]) -> Option<String> {
    if tags.is_empty() {
        return None;
    }

    Some(
        tags.iter()
            .map(|(key, value)| format!("{}={}", query_encode(key), query_encode(value)))
            .collect::<Vec<_>>()
            .join("&"),
    )
}

/// Returns the metadata attached to every uploaded object.
/// `uncompressed-size` records the estimate taken at upload start.
pub fn upload_metadata(snapshot: &SnapshotInfo, estimate: u64) -> Vec<(String, String)> {
    vec![
        ("snapshot-starttime".to_string(), snapshot.start_time_iso()),
        ("snapshot-snapshotid".to_string(), snapshot.id.clone()),
        (
            "snapshot-volumesize".to_string(),
            snapshot.size_gib.to_string(),
        ),
        ("snapshot-volumeid".to_string(), snapshot.volume_id.clone()),
        (
            "snapshot-description".to_string(),
            snapshot.description.clone(),
        ),
        ("uncompressed-size".to_string(), estimate.to_string()),
    ]
}

/// Everything one multipart upload needs besides the byte stream.
#[derive(Clone, Debug)]
pub struct UploadTarget {
    pub key: String,
    pub metadata: Vec<(String, String)>,
    pub tags: Vec<(String, String)>,
    pub sse: Option<String>,
    pub sse_kms_key_id: Option<String>,
    /// Pre-compression byte count estimate; drives part sizing.
    pub estimate: u64,
}

/// An object that HEAD found, reduced to what validation needs.
#[derive(Clone, Copy, Debug)]
pub struct RemoteObject {
    pub size: u64,
}

fn api_error<E, R>(e: SdkError<E, R>) -> PipelineError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    PipelineError::Api(DisplayErrorContext(e).to_string())
}

// Resolves on SIGINT; pends forever if no handler could be installed
// so that a healthy upload is never aborted by accident.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn read_part<R: AsyncRead + Unpin>(reader: &mut R, part_size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; part_size];
    let mut filled = 0;

    while filled < part_size {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }

        filled += n;
    }

    buf.truncate(filled);
    Ok(buf)
}

/// An `ObjectStore` wraps the bucket all objects of a run land in.
pub struct ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Streams the reader into a multipart upload of the target.
    ///
    /// Any part failure and any interrupt aborts the multipart upload
    /// before surfacing, so no orphaned parts are left in the store.
    pub async fn upload_stream<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        target: &UploadTarget,
        streams: usize,
    ) -> Result<(), PipelineError> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&target.key)
            .checksum_algorithm(ChecksumAlgorithm::Crc32)
            .set_metadata(Some(HashMap::from_iter(target.metadata.iter().cloned())))
            .set_tagging(tagging_query(&target.tags));

        if let Some(sse) = &target.sse {
            request = request.server_side_encryption(ServerSideEncryption::from(sse.as_str()));
        }
        if let Some(key_id) = &target.sse_kms_key_id {
            request = request.ssekms_key_id(key_id);
        }

        let created = request.send().await.map_err(api_error)?;
        let upload_id = created
            .upload_id
            .ok_or_else(|| PipelineError::NoUploadId(target.key.clone()))?;

        let result = tokio::select! {
            result = self.upload_parts(reader, target, &upload_id, streams) => result,
            _ = interrupted() => Err(PipelineError::Interrupted),
        };

        if result.is_err() {
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&target.key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(
                    "failed to abort multipart upload of \"{}\": {}",
                    target.key,
                    DisplayErrorContext(&e)
                );
            }
        }

        result
    }

    async fn upload_parts<R: AsyncRead + Unpin>(
        &self,
        mut reader: R,
        target: &UploadTarget,
        upload_id: &str,
        streams: usize,
    ) -> Result<(), PipelineError> {
        let part_size = part_size_for(target.estimate) as usize;
        let semaphore = Arc::new(Semaphore::new(streams.max(1)));
        let mut tasks: JoinSet<Result<CompletedPart, PipelineError>> = JoinSet::new();
        let mut parts = Vec::new();
        let mut part_number: i32 = 1;

        loop {
            // A part that already failed aborts the upload instead of
            // letting the rest of the stream go through the wire.
            while let Some(joined) = tasks.try_join_next() {
                parts.push(joined.map_err(|e| PipelineError::Io(io::Error::other(e)))??);
            }

            // Taking the permit before reading bounds the buffered
            // parts to the configured stream count.
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Io(io::Error::other(e)))?;

            let chunk = read_part(&mut reader, part_size).await?;
            if chunk.is_empty() && part_number > 1 {
                break;
            }

            let is_last = chunk.len() < part_size;

            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = target.key.clone();
            let upload_id = upload_id.to_string();
            let number = part_number;

            tasks.spawn(async move {
                let _permit = permit;

                let uploaded = client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(number)
                    .checksum_algorithm(ChecksumAlgorithm::Crc32)
                    .body(ByteStream::from(chunk))
                    .send()
                    .await
                    .map_err(api_error)?;

                Ok(CompletedPart::builder()
                    .part_number(number)
                    .set_e_tag(uploaded.e_tag)
                    .set_checksum_crc32(uploaded.checksum_crc32)
                    .build())
            });

            if is_last {
                break;
            }

            part_number += 1;
        }

        while let Some(joined) = tasks.join_next().await {
            parts.push(joined.map_err(|e| PipelineError::Io(io::Error::other(e)))??);
        }
        parts.sort_by_key(|part| part.part_number());

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(api_error)?;

        Ok(())
    }

    /// Checks whether the key exists, returning its size if so.
    pub async fn head(&self, key: &str) -> Result<Option<RemoteObject>, PipelineError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => Ok(Some(RemoteObject {
                size: response.content_length.unwrap_or(0).max(0) as u64,
            })),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()) == Some(true) {
                    Ok(None)
                } else {
                    Err(api_error(e))
                }
            }
        }
    }

    /// Streams the object into the writer with sequential ranged GETs,
    /// counting the (compressed) bytes as they arrive.
    pub async fn download<W: AsyncWrite + Unpin>(
        &self,
        key: &str,
        size: u64,
        mut dst: W,
        counter: &mut UnitCounter,
    ) -> Result<(), PipelineError> {
        let mut start = 0;

        while start < size {
            let end = (start + RANGE_CHUNK).min(size) - 1;

            let response = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .range(format!("bytes={}-{}", start, end))
                .send()
                .await
                .map_err(api_error)?;

            let mut body = response.body;
            while let Some(chunk) = body
                .try_next()
                .await
                .map_err(|e| PipelineError::Io(io::Error::other(e)))?
            {
                counter.add(chunk.len() as u64);
                dst.write_all(&chunk).await?;
            }

            start = end + 1;
        }

        dst.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    fn snapshot(description: &str) -> SnapshotInfo {
        SnapshotInfo {
            id: "snap-a".to_string(),
            volume_id: "vol-a".to_string(),
            size_gib: 100,
            start_time: chrono::Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            description: description.to_string(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn image_key_without_description() {
        assert_eq!(
            image_key(&snapshot("")),
            "vol-a/2024-01-02T03:04:05+00:00 snap-a.img.lz4"
        );
    }

    #[test]
    fn tar_keys_with_description_and_partition() {
        let snapshot = snapshot("nightly");

        assert_eq!(
            tar_key(&snapshot, ""),
            "vol-a/2024-01-02T03:04:05+00:00 snap-a - nightly.tar.lz4"
        );
        assert_eq!(
            tar_key(&snapshot, "xvdf1"),
            "vol-a/2024-01-02T03:04:05+00:00 snap-a - nightly.xvdf1.tar.lz4"
        );
    }

    #[test]
    fn part_size_always_fits_the_part_budget() {
        for estimate in [0, 1, MIN_PART_SIZE, 100 << 30, 5 << 40] {
            let part_size = part_size_for(estimate);
            assert!(part_size >= MIN_PART_SIZE);
            assert!(part_size * MAX_PARTS >= estimate + SIZE_SLACK);
        }
    }

    #[test]
    fn small_estimates_use_the_minimum_part_size() {
        assert_eq!(part_size_for(0), MIN_PART_SIZE);
        assert_eq!(part_size_for(1 << 30), MIN_PART_SIZE);
    }

    #[test]
    fn sanitize_replaces_disallowed_characters() {
        assert_eq!(sanitize_tag("name=a+b./c:d_e f-g"), "name=a+b./c:d_e f-g");
        assert_eq!(sanitize_tag("weird\"chars(here)"), "weird_chars_here_");

        let sanitized = sanitize_tag("héllo\u{7f}");
        assert!(sanitized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || "+=._:/-_".contains(c)));
    }

    #[test]
    fn object_tags_drop_coordination_tags() {
        let tags = vec![
            ("snap-to-s3".to_string(), "migrating".to_string()),
            ("snap-to-s3-id".to_string(), "12345".to_string()),
            ("team".to_string(), "storage&backup".to_string()),
        ];

        let filtered = object_tags(&tags, "snap-to-s3", "snap-to-s3-id");
        assert_eq!(
            filtered,
            vec![("team".to_string(), "storage_backup".to_string())]
        );
    }

    #[test]
    fn tagging_query_is_url_encoded() {
        let tags = vec![
            ("team".to_string(), "a b".to_string()),
            ("env".to_string(), "x=y".to_string()),
        ];

        assert_eq!(
            tagging_query(&tags).unwrap(),
            "team=a%20b&env=x%3Dy"
        );
        assert_eq!(tagging_query(&[]), None);
    }

    #[test]
    fn metadata_records_the_estimate() {
        let metadata = upload_metadata(&snapshot("nightly"), 42);

        assert!(metadata.contains(&("snapshot-snapshotid".to_string(), "snap-a".to_string())));
        assert!(metadata.contains(&("snapshot-volumesize".to_string(), "100".to_string())));
        assert!(metadata.contains(&("uncompressed-size".to_string(), "42".to_string())));
    }
}
