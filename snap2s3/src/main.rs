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

mod error;
use error::*;

use snap2s3_common::claim::ClaimState;
use snap2s3_common::cloud::{self, Ec2, SnapshotInfo};
use snap2s3_common::config::MigrateConfig;
use snap2s3_common::migrate::Migrator;
use snap2s3_common::pipeline;
use snap2s3_common::store::ObjectStore;
use snap2s3_common::validate::Validator;
use snap2s3_common::{ClaimError, MigrationError, TaskError, ValidationError};

use std::collections::HashSet;
use std::process;

use clap::{Args, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonOpts {
    /// The user tag key driving snapshot claims.
    #[arg(long)]
    tag: String,
    /// Root directory under which per-partition mountpoints live.
    #[arg(long)]
    mount_point: String,
    /// The destination bucket.
    #[arg(long)]
    bucket: String,
    /// The type of the temporary volumes created from snapshots.
    #[arg(long, default_value = "standard")]
    volume_type: String,
    /// LZ4 compression level, clamped to 1-9.
    #[arg(long, default_value_t = 1.0)]
    compression_level: f64,
    /// Number of multipart upload parts in flight at once.
    #[arg(long, default_value_t = 4.0)]
    upload_streams: f64,
    /// Leave temporary volumes attached and mounted for inspection.
    #[arg(long)]
    keep_temp_volumes: bool,
    /// Upload whole-volume raw images instead of per-partition archives.
    #[arg(long)]
    dd: bool,
    /// Server-side encryption algorithm, e.g. "AES256" or "aws:kms".
    #[arg(long)]
    sse: Option<String>,
    /// KMS key id; only valid together with --sse aws:kms.
    #[arg(long)]
    sse_kms_key_id: Option<String>,
    /// A partition name to skip; may be passed multiple times.
    #[arg(long = "skip-partition")]
    skip_partition: Vec<String>,
}

impl CommonOpts {
    fn into_config(self, validate: bool) -> Result<MigrateConfig> {
        Ok(MigrateConfig::new(
            self.tag,
            self.mount_point,
            self.bucket,
            self.volume_type,
            self.compression_level,
            self.upload_streams,
            self.keep_temp_volumes,
            self.dd,
            validate,
            self.sse,
            self.sse_kms_key_id,
            self.skip_partition,
        )?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate snapshots to the object store.
    Migrate {
        #[command(flatten)]
        opts: CommonOpts,
        /// Hash-compare each object right after its upload.
        #[arg(long)]
        validate: bool,
        /// The snapshots to migrate. Without ids, everything tagged
        /// "migrate" is processed, re-querying between snapshots.
        snapshot_ids: Vec<String>,
    },
    /// Validate uploaded snapshots against the object store.
    Validate {
        #[command(flatten)]
        opts: CommonOpts,
        /// The snapshots to validate. Without ids, everything tagged
        /// "migrated" is processed, re-querying between snapshots.
        snapshot_ids: Vec<String>,
    },
}

async fn logic() -> Result<()> {
    let cli = Cli::parse();

    pipeline::check_tools()?;
    let identity = cloud::instance_identity().await?;

    match cli.command {
        Commands::Migrate {
            opts,
            validate,
            snapshot_ids,
        } => {
            let config = opts.into_config(validate)?;
            let shared = cloud::sdk_config(&identity).await;
            let ec2 = Ec2::new(cloud::ec2_client(&shared), identity);
            let store = ObjectStore::new(cloud::s3_client(&shared), config.bucket.clone());

            migrate(&ec2, &store, &config, snapshot_ids).await?;
        }
        Commands::Validate { opts, snapshot_ids } => {
            let config = opts.into_config(false)?;
            let shared = cloud::sdk_config(&identity).await;
            let ec2 = Ec2::new(cloud::ec2_client(&shared), identity);
            let store = ObjectStore::new(cloud::s3_client(&shared), config.bucket.clone());

            validate(&ec2, &store, &config, snapshot_ids).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match logic().await {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

/// Returns the next snapshot to work on: the requested ids in order,
/// or the first eligible snapshot not already skipped or handled.
async fn next_eligible(
    ec2: &Ec2,
    tag: &str,
    state: ClaimState,
    skip: &HashSet<String>,
) -> Result<Option<SnapshotInfo>> {
    Ok(ec2
        .snapshots_tagged(tag, state.as_str())
        .await?
        .into_iter()
        .find(|snapshot| !skip.contains(&snapshot.id)))
}

async fn migrate(
    ec2: &Ec2,
    store: &ObjectStore,
    config: &MigrateConfig,
    snapshot_ids: Vec<String>,
) -> Result<()> {
    if config.keep_temp_volumes {
        warn!("keep-temp-volumes is set; volumes stay attached and mounted");
    }

    let migrator = Migrator::new(ec2, store, config);

    let mut migrated = 0;
    if snapshot_ids.is_empty() {
        // Re-query the eligible set between snapshots so that claims
        // won by other workers are seen.
        let mut skip = HashSet::new();
        while let Some(snapshot) =
            next_eligible(ec2, &config.tag, ClaimState::Migrate, &skip).await?
        {
            println!("Migrating {}...", snapshot.id);

            match migrator.migrate_snapshot(&snapshot).await {
                Ok(()) => migrated += 1,
                Err(TaskError::Claim(ClaimError::Lost(_))) => {
                    println!("{} already claimed by another worker", snapshot.id);
                }
                Err(source) => {
                    return Err(MigrationError {
                        snapshot_id: snapshot.id,
                        source,
                    }
                    .into())
                }
            }

            skip.insert(snapshot.id.clone());
        }
    } else {
        let snapshots = ec2.snapshots_by_ids(&snapshot_ids).await??;

        for snapshot in snapshots {
            println!("Migrating {}...", snapshot.id);

            match migrator.migrate_snapshot(&snapshot).await {
                Ok(()) => migrated += 1,
                Err(TaskError::Claim(ClaimError::Lost(_))) => {
                    println!("{} already claimed by another worker", snapshot.id);
                }
                Err(source) => {
                    return Err(MigrationError {
                        snapshot_id: snapshot.id,
                        source,
                    }
                    .into())
                }
            }
        }
    }

    println!("Migrated {} snapshot(s)", migrated);
    Ok(())
}

async fn validate(
    ec2: &Ec2,
    store: &ObjectStore,
    config: &MigrateConfig,
    snapshot_ids: Vec<String>,
) -> Result<()> {
    if config.keep_temp_volumes {
        warn!("keep-temp-volumes is set; volumes stay attached and mounted");
    }

    let validator = Validator::new(ec2, store, config);

    let mut failures = Vec::new();
    let mut succeeded = Vec::new();

    if snapshot_ids.is_empty() {
        // Failed snapshots fall back to "migrated" and would be
        // re-queried forever without the skip set.
        let mut skip = HashSet::new();
        while let Some(snapshot) =
            next_eligible(ec2, &config.tag, ClaimState::Migrated, &skip).await?
        {
            println!("Validating {}...", snapshot.id);

            match validator.validate_snapshot(&snapshot).await {
                Ok(()) => succeeded.push(snapshot.id.clone()),
                Err(TaskError::Claim(ClaimError::Lost(_))) => {
                    println!("{} already claimed by another worker", snapshot.id);
                }
                Err(e) => {
                    eprintln!("Validation of {} failed: {}", snapshot.id, e);
                    failures.push((snapshot.id.clone(), e));
                }
            }

            skip.insert(snapshot.id.clone());
        }
    } else {
        let snapshots = ec2.snapshots_by_ids(&snapshot_ids).await??;

        for snapshot in snapshots {
            println!("Validating {}...", snapshot.id);

            match validator.validate_snapshot(&snapshot).await {
                Ok(()) => succeeded.push(snapshot.id.clone()),
                Err(TaskError::Claim(ClaimError::Lost(_))) => {
                    println!("{} already claimed by another worker", snapshot.id);
                }
                Err(e) => {
                    eprintln!("Validation of {} failed: {}", snapshot.id, e);
                    failures.push((snapshot.id, e));
                }
            }
        }
    }

    if !failures.is_empty() {
        return Err(ValidationError {
            failures,
            succeeded,
        }
        .into());
    }

    println!("Validated {} snapshot(s)", succeeded.len());
    Ok(())
}
