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

use crate::cloud::{Ec2, SnapshotInfo};
use crate::config::MigrateConfig;
use crate::{ClaimError, PipelineError};

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// How long tag writes are given to reach read-back consistency before
/// the claim is decided. Must exceed the tagging API's eventual
/// consistency window; do not shorten it.
pub const SETTLE_INTERVAL: Duration = Duration::from_secs(4);

/// The tag value marking a temporary volume as owned by a worker.
pub const VOLUME_IN_PROGRESS: &str = "in-progress";

/// The lifecycle states a snapshot's claim tag can carry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClaimState {
    /// Eligible for migration.
    Migrate,
    /// A worker is uploading it.
    Migrating,
    /// Uploaded; eligible for validation.
    Migrated,
    /// A worker is hash-comparing it.
    Validating,
    /// Upload proven to reproduce the snapshot.
    Validated,
}

impl ClaimState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Migrate => "migrate",
            Self::Migrating => "migrating",
            Self::Migrated => "migrated",
            Self::Validating => "validating",
            Self::Validated => "validated",
        }
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ClaimState {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "migrate" => Ok(Self::Migrate),
            "migrating" => Ok(Self::Migrating),
            "migrated" => Ok(Self::Migrated),
            "validating" => Ok(Self::Validating),
            "validated" => Ok(Self::Validated),
            _ => Err(()),
        }
    }
}

/// The recovery value written back when validation fails: the
/// pre-claim value, except that a snapshot that claimed to be
/// validated (or was being validated) just had that disproven and
/// collapses to `migrated`; an absent tag collapses to empty.
pub fn validation_rollback_value(previous: Option<&str>) -> String {
    match previous {
        Some("validated") | Some("validating") => "migrated".to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// A `Claim` is a won state transition on one snapshot. It remembers
/// the pre-claim tag value for the validation recovery path.
#[derive(Debug)]
pub struct Claim {
    pub snapshot_id: String,
    pub state: ClaimState,
    pub previous: Option<String>,
}

/// A `Coordinator` performs tag-based claims on snapshots. The tagging
/// API has no compare-and-swap, so a claim is a write of the state tag
/// plus a random nonce, a settle sleep, and a read-back that decides
/// the race: at most one worker finds its own nonce still present.
pub struct Coordinator<'a> {
    ec2: &'a Ec2,
    tag: String,
    nonce_tag: String,
}

impl<'a> Coordinator<'a> {
    pub fn new(ec2: &'a Ec2, config: &MigrateConfig) -> Self {
        Self {
            ec2,
            tag: config.tag.clone(),
            nonce_tag: config.nonce_tag(),
        }
    }

    /// Returns the tag key driving the claim protocol.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns the tag key carrying the claim nonce.
    pub fn nonce_tag(&self) -> &str {
        &self.nonce_tag
    }

    /// Claims the snapshot for a transition to `state`.
    pub async fn claim(
        &self,
        snapshot: &SnapshotInfo,
        state: ClaimState,
    ) -> Result<Claim, ClaimError> {
        let previous = snapshot.tag(&self.tag).map(str::to_string);
        let nonce: u32 = rand::thread_rng().gen();

        self.ec2
            .tag_resource(
                &snapshot.id,
                &[
                    (self.tag.clone(), state.as_str().to_string()),
                    (self.nonce_tag.clone(), nonce.to_string()),
                ],
            )
            .await?;

        tokio::time::sleep(SETTLE_INTERVAL).await;

        let tags = self.ec2.snapshot_tags(&snapshot.id).await?;
        let read_state = tags
            .iter()
            .find(|(key, _)| *key == self.tag)
            .map(|(_, value)| value.as_str());
        let read_nonce = tags
            .iter()
            .find(|(key, _)| *key == self.nonce_tag)
            .map(|(_, value)| value.as_str());

        if !read_back_wins(state, nonce, read_state, read_nonce) {
            debug!(
                "lost claim on {}: state {:?}, nonce {:?}",
                snapshot.id, read_state, read_nonce
            );
            return Err(ClaimError::Lost(snapshot.id.clone()));
        }

        Ok(Claim {
            snapshot_id: snapshot.id.clone(),
            state,
            previous,
        })
    }

    /// Completes a claim: drops the nonce and writes the terminal state.
    pub async fn release(&self, claim: &Claim, state: ClaimState) -> Result<(), PipelineError> {
        self.ec2
            .untag_resource(&claim.snapshot_id, &[&self.nonce_tag])
            .await?;
        self.ec2
            .tag_resource(
                &claim.snapshot_id,
                &[(self.tag.clone(), state.as_str().to_string())],
            )
            .await?;

        Ok(())
    }

    /// Recovery write after a failed migration: back to `migrate`.
    pub async fn rollback_migration(&self, claim: &Claim) -> Result<(), PipelineError> {
        self.ec2
            .untag_resource(&claim.snapshot_id, &[&self.nonce_tag])
            .await?;
        self.ec2
            .tag_resource(
                &claim.snapshot_id,
                &[(self.tag.clone(), ClaimState::Migrate.as_str().to_string())],
            )
            .await?;

        Ok(())
    }

    /// Recovery write after a failed validation: back to the collapsed
    /// pre-claim value.
    pub async fn rollback_validation(&self, claim: &Claim) -> Result<(), PipelineError> {
        let value = validation_rollback_value(claim.previous.as_deref());

        self.ec2
            .untag_resource(&claim.snapshot_id, &[&self.nonce_tag])
            .await?;
        self.ec2
            .tag_resource(&claim.snapshot_id, &[(self.tag.clone(), value)])
            .await?;

        Ok(())
    }
}

/// Decides a read-back: `true` means this worker's write survived
/// the settle interval.
pub fn read_back_wins(
    state: ClaimState,
    nonce: u32,
    read_state: Option<&str>,
    read_nonce: Option<&str>,
) -> bool {
    read_state == Some(state.as_str()) && read_nonce == Some(nonce.to_string().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_round_trip() {
        for state in [
            ClaimState::Migrate,
            ClaimState::Migrating,
            ClaimState::Migrated,
            ClaimState::Validating,
            ClaimState::Validated,
        ] {
            assert_eq!(ClaimState::try_from(state.as_str()), Ok(state));
        }

        assert!(ClaimState::try_from("in-progress").is_err());
        assert!(ClaimState::try_from("").is_err());
    }

    #[test]
    fn at_most_one_worker_wins_a_read_back() {
        // Two workers both wrote "migrating" with their own nonce;
        // whatever the tags settle to, only one of them may win.
        let (a, b) = (1111_u32, 2222_u32);

        for settled in [a, b] {
            let read_nonce = settled.to_string();
            let wins_a = read_back_wins(
                ClaimState::Migrating,
                a,
                Some("migrating"),
                Some(&read_nonce),
            );
            let wins_b = read_back_wins(
                ClaimState::Migrating,
                b,
                Some("migrating"),
                Some(&read_nonce),
            );

            assert!(wins_a ^ wins_b);
        }

        // A third worker moved the snapshot to another state entirely.
        assert!(!read_back_wins(
            ClaimState::Migrating,
            a,
            Some("migrate"),
            Some(&a.to_string()),
        ));
    }

    #[test]
    fn validation_rollback_collapses_states() {
        assert_eq!(validation_rollback_value(Some("validated")), "migrated");
        assert_eq!(validation_rollback_value(Some("validating")), "migrated");
        assert_eq!(validation_rollback_value(Some("migrated")), "migrated");
        assert_eq!(validation_rollback_value(Some("migrate")), "migrate");
        assert_eq!(validation_rollback_value(None), "");
    }
}
