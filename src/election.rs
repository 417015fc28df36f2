use crate::crypto::PaillierPublicKey;
use crate::threshold::EncryptedKeyShare;
use crate::Error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of an election. Advanced only by the tally engine; an
/// election is never deleted while a result references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionState {
    Pending,
    Active,
    Tallying,
    Completed,
    Failed,
}

impl fmt::Display for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ElectionState::Pending => "pending",
            ElectionState::Active => "active",
            ElectionState::Tallying => "tallying",
            ElectionState::Completed => "completed",
            ElectionState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// An election: a title, an ordered candidate list (the order is
/// canonical and carried through every serialization), and the
/// encryption public key ballots are produced under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Election {
    pub id: Uuid,
    pub title: String,
    pub candidates: Vec<String>,
    pub public_key: PaillierPublicKey,
    pub state: ElectionState,
    pub created_at: DateTime<Utc>,
}

impl Election {
    pub fn new(title: impl Into<String>, candidates: Vec<String>, public_key: PaillierPublicKey) -> Self {
        Election {
            id: Uuid::new_v4(),
            title: title.into(),
            candidates,
            public_key,
            state: ElectionState::Pending,
            created_at: Utc::now(),
        }
    }
}

/// K-of-N trustee configuration. Defaults to 3-of-5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub threshold: u8,
    pub total_trustees: u8,
}

impl ThresholdConfig {
    pub fn new(threshold: u8, total_trustees: u8) -> Result<Self, Error> {
        let config = ThresholdConfig {
            threshold,
            total_trustees,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.threshold < 1 || self.threshold > self.total_trustees {
            return Err(Error::InvalidThreshold);
        }
        Ok(())
    }

    /// How many trustees may be unavailable while a tally remains
    /// possible.
    pub fn max_unavailable(&self) -> u8 {
        self.total_trustees - self.threshold
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        ThresholdConfig {
            threshold: 3,
            total_trustees: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrusteeStatus {
    Active,
    Inactive,
}

/// Registry entry for one trustee: its Shamir index, the public
/// commitment partial decryptions are verified against, and the
/// trustee's key share encrypted at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrusteeRecord {
    pub id: Uuid,
    pub index: u8,
    pub name: String,
    pub encrypted_share: EncryptedKeyShare,
    pub status: TrusteeStatus,
    pub created_at: DateTime<Utc>,
}

impl TrusteeRecord {
    pub fn new(index: u8, name: impl Into<String>, encrypted_share: EncryptedKeyShare) -> Self {
        TrusteeRecord {
            id: Uuid::new_v4(),
            index,
            name: name.into(),
            encrypted_share,
            status: TrusteeStatus::Active,
            created_at: Utc::now(),
        }
    }
}
