use crate::crypto::{Ciphertext, PaillierPublicKey};
use crate::encoding::to_fixed_be_bytes;
use crate::Error;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Published outcome of a finalized election. Immutable once the
/// session reaches `completed`; the only later change is recording the
/// blockchain transaction hash at publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionResult {
    pub election_id: Uuid,
    /// Candidate -> vote count, in canonical candidate order.
    pub tally: IndexMap<String, u64>,
    pub total_votes: u64,
    pub verification_hash: String,
    pub blockchain_tx_hash: Option<String>,
    pub is_verified: bool,
    pub finalized_at: DateTime<Utc>,
}

/// Answer to a verification request: whether the recomputation matched,
/// and what it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultVerification {
    pub election_id: Uuid,
    pub valid: bool,
    pub recomputed_hash: String,
}

/// Per-candidate slice of a result summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateTotal {
    pub votes: u64,
    pub percentage: f64,
}

/// Read-only overview of a finalized election, including trustee
/// participation and publication status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub election_id: Uuid,
    pub title: String,
    pub totals: IndexMap<String, CandidateTotal>,
    pub total_votes: u64,
    pub verification_hash: String,
    pub trustees_participated: u8,
    pub required_trustees: u8,
    pub published: bool,
    pub blockchain_tx_hash: Option<String>,
}

/// Canonical tally integrity hash.
///
/// SHA-256 over the concatenation, without separators, of fixed-width
/// big-endian byte strings: the election id (16 bytes), the modulus n,
/// each aggregated ciphertext in candidate order, each tally count
/// (8 bytes), then the participating trustee indices sorted ascending,
/// one byte each with a one-byte length prefix. Hex-lowercase output.
pub fn verification_hash(
    election_id: Uuid,
    pk: &PaillierPublicKey,
    aggregated: &[Ciphertext],
    counts: &[u64],
    trustee_indices: &[u8],
) -> Result<String, Error> {
    let modulus_width = pk.modulus_byte_len();
    let ciphertext_width = pk.ciphertext_byte_len();

    let mut hasher = Sha256::new();
    hasher.update(election_id.as_bytes());
    hasher.update(to_fixed_be_bytes(&pk.n, modulus_width)?);
    for ciphertext in aggregated {
        hasher.update(to_fixed_be_bytes(&ciphertext.0, ciphertext_width)?);
    }
    for count in counts {
        hasher.update(count.to_be_bytes());
    }

    let mut indices = trustee_indices.to_vec();
    indices.sort_unstable();
    hasher.update([indices.len() as u8]);
    hasher.update(&indices);

    Ok(hex::encode(hasher.finalize()))
}
