use crate::crypto::{Ciphertext, PaillierPublicKey};
use crate::Error;

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One voter's encrypted ballot: a fixed-length vector with one
/// ciphertext per candidate, in the election's canonical candidate
/// order. Each slot encrypts 0 or 1 and at most one slot encrypts 1.
///
/// The `nonce` is the replay guard: the store rejects a second ballot
/// carrying the same nonce. Ballots are immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedBallot {
    pub id: Uuid,
    pub election_id: Uuid,
    pub choices: Vec<Ciphertext>,
    pub nonce: String,
    pub is_tallied: bool,
    pub cast_at: DateTime<Utc>,
}

impl EncryptedBallot {
    pub fn new(election_id: Uuid, choices: Vec<Ciphertext>, nonce: impl Into<String>) -> Self {
        EncryptedBallot {
            id: Uuid::new_v4(),
            election_id,
            choices,
            nonce: nonce.into(),
            is_tallied: false,
            cast_at: Utc::now(),
        }
    }
}

/// Encrypts a one-hot ballot vector for `candidate` (1-based) out of
/// `num_candidates`. The ballot issuer runs this on the voter's behalf;
/// well-formedness proofs are its responsibility, not ours.
pub fn encrypt_choice(
    pk: &PaillierPublicKey,
    candidate: usize,
    num_candidates: usize,
) -> Result<Vec<Ciphertext>, Error> {
    if candidate < 1 || candidate > num_candidates {
        return Err(Error::PlaintextOutOfRange);
    }

    let mut choices = Vec::with_capacity(num_candidates);
    for slot in 1..=num_candidates {
        let m = if slot == candidate {
            BigUint::one()
        } else {
            BigUint::zero()
        };
        choices.push(pk.encrypt(&m)?);
    }
    Ok(choices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    #[test]
    fn one_hot_vector_encrypts_a_single_one() {
        let keypair = generate_keypair(512).unwrap();
        let choices = encrypt_choice(&keypair.public, 2, 3).unwrap();
        assert_eq!(choices.len(), 3);

        let decrypted: Vec<BigUint> = choices
            .iter()
            .map(|c| keypair.private.decrypt(c).unwrap())
            .collect();
        assert_eq!(
            decrypted,
            vec![BigUint::zero(), BigUint::one(), BigUint::zero()]
        );
    }

    #[test]
    fn candidate_must_be_in_range() {
        let keypair = generate_keypair(512).unwrap();
        assert!(encrypt_choice(&keypair.public, 0, 3).is_err());
        assert!(encrypt_choice(&keypair.public, 4, 3).is_err());
    }
}
