//! Threshold decryption of the Paillier key.
//!
//! The dealer splits a decryption exponent into N shares with a
//! degree-(K-1) polynomial; any K trustees can jointly decrypt an
//! aggregate by each raising it to their share and combining the
//! results with Lagrange interpolation in the exponent. No trustee
//! ever reconstructs the key itself.
//!
//! The dealt secret is the CRT-combined exponent d with d = 0 mod
//! lambda and d = 1 mod n, shared modulo n*lambda. Partial
//! decryptions are C^(2*delta*s_i) with delta = N!, so that the
//! Lagrange coefficients 2*delta*l_i(0) stay integral and the
//! combination is exact in the unknown-order group Z*_{n^2}.

use crate::crypto::{l_function, sample_coprime, Ciphertext, PaillierKeyPair, PaillierPublicKey};
use crate::election::ThresholdConfig;
use crate::encoding::{biguint_b64, HexForm};
use hex_buffer_serde::Hex as _;
use crate::{CryptoError, Error};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use log::debug;
use num_bigint::{BigInt, BigUint, RandBigInt, Sign};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::rngs::OsRng;
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Domain-separation info for the share-at-rest key derivation.
const SHARE_KDF_INFO: &[u8] = b"veritally_share_at_rest";

/// Statistical blinding slack, in bits, for proof nonces.
const PROOF_SLACK_BITS: u64 = 128;

/// Challenge width produced by the Fiat-Shamir transcript hash.
const CHALLENGE_BITS: u64 = 256;

/// One trustee's point on the sharing polynomial.
///
/// The secret exponent is cleared when the share is dropped; shares
/// live in memory only for the duration of a partial decryption.
#[derive(Clone)]
pub struct KeyShare {
    pub index: u8,
    secret: BigUint,
}

impl Drop for KeyShare {
    fn drop(&mut self) {
        self.secret.set_zero();
    }
}

/// Public verification material published at share issuance: a common
/// base v and one commitment v^(s_i) per trustee, indexed by trustee
/// index minus one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareCommitments {
    pub threshold: u8,
    pub total: u8,
    #[serde(with = "biguint_b64")]
    pub base: BigUint,
    #[serde(with = "crate::encoding::biguint_b64_vec")]
    pub per_trustee: Vec<BigUint>,
}

impl ShareCommitments {
    pub fn commitment(&self, trustee_index: u8) -> Option<&BigUint> {
        if trustee_index == 0 {
            return None;
        }
        self.per_trustee.get(trustee_index as usize - 1)
    }
}

/// Non-interactive Chaum-Pedersen proof that the exponent used for a
/// partial decryption equals the one in the trustee's published
/// commitment. Stored as (challenge, response); the verifier restores
/// the two commitments from the verification equations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EqualityProof {
    #[serde(with = "biguint_b64")]
    challenge: BigUint,
    #[serde(with = "biguint_b64")]
    response: BigUint,
}

/// One trustee's contribution for every candidate slot of an
/// aggregated ciphertext vector, with one proof per slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialDecryption {
    pub trustee_index: u8,
    #[serde(with = "crate::encoding::biguint_b64_vec")]
    pub values: Vec<BigUint>,
    pub proofs: Vec<EqualityProof>,
}

/// A key share encrypted at rest with a key derived from operator
/// credentials. This is the only serializable form of a share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKeyShare {
    pub index: u8,
    #[serde(with = "HexForm")]
    nonce: Vec<u8>,
    #[serde(with = "HexForm")]
    ciphertext: Vec<u8>,
}

fn factorial(total: u8) -> BigUint {
    (2..=u64::from(total)).fold(BigUint::one(), |acc, i| acc * i)
}

/// Horner evaluation of the sharing polynomial (constant term first).
fn eval_polynomial(coefficients: &[BigUint], x: u64, modulus: &BigUint) -> BigUint {
    coefficients.iter().rev().fold(BigUint::zero(), |acc, c| {
        (acc * x + c) % modulus
    })
}

/// SHA-256 over length-prefixed big-endian encodings of the arguments.
fn transcript_hash(args: &[&BigUint]) -> BigUint {
    let mut hasher = Sha256::new();
    for arg in args {
        let bytes = arg.to_bytes_be();
        hasher.update((bytes.len() as u32).to_be_bytes());
        hasher.update(&bytes);
    }
    BigUint::from_bytes_be(&hasher.finalize())
}

/// Splits the decryption exponent of `keypair` into `config.total_trustees`
/// shares with threshold `config.threshold`, returning the shares and the
/// public commitments trustees are later verified against.
///
/// The private key is only read here; callers drop it once the ceremony
/// completes.
pub fn issue_shares(
    keypair: &PaillierKeyPair,
    config: &ThresholdConfig,
) -> Result<(Vec<KeyShare>, ShareCommitments), Error> {
    config.validate()?;

    let n = &keypair.public.n;
    let n_squared = keypair.public.n_squared();
    let lambda = &keypair.private.lambda;
    let share_modulus = n * lambda;

    // d = 0 mod lambda, d = 1 mod n, via CRT. gcd(lambda, n) = 1 for
    // any honestly generated modulus.
    let lambda_inv = lambda
        .modinv(n)
        .ok_or(CryptoError::ShareIssuance("lambda is not invertible mod n"))?;
    let d = lambda * lambda_inv;

    let mut rng = OsRng;
    let mut coefficients = vec![d];
    for _ in 1..config.threshold {
        coefficients.push(rng.gen_biguint_below(&share_modulus));
    }

    let shares: Vec<KeyShare> = (1..=u64::from(config.total_trustees))
        .map(|i| KeyShare {
            index: i as u8,
            secret: eval_polynomial(&coefficients, i, &share_modulus),
        })
        .collect();

    for c in coefficients.iter_mut() {
        c.set_zero();
    }

    // Verification base: a random square, generating the subgroup the
    // commitments live in.
    let r = sample_coprime(&mut rng, n);
    let base = (&r * &r) % &n_squared;
    let per_trustee = shares
        .iter()
        .map(|share| base.modpow(&share.secret, &n_squared))
        .collect();

    debug!(
        "issued {} key shares with threshold {}",
        config.total_trustees, config.threshold
    );

    Ok((
        shares,
        ShareCommitments {
            threshold: config.threshold,
            total: config.total_trustees,
            base,
            per_trustee,
        },
    ))
}

impl KeyShare {
    /// Computes this trustee's partial decryption of every slot of an
    /// aggregated ciphertext vector, with a proof of correctness per
    /// slot.
    pub fn partial_decrypt(
        &self,
        pk: &PaillierPublicKey,
        commitments: &ShareCommitments,
        ciphertexts: &[Ciphertext],
    ) -> Result<PartialDecryption, Error> {
        if commitments.commitment(self.index).is_none() {
            return Err(Error::InvalidTrusteeIndex(self.index));
        }

        let n_squared = pk.n_squared();
        let two_delta = BigUint::from(2u8) * factorial(commitments.total);
        let exponent = &two_delta * &self.secret;

        let mut values = Vec::with_capacity(ciphertexts.len());
        let mut proofs = Vec::with_capacity(ciphertexts.len());
        for ciphertext in ciphertexts {
            if ciphertext.0 >= n_squared {
                return Err(Error::CiphertextOutOfRange);
            }
            let value = ciphertext.0.modpow(&exponent, &n_squared);
            let proof =
                EqualityProof::generate(pk, commitments, self, &two_delta, ciphertext, &value);
            values.push(value);
            proofs.push(proof);
        }

        Ok(PartialDecryption {
            trustee_index: self.index,
            values,
            proofs,
        })
    }
}

impl EqualityProof {
    fn generate(
        pk: &PaillierPublicKey,
        commitments: &ShareCommitments,
        share: &KeyShare,
        two_delta: &BigUint,
        ciphertext: &Ciphertext,
        value: &BigUint,
    ) -> Self {
        let n_squared = pk.n_squared();
        let commitment = &commitments.per_trustee[share.index as usize - 1];
        let shifted_base = ciphertext.0.modpow(two_delta, &n_squared);

        // The group order is unknown, so the nonce is oversized enough
        // to statistically hide challenge * secret.
        let mut rng = OsRng;
        let nonce_bits = n_squared.bits() + CHALLENGE_BITS + PROOF_SLACK_BITS;
        let nonce = rng.gen_biguint(nonce_bits);

        let t1 = commitments.base.modpow(&nonce, &n_squared);
        let t2 = shifted_base.modpow(&nonce, &n_squared);
        let challenge = transcript_hash(&[
            &pk.n,
            &commitments.base,
            commitment,
            &ciphertext.0,
            value,
            &t1,
            &t2,
        ]);
        let response = nonce + &challenge * &share.secret;

        EqualityProof {
            challenge,
            response,
        }
    }

    /// Checks the proof against the trustee's published commitment.
    /// Returns `false` on any mismatch.
    pub fn verify(
        &self,
        pk: &PaillierPublicKey,
        commitments: &ShareCommitments,
        trustee_index: u8,
        ciphertext: &Ciphertext,
        value: &BigUint,
    ) -> bool {
        let n_squared = pk.n_squared();
        let commitment = match commitments.commitment(trustee_index) {
            Some(c) => c,
            None => return false,
        };
        if *value >= n_squared || value.is_zero() {
            return false;
        }

        let two_delta = BigUint::from(2u8) * factorial(commitments.total);
        let shifted_base = ciphertext.0.modpow(&two_delta, &n_squared);

        let commitment_inv = match commitment.modinv(&n_squared) {
            Some(inv) => inv,
            None => return false,
        };
        let value_inv = match value.modinv(&n_squared) {
            Some(inv) => inv,
            None => return false,
        };

        // Restore the prover's commitments from the verification
        // equations and recompute the challenge.
        let t1 = commitments.base.modpow(&self.response, &n_squared)
            * commitment_inv.modpow(&self.challenge, &n_squared)
            % &n_squared;
        let t2 = shifted_base.modpow(&self.response, &n_squared)
            * value_inv.modpow(&self.challenge, &n_squared)
            % &n_squared;

        let expected = transcript_hash(&[
            &pk.n,
            &commitments.base,
            commitment,
            &ciphertext.0,
            value,
            &t1,
            &t2,
        ]);
        expected == self.challenge
    }
}

/// Combines one partial-decryption value per trustee (for a single
/// candidate slot) into the plaintext count.
///
/// `selections` holds (trustee_index, value) pairs for a subset S of
/// trustees with |S| >= threshold and pairwise-distinct indices. If
/// `plaintext_bound` is given, a combined plaintext above it fails with
/// an overflow error instead of returning a wrapped or garbage count.
pub fn combine(
    pk: &PaillierPublicKey,
    commitments: &ShareCommitments,
    selections: &[(u8, BigUint)],
    plaintext_bound: Option<&BigUint>,
) -> Result<BigUint, Error> {
    if selections.len() < commitments.threshold as usize {
        return Err(Error::TooFewTrustees {
            needed: commitments.threshold,
            found: selections.len() as u8,
        });
    }
    for (index, _) in selections {
        if *index == 0 || *index > commitments.total {
            return Err(Error::InvalidTrusteeIndex(*index));
        }
    }
    let distinct: std::collections::HashSet<u8> =
        selections.iter().map(|(index, _)| *index).collect();
    if distinct.len() != selections.len() {
        return Err(CryptoError::Combine("trustee indices are not distinct").into());
    }

    let n_squared = pk.n_squared();
    let delta = factorial(commitments.total);

    let mut acc = BigUint::one();
    for (i, value) in selections {
        if *value >= n_squared {
            return Err(Error::CiphertextOutOfRange);
        }

        // w_i = 2 * delta * prod_{j != i} j / (j - i), an exact integer.
        let mut numerator = BigInt::from(2) * BigInt::from(delta.clone());
        let mut denominator = BigInt::one();
        for (j, _) in selections {
            if j != i {
                numerator *= BigInt::from(i64::from(*j));
                denominator *= BigInt::from(i64::from(*j)) - BigInt::from(i64::from(*i));
            }
        }
        let (weight, remainder) = numerator.div_rem(&denominator);
        if !remainder.is_zero() {
            return Err(CryptoError::Combine("lagrange coefficient is not integral").into());
        }

        let (sign, magnitude) = weight.into_parts();
        let term = if sign == Sign::Minus {
            value
                .modinv(&n_squared)
                .ok_or(CryptoError::Combine("partial decryption is not invertible"))?
                .modpow(&magnitude, &n_squared)
        } else {
            value.modpow(&magnitude, &n_squared)
        };
        acc = acc * term % &n_squared;
    }

    // acc = (1 + n)^(4 * delta^2 * m) mod n^2; anything else means the
    // partials do not belong to this key.
    if (&acc - BigUint::one()) % &pk.n != BigUint::zero() {
        return Err(CryptoError::Combine("combined value is not a decryption under this key").into());
    }

    let four_delta_sq = (BigUint::from(4u8) * &delta * &delta) % &pk.n;
    let scale_inv = four_delta_sq
        .modinv(&pk.n)
        .ok_or(CryptoError::Combine("scaling factor is not invertible"))?;
    let plaintext = l_function(&acc, &pk.n) * scale_inv % &pk.n;

    if let Some(bound) = plaintext_bound {
        if plaintext > *bound {
            return Err(CryptoError::PlaintextOverflow.into());
        }
    }

    Ok(plaintext)
}

/// Encrypts a share for storage, deriving the AEAD key from the
/// operator credential with HKDF-SHA256.
pub fn seal_share<R: Rng + CryptoRng>(
    rng: &mut R,
    share: &KeyShare,
    credential: &[u8],
) -> Result<EncryptedKeyShare, Error> {
    let mut key = Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(None, credential)
        .expand(SHARE_KDF_INFO, key.as_mut_slice())
        .map_err(|_| CryptoError::ShareIssuance("share key derivation failed"))?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
    let nonce: [u8; 12] = rng.gen();
    let plaintext = Zeroizing::new(share.secret.to_bytes_be());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| CryptoError::ShareIssuance("share encryption failed"))?;

    Ok(EncryptedKeyShare {
        index: share.index,
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

/// Decrypts a share held at rest. The plaintext buffer is wiped once
/// the share is reconstructed.
pub fn open_share(sealed: &EncryptedKeyShare, credential: &[u8]) -> Result<KeyShare, Error> {
    if sealed.nonce.len() != 12 {
        return Err(Error::ShareDecryption);
    }
    let mut key = Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(None, credential)
        .expand(SHARE_KDF_INFO, key.as_mut_slice())
        .map_err(|_| Error::ShareDecryption)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
        .map_err(|_| Error::ShareDecryption)?;
    let plaintext = Zeroizing::new(plaintext);

    Ok(KeyShare {
        index: sealed.index,
        secret: BigUint::from_bytes_be(&plaintext),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    const TEST_KEY_BITS: usize = 512;

    fn setup(
        threshold: u8,
        total: u8,
    ) -> (PaillierKeyPair, Vec<KeyShare>, ShareCommitments) {
        let keypair = generate_keypair(TEST_KEY_BITS).unwrap();
        let config = ThresholdConfig::new(threshold, total).unwrap();
        let (shares, commitments) = issue_shares(&keypair, &config).unwrap();
        (keypair, shares, commitments)
    }

    fn partial_values_for(
        subset: &[usize],
        shares: &[KeyShare],
        pk: &PaillierPublicKey,
        commitments: &ShareCommitments,
        ciphertext: &Ciphertext,
    ) -> Vec<(u8, BigUint)> {
        subset
            .iter()
            .map(|&i| {
                let partial = shares[i]
                    .partial_decrypt(pk, commitments, std::slice::from_ref(ciphertext))
                    .unwrap();
                (partial.trustee_index, partial.values[0].clone())
            })
            .collect()
    }

    #[test]
    fn any_quorum_recovers_the_plaintext() {
        let (keypair, shares, commitments) = setup(2, 3);
        let m = BigUint::from(21u32);
        let c = keypair.public.encrypt(&m).unwrap();

        for subset in [[0usize, 1], [0, 2], [1, 2]] {
            let selections =
                partial_values_for(&subset, &shares, &keypair.public, &commitments, &c);
            let recovered = combine(&keypair.public, &commitments, &selections, None).unwrap();
            assert_eq!(recovered, m);
        }
    }

    #[test]
    fn threshold_of_one_works() {
        let (keypair, shares, commitments) = setup(1, 1);
        let m = BigUint::from(5u32);
        let c = keypair.public.encrypt(&m).unwrap();
        let selections = partial_values_for(&[0], &shares, &keypair.public, &commitments, &c);
        assert_eq!(
            combine(&keypair.public, &commitments, &selections, None).unwrap(),
            m
        );
    }

    #[test]
    fn oversized_quorum_also_recovers() {
        let (keypair, shares, commitments) = setup(2, 4);
        let m = BigUint::from(9u32);
        let c = keypair.public.encrypt(&m).unwrap();
        let selections =
            partial_values_for(&[0, 1, 2, 3], &shares, &keypair.public, &commitments, &c);
        assert_eq!(
            combine(&keypair.public, &commitments, &selections, None).unwrap(),
            m
        );
    }

    #[test]
    fn below_threshold_is_rejected() {
        let (keypair, shares, commitments) = setup(2, 3);
        let c = keypair.public.encrypt(&BigUint::from(1u32)).unwrap();
        let selections = partial_values_for(&[0], &shares, &keypair.public, &commitments, &c);
        assert!(matches!(
            combine(&keypair.public, &commitments, &selections, None),
            Err(Error::TooFewTrustees { needed: 2, found: 1 })
        ));
    }

    #[test]
    fn duplicate_indices_are_rejected() {
        let (keypair, shares, commitments) = setup(2, 3);
        let c = keypair.public.encrypt(&BigUint::from(1u32)).unwrap();
        let mut selections =
            partial_values_for(&[0], &shares, &keypair.public, &commitments, &c);
        selections.push(selections[0].clone());
        assert!(matches!(
            combine(&keypair.public, &commitments, &selections, None),
            Err(Error::Crypto(CryptoError::Combine(_)))
        ));
    }

    #[test]
    fn proof_verifies_and_tampering_breaks_it() {
        let (keypair, shares, commitments) = setup(2, 3);
        let c = keypair.public.encrypt(&BigUint::from(3u32)).unwrap();
        let partial = shares[0]
            .partial_decrypt(&keypair.public, &commitments, std::slice::from_ref(&c))
            .unwrap();

        assert!(partial.proofs[0].verify(
            &keypair.public,
            &commitments,
            partial.trustee_index,
            &c,
            &partial.values[0],
        ));

        // d + 1 mod n^2 must no longer verify.
        let tampered =
            (&partial.values[0] + BigUint::one()) % keypair.public.n_squared();
        assert!(!partial.proofs[0].verify(
            &keypair.public,
            &commitments,
            partial.trustee_index,
            &c,
            &tampered,
        ));
    }

    #[test]
    fn proof_is_bound_to_the_trustee() {
        let (keypair, shares, commitments) = setup(2, 3);
        let c = keypair.public.encrypt(&BigUint::from(3u32)).unwrap();
        let partial = shares[0]
            .partial_decrypt(&keypair.public, &commitments, std::slice::from_ref(&c))
            .unwrap();
        assert!(!partial.proofs[0].verify(
            &keypair.public,
            &commitments,
            2,
            &c,
            &partial.values[0],
        ));
    }

    #[test]
    fn plaintext_bound_is_enforced() {
        let (keypair, shares, commitments) = setup(2, 3);
        let m = BigUint::from(50u32);
        let c = keypair.public.encrypt(&m).unwrap();
        let selections =
            partial_values_for(&[0, 1], &shares, &keypair.public, &commitments, &c);
        let err = combine(
            &keypair.public,
            &commitments,
            &selections,
            Some(&BigUint::from(10u32)),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Crypto(CryptoError::PlaintextOverflow)
        ));
    }

    #[test]
    fn foreign_key_partials_do_not_combine() {
        let (keypair_a, _, _) = setup(2, 3);
        let (keypair_b, shares_b, commitments_b) = setup(2, 3);

        // Aggregate under key A, partials computed with shares of key B.
        let c_a = keypair_a.public.encrypt(&BigUint::from(4u32)).unwrap();
        let c_mixed = Ciphertext(c_a.0 % keypair_b.public.n_squared());
        let selections =
            partial_values_for(&[0, 1], &shares_b, &keypair_b.public, &commitments_b, &c_mixed);
        let result = combine(
            &keypair_b.public,
            &commitments_b,
            &selections,
            Some(&BigUint::from(1000u32)),
        );
        assert!(matches!(result, Err(Error::Crypto(_))));
    }

    #[test]
    fn sealed_share_roundtrips() {
        let (_, shares, _) = setup(2, 3);
        let sealed = seal_share(&mut OsRng, &shares[0], b"operator-credential").unwrap();
        let opened = open_share(&sealed, b"operator-credential").unwrap();
        assert_eq!(opened.index, shares[0].index);
        assert_eq!(opened.secret, shares[0].secret);
    }

    #[test]
    fn wrong_credential_fails_to_open() {
        let (_, shares, _) = setup(2, 3);
        let sealed = seal_share(&mut OsRng, &shares[0], b"operator-credential").unwrap();
        assert!(matches!(
            open_share(&sealed, b"not-the-credential"),
            Err(Error::ShareDecryption)
        ));
    }
}
