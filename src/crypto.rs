//! Paillier additive-homomorphic cryptosystem.
//!
//! Ciphertexts of the same public key multiply to an encryption of the
//! sum of their plaintexts, which is what lets the tally engine add
//! votes without decrypting any individual ballot.

use crate::deadline::check_deadline;
use crate::encoding::biguint_b64;
use crate::{CryptoError, Deadline, Error};

use log::{debug, info};
use num_bigint::{BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use num_prime::RandPrime;
use rand::rngs::OsRng;
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

/// Attempts at sampling a usable prime pair before key generation gives up.
const MAX_KEYGEN_ATTEMPTS: u32 = 16;

/// Seed for the single deterministic encryption of zero used as the
/// aggregate of an empty ballot set.
const EMPTY_AGGREGATE_SEED: [u8; 32] = *b"veritally_empty_aggregate_seed_0";

/// A Paillier ciphertext, an element of Z*_{n^2}.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext(#[serde(with = "biguint_b64")] pub BigUint);

/// Paillier public key (n, g) with n = p*q and g = n + 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaillierPublicKey {
    #[serde(with = "biguint_b64")]
    pub n: BigUint,
    #[serde(with = "biguint_b64")]
    pub g: BigUint,
}

/// Paillier private key (lambda, mu).
///
/// Held in memory only for the duration of key generation and share
/// issuance; the big integers are cleared when the key is dropped.
#[derive(Clone)]
pub struct PaillierPrivateKey {
    pub(crate) lambda: BigUint,
    pub(crate) mu: BigUint,
    pub(crate) n: BigUint,
}

impl Drop for PaillierPrivateKey {
    fn drop(&mut self) {
        // Best effort: release the secret exponents instead of leaving
        // them in freed allocations.
        self.lambda.set_zero();
        self.mu.set_zero();
    }
}

pub struct PaillierKeyPair {
    pub public: PaillierPublicKey,
    pub private: PaillierPrivateKey,
}

/// Paillier's L function, L(x) = (x - 1) / n. Callers must ensure
/// x = 1 mod n.
pub(crate) fn l_function(x: &BigUint, n: &BigUint) -> BigUint {
    (x - BigUint::one()) / n
}

/// Samples a uniform element of Z*_modulus.
pub(crate) fn sample_coprime<R: Rng>(rng: &mut R, modulus: &BigUint) -> BigUint {
    let mut r = rng.gen_biguint_range(&BigUint::one(), modulus);
    while r.gcd(modulus) != BigUint::one() {
        r = rng.gen_biguint_range(&BigUint::one(), modulus);
    }
    r
}

/// Generates a fresh Paillier keypair with an n of `bits` bits.
pub fn generate_keypair(bits: usize) -> Result<PaillierKeyPair, Error> {
    generate_keypair_with_deadline(bits, None)
}

/// Like [`generate_keypair`], aborting cleanly once `deadline` passes.
pub fn generate_keypair_with_deadline(
    bits: usize,
    deadline: Option<&Deadline>,
) -> Result<PaillierKeyPair, Error> {
    if bits < 64 || bits % 2 != 0 {
        return Err(Error::InvalidKeySize(bits));
    }

    info!("generating {}-bit Paillier keypair", bits);
    let mut rng = OsRng;

    for attempt in 1..=MAX_KEYGEN_ATTEMPTS {
        check_deadline(deadline, "key generation")?;

        let p: BigUint = rng.gen_prime(bits / 2, None);
        let q: BigUint = rng.gen_prime(bits / 2, None);
        if p == q {
            continue;
        }

        let n = &p * &q;
        if n.bits() as usize != bits {
            debug!("keygen attempt {}: modulus has wrong bit length", attempt);
            continue;
        }

        let n_squared = &n * &n;
        let g = &n + BigUint::one();
        let lambda = (&p - BigUint::one()).lcm(&(&q - BigUint::one()));

        // mu = (L(g^lambda mod n^2))^-1 mod n
        let mu = match l_function(&g.modpow(&lambda, &n_squared), &n).modinv(&n) {
            Some(mu) => mu,
            None => continue,
        };

        info!("keypair generated after {} attempt(s)", attempt);
        return Ok(PaillierKeyPair {
            public: PaillierPublicKey { n: n.clone(), g },
            private: PaillierPrivateKey { lambda, mu, n },
        });
    }

    Err(CryptoError::KeyGenFailed(MAX_KEYGEN_ATTEMPTS).into())
}

impl PaillierPublicKey {
    pub fn n_squared(&self) -> BigUint {
        &self.n * &self.n
    }

    /// Byte width of a fixed-width big-endian encoding of the modulus.
    pub fn modulus_byte_len(&self) -> usize {
        (self.n.bits() as usize + 7) / 8
    }

    /// Byte width of a fixed-width big-endian encoding of a ciphertext.
    pub fn ciphertext_byte_len(&self) -> usize {
        (self.n_squared().bits() as usize + 7) / 8
    }

    /// Encrypts `m` with fresh randomness from the OS entropy source.
    /// Requires 0 <= m < n.
    pub fn encrypt(&self, m: &BigUint) -> Result<Ciphertext, Error> {
        self.encrypt_with_rng(&mut OsRng, m)
    }

    /// Encrypts `m` drawing the blinding factor from `rng`.
    pub fn encrypt_with_rng<R: Rng>(&self, rng: &mut R, m: &BigUint) -> Result<Ciphertext, Error> {
        if *m >= self.n {
            return Err(Error::PlaintextOutOfRange);
        }
        let n_squared = self.n_squared();
        let r = sample_coprime(rng, &self.n);

        // c = g^m * r^n mod n^2
        let c = (self.g.modpow(m, &n_squared) * r.modpow(&self.n, &n_squared)) % &n_squared;
        Ok(Ciphertext(c))
    }

    /// Homomorphic addition: E(m1) * E(m2) = E(m1 + m2 mod n).
    pub fn homomorphic_add(&self, c1: &Ciphertext, c2: &Ciphertext) -> Result<Ciphertext, Error> {
        let n_squared = self.n_squared();
        if c1.0 >= n_squared || c2.0 >= n_squared {
            return Err(Error::CiphertextOutOfRange);
        }
        Ok(Ciphertext((&c1.0 * &c2.0) % &n_squared))
    }

    /// Multiplies all ciphertexts together mod n^2, yielding an
    /// encryption of the sum of the underlying plaintexts.
    ///
    /// The empty product is a deterministic encryption of zero, so that
    /// an election with no ballots still aggregates to a well-formed
    /// ciphertext (and does so reproducibly for testing).
    pub fn aggregate(
        &self,
        ciphertexts: &[Ciphertext],
        deadline: Option<&Deadline>,
    ) -> Result<Ciphertext, Error> {
        if ciphertexts.is_empty() {
            let mut rng = ChaCha20Rng::from_seed(EMPTY_AGGREGATE_SEED);
            return self.encrypt_with_rng(&mut rng, &BigUint::zero());
        }

        let n_squared = self.n_squared();
        let mut acc = BigUint::one();
        for c in ciphertexts {
            check_deadline(deadline, "aggregation")?;
            if c.0 >= n_squared {
                return Err(Error::CiphertextOutOfRange);
            }
            acc = acc * &c.0 % &n_squared;
        }
        Ok(Ciphertext(acc))
    }
}

impl PaillierPrivateKey {
    /// Raw decryption: m = L(c^lambda mod n^2) * mu mod n.
    pub fn decrypt(&self, c: &Ciphertext) -> Result<BigUint, Error> {
        let n_squared = &self.n * &self.n;
        if c.0 >= n_squared {
            return Err(Error::CiphertextOutOfRange);
        }
        let m = l_function(&c.0.modpow(&self.lambda, &n_squared), &self.n) * &self.mu % &self.n;
        Ok(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY_BITS: usize = 512;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let keypair = generate_keypair(TEST_KEY_BITS).unwrap();
        let m = BigUint::from(42u32);
        let c = keypair.public.encrypt(&m).unwrap();
        assert_eq!(keypair.private.decrypt(&c).unwrap(), m);
    }

    #[test]
    fn encryption_is_probabilistic() {
        let keypair = generate_keypair(TEST_KEY_BITS).unwrap();
        let m = BigUint::from(7u32);
        let c1 = keypair.public.encrypt(&m).unwrap();
        let c2 = keypair.public.encrypt(&m).unwrap();
        assert_ne!(c1, c2);
        assert_eq!(keypair.private.decrypt(&c1).unwrap(), m);
        assert_eq!(keypair.private.decrypt(&c2).unwrap(), m);
    }

    #[test]
    fn homomorphic_addition_sums_plaintexts() {
        let keypair = generate_keypair(TEST_KEY_BITS).unwrap();
        let c1 = keypair.public.encrypt(&BigUint::from(19u32)).unwrap();
        let c2 = keypair.public.encrypt(&BigUint::from(23u32)).unwrap();
        let sum = keypair.public.homomorphic_add(&c1, &c2).unwrap();
        assert_eq!(keypair.private.decrypt(&sum).unwrap(), BigUint::from(42u32));
    }

    #[test]
    fn aggregate_sums_many_plaintexts() {
        let keypair = generate_keypair(TEST_KEY_BITS).unwrap();
        let plaintexts: Vec<u32> = vec![1, 0, 3, 5, 0, 1];
        let ciphertexts: Vec<Ciphertext> = plaintexts
            .iter()
            .map(|m| keypair.public.encrypt(&BigUint::from(*m)).unwrap())
            .collect();
        let aggregated = keypair.public.aggregate(&ciphertexts, None).unwrap();
        assert_eq!(
            keypair.private.decrypt(&aggregated).unwrap(),
            BigUint::from(plaintexts.iter().sum::<u32>())
        );
    }

    #[test]
    fn empty_aggregate_is_deterministic_zero() {
        let keypair = generate_keypair(TEST_KEY_BITS).unwrap();
        let a = keypair.public.aggregate(&[], None).unwrap();
        let b = keypair.public.aggregate(&[], None).unwrap();
        assert_eq!(a, b);
        assert_eq!(keypair.private.decrypt(&a).unwrap(), BigUint::zero());
    }

    #[test]
    fn plaintext_must_be_below_n() {
        let keypair = generate_keypair(TEST_KEY_BITS).unwrap();
        let err = keypair.public.encrypt(&keypair.public.n.clone()).unwrap_err();
        assert!(matches!(err, Error::PlaintextOutOfRange));
    }

    #[test]
    fn ciphertext_must_be_below_n_squared() {
        let keypair = generate_keypair(TEST_KEY_BITS).unwrap();
        let out_of_range = Ciphertext(keypair.public.n_squared());
        assert!(matches!(
            keypair.private.decrypt(&out_of_range),
            Err(Error::CiphertextOutOfRange)
        ));
    }

    #[test]
    fn expired_deadline_aborts_keygen() {
        let deadline = Deadline::after(std::time::Duration::from_secs(0));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(matches!(
            generate_keypair_with_deadline(TEST_KEY_BITS, Some(&deadline)),
            Err(Error::DeadlineExpired(_))
        ));
    }
}
