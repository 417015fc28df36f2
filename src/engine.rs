use crate::audit::{AuditEntry, AuditStatus};
use crate::ballot::EncryptedBallot;
use crate::crypto::{Ciphertext, PaillierPublicKey};
use crate::election::{Election, ElectionState, ThresholdConfig, TrusteeRecord, TrusteeStatus};
use crate::result::{
    verification_hash, CandidateTotal, ElectionResult, ResultSummary, ResultVerification,
};
use crate::session::{SessionSnapshot, SessionState, TallyingSession};
use crate::store::{PartialDecryptionRecord, Store};
use crate::threshold::{combine, PartialDecryption, ShareCommitments};
use crate::{CryptoError, Deadline, Error};

use chrono::Utc;
use indexmap::IndexMap;
use log::{info, warn};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use serde_json::json;
use uuid::Uuid;

/// External gateway that anchors a verification hash on an immutable
/// ledger. Which chain, gas handling and finality are its problem;
/// the engine only records the returned transaction hash.
pub trait ResultPublisher {
    fn publish(&self, election_id: Uuid, verification_hash: &str) -> Result<String, Error>;
}

/// Coordinates the tallying of elections against a persistence
/// backend. All operations are synchronous and blocking; callers run
/// them from per-request threads. The exclusive receiver serializes
/// session state transitions.
pub struct TallyEngine<S: Store> {
    store: S,
    config: ThresholdConfig,
}

impl<S: Store> TallyEngine<S> {
    pub fn new(store: S, config: ThresholdConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(TallyEngine { store, config })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    // --- operator surface -------------------------------------------------

    pub fn create_election(
        &mut self,
        title: impl Into<String>,
        candidates: Vec<String>,
        public_key: PaillierPublicKey,
        actor: &str,
    ) -> Result<Election, Error> {
        let outcome = (|| {
            if candidates.is_empty() {
                return Err(Error::NoCandidates);
            }
            let election = Election::new(title, candidates, public_key);
            self.store.put_election(election.clone())?;
            info!("created election {} ({})", election.id, election.title);
            let details = json!({
                "election_id": election.id,
                "candidates": election.candidates.len(),
            });
            Ok((election, details))
        })();
        let election_id = outcome.as_ref().ok().map(|(e, _)| e.id);
        self.audited(election_id, "create_election", actor, outcome)
    }

    /// Opens a pending election for ballot intake.
    pub fn open_election(&mut self, election_id: Uuid, actor: &str) -> Result<Election, Error> {
        let outcome = (|| {
            let mut election = self.store.election(election_id)?;
            if election.state != ElectionState::Pending {
                return Err(Error::WrongElectionState);
            }
            election.state = ElectionState::Active;
            self.store.set_election_state(election_id, ElectionState::Active)?;
            Ok((election, json!({ "state": "active" })))
        })();
        self.audited(Some(election_id), "open_election", actor, outcome)
    }

    pub fn register_trustee(&mut self, trustee: TrusteeRecord, actor: &str) -> Result<(), Error> {
        let outcome = (|| {
            if trustee.index == 0 || trustee.index > self.config.total_trustees {
                return Err(Error::InvalidTrusteeIndex(trustee.index));
            }
            let details = json!({
                "trustee_id": trustee.id,
                "trustee_index": trustee.index,
            });
            self.store.put_trustee(trustee)?;
            Ok(((), details))
        })();
        self.audited(None, "register_trustee", actor, outcome)
    }

    /// Records the public commitments produced by the share-issuance
    /// ceremony.
    pub fn publish_commitments(
        &mut self,
        commitments: ShareCommitments,
        actor: &str,
    ) -> Result<(), Error> {
        let outcome = (|| {
            if commitments.threshold != self.config.threshold
                || commitments.total != self.config.total_trustees
            {
                return Err(Error::InvalidThreshold);
            }
            let details = json!({
                "threshold": commitments.threshold,
                "total_trustees": commitments.total,
            });
            self.store.put_commitments(commitments)?;
            Ok(((), details))
        })();
        self.audited(None, "publish_commitments", actor, outcome)
    }

    // --- ballot intake ----------------------------------------------------

    /// Accepts an encrypted ballot from the upstream ballot issuer.
    /// Intake closes for good once a tallying session exists.
    pub fn submit_ballot(&mut self, ballot: EncryptedBallot, actor: &str) -> Result<(), Error> {
        let election_id = ballot.election_id;
        let outcome = (|| {
            let election = self.store.election(election_id)?;
            if election.state != ElectionState::Active {
                return Err(Error::WrongElectionState);
            }
            if self.store.session(election_id).is_ok() {
                return Err(Error::BallotsFrozen);
            }
            if ballot.choices.len() != election.candidates.len() {
                return Err(Error::BallotArityMismatch {
                    expected: election.candidates.len(),
                    found: ballot.choices.len(),
                });
            }
            let n_squared = election.public_key.n_squared();
            if ballot.choices.iter().any(|c| c.0 >= n_squared) {
                return Err(Error::CiphertextOutOfRange);
            }
            let details = json!({
                "ballot_id": ballot.id,
                "nonce": ballot.nonce,
            });
            self.store.put_ballot(ballot)?;
            Ok(((), details))
        })();
        self.audited(Some(election_id), "submit_ballot", actor, outcome)
    }

    // --- tallying session -------------------------------------------------

    /// Opens the tallying session for an election. Fails with a
    /// conflict if one already exists.
    pub fn start_tally(
        &mut self,
        election_id: Uuid,
        actor: &str,
    ) -> Result<SessionSnapshot, Error> {
        let outcome = (|| {
            let election = self.store.election(election_id)?;
            if election.state != ElectionState::Active {
                return Err(Error::WrongElectionState);
            }
            if self.store.session(election_id).is_ok() {
                return Err(Error::SessionExists(election_id));
            }
            let ballots = self.store.ballots(election_id)?;
            if ballots.is_empty() {
                return Err(Error::NoBallots);
            }

            let session = TallyingSession::new(
                election_id,
                self.config.threshold,
                ballots.len() as u64,
            );
            self.store.put_session(session.clone())?;
            self.store
                .set_election_state(election_id, ElectionState::Tallying)?;

            info!(
                "tallying started for election {} with {} ballots",
                election_id,
                ballots.len()
            );
            let details = json!({
                "total_ballots": ballots.len(),
                "required_trustees": self.config.threshold,
            });
            Ok((session.snapshot(), details))
        })();
        self.audited(Some(election_id), "start_tally", actor, outcome)
    }

    /// Aggregates all accepted ballots into one ciphertext per
    /// candidate and freezes the ballot set. Runs exactly once per
    /// session.
    ///
    /// A deadline expiry leaves the session in its pre-call state; any
    /// other failure marks it failed.
    pub fn aggregate(
        &mut self,
        election_id: Uuid,
        deadline: Option<&Deadline>,
        actor: &str,
    ) -> Result<SessionSnapshot, Error> {
        let outcome = self.aggregate_inner(election_id, deadline);
        self.audited(Some(election_id), "aggregate", actor, outcome)
    }

    fn aggregate_inner(
        &mut self,
        election_id: Uuid,
        deadline: Option<&Deadline>,
    ) -> Result<(SessionSnapshot, serde_json::Value), Error> {
        let mut session = self.store.session(election_id)?;
        session.expect_state(SessionState::Initiated)?;
        let election = self.store.election(election_id)?;
        let ballots = self.store.ballots(election_id)?;

        match aggregate_columns(&election, &ballots, deadline) {
            Ok(aggregated) => {
                session.advance(SessionState::Aggregating)?;
                session.advance(SessionState::Decrypting)?;
                session.aggregated = Some(aggregated);
                self.store.mark_ballots_tallied(election_id)?;
                self.store.update_session(session.clone())?;
                info!(
                    "aggregated {} ballots over {} candidates for election {}",
                    ballots.len(),
                    election.candidates.len(),
                    election_id
                );
                let details = json!({
                    "ballots": ballots.len(),
                    "candidates": election.candidates.len(),
                });
                Ok((session.snapshot(), details))
            }
            Err(err @ Error::DeadlineExpired(_)) => Err(err),
            Err(err) => {
                self.fail_session(session, &err)?;
                Err(err)
            }
        }
    }

    /// Accepts one trustee's partial decryption of the aggregated
    /// ciphertext vector. The proof is checked against the trustee's
    /// published commitment; a failing submission is persisted
    /// unverified and does not count toward the threshold.
    pub fn submit_partial(
        &mut self,
        election_id: Uuid,
        partial: PartialDecryption,
    ) -> Result<SessionSnapshot, Error> {
        let actor = format!("trustee:{}", partial.trustee_index);
        let outcome = self.submit_partial_inner(election_id, partial);
        self.audited(Some(election_id), "submit_partial", &actor, outcome)
    }

    fn submit_partial_inner(
        &mut self,
        election_id: Uuid,
        partial: PartialDecryption,
    ) -> Result<(SessionSnapshot, serde_json::Value), Error> {
        let trustee_index = partial.trustee_index;
        let mut session = self.store.session(election_id)?;
        session.expect_state(SessionState::Decrypting)?;

        let trustee = self.store.trustee_by_index(trustee_index)?;
        if trustee.status != TrusteeStatus::Active {
            return Err(Error::TrusteeInactive(trustee_index));
        }

        let already_verified = self
            .store
            .partial_decryptions(election_id)?
            .iter()
            .any(|r| r.partial.trustee_index == trustee_index && r.verified);
        if already_verified {
            return Err(Error::DuplicatePartialDecryption(trustee_index));
        }

        let election = self.store.election(election_id)?;
        let commitments = self.store.commitments()?;
        let aggregated = session
            .aggregated
            .clone()
            .ok_or_else(|| Error::Storage("aggregated ciphertext missing".into()))?;

        if partial.values.len() != aggregated.len() || partial.proofs.len() != aggregated.len() {
            return Err(Error::BallotArityMismatch {
                expected: aggregated.len(),
                found: partial.values.len(),
            });
        }

        let verified = aggregated
            .iter()
            .zip(partial.values.iter().zip(partial.proofs.iter()))
            .all(|(ciphertext, (value, proof))| {
                proof.verify(
                    &election.public_key,
                    &commitments,
                    trustee_index,
                    ciphertext,
                    value,
                )
            });

        self.store.put_partial_decryption(PartialDecryptionRecord {
            election_id,
            trustee_id: trustee.id,
            partial,
            verified,
            submitted_at: Utc::now(),
        })?;

        if !verified {
            warn!(
                "partial decryption from trustee {} failed proof verification",
                trustee_index
            );
            return Err(Error::InvalidPartialDecryption(trustee_index));
        }

        session.completed_trustees += 1;
        self.store.update_session(session.clone())?;
        info!(
            "partial decryption accepted from trustee {} ({}/{})",
            trustee_index, session.completed_trustees, session.required_trustees
        );
        let details = json!({
            "trustee_index": trustee_index,
            "completed_trustees": session.completed_trustees,
            "required_trustees": session.required_trustees,
        });
        Ok((session.snapshot(), details))
    }

    /// Combines the first K verified partial decryptions (lowest
    /// trustee indices first) into the final per-candidate counts and
    /// publishes the election result.
    ///
    /// Falling short of the threshold leaves the session open for more
    /// submissions; errors during combination mark it failed.
    pub fn finalize(&mut self, election_id: Uuid, actor: &str) -> Result<ElectionResult, Error> {
        let outcome = self.finalize_inner(election_id);
        self.audited(Some(election_id), "finalize", actor, outcome)
    }

    fn finalize_inner(
        &mut self,
        election_id: Uuid,
    ) -> Result<(ElectionResult, serde_json::Value), Error> {
        let mut session = self.store.session(election_id)?;
        session.expect_state(SessionState::Decrypting)?;
        let election = self.store.election(election_id)?;
        let commitments = self.store.commitments()?;

        let quorum = self.select_quorum(election_id, session.required_trustees)?;
        let aggregated = session
            .aggregated
            .clone()
            .ok_or_else(|| Error::Storage("aggregated ciphertext missing".into()))?;

        session.advance(SessionState::Finalizing)?;
        match compute_result(&election, &commitments, &quorum, &aggregated, session.total_ballots)
        {
            Ok(result) => {
                self.store.put_result(result.clone())?;
                session.advance(SessionState::Completed)?;
                session.completed_at = Some(Utc::now());
                self.store.update_session(session)?;
                self.store
                    .set_election_state(election_id, ElectionState::Completed)?;
                info!(
                    "election {} finalized: {} votes, hash {}",
                    election_id, result.total_votes, result.verification_hash
                );
                let details = json!({
                    "total_votes": result.total_votes,
                    "verification_hash": result.verification_hash,
                });
                Ok((result, details))
            }
            Err(err) => {
                self.fail_session(session, &err)?;
                Err(err)
            }
        }
    }

    /// The deterministic quorum used for finalization and
    /// verification: verified records ordered by trustee index, ties
    /// broken by submission time, truncated to the threshold.
    fn select_quorum(
        &self,
        election_id: Uuid,
        required: u8,
    ) -> Result<Vec<PartialDecryptionRecord>, Error> {
        let mut verified: Vec<PartialDecryptionRecord> = self
            .store
            .partial_decryptions(election_id)?
            .into_iter()
            .filter(|r| r.verified)
            .collect();
        verified.sort_by(|a, b| {
            a.partial
                .trustee_index
                .cmp(&b.partial.trustee_index)
                .then(a.submitted_at.cmp(&b.submitted_at))
        });
        if (verified.len() as u8) < required {
            return Err(Error::TooFewTrustees {
                needed: required,
                found: verified.len() as u8,
            });
        }
        verified.truncate(required as usize);
        Ok(verified)
    }

    // --- verification and publication -------------------------------------

    /// Recomputes the combined plaintexts and the verification hash
    /// from the persisted aggregate and partial decryptions, checking
    /// every proof again. The stored result's `is_verified` flag is
    /// updated to match.
    pub fn verify_result(&mut self, election_id: Uuid) -> Result<ResultVerification, Error> {
        let stored = self.store.result(election_id)?;
        let session = self.store.session(election_id)?;
        let election = self.store.election(election_id)?;
        let commitments = self.store.commitments()?;
        let aggregated = session.aggregated.clone().unwrap_or_default();

        let verification = match self.recompute(&election, &commitments, &session, &aggregated) {
            Ok((counts, indices, proofs_ok)) => {
                let recomputed_hash = verification_hash(
                    election_id,
                    &election.public_key,
                    &aggregated,
                    &counts,
                    &indices,
                )?;
                let counts_match = stored.tally.values().copied().eq(counts.iter().copied());
                let valid =
                    proofs_ok && counts_match && recomputed_hash == stored.verification_hash;
                ResultVerification {
                    election_id,
                    valid,
                    recomputed_hash,
                }
            }
            Err(_) => ResultVerification {
                election_id,
                valid: false,
                recomputed_hash: String::new(),
            },
        };

        if stored.is_verified != verification.valid {
            let mut updated = stored;
            updated.is_verified = verification.valid;
            self.store.update_result(updated)?;
        }
        Ok(verification)
    }

    fn recompute(
        &self,
        election: &Election,
        commitments: &ShareCommitments,
        session: &TallyingSession,
        aggregated: &[Ciphertext],
    ) -> Result<(Vec<u64>, Vec<u8>, bool), Error> {
        let quorum = self.select_quorum(election.id, session.required_trustees)?;

        let proofs_ok = quorum.iter().all(|record| {
            record.partial.values.len() == aggregated.len()
                && record.partial.proofs.len() == aggregated.len()
                && aggregated
                    .iter()
                    .zip(record.partial.values.iter().zip(record.partial.proofs.iter()))
                    .all(|(ciphertext, (value, proof))| {
                        proof.verify(
                            &election.public_key,
                            commitments,
                            record.partial.trustee_index,
                            ciphertext,
                            value,
                        )
                    })
        });

        let (counts, indices) =
            combine_counts(election, commitments, &quorum, aggregated, session.total_ballots)?;
        Ok((counts, indices, proofs_ok))
    }

    /// Anchors a finalized result's verification hash through the
    /// injected publisher gateway.
    pub fn publish_result(
        &mut self,
        election_id: Uuid,
        publisher: &dyn ResultPublisher,
        actor: &str,
    ) -> Result<String, Error> {
        let outcome = (|| {
            let mut result = self.store.result(election_id)?;
            if result.blockchain_tx_hash.is_some() {
                return Err(Error::AlreadyPublished);
            }
            let tx_hash = publisher.publish(election_id, &result.verification_hash)?;
            result.blockchain_tx_hash = Some(tx_hash.clone());
            self.store.update_result(result)?;
            info!("election {} published: {}", election_id, tx_hash);
            let details = json!({ "tx_hash": tx_hash });
            Ok((tx_hash, details))
        })();
        self.audited(Some(election_id), "publish_blockchain", actor, outcome)
    }

    // --- read-only surface ------------------------------------------------

    pub fn session_snapshot(&self, election_id: Uuid) -> Result<SessionSnapshot, Error> {
        Ok(self.store.session(election_id)?.snapshot())
    }

    pub fn audit_trail(&self, election_id: Uuid) -> Result<Vec<AuditEntry>, Error> {
        self.store.audit_entries(election_id)
    }

    pub fn result_summary(&self, election_id: Uuid) -> Result<ResultSummary, Error> {
        let result = self.store.result(election_id)?;
        let election = self.store.election(election_id)?;
        let session = self.store.session(election_id)?;

        let totals: IndexMap<String, CandidateTotal> = result
            .tally
            .iter()
            .map(|(candidate, votes)| {
                let percentage = if result.total_votes > 0 {
                    (*votes as f64 / result.total_votes as f64 * 10_000.0).round() / 100.0
                } else {
                    0.0
                };
                (
                    candidate.clone(),
                    CandidateTotal {
                        votes: *votes,
                        percentage,
                    },
                )
            })
            .collect();

        Ok(ResultSummary {
            election_id,
            title: election.title,
            totals,
            total_votes: result.total_votes,
            verification_hash: result.verification_hash,
            trustees_participated: session.completed_trustees,
            required_trustees: session.required_trustees,
            published: result.blockchain_tx_hash.is_some(),
            blockchain_tx_hash: result.blockchain_tx_hash,
        })
    }

    // --- internals --------------------------------------------------------

    /// Writes exactly one audit entry per state-changing call, success
    /// or failure, then hands the outcome back to the caller.
    fn audited<T>(
        &mut self,
        election_id: Option<Uuid>,
        operation: &'static str,
        actor: &str,
        outcome: Result<(T, serde_json::Value), Error>,
    ) -> Result<T, Error> {
        match outcome {
            Ok((value, details)) => {
                self.store.append_audit(AuditEntry::new(
                    election_id,
                    operation,
                    actor,
                    details,
                    AuditStatus::Success,
                ))?;
                Ok(value)
            }
            Err(err) => {
                self.store.append_audit(AuditEntry::new(
                    election_id,
                    operation,
                    actor,
                    json!({ "error": err.to_string() }),
                    AuditStatus::Failure,
                ))?;
                Err(err)
            }
        }
    }

    fn fail_session(&mut self, mut session: TallyingSession, reason: &Error) -> Result<(), Error> {
        warn!(
            "tallying session for election {} failed: {}",
            session.election_id, reason
        );
        session.error_message = Some(reason.to_string());
        session.advance(SessionState::Failed)?;
        self.store.update_session(session)
    }
}

/// Column-wise homomorphic aggregation of all ballots.
fn aggregate_columns(
    election: &Election,
    ballots: &[EncryptedBallot],
    deadline: Option<&Deadline>,
) -> Result<Vec<Ciphertext>, Error> {
    if ballots.is_empty() {
        return Err(Error::NoBallots);
    }
    for ballot in ballots {
        if ballot.choices.len() != election.candidates.len() {
            return Err(Error::BallotArityMismatch {
                expected: election.candidates.len(),
                found: ballot.choices.len(),
            });
        }
    }

    let mut aggregated = Vec::with_capacity(election.candidates.len());
    for slot in 0..election.candidates.len() {
        let column: Vec<Ciphertext> = ballots
            .iter()
            .map(|ballot| ballot.choices[slot].clone())
            .collect();
        aggregated.push(election.public_key.aggregate(&column, deadline)?);
    }
    Ok(aggregated)
}

fn combine_counts(
    election: &Election,
    commitments: &ShareCommitments,
    quorum: &[PartialDecryptionRecord],
    aggregated: &[Ciphertext],
    total_ballots: u64,
) -> Result<(Vec<u64>, Vec<u8>), Error> {
    let bound = BigUint::from(total_ballots);
    let mut counts = Vec::with_capacity(aggregated.len());

    for slot in 0..aggregated.len() {
        let selections: Vec<(u8, BigUint)> = quorum
            .iter()
            .map(|record| {
                record
                    .partial
                    .values
                    .get(slot)
                    .cloned()
                    .map(|value| (record.partial.trustee_index, value))
                    .ok_or_else(|| Error::Storage("partial decryption vector too short".into()))
            })
            .collect::<Result<_, _>>()?;

        let plaintext = combine(&election.public_key, commitments, &selections, Some(&bound))?;
        counts.push(
            plaintext
                .to_u64()
                .ok_or(Error::Crypto(CryptoError::PlaintextOverflow))?,
        );
    }

    let total: u64 = counts.iter().sum();
    if total > total_ballots {
        return Err(CryptoError::PlaintextOverflow.into());
    }

    let indices: Vec<u8> = quorum
        .iter()
        .map(|record| record.partial.trustee_index)
        .collect();
    Ok((counts, indices))
}

fn compute_result(
    election: &Election,
    commitments: &ShareCommitments,
    quorum: &[PartialDecryptionRecord],
    aggregated: &[Ciphertext],
    total_ballots: u64,
) -> Result<ElectionResult, Error> {
    let (counts, indices) = combine_counts(election, commitments, quorum, aggregated, total_ballots)?;

    let hash = verification_hash(election.id, &election.public_key, aggregated, &counts, &indices)?;
    let tally: IndexMap<String, u64> = election
        .candidates
        .iter()
        .cloned()
        .zip(counts.iter().copied())
        .collect();

    Ok(ElectionResult {
        election_id: election.id,
        total_votes: counts.iter().sum(),
        tally,
        verification_hash: hash,
        blockchain_tx_hash: None,
        is_verified: false,
        finalized_at: Utc::now(),
    })
}
