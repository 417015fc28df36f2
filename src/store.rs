use crate::audit::AuditEntry;
use crate::ballot::EncryptedBallot;
use crate::election::{Election, ElectionState, TrusteeRecord};
use crate::result::ElectionResult;
use crate::session::TallyingSession;
use crate::threshold::{PartialDecryption, ShareCommitments};
use crate::Error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// One trustee's persisted partial decryption for an election.
/// Unique per (election, trustee); a row that failed proof
/// verification is kept with `verified = false` and may be replaced
/// by a corrected resubmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialDecryptionRecord {
    pub election_id: Uuid,
    pub trustee_id: Uuid,
    pub partial: PartialDecryption,
    pub verified: bool,
    pub submitted_at: DateTime<Utc>,
}

/// The persistence contract the tally engine runs against. Any
/// relational engine can sit behind this; the crate ships an
/// in-memory implementation for tests and embedding.
///
/// Implementations must enforce the uniqueness constraints spelled
/// out per method, and must treat the audit log as append-only.
pub trait Store {
    fn put_election(&mut self, election: Election) -> Result<(), Error>;
    fn election(&self, id: Uuid) -> Result<Election, Error>;
    fn set_election_state(&mut self, id: Uuid, state: ElectionState) -> Result<(), Error>;

    fn put_trustee(&mut self, trustee: TrusteeRecord) -> Result<(), Error>;
    fn trustee_by_index(&self, index: u8) -> Result<TrusteeRecord, Error>;
    fn trustees(&self) -> Result<Vec<TrusteeRecord>, Error>;

    fn put_commitments(&mut self, commitments: ShareCommitments) -> Result<(), Error>;
    fn commitments(&self) -> Result<ShareCommitments, Error>;

    /// Rejects a ballot whose nonce was already seen (replay guard).
    fn put_ballot(&mut self, ballot: EncryptedBallot) -> Result<(), Error>;
    fn ballots(&self, election_id: Uuid) -> Result<Vec<EncryptedBallot>, Error>;
    fn mark_ballots_tallied(&mut self, election_id: Uuid) -> Result<(), Error>;

    /// Enforces UNIQUE(election_id, trustee_index): a verified row is
    /// never replaced; an unverified row is superseded by a
    /// resubmission.
    fn put_partial_decryption(&mut self, record: PartialDecryptionRecord) -> Result<(), Error>;
    fn partial_decryptions(&self, election_id: Uuid) -> Result<Vec<PartialDecryptionRecord>, Error>;

    /// Rejects a second session for the same election.
    fn put_session(&mut self, session: TallyingSession) -> Result<(), Error>;
    fn session(&self, election_id: Uuid) -> Result<TallyingSession, Error>;
    fn update_session(&mut self, session: TallyingSession) -> Result<(), Error>;

    fn put_result(&mut self, result: ElectionResult) -> Result<(), Error>;
    fn result(&self, election_id: Uuid) -> Result<ElectionResult, Error>;
    fn update_result(&mut self, result: ElectionResult) -> Result<(), Error>;

    /// Append-only: there is deliberately no update or delete.
    fn append_audit(&mut self, entry: AuditEntry) -> Result<(), Error>;
    fn audit_entries(&self, election_id: Uuid) -> Result<Vec<AuditEntry>, Error>;
}

/// A simple store backed by in-memory BTreeMaps.
#[derive(Default, Clone)]
pub struct MemStore {
    elections: BTreeMap<Uuid, Election>,
    trustees: BTreeMap<u8, TrusteeRecord>,
    commitments: Option<ShareCommitments>,
    ballots: BTreeMap<Uuid, Vec<EncryptedBallot>>,
    seen_nonces: BTreeSet<String>,
    partials: BTreeMap<(Uuid, u8), PartialDecryptionRecord>,
    sessions: BTreeMap<Uuid, TallyingSession>,
    results: BTreeMap<Uuid, ElectionResult>,
    audit: Vec<AuditEntry>,
}

impl Store for MemStore {
    fn put_election(&mut self, election: Election) -> Result<(), Error> {
        self.elections.insert(election.id, election);
        Ok(())
    }

    fn election(&self, id: Uuid) -> Result<Election, Error> {
        self.elections
            .get(&id)
            .cloned()
            .ok_or(Error::ElectionNotFound(id))
    }

    fn set_election_state(&mut self, id: Uuid, state: ElectionState) -> Result<(), Error> {
        let election = self
            .elections
            .get_mut(&id)
            .ok_or(Error::ElectionNotFound(id))?;
        election.state = state;
        Ok(())
    }

    fn put_trustee(&mut self, trustee: TrusteeRecord) -> Result<(), Error> {
        self.trustees.insert(trustee.index, trustee);
        Ok(())
    }

    fn trustee_by_index(&self, index: u8) -> Result<TrusteeRecord, Error> {
        self.trustees
            .get(&index)
            .cloned()
            .ok_or(Error::TrusteeNotFound(index))
    }

    fn trustees(&self) -> Result<Vec<TrusteeRecord>, Error> {
        Ok(self.trustees.values().cloned().collect())
    }

    fn put_commitments(&mut self, commitments: ShareCommitments) -> Result<(), Error> {
        self.commitments = Some(commitments);
        Ok(())
    }

    fn commitments(&self) -> Result<ShareCommitments, Error> {
        self.commitments
            .clone()
            .ok_or_else(|| Error::Storage("share commitments not published".into()))
    }

    fn put_ballot(&mut self, ballot: EncryptedBallot) -> Result<(), Error> {
        if !self.seen_nonces.insert(ballot.nonce.clone()) {
            return Err(Error::DuplicateNonce);
        }
        self.ballots
            .entry(ballot.election_id)
            .or_default()
            .push(ballot);
        Ok(())
    }

    fn ballots(&self, election_id: Uuid) -> Result<Vec<EncryptedBallot>, Error> {
        Ok(self.ballots.get(&election_id).cloned().unwrap_or_default())
    }

    fn mark_ballots_tallied(&mut self, election_id: Uuid) -> Result<(), Error> {
        if let Some(ballots) = self.ballots.get_mut(&election_id) {
            for ballot in ballots {
                ballot.is_tallied = true;
            }
        }
        Ok(())
    }

    fn put_partial_decryption(&mut self, record: PartialDecryptionRecord) -> Result<(), Error> {
        let key = (record.election_id, record.partial.trustee_index);
        if let Some(existing) = self.partials.get(&key) {
            if existing.verified {
                return Err(Error::DuplicatePartialDecryption(
                    record.partial.trustee_index,
                ));
            }
        }
        self.partials.insert(key, record);
        Ok(())
    }

    fn partial_decryptions(&self, election_id: Uuid) -> Result<Vec<PartialDecryptionRecord>, Error> {
        Ok(self
            .partials
            .range((election_id, u8::MIN)..=(election_id, u8::MAX))
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn put_session(&mut self, session: TallyingSession) -> Result<(), Error> {
        if self.sessions.contains_key(&session.election_id) {
            return Err(Error::SessionExists(session.election_id));
        }
        self.sessions.insert(session.election_id, session);
        Ok(())
    }

    fn session(&self, election_id: Uuid) -> Result<TallyingSession, Error> {
        self.sessions
            .get(&election_id)
            .cloned()
            .ok_or(Error::SessionNotFound(election_id))
    }

    fn update_session(&mut self, session: TallyingSession) -> Result<(), Error> {
        if !self.sessions.contains_key(&session.election_id) {
            return Err(Error::SessionNotFound(session.election_id));
        }
        self.sessions.insert(session.election_id, session);
        Ok(())
    }

    fn put_result(&mut self, result: ElectionResult) -> Result<(), Error> {
        if self.results.contains_key(&result.election_id) {
            return Err(Error::Storage("result already exists".into()));
        }
        self.results.insert(result.election_id, result);
        Ok(())
    }

    fn result(&self, election_id: Uuid) -> Result<ElectionResult, Error> {
        self.results
            .get(&election_id)
            .cloned()
            .ok_or(Error::ResultNotFound(election_id))
    }

    fn update_result(&mut self, result: ElectionResult) -> Result<(), Error> {
        if !self.results.contains_key(&result.election_id) {
            return Err(Error::ResultNotFound(result.election_id));
        }
        self.results.insert(result.election_id, result);
        Ok(())
    }

    fn append_audit(&mut self, entry: AuditEntry) -> Result<(), Error> {
        self.audit.push(entry);
        Ok(())
    }

    fn audit_entries(&self, election_id: Uuid) -> Result<Vec<AuditEntry>, Error> {
        Ok(self
            .audit
            .iter()
            .filter(|entry| entry.election_id == Some(election_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditStatus;
    use crate::crypto::Ciphertext;
    use num_bigint::BigUint;

    fn ballot(election_id: Uuid, nonce: &str) -> EncryptedBallot {
        EncryptedBallot::new(
            election_id,
            vec![Ciphertext(BigUint::from(1u8))],
            nonce,
        )
    }

    #[test]
    fn nonce_replay_is_rejected() {
        let mut store = MemStore::default();
        let election_id = Uuid::new_v4();
        store.put_ballot(ballot(election_id, "n-1")).unwrap();
        assert!(matches!(
            store.put_ballot(ballot(election_id, "n-1")),
            Err(Error::DuplicateNonce)
        ));
        assert_eq!(store.ballots(election_id).unwrap().len(), 1);
    }

    #[test]
    fn second_session_for_election_conflicts() {
        let mut store = MemStore::default();
        let election_id = Uuid::new_v4();
        store
            .put_session(TallyingSession::new(election_id, 2, 3))
            .unwrap();
        assert!(matches!(
            store.put_session(TallyingSession::new(election_id, 2, 3)),
            Err(Error::SessionExists(_))
        ));
    }

    #[test]
    fn verified_partial_rows_are_immutable() {
        let mut store = MemStore::default();
        let election_id = Uuid::new_v4();
        let record = PartialDecryptionRecord {
            election_id,
            trustee_id: Uuid::new_v4(),
            partial: PartialDecryption {
                trustee_index: 1,
                values: vec![],
                proofs: vec![],
            },
            verified: true,
            submitted_at: Utc::now(),
        };
        store.put_partial_decryption(record.clone()).unwrap();
        assert!(matches!(
            store.put_partial_decryption(record),
            Err(Error::DuplicatePartialDecryption(1))
        ));
    }

    #[test]
    fn unverified_partial_rows_may_be_replaced() {
        let mut store = MemStore::default();
        let election_id = Uuid::new_v4();
        let mut record = PartialDecryptionRecord {
            election_id,
            trustee_id: Uuid::new_v4(),
            partial: PartialDecryption {
                trustee_index: 1,
                values: vec![],
                proofs: vec![],
            },
            verified: false,
            submitted_at: Utc::now(),
        };
        store.put_partial_decryption(record.clone()).unwrap();
        record.verified = true;
        store.put_partial_decryption(record).unwrap();
        let rows = store.partial_decryptions(election_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].verified);
    }

    #[test]
    fn audit_is_append_only_and_filtered_by_election() {
        let mut store = MemStore::default();
        let election_id = Uuid::new_v4();
        store
            .append_audit(AuditEntry::new(
                Some(election_id),
                "start_tally",
                "system",
                serde_json::json!({}),
                AuditStatus::Success,
            ))
            .unwrap();
        store
            .append_audit(AuditEntry::new(
                None,
                "register_trustee",
                "operator",
                serde_json::json!({}),
                AuditStatus::Success,
            ))
            .unwrap();
        assert_eq!(store.audit_entries(election_id).unwrap().len(), 1);
        assert_eq!(store.audit_entries(Uuid::new_v4()).unwrap().len(), 0);
    }
}
