use crate::crypto::Ciphertext;
use crate::Error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// States of a tallying session. A session only ever moves forward
/// through this list; `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initiated,
    Aggregating,
    Decrypting,
    Finalizing,
    Completed,
    Failed,
}

impl SessionState {
    fn rank(&self) -> u8 {
        match self {
            SessionState::Initiated => 0,
            SessionState::Aggregating => 1,
            SessionState::Decrypting => 2,
            SessionState::Finalizing => 3,
            SessionState::Completed => 4,
            SessionState::Failed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SessionState::Initiated => "initiated",
            SessionState::Aggregating => "aggregating",
            SessionState::Decrypting => "decrypting",
            SessionState::Finalizing => "finalizing",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// The run-once coordination record for decrypting one election's
/// aggregated ciphertext. One session per election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallyingSession {
    pub election_id: Uuid,
    pub state: SessionState,
    pub aggregated: Option<Vec<Ciphertext>>,
    pub required_trustees: u8,
    pub completed_trustees: u8,
    pub total_ballots: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl TallyingSession {
    pub fn new(election_id: Uuid, required_trustees: u8, total_ballots: u64) -> Self {
        TallyingSession {
            election_id,
            state: SessionState::Initiated,
            aggregated: None,
            required_trustees,
            completed_trustees: 0,
            total_ballots,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    /// Moves the session forward. Backwards transitions and transitions
    /// out of a terminal state are rejected; `Failed` is reachable from
    /// every non-terminal state.
    pub fn advance(&mut self, to: SessionState) -> Result<(), Error> {
        let allowed = if to == SessionState::Failed {
            !self.state.is_terminal()
        } else {
            !self.state.is_terminal() && to.rank() > self.state.rank()
        };
        if !allowed {
            return Err(Error::WrongState {
                expected: self.state,
                found: to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn expect_state(&self, expected: SessionState) -> Result<(), Error> {
        if self.state != expected {
            return Err(Error::WrongState {
                expected,
                found: self.state,
            });
        }
        Ok(())
    }

    pub fn can_finalize(&self) -> bool {
        self.state == SessionState::Decrypting
            && self.completed_trustees >= self.required_trustees
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            election_id: self.election_id,
            state: self.state,
            total_ballots: self.total_ballots,
            required_trustees: self.required_trustees,
            completed_trustees: self.completed_trustees,
            can_finalize: self.can_finalize(),
            error_message: self.error_message.clone(),
        }
    }
}

/// What callers get back from tallying operations: enough to drive a
/// UI or poll for progress, without the ciphertext payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub election_id: Uuid,
    pub state: SessionState,
    pub total_ballots: u64,
    pub required_trustees: u8,
    pub completed_trustees: u8,
    pub can_finalize: bool,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TallyingSession {
        TallyingSession::new(Uuid::new_v4(), 2, 3)
    }

    #[test]
    fn forward_transitions_are_allowed() {
        let mut s = session();
        s.advance(SessionState::Aggregating).unwrap();
        s.advance(SessionState::Decrypting).unwrap();
        s.advance(SessionState::Finalizing).unwrap();
        s.advance(SessionState::Completed).unwrap();
    }

    #[test]
    fn backward_transitions_are_rejected() {
        let mut s = session();
        s.advance(SessionState::Decrypting).unwrap();
        assert!(s.advance(SessionState::Aggregating).is_err());
        assert!(s.advance(SessionState::Initiated).is_err());
        assert_eq!(s.state, SessionState::Decrypting);
    }

    #[test]
    fn failed_is_reachable_from_any_non_terminal_state() {
        let mut s = session();
        s.advance(SessionState::Decrypting).unwrap();
        s.advance(SessionState::Failed).unwrap();
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut s = session();
        s.advance(SessionState::Completed).unwrap();
        assert!(s.advance(SessionState::Failed).is_err());

        let mut s = session();
        s.advance(SessionState::Failed).unwrap();
        assert!(s.advance(SessionState::Completed).is_err());
        assert!(s.advance(SessionState::Failed).is_err());
    }

    #[test]
    fn snapshot_reports_finalizability() {
        let mut s = session();
        s.advance(SessionState::Decrypting).unwrap();
        assert!(!s.snapshot().can_finalize);
        s.completed_trustees = 2;
        assert!(s.snapshot().can_finalize);
    }
}
