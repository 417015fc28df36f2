use crate::Error;

use std::time::{Duration, Instant};

/// A wall-clock deadline for long-running core operations (key generation,
/// aggregation over large ballot sets).
///
/// Operations check the deadline at arithmetic loop boundaries and abort
/// with [`Error::DeadlineExpired`] without leaving partial mutations
/// behind; the caller observes the same state as if the call had never
/// been made.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Deadline {
            at: Instant::now() + duration,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Returns `Err` if the deadline has passed, tagging the failing
    /// operation for the error message.
    pub fn check(&self, operation: &'static str) -> Result<(), Error> {
        if self.expired() {
            Err(Error::DeadlineExpired(operation))
        } else {
            Ok(())
        }
    }
}

/// Convenience for optional deadlines threaded through loops.
pub(crate) fn check_deadline(
    deadline: Option<&Deadline>,
    operation: &'static str,
) -> Result<(), Error> {
    match deadline {
        Some(d) => d.check(operation),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_in_the_future_passes() {
        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(!deadline.expired());
        assert!(deadline.check("test").is_ok());
    }

    #[test]
    fn elapsed_deadline_fails() {
        let deadline = Deadline::after(Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(deadline.expired());
        assert!(matches!(
            deadline.check("keygen"),
            Err(Error::DeadlineExpired("keygen"))
        ));
    }
}
