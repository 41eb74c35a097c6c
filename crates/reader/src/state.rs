//! Verification state shared between a reader and its files.

use crate::error::ErrorKind;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Trust decision for an archive handle.
///
/// Starts [`Unverified`](Self::Unverified). Every other state is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyState {
    /// Neither [`verify_toc`](crate::VerifiableReader::verify_toc) nor
    /// [`skip_verify`](crate::VerifiableReader::skip_verify) has been called.
    Unverified,
    /// TOC verification failed with this error. Nothing can be read.
    VerifyFailed(ErrorKind),
    /// TOC matched; every chunk is checked against its digest.
    Verified,
    /// Verification was explicitly disabled.
    SkipVerify,
}

/// Single-slot, first-write-wins cell for the earliest chunk verification
/// failure seen before the trust decision was made.
#[derive(Debug, Default)]
pub(crate) struct LastVerifyError {
    slot: Mutex<Option<ErrorKind>>,
    stored: Condvar,
}

impl LastVerifyError {
    /// Record `err` unless a failure is already latched. Returns whether this
    /// call stored it.
    pub(crate) fn store(&self, err: ErrorKind) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(err);
        self.stored.notify_all();
        true
    }

    pub(crate) fn load(&self) -> Option<ErrorKind> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Block until a failure is latched or `timeout` passes.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<ErrorKind> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let (slot, _) = self
            .stored
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn mismatch(id: u32) -> ErrorKind {
        ErrorKind::ChunkDigestMismatch {
            id,
            offset: 0,
            digest: "sha256:00".to_string(),
        }
    }

    #[test]
    fn test_first_write_wins() {
        let cell = LastVerifyError::default();
        assert_eq!(cell.load(), None);
        assert!(cell.store(mismatch(1)));
        assert!(!cell.store(mismatch(2)));
        assert_eq!(cell.load(), Some(mismatch(1)));
        // Reads don't consume the value.
        assert_eq!(cell.load(), Some(mismatch(1)));
    }

    #[test]
    fn test_wait_times_out() {
        let cell = LastVerifyError::default();
        let start = Instant::now();
        assert_eq!(cell.wait(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_wakes_on_store() {
        let cell = LastVerifyError::default();
        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(10));
                cell.store(mismatch(3));
            });
            assert_eq!(cell.wait(Duration::from_secs(10)), Some(mismatch(3)));
        });
    }
}
