//! Useful utilities that don't really belong anywhere else: mostly the one bounded busy-wait that
//! every hardware poll in the driver goes through.

use std::time::{Duration, Instant};

use log::trace;
use retry::{delay::NoDelay, retry};

use crate::error::{NfcError, Result};

/// A point in time after which hardware polls give up
#[derive(Debug, Copy, Clone)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// An endless stream of zero delays that dries up once the deadline passes
    fn polls(self) -> impl Iterator<Item = Duration> {
        NoDelay.take_while(move |_| !self.expired())
    }
}

/// Poll `check` until it produces a value, or fail with `Timeout(what)` once `deadline` passes.
///
/// `check` always runs at least once, even against an expired deadline.
pub fn wait_for<T>(
    deadline: &Deadline,
    what: &'static str,
    mut check: impl FnMut() -> Option<T>,
) -> Result<T> {
    retry(deadline.polls(), || check().ok_or(())).map_err(|err| {
        trace!("gave up on {what} after {} polls", err.tries);
        NfcError::Timeout(what)
    })
}

/// Like [`wait_for`], for checks that only report whether the condition holds.
pub fn wait_until(deadline: &Deadline, what: &'static str, mut cond: impl FnMut() -> bool) -> Result<()> {
    wait_for(deadline, what, || cond().then_some(()))
}

#[test]
fn test_wait_for_value() {
    let mut polls = 0;
    let found = wait_for(&Deadline::after(Duration::from_secs(1)), "counter", || {
        polls += 1;
        (polls == 5).then_some(polls * 10)
    })
    .unwrap();
    assert_eq!(found, 50);
    assert_eq!(polls, 5);
}

#[test]
fn test_wait_for_timeout() {
    let deadline = Deadline::after(Duration::from_millis(5));
    let err = wait_until(&deadline, "nothing", || false).unwrap_err();
    assert!(err.is_timeout());
    assert!(deadline.expired());
}

#[test]
fn test_expired_deadline_still_polls_once() {
    let deadline = Deadline::after(Duration::ZERO);
    let mut polls = 0;
    wait_until(&deadline, "first try", || {
        polls += 1;
        true
    })
    .unwrap();
    assert_eq!(polls, 1);
}
