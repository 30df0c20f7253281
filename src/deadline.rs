//! Time deadlines for blocking operations.
//!
//! Every blocking call in this crate accepts an `Option<Deadline>`. `None`
//! means wait indefinitely. A zero deadline means try once and fail
//! immediately with `TimedOut` instead of blocking.

use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;

/// A time bound on a blocking operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Deadline {
    /// A duration measured from the moment the operation begins. Immune to
    /// system clock changes.
    Relative(Duration),
    /// An absolute wall-clock point. Subject to system clock changes.
    Absolute(SystemTime),
}

impl Deadline {
    /// A deadline that expires immediately, turning the operation into a
    /// non-blocking attempt.
    pub const fn zero() -> Deadline {
        Deadline::Relative(Duration::ZERO)
    }

    /// Builds a relative deadline from signed nanoseconds. Negative
    /// durations clamp to zero.
    pub fn from_nanos(nanos: i64) -> Deadline {
        if nanos <= 0 {
            Deadline::zero()
        } else {
            Deadline::Relative(Duration::from_nanos(nanos as u64))
        }
    }

    /// True if this deadline expires immediately.
    pub fn is_zero(&self) -> bool {
        match self {
            Deadline::Relative(d) => d.is_zero(),
            Deadline::Absolute(t) => *t <= SystemTime::now(),
        }
    }
}

impl From<Duration> for Deadline {
    fn from(d: Duration) -> Deadline {
        Deadline::Relative(d)
    }
}

impl From<SystemTime> for Deadline {
    fn from(t: SystemTime) -> Deadline {
        Deadline::Absolute(t)
    }
}

/// Tracks an optional deadline against the start of an operation.
///
/// Relative deadlines are measured from the instant this tracker is created,
/// which must be at the head of the blocking call.
#[derive(Debug)]
pub(crate) struct DeadlineTracker {
    deadline: Option<Deadline>,
    began: Instant,
}

impl DeadlineTracker {
    pub(crate) fn new(deadline: Option<Deadline>) -> DeadlineTracker {
        DeadlineTracker {
            deadline,
            began: Instant::now(),
        }
    }

    /// Time left before expiry. `None` means wait forever.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        match self.deadline {
            None => None,
            Some(Deadline::Relative(d)) => {
                Some(d.saturating_sub(self.began.elapsed()))
            }
            Some(Deadline::Absolute(t)) => Some(
                t.duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
            ),
        }
    }

    /// Returns `TimedOut` once the deadline has passed.
    pub(crate) fn check(&self) -> Result<()> {
        match self.remaining() {
            Some(d) if d.is_zero() => Err(Error::new(ErrorKind::TimedOut)),
            _ => Ok(()),
        }
    }
}
