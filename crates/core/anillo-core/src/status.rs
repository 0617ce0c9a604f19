//! The kernel-wide status taxonomy.
//!
//! Every fallible operation in the kernel returns [`Result<T, Status>`]
//! (aliased as [`KResult`]). Success is the `Ok` side; [`Status`] enumerates
//! the failure kinds shared across all subsystem boundaries, including the
//! syscall ABI. There are no subsystem-private error types: callers either
//! propagate with `?` or translate to a more specific kind.

use core::fmt;

/// Result alias used throughout the kernel.
pub type KResult<T = ()> = core::result::Result<T, Status>;

/// A failure status.
///
/// The discriminants are stable: they are the values carried across the
/// syscall boundary (negated). Zero is reserved for success and never
/// appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum Status {
    /// Malformed or out-of-range input.
    InvalidArgument = 1,
    /// Resource pressure; try again later.
    TemporaryOutage = 2,
    /// The resource is gone forever.
    PermanentOutage = 3,
    /// Operation not available in this build.
    Unsupported = 4,
    /// Lookup failed.
    NoSuchResource = 5,
    /// The operation is redundant; it is already underway or done.
    AlreadyInProgress = 6,
    /// Aborted by a peer.
    Cancelled = 7,
    /// Size above the acceptable range.
    TooBig = 8,
    /// Size below the acceptable range.
    TooSmall = 9,
    /// Corrupt data detected.
    InvalidChecksum = 10,
    /// Retry the same call; observed state changed under the caller.
    ShouldRestart = 11,
    /// Caller not authorised.
    Forbidden = 12,
    /// Stronger than [`TemporaryOutage`](Self::TemporaryOutage), weaker than
    /// [`PermanentOutage`](Self::PermanentOutage).
    ResourceUnavailable = 13,
    /// The operation would block and blocking was not allowed.
    NoWait = 14,
    /// A deadline was hit.
    TimedOut = 15,
    /// Preempted by a signal; the wait itself was not consumed.
    Signalled = 16,
    /// Terminal failure.
    Aborted = 17,
}

impl Status {
    /// Returns the stable numeric code.
    #[inline]
    pub const fn code(self) -> i64 {
        self as i64
    }

    /// Reconstructs a status from its stable code.
    ///
    /// Returns `None` for zero (success) and unknown codes.
    pub const fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => Self::InvalidArgument,
            2 => Self::TemporaryOutage,
            3 => Self::PermanentOutage,
            4 => Self::Unsupported,
            5 => Self::NoSuchResource,
            6 => Self::AlreadyInProgress,
            7 => Self::Cancelled,
            8 => Self::TooBig,
            9 => Self::TooSmall,
            10 => Self::InvalidChecksum,
            11 => Self::ShouldRestart,
            12 => Self::Forbidden,
            13 => Self::ResourceUnavailable,
            14 => Self::NoWait,
            15 => Self::TimedOut,
            16 => Self::Signalled,
            17 => Self::Aborted,
            _ => return None,
        })
    }

    /// Returns a short human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid argument",
            Self::TemporaryOutage => "temporary outage",
            Self::PermanentOutage => "permanent outage",
            Self::Unsupported => "unsupported",
            Self::NoSuchResource => "no such resource",
            Self::AlreadyInProgress => "already in progress",
            Self::Cancelled => "cancelled",
            Self::TooBig => "too big",
            Self::TooSmall => "too small",
            Self::InvalidChecksum => "invalid checksum",
            Self::ShouldRestart => "should restart",
            Self::Forbidden => "forbidden",
            Self::ResourceUnavailable => "resource unavailable",
            Self::NoWait => "would block",
            Self::TimedOut => "timed out",
            Self::Signalled => "signalled",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        for code in 1..=17 {
            let status = Status::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn zero_is_not_a_status() {
        assert_eq!(Status::from_code(0), None);
    }

    #[test]
    fn unknown_code() {
        assert_eq!(Status::from_code(999), None);
        assert_eq!(Status::from_code(-1), None);
    }

    #[test]
    fn display_names() {
        assert_eq!(format!("{}", Status::TimedOut), "timed out");
        assert_eq!(format!("{}", Status::ShouldRestart), "should restart");
    }

    #[test]
    fn kresult_question_mark() {
        fn inner() -> KResult<u32> {
            Err(Status::NoSuchResource)
        }
        fn outer() -> KResult<u32> {
            let v = inner()?;
            Ok(v + 1)
        }
        assert_eq!(outer(), Err(Status::NoSuchResource));
    }
}
