//! Type-safe identifiers for kernel resources.
//!
//! These newtypes prevent accidental mixing of process IDs, thread IDs,
//! CPU IDs, descriptor IDs, conversation IDs, and timer IDs at compile time.

use core::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident($raw:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name($raw);

        impl $name {
            /// Creates a new identifier from the raw value.
            pub const fn new(val: $raw) -> Self {
                Self(val)
            }

            /// Returns the raw value.
            pub const fn as_raw(self) -> $raw {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id! {
    /// Process identifier.
    ProcessId(u64)
}

define_id! {
    /// Thread identifier.
    ThreadId(u64)
}

define_id! {
    /// CPU identifier (0 = bootstrap CPU).
    CpuId(u32)
}

define_id! {
    /// Per-process descriptor identifier (dense, reused after uninstall).
    DescriptorId(u64)
}

define_id! {
    /// Conversation identifier, monotonic within a channel pair.
    ///
    /// Zero means "no conversation"; the first reserved conversation is 1.
    ConversationId(u64)
}

define_id! {
    /// One-shot timer identifier.
    TimerId(u64)
}

impl ConversationId {
    /// The "not part of a conversation" sentinel.
    pub const NONE: Self = Self(0);

    /// Returns `true` if this is the no-conversation sentinel.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl CpuId {
    /// The bootstrap CPU.
    pub const BOOT: Self = Self(0);

    /// Returns the raw value as `usize` (convenience for indexing).
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl DescriptorId {
    /// Returns the raw value as `usize` (convenience for indexing).
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_id_roundtrip() {
        let pid = ProcessId::new(42);
        assert_eq!(pid.as_raw(), 42);
        assert_eq!(format!("{pid}"), "42");
    }

    #[test]
    fn thread_id_ordering() {
        assert!(ThreadId::new(1) < ThreadId::new(2));
    }

    #[test]
    fn conversation_id_none() {
        assert!(ConversationId::NONE.is_none());
        assert!(!ConversationId::new(1).is_none());
    }

    #[test]
    fn cpu_id_boot() {
        assert_eq!(CpuId::BOOT.as_raw(), 0);
        assert_eq!(CpuId::new(3).as_usize(), 3);
    }

    #[test]
    fn descriptor_id_usize() {
        assert_eq!(DescriptorId::new(7).as_usize(), 7);
    }
}
