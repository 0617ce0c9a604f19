//! Inter-process communication for the Anillo kernel.
//!
//! - [`channel`]: ordered bidirectional message queues with conversation
//!   tracking, attached-object handoff, and named server realms.
//! - [`futex`]: the kernel-mediated wait-on-address primitive, keyed on
//!   physical address so shared memory shares futexes across processes.
//! - [`monitor`]: the readiness multiplexer delivering channel, futex, and
//!   timeout events to a single waiter.
//!
//! Locking here follows one rule on top of the global order: wait-queue
//! operations (wake, park) never run while a channel or monitor state lock
//! is held.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod channel;
pub mod futex;
pub mod monitor;
