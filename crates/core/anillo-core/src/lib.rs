//! Core types and synchronization primitives for the Anillo kernel.
//!
//! This crate contains the host-testable foundation shared by every other
//! kernel crate: typed addresses, page/frame abstractions, resource IDs,
//! the kernel-wide [`Status`](status::Status) taxonomy, interrupt
//! discipline, spin locks, per-CPU storage, and the logging macros.
//!
//! By living outside the kernel crate, these types can be tested with
//! plain `cargo test` on the host without a kernel target. Architecture
//! hooks (interrupt masking, CPU identification) are routed through
//! registered function pointers with host fallbacks.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod cpu_local;
pub mod id;
pub mod log;
pub mod page;
pub mod status;
pub mod sync;
