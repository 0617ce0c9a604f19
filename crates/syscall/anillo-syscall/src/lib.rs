//! Single source of truth for Anillo syscall definitions.
//!
//! Provides:
//! - Syscall number constants (`SYS_*`); number 0 is reserved for the
//!   not-found handler.
//! - The ABI status encoding: a handler returns a non-negative payload on
//!   success or the negated [`Status`] code on failure.
//! - The [`SyscallHandler`] trait and [`dispatch`] function the kernel
//!   implements; the architecture trap stubs feed the raw registers in.
//!
//! # Register convention
//!
//! Up to six integer/pointer arguments, no floats:
//!
//! | | number | args | return | clobbered |
//! |---|---|---|---|---|
//! | x86_64 | `rax` | `rdi rsi rdx r10 r8 r9` | `rax` | `rcx r11` |
//! | aarch64 | `x8` | `x0`-`x5` | `x0` | — |

#![cfg_attr(not(test), no_std)]

use anillo_core::status::{KResult, Status};

// ---------------------------------------------------------------------------
// Syscall numbers
// ---------------------------------------------------------------------------

/// Reserved: dispatches to the not-found handler.
pub const SYS_NONE: usize = 0;

/// Terminates the calling thread.
pub const SYS_THREAD_EXIT: usize = 1;
/// Kills a thread by descriptor.
pub const SYS_THREAD_KILL: usize = 2;
/// Suspends a thread by descriptor.
pub const SYS_THREAD_SUSPEND: usize = 3;
/// Resumes a thread by descriptor.
pub const SYS_THREAD_RESUME: usize = 4;
/// Yields the calling thread's timeslice.
pub const SYS_THREAD_YIELD: usize = 5;
/// Returns the calling thread's id.
pub const SYS_THREAD_ID: usize = 6;

/// Allocates anonymous pages in the calling process's address space.
pub const SYS_MEMORY_ALLOCATE: usize = 7;
/// Frees pages previously allocated with [`SYS_MEMORY_ALLOCATE`].
pub const SYS_MEMORY_FREE: usize = 8;

/// Creates a shared memory mapping descriptor.
pub const SYS_MAPPING_CREATE: usize = 9;
/// Installs a view of a mapping into the calling process.
pub const SYS_MAPPING_INSERT: usize = 10;
/// Removes a previously installed view.
pub const SYS_MAPPING_REMOVE: usize = 11;
/// Moves an anonymous allocation's frames into a mapping.
pub const SYS_MAPPING_MOVE: usize = 12;
/// Binds a sub-range of one mapping into another.
pub const SYS_MAPPING_BIND: usize = 13;

/// Creates a channel pair, returning two descriptors.
pub const SYS_CHANNEL_CREATE_PAIR: usize = 14;
/// Sends a message on a channel descriptor.
pub const SYS_CHANNEL_SEND: usize = 15;
/// Receives a message from a channel descriptor.
pub const SYS_CHANNEL_RECEIVE: usize = 16;
/// Closes a channel descriptor's half.
pub const SYS_CHANNEL_CLOSE: usize = 17;
/// Connects to a named channel server.
pub const SYS_CHANNEL_CONNECT: usize = 18;

/// Waits on a user address.
pub const SYS_FUTEX_WAIT: usize = 19;
/// Wakes waiters of a user address.
pub const SYS_FUTEX_WAKE: usize = 20;

/// Creates a monitor descriptor.
pub const SYS_MONITOR_CREATE: usize = 21;
/// Adds an item to a monitor.
pub const SYS_MONITOR_ADD_ITEM: usize = 22;
/// Removes an item from a monitor.
pub const SYS_MONITOR_REMOVE_ITEM: usize = 23;
/// Polls a monitor for triggered items.
pub const SYS_MONITOR_POLL: usize = 24;
/// Closes a monitor.
pub const SYS_MONITOR_CLOSE: usize = 25;

/// Releases any descriptor.
pub const SYS_HANDLE_CLOSE: usize = 26;

/// Writes bytes to the kernel log.
pub const SYS_LOG_WRITE: usize = 27;

/// Number of defined syscalls (table size).
pub const SYSCALL_COUNT: usize = 28;

// ---------------------------------------------------------------------------
// Status encoding
// ---------------------------------------------------------------------------

/// Encodes a handler result into the ABI return register value.
///
/// Success payloads must fit in the non-negative `isize` range.
pub fn encode_result(result: KResult<usize>) -> isize {
    match result {
        Ok(value) => {
            debug_assert!(value as isize >= 0, "syscall payload overflows isize");
            value as isize
        }
        Err(status) => -(status.code() as isize),
    }
}

/// Decodes an ABI return register value back into a result.
///
/// Unknown negative codes decode to [`Status::Aborted`].
pub fn decode_result(raw: isize) -> KResult<usize> {
    if raw >= 0 {
        return Ok(raw as usize);
    }
    Err(Status::from_code(-raw as i64).unwrap_or(Status::Aborted))
}

// ---------------------------------------------------------------------------
// Kernel-side dispatch
// ---------------------------------------------------------------------------

/// The kernel's syscall surface.
///
/// One method per syscall; raw `usize` arguments exactly as they arrive in
/// the argument registers. Implementations validate and translate. All
/// methods return the encoded ABI value (see [`encode_result`]).
pub trait SyscallHandler {
    /// Called for out-of-range or unassigned syscall numbers.
    fn sys_none(&self, nr: usize) -> isize;

    fn sys_thread_exit(&self, status: usize) -> isize;
    fn sys_thread_kill(&self, thread: usize) -> isize;
    fn sys_thread_suspend(&self, thread: usize) -> isize;
    fn sys_thread_resume(&self, thread: usize) -> isize;
    fn sys_thread_yield(&self) -> isize;
    fn sys_thread_id(&self) -> isize;

    fn sys_memory_allocate(&self, page_count: usize, alignment: usize, flags: usize) -> isize;
    fn sys_memory_free(&self, address: usize, page_count: usize) -> isize;

    fn sys_mapping_create(&self, page_count: usize) -> isize;
    fn sys_mapping_insert(&self, mapping: usize, offset: usize, page_count: usize, flags: usize)
    -> isize;
    fn sys_mapping_remove(&self, address: usize) -> isize;
    fn sys_mapping_move(&self, address: usize, page_count: usize, offset: usize, mapping: usize)
    -> isize;
    fn sys_mapping_bind(
        &self,
        target: usize,
        target_offset: usize,
        source: usize,
        source_offset: usize,
        page_count: usize,
    ) -> isize;

    fn sys_channel_create_pair(&self, out_pair: usize) -> isize;
    fn sys_channel_send(&self, channel: usize, body_ptr: usize, body_len: usize, flags: usize)
    -> isize;
    fn sys_channel_receive(&self, channel: usize, buffer_ptr: usize, buffer_len: usize, flags: usize)
    -> isize;
    fn sys_channel_close(&self, channel: usize) -> isize;
    fn sys_channel_connect(&self, name_ptr: usize, name_len: usize) -> isize;

    fn sys_futex_wait(
        &self,
        address: usize,
        channel: usize,
        expected: usize,
        timeout_ns: usize,
    ) -> isize;
    fn sys_futex_wake(&self, address: usize, channel: usize, count: usize) -> isize;

    fn sys_monitor_create(&self) -> isize;
    fn sys_monitor_add_item(&self, monitor: usize, target: usize, events: usize, flags: usize)
    -> isize;
    fn sys_monitor_remove_item(&self, monitor: usize, item: usize) -> isize;
    fn sys_monitor_poll(&self, monitor: usize, out_ptr: usize, max: usize, timeout_ns: usize)
    -> isize;
    fn sys_monitor_close(&self, monitor: usize) -> isize;

    fn sys_handle_close(&self, handle: usize) -> isize;

    fn sys_log_write(&self, buffer_ptr: usize, buffer_len: usize) -> isize;
}

/// Routes a raw syscall to the handler.
///
/// `nr` is the syscall number register; `a0`..`a5` are the argument
/// registers in ABI order. Unknown numbers go to
/// [`sys_none`](SyscallHandler::sys_none).
pub fn dispatch<H: SyscallHandler + ?Sized>(
    handler: &H,
    nr: usize,
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
) -> isize {
    match nr {
        SYS_THREAD_EXIT => handler.sys_thread_exit(a0),
        SYS_THREAD_KILL => handler.sys_thread_kill(a0),
        SYS_THREAD_SUSPEND => handler.sys_thread_suspend(a0),
        SYS_THREAD_RESUME => handler.sys_thread_resume(a0),
        SYS_THREAD_YIELD => handler.sys_thread_yield(),
        SYS_THREAD_ID => handler.sys_thread_id(),
        SYS_MEMORY_ALLOCATE => handler.sys_memory_allocate(a0, a1, a2),
        SYS_MEMORY_FREE => handler.sys_memory_free(a0, a1),
        SYS_MAPPING_CREATE => handler.sys_mapping_create(a0),
        SYS_MAPPING_INSERT => handler.sys_mapping_insert(a0, a1, a2, a3),
        SYS_MAPPING_REMOVE => handler.sys_mapping_remove(a0),
        SYS_MAPPING_MOVE => handler.sys_mapping_move(a0, a1, a2, a3),
        SYS_MAPPING_BIND => handler.sys_mapping_bind(a0, a1, a2, a3, a4),
        SYS_CHANNEL_CREATE_PAIR => handler.sys_channel_create_pair(a0),
        SYS_CHANNEL_SEND => handler.sys_channel_send(a0, a1, a2, a3),
        SYS_CHANNEL_RECEIVE => handler.sys_channel_receive(a0, a1, a2, a3),
        SYS_CHANNEL_CLOSE => handler.sys_channel_close(a0),
        SYS_CHANNEL_CONNECT => handler.sys_channel_connect(a0, a1),
        SYS_FUTEX_WAIT => handler.sys_futex_wait(a0, a1, a2, a3),
        SYS_FUTEX_WAKE => handler.sys_futex_wake(a0, a1, a2),
        SYS_MONITOR_CREATE => handler.sys_monitor_create(),
        SYS_MONITOR_ADD_ITEM => handler.sys_monitor_add_item(a0, a1, a2, a3),
        SYS_MONITOR_REMOVE_ITEM => handler.sys_monitor_remove_item(a0, a1),
        SYS_MONITOR_POLL => handler.sys_monitor_poll(a0, a1, a2, a3),
        SYS_MONITOR_CLOSE => handler.sys_monitor_close(a0),
        SYS_HANDLE_CLOSE => handler.sys_handle_close(a0),
        SYS_LOG_WRITE => handler.sys_log_write(a0, a1),
        _ => {
            let _ = a5;
            handler.sys_none(nr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn encode_success() {
        assert_eq!(encode_result(Ok(0)), 0);
        assert_eq!(encode_result(Ok(42)), 42);
    }

    #[test]
    fn encode_failure_negates_code() {
        assert_eq!(
            encode_result(Err(Status::InvalidArgument)),
            -(Status::InvalidArgument.code() as isize)
        );
        assert_eq!(
            encode_result(Err(Status::TimedOut)),
            -(Status::TimedOut.code() as isize)
        );
    }

    #[test]
    fn decode_round_trip() {
        for status in [
            Status::InvalidArgument,
            Status::NoWait,
            Status::ShouldRestart,
            Status::Signalled,
        ] {
            assert_eq!(decode_result(encode_result(Err(status))), Err(status));
        }
        assert_eq!(decode_result(encode_result(Ok(7))), Ok(7));
    }

    #[test]
    fn decode_unknown_code_is_aborted() {
        assert_eq!(decode_result(-9999), Err(Status::Aborted));
    }

    /// Records which handler method ran.
    struct Recorder {
        last: RefCell<(&'static str, usize)>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                last: RefCell::new(("", 0)),
            }
        }

        fn note(&self, name: &'static str, arg: usize) -> isize {
            *self.last.borrow_mut() = (name, arg);
            0
        }
    }

    impl SyscallHandler for Recorder {
        fn sys_none(&self, nr: usize) -> isize {
            self.note("none", nr);
            -(Status::Unsupported.code() as isize)
        }
        fn sys_thread_exit(&self, status: usize) -> isize {
            self.note("thread_exit", status)
        }
        fn sys_thread_kill(&self, thread: usize) -> isize {
            self.note("thread_kill", thread)
        }
        fn sys_thread_suspend(&self, thread: usize) -> isize {
            self.note("thread_suspend", thread)
        }
        fn sys_thread_resume(&self, thread: usize) -> isize {
            self.note("thread_resume", thread)
        }
        fn sys_thread_yield(&self) -> isize {
            self.note("thread_yield", 0)
        }
        fn sys_thread_id(&self) -> isize {
            self.note("thread_id", 0)
        }
        fn sys_memory_allocate(&self, page_count: usize, _a: usize, _f: usize) -> isize {
            self.note("memory_allocate", page_count)
        }
        fn sys_memory_free(&self, address: usize, _n: usize) -> isize {
            self.note("memory_free", address)
        }
        fn sys_mapping_create(&self, page_count: usize) -> isize {
            self.note("mapping_create", page_count)
        }
        fn sys_mapping_insert(&self, mapping: usize, _o: usize, _n: usize, _f: usize) -> isize {
            self.note("mapping_insert", mapping)
        }
        fn sys_mapping_remove(&self, address: usize) -> isize {
            self.note("mapping_remove", address)
        }
        fn sys_mapping_move(&self, address: usize, _n: usize, _o: usize, _m: usize) -> isize {
            self.note("mapping_move", address)
        }
        fn sys_mapping_bind(
            &self,
            target: usize,
            _to: usize,
            _s: usize,
            _so: usize,
            _n: usize,
        ) -> isize {
            self.note("mapping_bind", target)
        }
        fn sys_channel_create_pair(&self, out_pair: usize) -> isize {
            self.note("channel_create_pair", out_pair)
        }
        fn sys_channel_send(&self, channel: usize, _p: usize, _l: usize, _f: usize) -> isize {
            self.note("channel_send", channel)
        }
        fn sys_channel_receive(&self, channel: usize, _p: usize, _l: usize, _f: usize) -> isize {
            self.note("channel_receive", channel)
        }
        fn sys_channel_close(&self, channel: usize) -> isize {
            self.note("channel_close", channel)
        }
        fn sys_channel_connect(&self, name_ptr: usize, _l: usize) -> isize {
            self.note("channel_connect", name_ptr)
        }
        fn sys_futex_wait(&self, address: usize, _c: usize, _e: usize, _t: usize) -> isize {
            self.note("futex_wait", address)
        }
        fn sys_futex_wake(&self, address: usize, _c: usize, _n: usize) -> isize {
            self.note("futex_wake", address)
        }
        fn sys_monitor_create(&self) -> isize {
            self.note("monitor_create", 0)
        }
        fn sys_monitor_add_item(&self, monitor: usize, _t: usize, _e: usize, _f: usize) -> isize {
            self.note("monitor_add_item", monitor)
        }
        fn sys_monitor_remove_item(&self, monitor: usize, _i: usize) -> isize {
            self.note("monitor_remove_item", monitor)
        }
        fn sys_monitor_poll(&self, monitor: usize, _o: usize, _m: usize, _t: usize) -> isize {
            self.note("monitor_poll", monitor)
        }
        fn sys_monitor_close(&self, monitor: usize) -> isize {
            self.note("monitor_close", monitor)
        }
        fn sys_handle_close(&self, handle: usize) -> isize {
            self.note("handle_close", handle)
        }
        fn sys_log_write(&self, buffer_ptr: usize, _l: usize) -> isize {
            self.note("log_write", buffer_ptr)
        }
    }

    #[test]
    fn dispatch_routes_by_number() {
        let recorder = Recorder::new();
        dispatch(&recorder, SYS_THREAD_EXIT, 3, 0, 0, 0, 0, 0);
        assert_eq!(*recorder.last.borrow(), ("thread_exit", 3));

        dispatch(&recorder, SYS_FUTEX_WAIT, 0x1000, 0, 0, 0, 0, 0);
        assert_eq!(*recorder.last.borrow(), ("futex_wait", 0x1000));

        dispatch(&recorder, SYS_MONITOR_POLL, 9, 0, 0, 0, 0, 0);
        assert_eq!(*recorder.last.borrow(), ("monitor_poll", 9));
    }

    #[test]
    fn unknown_number_goes_to_none() {
        let recorder = Recorder::new();
        let ret = dispatch(&recorder, 999, 0, 0, 0, 0, 0, 0);
        assert_eq!(*recorder.last.borrow(), ("none", 999));
        assert_eq!(decode_result(ret), Err(Status::Unsupported));
    }

    #[test]
    fn number_zero_is_reserved() {
        let recorder = Recorder::new();
        dispatch(&recorder, SYS_NONE, 0, 0, 0, 0, 0, 0);
        assert_eq!(*recorder.last.borrow(), ("none", 0));
    }
}
