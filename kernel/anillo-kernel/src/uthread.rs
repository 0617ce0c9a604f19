//! Userspace thread attachment.
//!
//! A kernel thread becomes a user thread by attaching a [`UserThread`]
//! record: the user entry point and stack, the owning process (and so the
//! address space), and the syscall handler configuration. The first
//! return to userspace jumps to the configured entry with the user stack
//! pointer; afterwards the architecture trap stubs save the user context
//! into the thread and enter [`enter_syscall`].

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, Ordering};

use anillo_core::addr::VirtAddr;
use anillo_core::id::ThreadId;
use anillo_core::status::{KResult, Status};
use anillo_core::sync::SpinLock;
use anillo_sched::thread::Thread;

use crate::proc::Process;

/// Raw syscall arguments as delivered by the trap stub.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallArgs {
    /// Syscall number register.
    pub nr: usize,
    /// Argument registers in ABI order.
    pub args: [usize; 6],
}

/// A syscall handler: receives the handler context and the raw arguments,
/// returns the encoded ABI value.
pub type SyscallHandlerFn = fn(usize, &SyscallArgs) -> isize;

/// User-mode state attached to a kernel thread.
#[derive(Debug)]
pub struct UserThread {
    thread: Arc<Thread>,
    process: Weak<Process>,
    user_entry: VirtAddr,
    user_stack: VirtAddr,
    handler: SyscallHandlerFn,
    handler_context: usize,
    entered_user: AtomicBool,
}

impl UserThread {
    /// The carrying kernel thread.
    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    /// The owning process, while it is alive.
    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    /// The configured user entry point.
    pub fn user_entry(&self) -> VirtAddr {
        self.user_entry
    }

    /// The configured user stack top.
    pub fn user_stack(&self) -> VirtAddr {
        self.user_stack
    }

    /// Whether the thread has entered userspace at least once.
    pub fn has_entered_user(&self) -> bool {
        self.entered_user.load(Ordering::Acquire)
    }
}

/// Attached user threads by thread id.
static USER_THREADS: SpinLock<BTreeMap<u64, Arc<UserThread>>> = SpinLock::new(BTreeMap::new());

/// Default syscall handler: the kernel's own dispatch table.
fn kernel_handler(_context: usize, args: &SyscallArgs) -> isize {
    crate::syscall::dispatch_current(args)
}

/// Attaches user context to a kernel thread.
///
/// The thread joins the process; the first return to userspace jumps to
/// `user_entry` with `user_stack`. Syscalls from the thread go to
/// `handler` (the kernel's own dispatcher if `None`).
pub fn register(
    thread: &Arc<Thread>,
    process: &Arc<Process>,
    user_stack: VirtAddr,
    user_entry: VirtAddr,
    handler: Option<(SyscallHandlerFn, usize)>,
) -> KResult<Arc<UserThread>> {
    if user_stack.is_kernel_half() || user_entry.is_kernel_half() {
        return Err(Status::Forbidden);
    }
    process.attach_thread(thread)?;

    let (handler, handler_context) = handler.unwrap_or((kernel_handler, 0));
    let user_thread = Arc::new(UserThread {
        thread: thread.clone(),
        process: Arc::downgrade(process),
        user_entry,
        user_stack,
        handler,
        handler_context,
        entered_user: AtomicBool::new(false),
    });

    let mut table = USER_THREADS.lock();
    if table.contains_key(&thread.id().as_raw()) {
        // Undo the attach; the record was never published.
        drop(table);
        let _ = process.detach_thread(thread);
        return Err(Status::AlreadyInProgress);
    }
    table.insert(thread.id().as_raw(), user_thread.clone());
    Ok(user_thread)
}

/// Resolves the user context of a thread, if any.
pub fn for_thread(id: ThreadId) -> Option<Arc<UserThread>> {
    USER_THREADS.lock().get(&id.as_raw()).cloned()
}

/// Drops a thread's user context (process teardown, thread death).
pub fn unregister(id: ThreadId) {
    USER_THREADS.lock().remove(&id.as_raw());
}

/// Syscall entry: called by the architecture trap stub after it saved the
/// user context into the calling thread.
///
/// Resolves the calling thread's handler, runs it, and decides whether
/// the thread may return to userspace (a dying thread must not execute
/// further user instructions).
pub fn enter_syscall(args: &SyscallArgs) -> isize {
    let Some(current) = anillo_sched::run::current_thread() else {
        return anillo_syscall::encode_result(Err(Status::Forbidden));
    };
    let Some(user_thread) = for_thread(current.id()) else {
        return anillo_syscall::encode_result(Err(Status::Forbidden));
    };

    let ret = (user_thread.handler)(user_thread.handler_context, args);

    // Return-to-user preemption point; a pending kill ends the thread
    // here instead of letting it back into userspace.
    if current.is_dying() {
        unregister(current.id());
        anillo_sched::run::yield_now();
    }
    ret
}

/// Marks the first user entry (called by the return-to-user stub).
pub fn mark_entered(id: ThreadId) {
    if let Some(user_thread) = for_thread(id) {
        user_thread.entered_user.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::tests_support::make_test_process;
    use anillo_sched::thread::SPIN_MANAGER;

    fn make_thread() -> Arc<Thread> {
        Thread::new("uthread-test", &SPIN_MANAGER, None)
    }

    #[test]
    fn register_attaches_to_process() {
        let (process, _frames) = make_test_process();
        let thread = make_thread();

        let user_thread = register(
            &thread,
            &process,
            VirtAddr::new(0x7FFF_F000),
            VirtAddr::new(0x40_0000),
            None,
        )
        .unwrap();

        assert_eq!(user_thread.user_entry().as_u64(), 0x40_0000);
        assert!(!user_thread.has_entered_user());
        assert!(for_thread(thread.id()).is_some());
        assert!(
            crate::proc::process_of(thread.id()).is_some_and(|p| Arc::ptr_eq(&p, &process))
        );

        // A second attach is redundant.
        let other = make_thread();
        register(
            &other,
            &process,
            VirtAddr::new(0x7FFF_F000),
            VirtAddr::new(0x40_0000),
            None,
        )
        .unwrap();
        assert_eq!(
            register(
                &other,
                &process,
                VirtAddr::new(0x7FFF_F000),
                VirtAddr::new(0x40_0000),
                None,
            )
            .unwrap_err(),
            Status::AlreadyInProgress
        );
    }

    #[test]
    fn kernel_half_addresses_are_forbidden() {
        let (process, _frames) = make_test_process();
        let thread = make_thread();
        assert_eq!(
            register(
                &thread,
                &process,
                VirtAddr::new(0xFFFF_8000_0000_0000),
                VirtAddr::new(0x40_0000),
                None,
            )
            .unwrap_err(),
            Status::Forbidden
        );
    }

    #[test]
    fn user_thread_blocks_detach() {
        let (process, _frames) = make_test_process();
        let thread = make_thread();
        register(
            &thread,
            &process,
            VirtAddr::new(0x7FFF_F000),
            VirtAddr::new(0x40_0000),
            None,
        )
        .unwrap();

        // A thread with user context cannot be detached (policy: a user
        // thread cannot outlive its address space).
        assert_eq!(
            process.detach_thread(&thread).unwrap_err(),
            Status::Forbidden
        );

        unregister(thread.id());
        process.detach_thread(&thread).unwrap();
    }

    #[test]
    fn custom_handler_receives_calls() {
        use std::sync::atomic::AtomicUsize;
        static SEEN_NR: AtomicUsize = AtomicUsize::new(0);

        fn capture(context: usize, args: &SyscallArgs) -> isize {
            SEEN_NR.store(args.nr + context, Ordering::SeqCst);
            7
        }

        let (process, _frames) = make_test_process();
        let thread = make_thread();
        let user_thread = register(
            &thread,
            &process,
            VirtAddr::new(0x7FFF_F000),
            VirtAddr::new(0x40_0000),
            Some((capture, 100)),
        )
        .unwrap();

        let args = SyscallArgs {
            nr: 5,
            args: [0; 6],
        };
        let ret = (user_thread.handler)(user_thread.handler_context, &args);
        assert_eq!(ret, 7);
        assert_eq!(SEEN_NR.load(Ordering::SeqCst), 105);
    }
}
