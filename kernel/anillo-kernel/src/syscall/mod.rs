//! Syscall handler implementations.
//!
//! [`KernelDispatch`] implements the handler trait from `anillo-syscall`;
//! the architecture trap stub lands in
//! [`uthread::enter_syscall`](crate::uthread::enter_syscall), which routes
//! here through [`dispatch_current`]. Every handler resolves the calling
//! thread and its process, validates raw arguments, and translates
//! subsystem results into the ABI encoding.
//!
//! Blocking handlers (channel send/receive, futex wait, monitor poll)
//! park through the same wait primitives as kernel code, so kills and
//! signals surface as `cancelled` / `signalled` and userspace can retry.

pub mod userptr;

use alloc::sync::Arc;
use alloc::vec::Vec;

use anillo_core::addr::VirtAddr;
use anillo_core::id::DescriptorId;
use anillo_core::page::{PhysFrame, Size4KiB};
use anillo_core::status::{KResult, Status};
use anillo_ipc::channel::{Channel, Message, connect};
use anillo_ipc::monitor::{ItemFlags, Monitor, MonitorEvents, MonitorTarget};
use anillo_mm::mapper::MapFlags;
use anillo_mm::mapping::Mapping;
use anillo_mm::pmm;
use anillo_sched::run;
use anillo_sched::thread::Thread;
use anillo_syscall::{SyscallHandler, dispatch, encode_result};

use crate::proc::desc::Descriptor;
use crate::proc::{Process, process_of};
use crate::uthread::SyscallArgs;
use userptr::{copy_from_user, copy_to_user, read_user_u64};

/// `sys_memory_allocate` flag: materialise the pages immediately.
pub const MEM_FLAG_PREFAULT: usize = 1 << 0;
/// `sys_memory_allocate` flag: map the pages executable.
pub const MEM_FLAG_EXECUTABLE: usize = 1 << 1;

/// `sys_channel_send` / `sys_channel_receive` flag: fail with `no-wait`
/// instead of blocking.
pub const CHANNEL_FLAG_NO_WAIT: usize = 1 << 0;

/// Cap on events returned by one `sys_monitor_poll`.
const MONITOR_POLL_MAX: usize = 64;

/// Bytes per serialized monitor event: (item id: u64, events: u32, pad).
const MONITOR_EVENT_SIZE: usize = 16;

/// The kernel's syscall surface.
pub struct KernelDispatch;

/// The shared dispatch instance.
pub static DISPATCH: KernelDispatch = KernelDispatch;

/// Dispatches raw trap-stub arguments for the calling thread.
pub fn dispatch_current(args: &SyscallArgs) -> isize {
    dispatch(
        &DISPATCH,
        args.nr,
        args.args[0],
        args.args[1],
        args.args[2],
        args.args[3],
        args.args[4],
        args.args[5],
    )
}

/// Resolves the calling thread and its process.
fn current_context() -> KResult<(Arc<Thread>, Arc<Process>)> {
    let thread = run::current_thread().ok_or(Status::Forbidden)?;
    let process = process_of(thread.id()).ok_or(Status::Forbidden)?;
    Ok((thread, process))
}

/// Returns frames owned by dropped mappings to the frame allocator.
fn release_mapping_frames(frame: PhysFrame<Size4KiB>, count: usize) {
    // try_with: mapping drops can happen in fault paths holding no locks,
    // but also in tests with no PMM at all.
    // SAFETY: The mapping owned these frames exclusively.
    let _ = pmm::try_with(|p| unsafe { p.free(frame, count) });
}

fn channel_of(process: &Process, id: usize) -> KResult<Arc<Channel>> {
    process
        .descriptors()
        .get(DescriptorId::new(id as u64))?
        .as_channel()
        .ok_or(Status::InvalidArgument)
}

fn mapping_of(process: &Process, id: usize) -> KResult<Arc<Mapping>> {
    process
        .descriptors()
        .get(DescriptorId::new(id as u64))?
        .as_mapping()
        .ok_or(Status::InvalidArgument)
}

fn monitor_of(process: &Process, id: usize) -> KResult<Arc<Monitor>> {
    process
        .descriptors()
        .get(DescriptorId::new(id as u64))?
        .as_monitor()
        .ok_or(Status::InvalidArgument)
}

fn thread_of(process: &Process, id: usize) -> KResult<Arc<Thread>> {
    process
        .descriptors()
        .get(DescriptorId::new(id as u64))?
        .as_thread()
        .ok_or(Status::InvalidArgument)
}

fn optional_timeout(timeout_ns: usize) -> Option<u64> {
    if timeout_ns == 0 {
        None
    } else {
        Some(timeout_ns as u64)
    }
}

impl SyscallHandler for KernelDispatch {
    fn sys_none(&self, _nr: usize) -> isize {
        encode_result(Err(Status::Unsupported))
    }

    // -- threads ------------------------------------------------------------

    fn sys_thread_exit(&self, _status: usize) -> isize {
        if let Ok((thread, _)) = current_context() {
            // Idempotent: the return-to-user path finishes the job.
            let _ = thread.kill();
            run::yield_now();
        }
        encode_result(Ok(0))
    }

    fn sys_thread_kill(&self, thread: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            thread_of(&process, thread)?.kill()?;
            Ok(0)
        })())
    }

    fn sys_thread_suspend(&self, thread: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            thread_of(&process, thread)?.suspend()?;
            Ok(0)
        })())
    }

    fn sys_thread_resume(&self, thread: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            thread_of(&process, thread)?.resume()?;
            Ok(0)
        })())
    }

    fn sys_thread_yield(&self) -> isize {
        run::yield_now();
        encode_result(Ok(0))
    }

    fn sys_thread_id(&self) -> isize {
        encode_result((|| {
            let (thread, _) = current_context()?;
            Ok(thread.id().as_raw() as usize)
        })())
    }

    // -- anonymous memory ---------------------------------------------------

    fn sys_memory_allocate(&self, page_count: usize, alignment: usize, flags: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            if alignment > 30 {
                return Err(Status::InvalidArgument);
            }
            let mut map_flags = MapFlags::WRITABLE;
            if flags & MEM_FLAG_EXECUTABLE != 0 {
                map_flags |= MapFlags::EXECUTABLE;
            }
            let va = process.space().allocate(
                page_count as u64,
                alignment as u32,
                map_flags,
                flags & MEM_FLAG_PREFAULT != 0,
                &mut pmm::GlobalFrames,
            )?;
            Ok(va.as_u64() as usize)
        })())
    }

    fn sys_memory_free(&self, address: usize, page_count: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            let va = VirtAddr::new_truncate(address as u64);
            process
                .space()
                .free(va, page_count as u64, &mut pmm::GlobalFrames)?;
            Ok(0)
        })())
    }

    // -- shared mappings ----------------------------------------------------

    fn sys_mapping_create(&self, page_count: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            let mapping = Mapping::new_zeroed(page_count, release_mapping_frames)?;
            let id = process.descriptors().install(Descriptor::mapping(mapping));
            Ok(id.as_usize())
        })())
    }

    fn sys_mapping_insert(
        &self,
        mapping: usize,
        offset: usize,
        page_count: usize,
        flags: usize,
    ) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            let mapping = mapping_of(&process, mapping)?;
            let mut map_flags = MapFlags::WRITABLE;
            if flags & MEM_FLAG_EXECUTABLE != 0 {
                map_flags |= MapFlags::EXECUTABLE;
            }
            let va = process
                .space()
                .insert_mapping(&mapping, offset, page_count as u64, 0, map_flags)?;
            Ok(va.as_u64() as usize)
        })())
    }

    fn sys_mapping_remove(&self, address: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            process
                .space()
                .remove_mapping(VirtAddr::new_truncate(address as u64))?;
            Ok(0)
        })())
    }

    fn sys_mapping_move(
        &self,
        address: usize,
        page_count: usize,
        offset: usize,
        mapping: usize,
    ) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            let mapping = mapping_of(&process, mapping)?;
            process.space().move_into_mapping(
                VirtAddr::new_truncate(address as u64),
                page_count as u64,
                offset,
                &mapping,
            )?;
            Ok(0)
        })())
    }

    fn sys_mapping_bind(
        &self,
        target: usize,
        target_offset: usize,
        source: usize,
        source_offset: usize,
        page_count: usize,
    ) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            let target = mapping_of(&process, target)?;
            let source = mapping_of(&process, source)?;
            target.bind_indirect(target_offset, &source, source_offset, page_count)?;
            Ok(0)
        })())
    }

    // -- channels -----------------------------------------------------------

    fn sys_channel_create_pair(&self, out_pair: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            let (a, b) = Channel::new_pair();
            let id_a = process.descriptors().install(Descriptor::channel(a));
            let id_b = process.descriptors().install(Descriptor::channel(b));

            let mut buffer = [0u8; 16];
            buffer[..8].copy_from_slice(&id_a.as_raw().to_ne_bytes());
            buffer[8..].copy_from_slice(&id_b.as_raw().to_ne_bytes());
            copy_to_user(
                process.space(),
                VirtAddr::new_truncate(out_pair as u64),
                &buffer,
            )?;
            Ok(0)
        })())
    }

    fn sys_channel_send(
        &self,
        channel: usize,
        body_ptr: usize,
        body_len: usize,
        flags: usize,
    ) -> isize {
        encode_result((|| {
            let (thread, process) = current_context()?;
            let channel = channel_of(&process, channel)?;
            let body = copy_from_user(
                process.space(),
                VirtAddr::new_truncate(body_ptr as u64),
                body_len,
            )?;
            let message = Message::new(body);
            if flags & CHANNEL_FLAG_NO_WAIT != 0 {
                channel.try_send(message).map_err(|(status, _)| status)?;
            } else {
                channel.send(&thread, message)?;
            }
            Ok(0)
        })())
    }

    fn sys_channel_receive(
        &self,
        channel: usize,
        buffer_ptr: usize,
        buffer_len: usize,
        flags: usize,
    ) -> isize {
        encode_result((|| {
            let (thread, process) = current_context()?;
            let channel = channel_of(&process, channel)?;
            let message = if flags & CHANNEL_FLAG_NO_WAIT != 0 {
                channel.try_receive()?
            } else {
                channel.receive(&thread)?
            };
            // Attached objects become descriptors of the receiver.
            for attachment in message.attachments {
                match attachment {
                    anillo_ipc::channel::Attachment::Channel(end) => {
                        process.descriptors().install(Descriptor::channel(end));
                    }
                    anillo_ipc::channel::Attachment::Mapping(mapping) => {
                        process.descriptors().install(Descriptor::mapping(mapping));
                    }
                    anillo_ipc::channel::Attachment::Data(_) => {}
                }
            }
            // Truncating copy; the returned full length tells userspace
            // whether its buffer was large enough.
            let copied = message.body.len().min(buffer_len);
            copy_to_user(
                process.space(),
                VirtAddr::new_truncate(buffer_ptr as u64),
                &message.body[..copied],
            )?;
            Ok(message.body.len())
        })())
    }

    fn sys_channel_close(&self, channel: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            channel_of(&process, channel)?.close();
            Ok(0)
        })())
    }

    fn sys_channel_connect(&self, name_ptr: usize, name_len: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            if name_len > 256 {
                return Err(Status::TooBig);
            }
            let raw = copy_from_user(
                process.space(),
                VirtAddr::new_truncate(name_ptr as u64),
                name_len,
            )?;
            let name = core::str::from_utf8(&raw).map_err(|_| Status::InvalidArgument)?;
            let client = connect(name)?;
            let id = process.descriptors().install(Descriptor::channel(client));
            Ok(id.as_usize())
        })())
    }

    // -- futexes ------------------------------------------------------------

    fn sys_futex_wait(
        &self,
        address: usize,
        channel: usize,
        expected: usize,
        timeout_ns: usize,
    ) -> isize {
        encode_result((|| {
            let (thread, process) = current_context()?;
            let va = VirtAddr::new_truncate(address as u64);
            // Physical keying: shared memory produces a shared futex.
            let phys = process.space().virtual_to_physical(va)?;
            let space = process.space().clone();
            process.futexes().wait(
                &thread,
                phys,
                channel as u64,
                expected as u64,
                &|| read_user_u64(&space, va).unwrap_or(!(expected as u64)),
                optional_timeout(timeout_ns),
            )?;
            Ok(0)
        })())
    }

    fn sys_futex_wake(&self, address: usize, channel: usize, count: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            let va = VirtAddr::new_truncate(address as u64);
            let phys = process.space().virtual_to_physical(va)?;
            Ok(process.futexes().wake(phys, channel as u64, count))
        })())
    }

    // -- monitors -----------------------------------------------------------

    fn sys_monitor_create(&self) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            let monitor = Monitor::new();
            let id = process.descriptors().install(Descriptor::monitor(monitor));
            Ok(id.as_usize())
        })())
    }

    fn sys_monitor_add_item(
        &self,
        monitor: usize,
        target: usize,
        events: usize,
        flags: usize,
    ) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            let monitor = monitor_of(&process, monitor)?;
            let flags =
                ItemFlags::from_bits(flags as u32).ok_or(Status::InvalidArgument)?;
            // Target 0 is the timeout pseudo-descriptor; `events` carries
            // the delay.
            let target = if target == 0 {
                MonitorTarget::Timeout {
                    delay_ns: events as u64,
                }
            } else {
                let channel = channel_of(&process, target)?;
                let events = MonitorEvents::from_bits(events as u32)
                    .ok_or(Status::InvalidArgument)?;
                MonitorTarget::Channel { channel, events }
            };
            let item = monitor.add_item(target, flags)?;
            Ok(item as usize)
        })())
    }

    fn sys_monitor_remove_item(&self, monitor: usize, item: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            monitor_of(&process, monitor)?.remove_item(item as u64)?;
            Ok(0)
        })())
    }

    fn sys_monitor_poll(
        &self,
        monitor: usize,
        out_ptr: usize,
        max: usize,
        timeout_ns: usize,
    ) -> isize {
        encode_result((|| {
            let (thread, process) = current_context()?;
            let monitor = monitor_of(&process, monitor)?;
            let max = max.min(MONITOR_POLL_MAX);
            let events = monitor.poll(&thread, max, optional_timeout(timeout_ns))?;

            let mut buffer = Vec::with_capacity(events.len() * MONITOR_EVENT_SIZE);
            for event in &events {
                buffer.extend_from_slice(&event.item.to_ne_bytes());
                buffer.extend_from_slice(&event.events.bits().to_ne_bytes());
                buffer.extend_from_slice(&0u32.to_ne_bytes());
            }
            copy_to_user(
                process.space(),
                VirtAddr::new_truncate(out_ptr as u64),
                &buffer,
            )?;
            Ok(events.len())
        })())
    }

    fn sys_monitor_close(&self, monitor: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            monitor_of(&process, monitor)?.close();
            Ok(0)
        })())
    }

    // -- descriptors and logging --------------------------------------------

    fn sys_handle_close(&self, handle: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            process
                .descriptors()
                .uninstall(DescriptorId::new(handle as u64))?;
            Ok(0)
        })())
    }

    fn sys_log_write(&self, buffer_ptr: usize, buffer_len: usize) -> isize {
        encode_result((|| {
            let (_, process) = current_context()?;
            if buffer_len > 4096 {
                return Err(Status::TooBig);
            }
            let raw = copy_from_user(
                process.space(),
                VirtAddr::new_truncate(buffer_ptr as u64),
                buffer_len,
            )?;
            let text = core::str::from_utf8(&raw).map_err(|_| Status::InvalidChecksum)?;
            anillo_core::kprint!("{}", text);
            Ok(buffer_len)
        })())
    }
}
