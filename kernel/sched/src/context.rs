//! Saved CPU context for context switching.
//!
//! The layouts match what the architecture switch stubs save and restore;
//! field order is part of the contract with that assembly. User threads
//! additionally carry the floating-point save area and the user page-table
//! root, restored on the way back to userspace.

/// Saved FPU/SSE state for FXSAVE/FXRSTOR (512 bytes, 16-byte aligned).
#[cfg(target_arch = "x86_64")]
#[repr(C, align(16))]
pub struct FpuState {
    /// Raw FXSAVE area.
    pub data: [u8; 512],
}

#[cfg(target_arch = "x86_64")]
impl FpuState {
    /// All x87 and SSE exceptions masked.
    pub const fn new() -> Self {
        let mut data = [0u8; 512];
        // FCW at offset 0: 0x037F.
        data[0] = 0x7F;
        data[1] = 0x03;
        // MXCSR at offset 24: 0x1F80.
        data[24] = 0x80;
        data[25] = 0x1F;
        Self { data }
    }
}

#[cfg(target_arch = "x86_64")]
impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Register state saved across a context switch (x86_64).
#[cfg(target_arch = "x86_64")]
#[repr(C)]
pub struct Context {
    /// Callee-saved registers.
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Stack pointer; the switch stub resumes from the frame it points at.
    pub rsp: u64,
    /// Resume address for a fresh thread (jumped to on first switch-in).
    pub rip: u64,
    pub rflags: u64,
    /// User page-table root, restored when entering a user thread.
    pub cr3: u64,
    /// Floating-point save area, restored for user threads.
    pub fpu: FpuState,
}

#[cfg(target_arch = "x86_64")]
impl Context {
    /// An all-zero context (interrupts disabled, no stack).
    pub const fn new() -> Self {
        Self {
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
            rflags: 0x2, // reserved bit 1 always set
            cr3: 0,
            fpu: FpuState::new(),
        }
    }
}

/// Register state saved across a context switch (aarch64).
#[cfg(target_arch = "aarch64")]
#[repr(C)]
pub struct Context {
    /// Callee-saved registers x19-x28.
    pub x19_x28: [u64; 10],
    /// Frame pointer (x29).
    pub fp: u64,
    /// Link register (x30); resume address.
    pub lr: u64,
    /// Stack pointer.
    pub sp: u64,
    /// Saved program status.
    pub spsr: u64,
    /// User translation table base, restored when entering a user thread.
    pub ttbr0: u64,
    /// SIMD/FP registers q8-q15 (callee-saved low halves saved in full).
    pub fpregs: [u128; 8],
    /// Floating-point control and status.
    pub fpcr: u64,
    pub fpsr: u64,
}

#[cfg(target_arch = "aarch64")]
impl Context {
    /// An all-zero context.
    pub const fn new() -> Self {
        Self {
            x19_x28: [0; 10],
            fp: 0,
            lr: 0,
            sp: 0,
            spsr: 0,
            ttbr0: 0,
            fpregs: [0; 8],
            fpcr: 0,
            fpsr: 0,
        }
    }
}

/// Placeholder context for host builds (tests never switch for real).
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[repr(C)]
pub struct Context {
    /// Stand-ins so the scheduler code paths have something to write.
    pub sp: u64,
    pub pc: u64,
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
impl Context {
    /// An all-zero context.
    pub const fn new() -> Self {
        Self { sp: 0, pc: 0 }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_constructs() {
        let ctx = Context::new();
        // Field values are arch-specific; just prove construction and that
        // the type is Sized and movable.
        let moved = ctx;
        let _ = moved;
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn fpu_defaults_mask_exceptions() {
        let fpu = FpuState::new();
        assert_eq!(fpu.data[0], 0x7F);
        assert_eq!(fpu.data[1], 0x03);
        assert_eq!(fpu.data[24], 0x80);
        assert_eq!(fpu.data[25], 0x1F);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn fpu_area_is_16_byte_aligned() {
        assert_eq!(core::mem::align_of::<FpuState>(), 16);
        assert_eq!(core::mem::size_of::<FpuState>(), 512);
    }
}
