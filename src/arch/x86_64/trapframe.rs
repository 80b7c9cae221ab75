//! Saved user-mode register state.
//!
//! Filled in by the syscall entry stub and by each exception handler
//! that forwards into common fault-handling code (page fault, general
//! protection fault) instead of handling everything itself. Field order
//! matches how a `pushaq`-style prologue lays registers on the stack, so
//! the assembly side can fill this in with a single block of pushes and
//! read it back with a single block of pops on return.

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Set by the handler for exception vectors that push one (page
    /// fault, GPF, ...); zero for vectors and syscalls that don't.
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// `true` if this frame was taken from (or is returning to) CPL 3.
    pub fn is_user(&self) -> bool {
        (self.cs & 0b11) == 3
    }

    /// Syscall argument registers, in SysV order (`rdi, rsi, rdx, r10, r8, r9`
    /// -- `r10` stands in for `rcx`, which the `syscall` instruction
    /// clobbers with the return address).
    pub fn syscall_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }

    pub fn syscall_number(&self) -> u64 {
        self.rax
    }

    pub fn set_return_value(&mut self, value: i64) {
        self.rax = value as u64;
    }
}
