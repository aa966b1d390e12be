//! System call ABI: argument extraction from [`Registers`] and return-value
//! delivery, following the System V register convention (`num`, `arg0`,
//! `arg1`, `arg2` ... in `%rax`, `%rdi`, `%rsi`, `%rdx`, `%r10`, `%r8`, `%r9`).
use keos::{KernelError, syscall::Registers};

/// The system call number and up to six arguments extracted from a trap
/// frame, plus the frame itself so a handler can set the return value.
pub struct SyscallAbi<'a> {
    /// The system call number, from `%rax` at trap time.
    pub sysno: usize,
    /// First argument (`%rdi`).
    pub arg1: usize,
    /// Second argument (`%rsi`).
    pub arg2: usize,
    /// Third argument (`%rdx`).
    pub arg3: usize,
    /// Fourth argument (`%r10`).
    pub arg4: usize,
    /// Fifth argument (`%r8`).
    pub arg5: usize,
    /// Sixth argument (`%r9`).
    pub arg6: usize,
    /// The trap frame this ABI was extracted from.
    pub regs: &'a mut Registers,
}

impl<'a> SyscallAbi<'a> {
    /// Extracts a [`SyscallAbi`] from `regs`, per the x86-64 `syscall`
    /// calling convention.
    pub fn from_registers(regs: &'a mut Registers) -> Self {
        let gprs = &regs.gprs;
        let (sysno, arg1, arg2, arg3, arg4, arg5, arg6) = (
            gprs.rax, gprs.rdi, gprs.rsi, gprs.rdx, gprs.r10, gprs.r8, gprs.r9,
        );
        Self {
            sysno,
            arg1,
            arg2,
            arg3,
            arg4,
            arg5,
            arg6,
            regs,
        }
    }

    /// Stores `return_val` into `%rax`: the success value on `Ok`, or
    /// [`KernelError::into_usize`] on `Err`.
    pub fn set_return_value(self, return_val: Result<usize, KernelError>) {
        self.regs.gprs.rax = match return_val {
            Ok(v) => v,
            Err(e) => e.into_usize(),
        };
    }
}
