//! A user process: one kernel thread wrapping one address space, its open
//! files, and the bookkeeping `exec`/`wait` need to track children.
use crate::{
    file_struct::FileStruct,
    loader::LoadContext,
    mm::{
        fault::{PageFaultReason, SptFrameOwner},
        page_table::PageTable,
        spt::Spt,
    },
    syscall::SyscallAbi,
};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use core::ops::Range;
use keos::{
    KernelError,
    addressing::{Pa, Va},
    fs::FileSystem,
    mm::page_table::Permission,
    power,
    syscall::{
        Registers,
        uaccess::{UserCString, UserPtrRO},
    },
    task::{PFErrorCode, Task},
    thread::{Current, JoinHandle, ThreadBuilder},
};

/// A user process.
pub struct Process {
    page_table: PageTable,
    spt: Arc<Spt>,
    file_struct: FileStruct,
    /// Children spawned by `exec`, keyed by pid, each waitable exactly once.
    children: BTreeMap<i32, JoinHandle>,
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}

impl Process {
    /// An empty process with a fresh address space and the standard file
    /// descriptors.
    pub fn new() -> Self {
        Self {
            page_table: PageTable::new(),
            spt: Arc::new(Spt::new()),
            file_struct: FileStruct::new(),
            children: BTreeMap::new(),
        }
    }

    /// Builds a process by loading `file` as an ELF executable with the
    /// given `argv`, ready to be launched as a brand-new thread.
    pub fn from_elf(file: &keos::fs::RegularFile, args: &[&str]) -> Result<(Self, Registers), KernelError> {
        let ctx = LoadContext::new().load(file, args)?;
        let process = Self {
            page_table: ctx.page_table,
            spt: ctx.spt,
            file_struct: FileStruct::new(),
            children: BTreeMap::new(),
        };
        Ok((process, ctx.regs))
    }

    /// `halt()`: powers the machine off. Never returns.
    fn halt(&self, _abi: &SyscallAbi) -> Result<usize, KernelError> {
        power::shutdown();
    }

    /// `exit(status)`: terminates the calling thread with `status`.
    fn exit(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        Current::exit(abi.arg1 as i32);
    }

    /// `exec(pathname, argv)`: loads `pathname` into a brand-new address
    /// space and spawns it as a child thread, returning its pid. `argv` is a
    /// NUL-terminated array of user-space C string pointers.
    fn exec(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = UserCString::new(abi.arg1).read()?;
        let mut args = Vec::new();
        let mut cursor = abi.arg2;
        loop {
            let ptr = UserPtrRO::<usize>::new(cursor).get()?;
            if ptr == 0 {
                break;
            }
            args.push(UserCString::new(ptr).read()?);
            cursor += core::mem::size_of::<usize>();
        }
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();

        let file = self
            .file_struct
            .cwd
            .open(&path)?
            .into_regular_file()
            .ok_or(KernelError::NoExec)?;
        let (child, regs) = Process::from_elf(&file, &args_ref)?;

        let builder = ThreadBuilder::new(path);
        let pid = builder.get_tid() as i32;
        let handle = builder
            .attach_task(Box::new(child))
            .spawn(move || regs.launch());
        self.children.insert(pid, handle);
        Ok(pid as usize)
    }

    /// `wait(pid)`: blocks until the child `pid` exits, returning its exit
    /// status, or `-1` if `pid` is not a live, unwaited-for child.
    fn wait(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let pid = abi.arg1 as i32;
        match self.children.remove(&pid) {
            Some(handle) => Ok(handle.join() as usize),
            None => Ok(-1i32 as usize),
        }
    }

    fn create(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        self.file_struct.create(abi)
    }

    fn remove(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        self.file_struct.remove(abi)
    }

    /// `mmap(addr, length, prot, fd, offset)`.
    fn mmap(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let addr = Va::new(abi.arg1).ok_or(KernelError::InvalidArgument)?;
        let length = abi.arg2;
        let mut perm = Permission::USER;
        if abi.arg3 & 0x1 != 0 {
            perm |= Permission::READ;
        }
        if abi.arg3 & 0x2 != 0 {
            perm |= Permission::WRITE;
        }
        if abi.arg3 & 0x4 != 0 {
            perm |= Permission::EXECUTABLE;
        }
        let fd = crate::file_struct::FileDescriptor(abi.arg4 as i32);
        if fd.0 == 0 || fd.0 == 1 {
            return Err(KernelError::InvalidArgument);
        }
        let file = match self.file_struct.files.get(&fd).map(|f| &f.file) {
            Some(crate::file_struct::FileKind::RegularFile { file, .. }) => file.clone(),
            _ => return Err(KernelError::InvalidArgument),
        };
        crate::mm::mmap::mmap(&self.spt, addr, length, perm, &file, abi.arg5)
    }

    /// `munmap(id)`, where `id` is the mapping identifier `mmap` returned.
    fn munmap(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        crate::mm::mmap::munmap(&self.spt, &mut self.page_table, abi.arg1)
    }
}

/// System call numbers, assigned in the order the calling convention
/// documents them.
#[repr(usize)]
enum SyscallNumber {
    Halt = 1,
    Exit = 2,
    Exec = 3,
    Wait = 4,
    Create = 5,
    Remove = 6,
    Open = 7,
    Filesize = 8,
    Read = 9,
    Write = 10,
    Seek = 11,
    Tell = 12,
    Close = 13,
    Mmap = 14,
    Munmap = 15,
}

impl TryFrom<usize> for SyscallNumber {
    type Error = KernelError;
    fn try_from(no: usize) -> Result<SyscallNumber, Self::Error> {
        match no {
            1 => Ok(SyscallNumber::Halt),
            2 => Ok(SyscallNumber::Exit),
            3 => Ok(SyscallNumber::Exec),
            4 => Ok(SyscallNumber::Wait),
            5 => Ok(SyscallNumber::Create),
            6 => Ok(SyscallNumber::Remove),
            7 => Ok(SyscallNumber::Open),
            8 => Ok(SyscallNumber::Filesize),
            9 => Ok(SyscallNumber::Read),
            10 => Ok(SyscallNumber::Write),
            11 => Ok(SyscallNumber::Seek),
            12 => Ok(SyscallNumber::Tell),
            13 => Ok(SyscallNumber::Close),
            14 => Ok(SyscallNumber::Mmap),
            15 => Ok(SyscallNumber::Munmap),
            _ => Err(KernelError::NoSuchSyscall),
        }
    }
}

impl Drop for Process {
    /// Exit implicitly `munmap`s every outstanding mapping: write back
    /// dirty pages before the page table drops and discards them.
    fn drop(&mut self) {
        crate::mm::mmap::writeback_all(&self.spt, &mut self.page_table);
    }
}

impl Task for Process {
    fn syscall(&mut self, regs: &mut Registers) {
        let abi = SyscallAbi::from_registers(regs);
        let return_val = SyscallNumber::try_from(abi.sysno).and_then(|no| match no {
            SyscallNumber::Halt => self.halt(&abi),
            SyscallNumber::Exit => self.exit(&abi),
            SyscallNumber::Exec => self.exec(&abi),
            SyscallNumber::Wait => self.wait(&abi),
            SyscallNumber::Create => self.create(&abi),
            SyscallNumber::Remove => self.remove(&abi),
            SyscallNumber::Open => self.file_struct.open(&abi),
            SyscallNumber::Filesize => self.file_struct.filesize(&abi),
            SyscallNumber::Read => self.file_struct.read(&abi),
            SyscallNumber::Write => self.file_struct.write(&abi),
            SyscallNumber::Seek => self.file_struct.seek(&abi),
            SyscallNumber::Tell => self.file_struct.tell(&abi),
            SyscallNumber::Close => self.file_struct.close(&abi),
            SyscallNumber::Mmap => self.mmap(&abi),
            SyscallNumber::Munmap => self.munmap(&abi),
        });
        abi.set_return_value(return_val);
    }

    fn page_fault(&mut self, ec: PFErrorCode, cr2: Va, esp: Va) {
        let reason = PageFaultReason::new(ec, cr2);
        if crate::mm::fault::handle(&reason, &mut self.page_table, &self.spt, esp).is_err() {
            Current::exit(-1);
        }
    }

    fn access_ok(&self, addr: Range<Va>, is_write: bool) -> bool {
        if addr.start.into_usize() == 0 {
            return false;
        }
        let mut va = addr.start.page_down();
        while va < addr.end {
            match self.spt.lookup(va) {
                Some(entry) if !is_write || entry.perm.contains(Permission::WRITE) => {}
                _ => return false,
            }
            va += 0x1000;
        }
        true
    }

    fn with_page_table_pa(&self, f: &fn(Pa)) {
        if let Some(pa) = self.page_table.pa() {
            f(pa)
        }
    }
}
