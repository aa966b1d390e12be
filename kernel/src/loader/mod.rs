//! Loads an ELF64 executable into a fresh address space and builds the
//! initial user stack, producing the register state a new thread launches
//! into.
pub mod elf;
pub mod stack_builder;

use crate::mm::{
    page_table::PageTable,
    spt::{Backing, Spt, SptEntry},
};
use alloc::{sync::Arc, vec::Vec};
use elf::{Elf, PType};
use keos::{KernelError, addressing::Va, fs::RegularFile, syscall::Registers};
use stack_builder::StackBuilder;

/// Ties together the pieces a loader needs to mutate while placing a program
/// in memory: the address space it is loading into and the register file
/// the new thread will resume with.
pub struct LoadContext {
    pub page_table: PageTable,
    pub spt: Arc<Spt>,
    pub regs: Registers,
}

impl LoadContext {
    /// An empty address space with freshly initialized (not-yet-launched)
    /// registers.
    pub fn new() -> Self {
        Self {
            page_table: PageTable::new(),
            spt: Arc::new(Spt::new()),
            regs: Registers::new(),
        }
    }

    /// Parses `file` as an ELF executable, installs its `PT_LOAD` segments
    /// as demand-paged [`Spt`] entries, builds the argument stack, and
    /// points `regs` at the entry point.
    pub fn load(mut self, file: &RegularFile, args: &[&str]) -> Result<Self, KernelError> {
        let elf = Elf::from_file(file).ok_or(KernelError::NoExec)?;
        self.load_phdr(&elf, file)?;
        self.build_stack(args);
        *self.regs.rip() = elf.header.e_entry as usize;
        Ok(self)
    }

    /// Installs one `Spt` entry per page of every `PT_LOAD` segment. Pages
    /// within a segment's file size are backed by the file (demand-loaded
    /// and, past `p_filesz`, zero-filled automatically by
    /// [`crate::mm::fault::handle`]); pages past it are pure anonymous BSS.
    fn load_phdr(&mut self, elf: &Elf, file: &RegularFile) -> Result<(), KernelError> {
        for phdr in elf.phdrs()? {
            if phdr.type_ != PType::Load {
                continue;
            }
            let perm = phdr.permission();
            let vaddr = Va::new(phdr.p_vaddr as usize).ok_or(KernelError::NoExec)?;
            let page_vaddr = vaddr.page_down();
            let page_off = vaddr.offset();
            let mem_end = vaddr + phdr.p_memsz as usize;
            let file_end = vaddr + phdr.p_filesz as usize;
            let mut file_off = (phdr.p_offset as usize).saturating_sub(page_off);

            let mut page = page_vaddr;
            while page < mem_end {
                let backing = if page < file_end {
                    let len = (file_end.into_usize().saturating_sub(page.into_usize())).min(0x1000);
                    Backing::File {
                        file: file.clone(),
                        offset: file_off,
                        len,
                    }
                } else {
                    Backing::Zero
                };
                self.spt.install(page, SptEntry { backing, perm });
                page += 0x1000;
                file_off += 0x1000;
            }
        }
        Ok(())
    }

    /// Lays out `argv`/`argc` on a fresh stack and points `rsp`/`rdi`/`rsi`
    /// at them, following the System V AMD64 calling convention `_start`
    /// expects its arguments in.
    fn build_stack(&mut self, arguments: &[&str]) {
        let mut builder = StackBuilder::new(&mut self.page_table, &self.spt);
        let mut argv_ptrs = Vec::with_capacity(arguments.len());
        for arg in arguments {
            argv_ptrs.push(builder.push_str(arg));
        }
        builder.align(8);
        builder.push_usize(0); // argv[argc] sentinel
        for &ptr in argv_ptrs.iter().rev() {
            builder.push_usize(ptr.into_usize());
        }
        let argv = builder.sp();
        builder.push_usize(0); // fake return address
        let sp = builder.finish();

        *self.regs.rsp() = sp.into_usize();
        self.regs.gprs.rdi = arguments.len();
        self.regs.gprs.rsi = argv.into_usize();
    }
}

impl Default for LoadContext {
    fn default() -> Self {
        Self::new()
    }
}
