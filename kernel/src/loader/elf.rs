//! Parsing for the subset of ELF64 a loader needs: the file header and the
//! `PT_LOAD` program headers.
use alloc::vec::Vec;
use core::convert::TryInto;
use keos::{KernelError, fs::RegularFile, mm::page_table::Permission};

/// The ELF64 file header.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct ELFHeader {
    pub magic: [u8; 4],
    pub class: u8,
    pub data: u8,
    pub version: u8,
    pub abi: u8,
    pub abi_version: u8,
    pub pad: [u8; 7],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// A parsed ELF file backed by an open [`RegularFile`].
pub struct Elf<'a> {
    pub header: ELFHeader,
    pub file: &'a RegularFile,
}

impl<'a, 'b> Elf<'a> {
    /// Parses the header out of `file` and validates it is a little-endian,
    /// 64-bit, `x86_64` executable.
    pub fn from_file(file: &'a RegularFile) -> Option<Self> {
        union HeaderUnion {
            _raw: [u8; 4096],
            header: ELFHeader,
        }
        let header = unsafe {
            let mut u = HeaderUnion { _raw: [0; 4096] };
            file.read(0, &mut u._raw).ok()?;
            u.header
        };

        if &header.magic == b"\x7FELF"
            && /* little endian */ header.data == 1
            && /* 64-bit */ header.class == 2
            && /* x86_64 */ header.e_machine == 0x3E
            && /* executable */ header.e_type == 2
        {
            Some(Self { header, file })
        } else {
            None
        }
    }

    /// Returns an iterator over the program header table.
    pub fn phdrs(&'b self) -> Result<PhdrIterator<'a, 'b>, KernelError> {
        let base = self.header.e_phoff.try_into().map_err(|_| KernelError::NoExec)?;
        let mut buffer = alloc::vec![0u8; self.header.e_phnum as usize * 0x38];
        self.file.read(base, buffer.as_mut())?;
        Ok(PhdrIterator {
            cursor: 0,
            buffer,
            elf: self,
        })
    }
}

/// Iterator over an ELF file's program headers, produced by [`Elf::phdrs`].
pub struct PhdrIterator<'a, 'b> {
    cursor: u16,
    elf: &'a Elf<'b>,
    buffer: Vec<u8>,
}

impl core::iter::Iterator for PhdrIterator<'_, '_> {
    type Item = Phdr;
    fn next(&mut self) -> Option<Self::Item> {
        union Reader {
            phdr: Phdr,
            _raw: [u8; 0x38],
        }
        if self.cursor >= self.elf.header.e_phnum {
            return None;
        }
        unsafe {
            let ofs = self.cursor as usize * 0x38;
            let mut inner = Reader { _raw: [0; 0x38] };
            inner._raw.copy_from_slice(&self.buffer[ofs..ofs + 0x38]);
            self.cursor += 1;
            Some(inner.phdr)
        }
    }
}

/// Segment type, from a program header's `p_type`.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[allow(dead_code)]
pub enum PType {
    Null = 0x0,
    Load = 0x1,
    Dynamic = 0x2,
    Interp = 0x3,
    Note = 0x4,
    Shlib = 0x5,
    Phdr = 0x6,
    Tls = 0x7,
    GnuEhFrame = 0x6474e550,
    GnuStack = 0x6474e551,
    GnuRelro = 0x6474e552,
    GnuProperty = 0x6474e553,
}

bitflags::bitflags! {
    /// Segment permission flags, from a program header's `p_flags`.
    pub struct PFlags: u32 {
        const READ = 1 << 2;
        const WRITE = 1 << 1;
        const EXECUTABLE = 1 << 0;
    }
}

/// A single ELF64 program header.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Phdr {
    pub type_: PType,
    pub p_flags: PFlags,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Phdr {
    /// Translates this segment's ELF permission flags into the page table's
    /// own [`Permission`] bits. Every loaded segment is user-accessible.
    pub fn permission(&self) -> Permission {
        let mut permission = Permission::USER;
        if self.p_flags.contains(PFlags::READ) {
            permission |= Permission::READ;
        }
        if self.p_flags.contains(PFlags::WRITE) {
            permission |= Permission::WRITE;
        }
        if self.p_flags.contains(PFlags::EXECUTABLE) {
            permission |= Permission::EXECUTABLE;
        }
        permission
    }
}
