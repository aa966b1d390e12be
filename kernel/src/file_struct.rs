//! Per-process open-file table: file descriptors, stdio, pipes.
use crate::syscall::SyscallAbi;
use alloc::collections::BTreeMap;
use keos::{
    KernelError,
    channel,
    fs::{Directory, FileSystem, RegularFile},
    syscall::{
        flags::FileMode,
        uaccess::{UserCString, UserPtrWO, UserU8SliceRO, UserU8SliceWO},
    },
    teletype::{Teletype, serial},
};

/// Maximum number of simultaneously open files per process, counting the
/// three standard descriptors.
pub const MAX_OPEN_FILES: usize = 16;

/// What a file descriptor actually refers to.
#[derive(Clone)]
pub enum FileKind {
    /// A regular file, with its current read/write offset.
    RegularFile { file: RegularFile, position: usize },
    /// A directory, with a `readdir` cursor.
    Directory { dir: Directory, position: usize },
    /// The console, shared by every process.
    Stdio,
    /// The read end of a pipe.
    Rx(channel::Receiver<u8>),
    /// The write end of a pipe.
    Tx(channel::Sender<u8>),
}

/// One entry in a process's file descriptor table.
#[derive(Clone)]
pub struct File {
    pub mode: FileMode,
    pub file: FileKind,
}

/// An index into a process's file descriptor table.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct FileDescriptor(pub i32);

/// A process's filesystem-facing state: its current directory and its open
/// file descriptor table.
#[derive(Clone)]
pub struct FileStruct {
    pub cwd: Directory,
    pub files: BTreeMap<FileDescriptor, File>,
}

impl Default for FileStruct {
    fn default() -> Self {
        Self::new()
    }
}

impl FileStruct {
    /// A fresh table rooted at the filesystem root, with fds 0/1/2 wired to
    /// the console.
    pub fn new() -> Self {
        let mut this = Self {
            cwd: FileSystem::root(),
            files: BTreeMap::new(),
        };
        this.install_file(File {
            mode: FileMode::Read,
            file: FileKind::Stdio,
        })
        .unwrap();
        this.install_file(File {
            mode: FileMode::Write,
            file: FileKind::Stdio,
        })
        .unwrap();
        this.install_file(File {
            mode: FileMode::Write,
            file: FileKind::Stdio,
        })
        .unwrap();
        this
    }

    /// Assigns `file` the lowest unused descriptor.
    pub fn install_file(&mut self, file: File) -> Result<FileDescriptor, KernelError> {
        if self.files.len() >= MAX_OPEN_FILES {
            return Err(KernelError::TooManyOpenFile);
        }
        let fd = (0..MAX_OPEN_FILES as i32)
            .map(FileDescriptor)
            .find(|fd| !self.files.contains_key(fd))
            .ok_or(KernelError::TooManyOpenFile)?;
        self.files.insert(fd, file);
        Ok(fd)
    }

    fn mode_from_flags(flags: usize) -> Result<FileMode, KernelError> {
        match flags {
            0 => Ok(FileMode::Read),
            1 => Ok(FileMode::Write),
            2 => Ok(FileMode::ReadWrite),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// `open(pathname, flags)`.
    pub fn open(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = UserCString::new(abi.arg1).read()?;
        let mode = Self::mode_from_flags(abi.arg2)?;
        let entry = self.cwd.open(&path)?;
        let file = match entry {
            keos::fs::File::RegularFile(file) => FileKind::RegularFile { file, position: 0 },
            keos::fs::File::Directory(dir) => FileKind::Directory { dir, position: 0 },
        };
        self.install_file(File { mode, file }).map(|fd| fd.0 as usize)
    }

    /// `create(pathname)`: creates a regular file, failing if it already
    /// exists.
    pub fn create(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = UserCString::new(abi.arg1).read()?;
        self.cwd.create(&path, false)?;
        Ok(0)
    }

    /// `remove(pathname)`.
    pub fn remove(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = UserCString::new(abi.arg1).read()?;
        self.cwd.unlink(&path)?;
        Ok(0)
    }

    /// `filesize(fd)`.
    pub fn filesize(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg1 as i32);
        let file = self.files.get(&fd).ok_or(KernelError::BadFileDescriptor)?;
        match &file.file {
            FileKind::RegularFile { file, .. } => Ok(file.size()),
            FileKind::Directory { dir, .. } => Ok(dir.size()),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// `read(fd, buf, count)`.
    pub fn read(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg1 as i32);
        let addr = abi.arg2;
        let count = abi.arg3;
        let file = self.files.get_mut(&fd).ok_or(KernelError::BadFileDescriptor)?;
        if file.mode == FileMode::Write {
            return Err(KernelError::InvalidAccess);
        }
        match &mut file.file {
            FileKind::RegularFile { file, position } => {
                let mut buf = alloc::vec![0u8; count];
                let n = file.read(*position, &mut buf)?;
                *position += n;
                UserU8SliceWO::new(addr, n).put(&buf[..n])
            }
            FileKind::Stdio => {
                let mut buf = alloc::vec![0u8; count];
                let mut guard = serial().lock();
                let n = guard.read(&mut buf)?;
                guard.unlock();
                UserU8SliceWO::new(addr, n).put(&buf[..n])
            }
            FileKind::Rx(rx) => {
                let mut buf = alloc::vec![0u8; count];
                let mut n = 0;
                while n < count {
                    match rx.recv() {
                        Ok(byte) => {
                            buf[n] = byte;
                            n += 1;
                        }
                        Err(_) => break,
                    }
                }
                UserU8SliceWO::new(addr, n).put(&buf[..n])
            }
            FileKind::Directory { .. } => Err(KernelError::IsDirectory),
            FileKind::Tx(_) => Err(KernelError::InvalidAccess),
        }
    }

    /// `write(fd, buf, count)`.
    pub fn write(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg1 as i32);
        let addr = abi.arg2;
        let count = abi.arg3;
        let file = self.files.get_mut(&fd).ok_or(KernelError::BadFileDescriptor)?;
        if file.mode == FileMode::Read {
            return Err(KernelError::InvalidAccess);
        }
        let buf = UserU8SliceRO::new(addr, count).get()?;
        match &mut file.file {
            FileKind::RegularFile { file, position } => {
                let n = file.write(*position, &buf)?;
                *position += n;
                Ok(n)
            }
            FileKind::Stdio => {
                let mut guard = serial().lock();
                let n = guard.write(&buf)?;
                guard.unlock();
                Ok(n)
            }
            FileKind::Tx(tx) => {
                for &byte in &buf {
                    tx.send(byte).map_err(|_| KernelError::BrokenPipe)?;
                }
                Ok(buf.len())
            }
            FileKind::Directory { .. } => Err(KernelError::IsDirectory),
            FileKind::Rx(_) => Err(KernelError::InvalidAccess),
        }
    }

    /// `seek(fd, offset)`.
    pub fn seek(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg1 as i32);
        let offset = abi.arg2;
        let file = self.files.get_mut(&fd).ok_or(KernelError::BadFileDescriptor)?;
        match &mut file.file {
            FileKind::RegularFile { position, .. } | FileKind::Directory { position, .. } => {
                *position = offset;
                Ok(offset)
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// `tell(fd)`.
    pub fn tell(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg1 as i32);
        let file = self.files.get(&fd).ok_or(KernelError::BadFileDescriptor)?;
        match &file.file {
            FileKind::RegularFile { position, .. } | FileKind::Directory { position, .. } => {
                Ok(*position)
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// `close(fd)`.
    pub fn close(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg1 as i32);
        self.files.remove(&fd).ok_or(KernelError::BadFileDescriptor)?;
        Ok(0)
    }

    /// `pipe(pipefd[2])`: installs a read end at `pipefd[0]` and a write end
    /// at `pipefd[1]`.
    pub fn pipe(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let addr = abi.arg1;
        let (tx, rx) = channel::channel(512);
        let read_fd = self.install_file(File {
            mode: FileMode::Read,
            file: FileKind::Rx(rx),
        })?;
        let write_fd = match self.install_file(File {
            mode: FileMode::Write,
            file: FileKind::Tx(tx),
        }) {
            Ok(fd) => fd,
            Err(e) => {
                self.files.remove(&read_fd);
                return Err(e);
            }
        };
        UserPtrWO::<i32>::new(addr).put(read_fd.0)?;
        UserPtrWO::<i32>::new(addr + 4).put(write_fd.0)?;
        Ok(0)
    }
}
