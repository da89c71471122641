//! Kernel-wide error types.
//!
//! Every subsystem reports failures through [`KernelError`] or one of the
//! per-subsystem enums that convert into it. The syscall gate is the only
//! place these are flattened into negative errno values for user code.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Out of physical frames or heap space
    NoMemory,
    /// No space left on a storage volume
    NoSpace,
    /// Malformed argument (unaligned address, zero length, bad range, ...)
    BadArgument,
    /// Address is outside user space or not mapped
    BadAddress { addr: u32 },
    /// File descriptor is not open
    BadDescriptor,
    /// Named object does not exist
    NotFound,
    /// Named object already exists
    Exists,
    /// Path component is not a directory
    NotDirectory,
    /// Operation needs a file but found a directory
    IsDirectory,
    /// Directory still has entries
    NotEmpty,
    /// Caller may not perform the operation
    PermissionDenied,
    /// Transient failure, retry later
    TryAgain,
    /// Operation would block and the caller asked not to
    WouldBlock,
    /// Pipe with no peer
    BrokenPipe,
    /// No process with the given pid
    NoSuchProcess,
    /// Operation is recognized but not provided by this kernel
    NotSupported,

    /// Filesystem-level failure
    Fs(FsError),
    /// Scheduler-level failure
    Sched(SchedError),
    /// Syscall decoding failure
    Syscall(SyscallError),
    /// IPC failure
    Ipc(IpcError),
}

/// Filesystem-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File or directory not found
    NotFound,
    /// Path already exists
    AlreadyExists,
    /// Target is not a directory
    NotADirectory,
    /// Target is a directory (when a file was expected)
    IsADirectory,
    /// Directory is not empty
    DirectoryNotEmpty,
    /// Path already has a mount point
    AlreadyMounted,
    /// Path is not a mount point
    NotMounted,
    /// Root filesystem not mounted
    NoRootFs,
    /// Volume metadata failed validation
    InvalidVolume,
    /// I/O error from the block device
    IoError,
    /// File grew past the per-node limit
    FileTooLarge,
    /// Operation not supported on this node type
    NotSupported,
}

/// Scheduler-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// No free task slots
    TableFull,
    /// Task id does not name a live task
    TaskNotFound,
    /// Kernel stack allocation failed
    NoStack,
}

/// Syscall decoding errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Unknown syscall number
    InvalidSyscall { nr: u32 },
    /// Pointer argument failed validation
    InvalidPointer { addr: u32 },
    /// String argument is unterminated or leaves user space
    InvalidString { addr: u32 },
}

/// IPC-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// All pipe / queue / segment slots are taken
    TableFull,
    /// Id does not name a live object
    NotFound,
    /// Message is larger than the queue accepts
    MessageTooBig,
    /// Queue is full
    QueueFull,
    /// Queue is empty
    QueueEmpty,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "out of memory"),
            Self::NoSpace => write!(f, "no space left on device"),
            Self::BadArgument => write!(f, "invalid argument"),
            Self::BadAddress { addr } => write!(f, "bad address {:#010x}", addr),
            Self::BadDescriptor => write!(f, "bad file descriptor"),
            Self::NotFound => write!(f, "not found"),
            Self::Exists => write!(f, "already exists"),
            Self::NotDirectory => write!(f, "not a directory"),
            Self::IsDirectory => write!(f, "is a directory"),
            Self::NotEmpty => write!(f, "directory not empty"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::TryAgain => write!(f, "try again"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::BrokenPipe => write!(f, "broken pipe"),
            Self::NoSuchProcess => write!(f, "no such process"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::Fs(e) => write!(f, "filesystem error: {:?}", e),
            Self::Sched(e) => write!(f, "scheduler error: {:?}", e),
            Self::Syscall(e) => write!(f, "syscall error: {:?}", e),
            Self::Ipc(e) => write!(f, "ipc error: {:?}", e),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::Sched(err)
    }
}

impl From<SyscallError> for KernelError {
    fn from(err: SyscallError) -> Self {
        Self::Syscall(err)
    }
}

impl From<IpcError> for KernelError {
    fn from(err: IpcError) -> Self {
        Self::Ipc(err)
    }
}

impl KernelError {
    /// Flatten to the negative errno convention used at the syscall boundary.
    ///
    /// Values follow the classic UNIX numbering so user programs see familiar
    /// codes (-2 ENOENT, -9 EBADF, -12 ENOMEM, -22 EINVAL, ...).
    pub fn to_errno(self) -> i32 {
        match self {
            Self::NotFound | Self::Fs(FsError::NotFound) | Self::Ipc(IpcError::NotFound) => -2,
            Self::NoSuchProcess => -3,
            Self::BadDescriptor => -9,
            Self::TryAgain | Self::WouldBlock => -11,
            Self::Sched(_) => -11,
            Self::Ipc(IpcError::QueueFull) | Self::Ipc(IpcError::QueueEmpty) => -11,
            Self::NoMemory => -12,
            Self::PermissionDenied => -13,
            Self::BadAddress { .. } | Self::Syscall(SyscallError::InvalidPointer { .. }) => -14,
            Self::Syscall(SyscallError::InvalidString { .. }) => -14,
            Self::Exists | Self::Fs(FsError::AlreadyExists) | Self::Fs(FsError::AlreadyMounted) => {
                -17
            }
            Self::NotDirectory | Self::Fs(FsError::NotADirectory) => -20,
            Self::IsDirectory | Self::Fs(FsError::IsADirectory) => -21,
            Self::BadArgument => -22,
            Self::Ipc(IpcError::TableFull) => -23,
            Self::Fs(FsError::FileTooLarge) => -27,
            Self::NoSpace => -28,
            Self::BrokenPipe => -32,
            Self::NotSupported | Self::Fs(FsError::NotSupported) => -38,
            Self::Syscall(SyscallError::InvalidSyscall { .. }) => -38,
            Self::NotEmpty | Self::Fs(FsError::DirectoryNotEmpty) => -39,
            Self::Ipc(IpcError::MessageTooBig) => -90,
            Self::Fs(_) => -5,
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_uses_classic_numbers() {
        assert_eq!(KernelError::NotFound.to_errno(), -2);
        assert_eq!(KernelError::BadDescriptor.to_errno(), -9);
        assert_eq!(KernelError::NoMemory.to_errno(), -12);
        assert_eq!(KernelError::BadArgument.to_errno(), -22);
        assert_eq!(KernelError::NoSuchProcess.to_errno(), -3);
        assert_eq!(KernelError::Fs(FsError::DirectoryNotEmpty).to_errno(), -39);
    }

    #[test]
    fn subsystem_errors_convert() {
        fn fails() -> KernelResult<()> {
            Err(FsError::NotADirectory)?
        }
        assert_eq!(fails(), Err(KernelError::Fs(FsError::NotADirectory)));
    }
}
