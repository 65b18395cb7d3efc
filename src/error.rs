// Kernel error type shared by syscalls and most internal interfaces.

/// Every fallible kernel interface reports one of these. The syscall ABI
/// returns the raw code, with `0` reserved for "no error" (a successful
/// call never constructs a `KernelError` at all).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum KernelError {
    /// Something failed without providing a meaningful code. Converting a
    /// bare `false` into an error lands here; our own code shouldn't.
    Unknown = 1,
    /// The object was not found.
    NotFound = 2,
    /// A leaf was requested but the name refers to a branch, or vice versa.
    WrongType = 3,
    /// An object of the same name already exists.
    AlreadyExists = 4,
    /// The name is not valid for use in the system tree.
    InvalidName = 5,
    /// A parameter is not valid in some way.
    InvalidParam = 6,
    /// The requested operation is not supported by this object.
    InvalidOp = 7,
    /// Out of physical memory, handles, or another finite resource.
    OutOfResource = 8,
    /// A position or length lies outside the valid range.
    OutOfRange = 9,
    /// A device driver reported a hardware failure.
    DeviceFailed = 10,
    /// The target process never registered for message passing.
    SyncMsgNotAccepted = 11,
    /// A message is still checked out; complete it first.
    SyncMsgIncomplete = 12,
    /// No message is waiting in the queue.
    SyncMsgQueueEmpty = 13,
    /// The supplied header does not match the checked-out message.
    SyncMsgMismatch = 14,
}

pub type Result<T> = core::result::Result<T, KernelError>;

/// ABI code for a successful syscall.
pub const NO_ERROR: u64 = 0;

impl KernelError {
    /// Raw code as seen by user programs.
    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn description(self) -> &'static str {
        match self {
            KernelError::Unknown => "unknown error",
            KernelError::NotFound => "not found",
            KernelError::WrongType => "wrong object type",
            KernelError::AlreadyExists => "already exists",
            KernelError::InvalidName => "invalid name",
            KernelError::InvalidParam => "invalid parameter",
            KernelError::InvalidOp => "invalid operation",
            KernelError::OutOfResource => "out of resource",
            KernelError::OutOfRange => "out of range",
            KernelError::DeviceFailed => "device failed",
            KernelError::SyncMsgNotAccepted => "process does not accept messages",
            KernelError::SyncMsgIncomplete => "previous message not completed",
            KernelError::SyncMsgQueueEmpty => "message queue empty",
            KernelError::SyncMsgMismatch => "message mismatch",
        }
    }
}

/// Collapse a `Result` into the syscall ABI code.
pub fn to_abi(result: Result<()>) -> u64 {
    match result {
        Ok(()) => NO_ERROR,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(NO_ERROR, 0);
        assert_eq!(KernelError::Unknown.code(), 1);
        assert_eq!(KernelError::NotFound.code(), 2);
        assert_eq!(KernelError::OutOfRange.code(), 9);
        assert_eq!(KernelError::SyncMsgMismatch.code(), 14);
    }

    #[test]
    fn abi_collapse() {
        assert_eq!(to_abi(Ok(())), NO_ERROR);
        assert_eq!(to_abi(Err(KernelError::InvalidOp)), 7);
    }
}
