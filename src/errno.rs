//! Error codes returned through the kernel's `(value, errno)` pair
//! convention (SPEC_FULL.md §6/§7).

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// No error. Numerically zero so `errno == 0` means success, matching
    /// the syscall return-pair convention.
    EOK = 0,
    ENOENT = 2,
    ENOEXEC = 8,
    EBADF = 9,
    ENOMEM = 12,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    ENOTDIR = 20,
    EINVAL = 22,
    EMFILE = 24,
    ERANGE = 34,
    ENOTSUP = 95,
}

impl Errno {
    pub const fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errno::EOK => "EOK",
            Errno::ENOENT => "ENOENT",
            Errno::ENOEXEC => "ENOEXEC",
            Errno::EBADF => "EBADF",
            Errno::ENOMEM => "ENOMEM",
            Errno::EFAULT => "EFAULT",
            Errno::EBUSY => "EBUSY",
            Errno::EEXIST => "EEXIST",
            Errno::ENOTDIR => "ENOTDIR",
            Errno::EINVAL => "EINVAL",
            Errno::EMFILE => "EMFILE",
            Errno::ERANGE => "ERANGE",
            Errno::ENOTSUP => "ENOTSUP",
        };
        f.write_str(name)
    }
}

pub type KResult<T> = Result<T, Errno>;

/// Converts a `KResult` into the syscall ABI's `(value, errno)` pair.
pub fn to_pair<T: Default>(result: KResult<T>) -> (T, i32) {
    match result {
        Ok(value) => (value, Errno::EOK.as_raw()),
        Err(errno) => (T::default(), errno.as_raw()),
    }
}
