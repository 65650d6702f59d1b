//! Error numbers returned (negated) by syscalls.

pub const ENOENT: i64 = 2;
pub const ESRCH: i64 = 3;
pub const EIO: i64 = 5;
pub const ECHILD: i64 = 10;
pub const EEXIST: i64 = 17;
pub const EINVAL: i64 = 22;
pub const EFBIG: i64 = 27;
pub const ENOSYS: i64 = 38;
pub const ELOOP: i64 = 40;
