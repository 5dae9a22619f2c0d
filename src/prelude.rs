//! Common imports every module in this crate pulls in with `use
//! crate::prelude::*`, in the teacher's `src/prelude.rs` style.

pub use crate::errno::{Errno, KResult};
pub use alloc::boxed::Box;
pub use alloc::string::{String, ToString};
pub use alloc::sync::Arc;
pub use alloc::vec::Vec;

pub use klog::{print, println, println_debug, println_fatal, println_info, println_trace, println_warn};

pub use spinlock::Spin;

/// Shorthand for a fallible operation whose `Err` case should simply be
/// propagated; kept for readability at call sites with long `?` chains.
#[macro_export]
macro_rules! dont_check {
    ($e:expr) => {
        let _ = $e;
    };
}
