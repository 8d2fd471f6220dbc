use caps::{CapSet, Capability};
use tracing::debug;

use crate::error::{Error, Result};

/// Returns `true` if the calling process runs with an effective UID of 0.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Check whether the calling process may read the memory image of other processes, i.e. whether
/// it runs as root or holds `CAP_SYS_PTRACE` in its effective set.
///
/// # Errors
///
/// Returns [`Error::InsufficientPrivilege`] if it may not, or [`Error::Caps`] if the capability
/// sets could not be retrieved.
pub fn check_privilege() -> Result<()> {
    if is_root() {
        debug!("running as root");
        return Ok(());
    }
    if caps::has_cap(None, CapSet::Effective, Capability::CAP_SYS_PTRACE)? {
        debug!("running with CAP_SYS_PTRACE");
        return Ok(());
    }
    Err(Error::InsufficientPrivilege)
}
