//! ZFS side of automount: runs `zfs`/`zpool`, parses what they print, sorts
//! disks for TRIM, and gates boot until device identifiers are stable.

mod command;
mod disk;
mod parse;
mod readiness;
mod system;

pub use command::{CommandExecutor, Output, SystemRunner};
pub use disk::DiskDetector;
pub use readiness::{BootGate, GateOutcome};
pub use system::{discover_binary, SystemZfs, FALLBACK_DIR, SEARCH_DIRS};
