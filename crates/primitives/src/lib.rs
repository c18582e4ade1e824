//! Concurrency primitives shared by the lattice crates: a closeable channel
//! with timeout receives, a pending-reply table, and a version-counting
//! condition watcher.

mod channel;
mod pending;
mod watcher;

pub use channel::Channel;
pub use pending::{AsyncReturn, PendingTable};
pub use watcher::AsyncWatcher;
