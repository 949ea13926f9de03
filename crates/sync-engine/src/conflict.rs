//! Conflict resolution between a local and a remote copy of a record

use std::cmp::Ordering;
use storage::Record;

use crate::config::ConflictStrategy;

/// Which copy survives a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    /// Keep the local record and push it later
    Local,
    /// Overwrite the local record with the remote one
    Remote,
}

/// Decide which copy wins
///
/// Ties always go to the remote copy.
pub fn resolve(strategy: ConflictStrategy, local: &Record, remote: &Record) -> Winner {
    let ordering = match strategy {
        ConflictStrategy::LastWriteWins => remote.updated_at.cmp(&local.updated_at),
        ConflictStrategy::HighestVersion => remote
            .version
            .cmp(&local.version)
            .then(remote.updated_at.cmp(&local.updated_at)),
    };

    match ordering {
        Ordering::Less => Winner::Local,
        Ordering::Equal | Ordering::Greater => Winner::Remote,
    }
}
