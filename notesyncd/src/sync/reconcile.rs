use notesync_core::ObjectStat;

use super::registry::Note;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Download,
    LocalIsCurrent,
    RemoteMissing,
}

/// Decides whether the remote copy of `local` should replace it.
///
/// Local wins ties, so a no-op sync never downloads.
pub fn decide(local: &Note, remote: &ObjectStat) -> Decision {
    if !remote.exists {
        return Decision::RemoteMissing;
    }
    match local.updated_at {
        None => Decision::Download,
        Some(local_at) if remote.remote_modified_at > local_at => Decision::Download,
        Some(_) => Decision::LocalIsCurrent,
    }
}
