//! Change events delivered by remote subscriptions.

use crate::record::RemoteDocument;

/// Type of remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Document was created.
    Added,
    /// Document was overwritten.
    Modified,
    /// Document was hard-deleted.
    Removed,
}

/// A single change pushed by a remote subscription.
///
/// For `Removed` events the document carries the last known fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    /// Type of change.
    pub kind: ChangeKind,
    /// The affected document.
    pub document: RemoteDocument,
}

impl RemoteChange {
    /// Creates an added event.
    pub fn added(document: RemoteDocument) -> Self {
        Self {
            kind: ChangeKind::Added,
            document,
        }
    }

    /// Creates a modified event.
    pub fn modified(document: RemoteDocument) -> Self {
        Self {
            kind: ChangeKind::Modified,
            document,
        }
    }

    /// Creates a removed event.
    pub fn removed(document: RemoteDocument) -> Self {
        Self {
            kind: ChangeKind::Removed,
            document,
        }
    }
}
