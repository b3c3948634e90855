//! Change notifications emitted by the store.

use super::is_descendant;

/// A change applied to the store.
///
/// Events are dispatched via a broadcast channel after the change is
/// visible, so a subscriber re-reading the path observes the new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A node was created, written, or had its permissions changed.
    Written { path: String },
    /// A node and its whole subtree were removed.
    Removed { path: String },
}

impl Event {
    /// Path of the node this event refers to.
    pub fn path(&self) -> &str {
        match self {
            Event::Written { path } | Event::Removed { path } => path,
        }
    }

    /// Whether a watch registered on `watched` fires for this event.
    ///
    /// Watches fire for the node itself and anything below it. Removing an
    /// ancestor also removes the watched node, so that fires too.
    pub fn affects(&self, watched: &str) -> bool {
        let path = self.path();
        if path == watched || is_descendant(path, watched) {
            return true;
        }
        matches!(self, Event::Removed { .. }) && is_descendant(watched, path)
    }
}
