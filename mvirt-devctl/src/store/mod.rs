//! Hierarchical key-value store abstraction.
//!
//! The device controller only talks to the store through the [`Store`] and
//! [`Transaction`] traits. [`MemoryStore`] is an in-process implementation
//! with optimistic transactions and broadcast watches.

mod error;
mod event;
mod memory;
mod traits;

pub use error::{Result, StoreError};
pub use event::Event;
pub use memory::MemoryStore;
pub use traits::{Fields, Permission, Store, Transaction};

/// Join a base path and a relative key.
pub fn join(base: &str, key: &str) -> String {
    if key.is_empty() {
        base.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, key)
    } else {
        format!("{}/{}", base, key)
    }
}

/// Returns true if `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return path != "/" && path.starts_with('/');
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Parent of an absolute path, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}
