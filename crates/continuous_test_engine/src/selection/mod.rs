//! Change-driven test selection.
//!
//! Provides the usage graph, the selection filter built from it, and a file
//! watcher that turns compiled class changes into change sets.

pub mod graph;
pub mod index;
pub mod watcher;

pub use index::{Selection, SelectionFilter, UsageIndex};
pub use watcher::{ChangeFeed, WatchError, WatcherConfig};
