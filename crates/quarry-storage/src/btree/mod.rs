//! B+Tree index over the buffer pool.
//!
//! Nodes live in the data region of fixed-size pages and are viewed through
//! byte-level layouts in [`page`]; the index itself ([`index`]) drives
//! search, ordered insert with recursive split, delete with
//! redistribute-or-coalesce, and leaf-chain iteration ([`iterator`]). Keys
//! are fixed-width and monomorphized per width through [`types`].

pub mod index;
pub mod iterator;
pub mod page;
pub mod types;

pub use index::BPlusTree;
pub use iterator::IndexIterator;
pub use types::{GenericComparator, GenericKey, IndexKey, KeyComparator, NodeType};
