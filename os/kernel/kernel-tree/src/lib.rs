//! # Ordered Containers for the Memory Manager
//!
//! - [`Arena`]: slot storage addressed by generation-checked [`Handle`]s. A
//!   handle stops resolving once its slot is freed or its content is moved,
//!   even if the slot is later reused.
//! - [`AvlTree`]: a height-balanced binary search tree whose nodes live in an
//!   [`Arena`]. Besides exact lookups it answers the two asymmetric queries the
//!   region allocator is built on: smallest key `>=` a bound
//!   ([`AvlTree::find_greater_or_equal`]) and largest key `<` a bound
//!   ([`AvlTree::find_less`]).
//!
//! Node storage grows through the global allocator with `try_reserve`, so an
//! exhausted heap surfaces as [`TreeError::OutOfMemory`] instead of aborting.
//! Removal never allocates.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod arena;
mod avl;

pub use arena::{Arena, ArenaFull, Handle};
pub use avl::{AvlTree, Iter, NodeId};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TreeError {
    #[error("key is already present in the tree")]
    DuplicateKey,
    #[error("out of memory while allocating a tree node")]
    OutOfMemory,
}

impl From<ArenaFull> for TreeError {
    fn from(_: ArenaFull) -> Self {
        Self::OutOfMemory
    }
}
