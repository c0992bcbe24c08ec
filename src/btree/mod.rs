mod btree;
mod iterator;
mod node;

pub use btree::{BPlusTree, PositionHint};
pub use iterator::BTreeIterator;
