//! Bit-exact binary image save/load for the compiled network
//!
//! The image duplicates the network's topology with pointers replaced by
//! array indices (`u64::MAX` encodes a null edge). Pattern nodes are
//! written in canonical traversal order, joins and rules in arena order,
//! and join links as chained records exactly as they thread through the
//! live structures, so a save/load round trip enumerates identical
//! tuples.
//!
//! Only topology is imaged. Memories, partial matches, and activations
//! are runtime state; a restored network starts empty and is re-primed.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod load;
mod records;
mod save;

pub use load::load_image;
pub use records::{
    BsaveDefrule, BsaveFactPatternNode, BsaveJoinLink, BsaveJoinNode, BsavePatternNodeHeader,
    ImageError, ImageResult, IMAGE_MAGIC, IMAGE_VERSION, NULL_INDEX,
};
pub use save::save_image;
