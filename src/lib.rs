//! A multidimensional spatial index built on the X-tree family: an R*-tree
//! split heuristic with "supernode" overflow handling for clusters that
//! have no clean geometric split. Points, minimum bounding rectangles, and
//! node identity are addressed through the types in [mbr] and [types];
//! [bucket] implements the tree itself; [index] is the public façade.

mod arena;
mod bucket;
mod cache;
mod config;
mod durable;
mod error;
mod gate;
mod index;
mod iter;
mod mbr;
mod ofloat;
mod pagetrack;
mod snapshot;
mod types;

pub use crate::config::{Mode, Params};
pub use crate::error::Error;
pub use crate::index::{Index, IndexIter};
pub use crate::mbr::Mbr;
pub use crate::types::{ChildRef, DataRecord, NodeId, NodeKind, QueryMode, TraversalOrder};
pub use crate::error::Result;
