//! Deserializer for clustered VM heap snapshots.
//!
//! A snapshot persists a complete object heap (plus optional machine code
//! and read-only data) as one or two blobs. [`snapshot::Snapshot::parse`]
//! reconstructs the object graph in two passes: an allocation pass that
//! assigns every object its reference id, and a fill pass that populates
//! fields once every id is known. The result exposes the reference table,
//! the clusters, the linked class table and a set of convenience indices.

pub mod clusters;
pub mod consts;
pub mod error;
pub mod link;
pub mod reader;
pub mod refs;
pub mod snapshot;
pub mod tables;
pub mod value;

mod base_objects;

pub use base_objects::base_object_count;

pub mod prelude {
    //! Re-exports of the types needed to parse and inspect a snapshot.

    pub use crate::clusters::{ClassRef, Cluster, ElemKind, HandlerKind};
    pub use crate::consts::{Arch, Kind};
    pub use crate::error::ParseError;
    pub use crate::link::{EntryPoint, Indices};
    pub use crate::reader::SnapshotReader;
    pub use crate::refs::RefTable;
    pub use crate::snapshot::{Options, Snapshot};
    pub use crate::value::{Object, PathSeg, Payload, RefId, SourceRef, Value};
}
