//! Bundled static tables: class ids, stub names, offsets and per-handler field lists

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::consts::{Arch, Kind};

static CLASS_IDS: Lazy<Vec<String>> = Lazy::new(|| {
    serde_json::from_str(include_str!("data/class_ids.json")).expect("bundled class-id table is valid")
});

static CLASS_IDS_BY_NAME: Lazy<HashMap<&'static str, i64>> = Lazy::new(|| {
    CLASS_IDS.iter().enumerate().map(|(cid, name)| (name.as_str(), cid as i64)).collect()
});

static STUB_CODE_LIST: Lazy<Vec<String>> = Lazy::new(|| {
    serde_json::from_str(include_str!("data/stub_code_list.json")).expect("bundled stub-code table is valid")
});

/// Name of a predefined class id, if `cid` is predefined.
pub fn class_name(cid: i64) -> Option<&'static str> {
    usize::try_from(cid).ok().and_then(|cid| CLASS_IDS.get(cid)).map(String::as_str)
}

/// Class id of a predefined class name.
pub fn class_id(name: &str) -> Option<i64> {
    CLASS_IDS_BY_NAME.get(name).copied()
}

/// First class id reserved for user-defined classes.
pub fn num_predefined_cids() -> i64 {
    CLASS_IDS.len() as i64
}

/// Names of the stub code entries shared through the base object set.
pub fn stub_code_list() -> &'static [String] {
    &STUB_CODE_LIST
}

/* TYPED DATA CID RANGES */

// Typed-data class ids come in consecutive (internal, view, external)
// triples from Int8Array up to ByteDataView.
const TYPED_DATA_REMAINDER_INTERNAL: i64 = 0;
const TYPED_DATA_REMAINDER_VIEW: i64 = 1;
const TYPED_DATA_REMAINDER_EXTERNAL: i64 = 2;

fn typed_data_remainder(cid: i64) -> Option<i64> {
    let base = class_id("TypedDataInt8Array").expect("typed-data base class is predefined");
    let end = class_id("ByteDataView").expect("byte-data view class is predefined");
    (base..end).contains(&cid).then(|| (cid - base) % 3)
}

/// Whether `cid` is an internally-stored typed data array.
pub fn is_typed_data_cid(cid: i64) -> bool {
    typed_data_remainder(cid) == Some(TYPED_DATA_REMAINDER_INTERNAL)
}

/// Whether `cid` is a typed data view.
pub fn is_typed_data_view_cid(cid: i64) -> bool {
    typed_data_remainder(cid) == Some(TYPED_DATA_REMAINDER_VIEW) || Some(cid) == class_id("ByteDataView")
}

/// Whether `cid` is an externally-stored typed data array.
pub fn is_external_typed_data_cid(cid: i64) -> bool {
    typed_data_remainder(cid) == Some(TYPED_DATA_REMAINDER_EXTERNAL)
}

/* RUNTIME OFFSETS */

#[derive(Debug, Deserialize)]
struct ArchEntryPoints {
    jit: (u64, u64),
    aot: (u64, u64),
}

#[derive(Debug, Deserialize)]
struct RuntimeOffsets {
    word_size: HashMap<String, u32>,
    entry_points: HashMap<String, ArchEntryPoints>,
}

static RUNTIME_OFFSETS: Lazy<RuntimeOffsets> = Lazy::new(|| {
    serde_json::from_str(include_str!("data/runtime_offsets.json")).expect("bundled offset table is valid")
});

/// Word size in bytes of the given architecture.
pub fn word_size(arch: Arch) -> u32 {
    *RUNTIME_OFFSETS.word_size.get(arch.key()).expect("offset table covers every architecture")
}

/// Monomorphic and polymorphic entry offsets into a code object's
/// instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOffsets {
    /// Offset of the monomorphic (checked) entry.
    pub monomorphic: u64,
    /// Offset of the polymorphic entry.
    pub polymorphic: u64,
}

/// Entry offsets for an architecture, in JIT or AOT flavor.
pub fn entry_offsets(arch: Arch, aot: bool) -> EntryOffsets {
    let entry = RUNTIME_OFFSETS.entry_points.get(arch.key()).expect("offset table covers every architecture");
    let (monomorphic, polymorphic) = if aot { entry.aot } else { entry.jit };
    EntryOffsets { monomorphic, polymorphic }
}

/* PER-HANDLER FIELD LISTS */

#[derive(Debug, Deserialize)]
struct RawTypeEntry {
    fields: Vec<String>,
    #[serde(default)]
    last: Option<HashMap<String, String>>,
}

static TYPE_FIELDS: Lazy<HashMap<String, RawTypeEntry>> = Lazy::new(|| {
    serde_json::from_str(include_str!("data/type_fields.json")).expect("bundled field table is valid")
});

/// The reference fields the driver reads for each handler before calling
/// its fill routine, pruned for a concrete snapshot configuration.
#[derive(Debug, Clone)]
pub struct TypeTable {
    fields: HashMap<String, Vec<String>>,
}

impl TypeTable {
    /// Build the field table for a snapshot of the given kind. `FullCore`
    /// shares the `Full` prunings.
    pub fn build(kind: Kind, is_precompiled: bool) -> Self {
        let group = match kind {
            Kind::FullJit => "jit",
            Kind::FullAot => "aot",
            _ => "full",
        };
        let mut fields = HashMap::new();
        for (name, entry) in TYPE_FIELDS.iter() {
            let mut list = entry.fields.clone();
            if let Some(last) = entry.last.as_ref().and_then(|last| last.get(group)) {
                if let Some(idx) = list.iter().position(|field| field == last) {
                    list.truncate(idx + 1);
                }
            }
            if name == "ClosureData" && kind == Kind::FullAot {
                list.retain(|field| field != "context_scope");
            }
            if name == "Code" && !is_precompiled && kind != Kind::FullJit {
                list.retain(|field| field != "deopt_info_array" && field != "static_calls_target_table");
            }
            fields.insert(name.clone(), list);
        }
        Self { fields }
    }

    /// Ordered reference fields of a handler, if it has a field list.
    pub fn fields(&self, handler: &str) -> Option<&[String]> {
        self.fields.get(handler).map(Vec::as_slice)
    }
}
