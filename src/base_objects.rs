//! Predefined base objects shared by every snapshot
//!
//! A snapshot's first `num_base_objects` references point at objects the
//! runtime guarantees to exist: null and the sentinels, a handful of empty
//! containers, cached descriptors, the predefined classes and, when the
//! snapshot carries no code of its own, the stub code entries.

use crate::consts::{CACHED_DESCRIPTOR_COUNT, CACHED_ICDATA_ARRAY_COUNT};
use crate::tables;

/// One synthesized base object.
#[derive(Debug, Clone)]
pub(crate) struct BaseEntry {
    /// Runtime type of the entry, as a display name.
    pub type_name: &'static str,
    /// Display value of the entry.
    pub value: String,
    /// Class id, for the predefined class entries.
    pub cid: Option<i64>,
}

impl BaseEntry {
    fn new(type_name: &'static str, value: impl Into<String>) -> Self {
        Self { type_name, value: value.into(), cid: None }
    }

    fn class(value: impl Into<String>, cid: i64) -> Self {
        Self { type_name: "Class", value: value.into(), cid: Some(cid) }
    }
}

/// The base object set, in reference order starting at id 1.
pub(crate) fn base_entries(includes_code: bool) -> Vec<BaseEntry> {
    let mut entries = vec![
        BaseEntry::new("Null", "null"),
        BaseEntry::new("Null", "sentinel"),
        BaseEntry::new("Null", "transition_sentinel"),
        BaseEntry::new("Array", "<empty_array>"),
        BaseEntry::new("Array", "<zero_array>"),
        BaseEntry::new("Type", "<dynamic type>"),
        BaseEntry::new("Type", "<void type>"),
        BaseEntry::new("TypeArguments", "[]"),
        BaseEntry::new("bool", "true"),
        BaseEntry::new("bool", "false"),
        BaseEntry::new("Array", "<extractor parameter types>"),
        BaseEntry::new("Array", "<extractor parameter names>"),
        BaseEntry::new("ContextScope", "<empty>"),
        BaseEntry::new("ObjectPool", "<empty>"),
        BaseEntry::new("CompressedStackMaps", "<empty>"),
        BaseEntry::new("PcDescriptors", "<empty>"),
        BaseEntry::new("LocalVarDescriptors", "<empty>"),
        BaseEntry::new("ExceptionHandlers", "<empty>"),
    ];

    for i in 0..CACHED_DESCRIPTOR_COUNT {
        entries.push(BaseEntry::new("ArgumentsDescriptor", format!("<cached arguments descriptor {i}>")));
    }
    for i in 0..CACHED_ICDATA_ARRAY_COUNT {
        entries.push(BaseEntry::new("Array", format!("<empty icdata entries {i}>")));
    }
    entries.push(BaseEntry::new("Array", "<empty subtype entries>"));

    // The predefined classes between Class and Instance, except the two
    // abstract ones that never get instantiated.
    let first = tables::class_id("Class").expect("class table contains Class");
    let last = tables::class_id("Instance").expect("class table contains Instance");
    for cid in first..last {
        let name = tables::class_name(cid).expect("class table is dense");
        if name == "Error" || name == "CallSiteData" {
            continue;
        }
        entries.push(BaseEntry::class(name, cid));
    }
    entries.push(BaseEntry::class("dynamic", tables::class_id("Dynamic").expect("class table contains Dynamic")));
    entries.push(BaseEntry::class("void", tables::class_id("Void").expect("class table contains Void")));

    if !includes_code {
        for stub in tables::stub_code_list() {
            entries.push(BaseEntry::new("Code", format!("<stub code {stub}>")));
        }
    }

    entries
}

/// Number of base objects synthesized for a snapshot without an explicit
/// base. Useful when composing snapshots or crafting headers.
pub fn base_object_count(includes_code: bool) -> usize {
    base_entries(includes_code).len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_the_first_entry() {
        let entries = base_entries(false);
        assert_eq!(entries[0].value, "null");
        assert_eq!(entries[3].value, "<empty_array>");
        assert_eq!(entries[8].value, "true");
    }

    #[test]
    fn class_entries_skip_abstract_classes() {
        let entries = base_entries(true);
        assert!(!entries.iter().any(|e| e.value == "Error"));
        assert!(!entries.iter().any(|e| e.value == "CallSiteData"));
        assert!(entries.iter().any(|e| e.value == "Function" && e.cid.is_some()));
        assert!(entries.iter().any(|e| e.value == "dynamic"));
    }

    #[test]
    fn stubs_are_only_synthesized_without_code() {
        let without_code = base_entries(false);
        let with_code = base_entries(true);
        assert!(without_code.len() > with_code.len());
        assert!(without_code.iter().any(|e| e.type_name == "Code"));
        assert!(!with_code.iter().any(|e| e.type_name == "Code"));
    }
}
