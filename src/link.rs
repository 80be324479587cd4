//! Class-id linking and the post-parse convenience indices

use std::collections::BTreeMap;

use indexmap::IndexMap;
use itertools::Itertools;

use crate::clusters::ClassRef;
use crate::consts::Kind;
use crate::error::ParseError;
use crate::snapshot::{Parser, Snapshot};
use crate::tables;
use crate::value::{PathSeg, Payload, RefId, SourceRef, Value};

/// Entry descriptor of a code object's instructions: which call shape the
/// entry serves and whether it performs argument checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    /// Whether the entry serves polymorphic calls.
    pub polymorphic: bool,
    /// Whether the entry performs its argument checks.
    pub checked: bool,
}

/// Convenience indices built after linking.
#[derive(Debug, Default)]
pub struct Indices {
    /// Object ids grouped by their cluster's class name.
    pub refs_by_class: IndexMap<String, Vec<RefId>>,
    /// String value to string object.
    pub strings: IndexMap<String, RefId>,
    /// Script reference id to owning library.
    pub scripts_lib: BTreeMap<u32, RefId>,
    /// Absolute entry address to (code object, entry descriptor).
    pub entry_points: BTreeMap<u64, (RefId, EntryPoint)>,
    /// Code objects sorted by instruction address.
    pub code_objs: Vec<RefId>,
    /// Instruction start addresses, parallel to `code_objs`.
    pub code_addrs: Vec<u64>,
}

impl Snapshot {
    /// Objects whose cluster has the given class name. Empty when the
    /// indices were not built.
    pub fn get_refs(&self, name: &str) -> &[RefId] {
        self.indices
            .as_ref()
            .and_then(|indices| indices.refs_by_class.get(name))
            .map_or(&[], Vec::as_slice)
    }

    /// Find the code object covering an instruction address. Returns the
    /// code and the offset of the address within its instructions.
    pub fn search_address(&self, addr: u64) -> Option<(RefId, u64)> {
        let indices = self.indices.as_ref()?;
        let pos = indices.code_addrs.partition_point(|&start| start <= addr);
        if pos == 0 {
            return None;
        }
        let code = indices.code_objs[pos - 1];
        let offset = addr - indices.code_addrs[pos - 1];
        let length = self
            .refs
            .get(code)
            .and_then(|obj| obj.payload.get("instructions"))
            .and_then(Value::as_map)
            .and_then(|instr| instr.get("data"))
            .and_then(Value::as_bytes)
            .map_or(0, <[u8]>::len) as u64;
        (offset < length).then_some((code, offset))
    }

    /// Compute the absolute entry addresses of an instructions descriptor
    /// for this snapshot's architecture and kind.
    pub fn entry_points_of(&self, instr: &Payload) -> BTreeMap<u64, EntryPoint> {
        let offsets = tables::entry_offsets(self.arch, self.kind == Kind::FullAot);
        let data_addr = instr.get("data_addr").and_then(Value::as_uint).unwrap_or(0);
        let single_entry = instr
            .get("flags")
            .and_then(Value::as_map)
            .and_then(|flags| flags.get("single_entry"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let unchecked = instr.get("unchecked_entrypoint_pc_offset").and_then(Value::as_uint).unwrap_or(0);

        let mut entries = BTreeMap::new();
        entries.insert(offsets.monomorphic, EntryPoint { polymorphic: false, checked: true });
        if !single_entry {
            entries.insert(offsets.polymorphic, EntryPoint { polymorphic: true, checked: true });
        }
        if unchecked != 0 {
            let unchecked_entries: Vec<_> = entries
                .iter()
                .map(|(offset, entry)| (offset + unchecked, EntryPoint { checked: false, ..*entry }))
                .collect();
            entries.extend(unchecked_entries);
        }
        entries.into_iter().map(|(offset, entry)| (data_addr + offset, entry)).collect()
    }
}

impl<'a> Parser<'a> {
    /// Build the class table and give every instance and type a `_class`
    /// back-pointer.
    pub(crate) fn link_cids(&mut self) -> Result<(), ParseError> {
        let class_cid = tables::class_id("Class");
        let type_cid = tables::class_id("Type");
        let mint_cid = tables::class_id("Mint");
        let instance_cid = tables::class_id("Instance");
        let num_predefined = tables::num_predefined_cids();

        // Class table: parsed Class objects plus the predefined class
        // entries of the base object set.
        let mut classes: BTreeMap<i64, RefId> = BTreeMap::new();
        let mut duplicates = Vec::new();
        for id in self.snap.refs.ids().collect::<Vec<_>>() {
            let Some(obj) = self.snap.refs.get(id) else { continue };
            let Some(cluster) = self.snap.clusters.get(obj.cluster) else { continue };
            let is_class = cluster.cid.cid() == class_cid
                || (cluster.cid == ClassRef::BaseObject
                    && obj.payload.get("type").and_then(Value::as_str) == Some("Class"));
            if !is_class {
                continue;
            }
            if let Some(cid) = obj.payload.get("cid").and_then(Value::as_int) {
                if classes.insert(cid, id).is_some() {
                    duplicates.push(cid);
                }
            }
        }
        for cid in duplicates {
            self.notice(format!("duplicate class with id {cid}"));
        }

        // Collect the links first; the table is mutated afterwards.
        let mut links: Vec<(RefId, Option<i64>)> = Vec::new();
        for id in self.snap.refs.ids().collect::<Vec<_>>() {
            let Some(obj) = self.snap.refs.get(id) else { continue };
            let Some(cluster) = self.snap.clusters.get(obj.cluster) else { continue };
            let cid = cluster.cid.cid();
            let is_instance = cid == instance_cid || cid.map_or(false, |cid| cid >= num_predefined);
            if is_instance {
                links.push((id, cid));
            }
            if cid == type_cid {
                let class_id = obj
                    .payload
                    .get("type_class_id")
                    .and_then(Value::as_ref_id)
                    .and_then(|target| self.snap.refs.get(target))
                    .filter(|target| {
                        self.snap.clusters.get(target.cluster).and_then(|c| c.cid.cid()) == mint_cid
                    })
                    .and_then(|target| target.payload.get("value"))
                    .and_then(Value::as_int);
                links.push((id, class_id));
            }
        }

        let mut broken = false;
        for (id, cid) in links {
            let class = cid.and_then(|cid| classes.get(&cid).copied());
            match class {
                Some(class_ref) => {
                    if let Some(obj) = self.snap.refs.get_mut(id) {
                        obj.payload.insert("_class".into(), Value::Ref(class_ref));
                    }
                    if let Some(class_obj) = self.snap.refs.get_mut(class_ref) {
                        class_obj
                            .sources
                            .push(SourceRef { parent: id, path: vec![PathSeg::Field("_class".into())] });
                    }
                }
                None => {
                    broken = true;
                    if let Some(obj) = self.snap.refs.get_mut(id) {
                        obj.payload.insert("_class".into(), Value::Null);
                    }
                }
            }
        }
        if broken {
            self.notice("there were broken or invalid class-id references; a null _class was set");
        }
        self.snap.classes = classes;
        Ok(())
    }

    /// Populate the convenience indices: refs by class name, strings by
    /// value, scripts by library, code by address and entry points.
    pub(crate) fn build_tables(&mut self) -> Result<(), ParseError> {
        let mut indices = Indices::default();

        for cluster in &self.snap.clusters {
            if cluster.synthetic {
                continue;
            }
            let name = cluster.cid.display_name();
            indices.refs_by_class.entry(name).or_default().extend(cluster.refs.iter().copied());
        }

        let mut string_refs: Vec<RefId> = Vec::new();
        for class in ["OneByteString", "TwoByteString"] {
            if let Some(refs) = indices.refs_by_class.get(class) {
                string_refs.extend(refs.iter().copied());
            }
        }
        for id in &string_refs {
            let value = self.snap.refs.get(*id).and_then(|obj| obj.payload.get("value")).and_then(Value::as_str);
            if let Some(value) = value {
                indices.strings.insert(value.to_string(), *id);
            }
        }
        if indices.strings.len() != string_refs.len() {
            self.notice(format!("there are {} duplicate strings", string_refs.len() - indices.strings.len()));
        }

        let libraries = indices.refs_by_class.get("Library").cloned().unwrap_or_default();
        let mut multiply_owned = Vec::new();
        for library in libraries {
            let owned = self
                .snap
                .refs
                .get(library)
                .and_then(|obj| obj.payload.get("owned_scripts"))
                .and_then(Value::as_ref_id)
                .and_then(|scripts| self.snap.values(scripts));
            for value in owned.unwrap_or_default() {
                let Some(script) = value.as_ref_id() else { continue };
                let RefId::Id(raw) = script else { continue };
                if self.snap.is_null(script) {
                    continue;
                }
                if indices.scripts_lib.insert(raw, library).is_some() {
                    multiply_owned.push(script);
                }
            }
        }
        for script in multiply_owned {
            self.notice(format!("script {script} is owned by multiple libraries"));
        }

        if self.snap.includes_code && self.opts.parse_rodata {
            self.index_code(&mut indices)?;
        }

        // Consistency checks over the finished tables.
        let script_count = indices.refs_by_class.get("Script").map_or(0, Vec::len);
        if script_count != indices.scripts_lib.len() {
            self.notice(format!(
                "there are {script_count} scripts but {} are associated to a library",
                indices.scripts_lib.len(),
            ));
        }
        let classes = indices.refs_by_class.get("Class").cloned().unwrap_or_default();
        for class in classes {
            let Some(obj) = self.snap.refs.get(class) else { continue };
            let library = obj.payload.get("library").and_then(Value::as_ref_id);
            let script = obj.payload.get("script").and_then(Value::as_ref_id);
            if let (Some(library), Some(RefId::Id(script))) = (library, script) {
                if let Some(owner) = indices.scripts_lib.get(&script) {
                    if *owner != library {
                        self.notice(format!("class {class} does not have a matching script and library"));
                    }
                }
            }
        }

        self.snap.indices = Some(indices);
        Ok(())
    }

    /// Index code objects by instruction address and record their entry
    /// points. Code without parsed instructions (base-instruction refs) is
    /// skipped.
    fn index_code(&mut self, indices: &mut Indices) -> Result<(), ParseError> {
        let code_refs = indices.refs_by_class.get("Code").cloned().unwrap_or_default();
        let mut codes: Vec<(u64, u64, RefId)> = Vec::new();
        for code in code_refs {
            let Some(obj) = self.snap.refs.get(code) else { continue };
            let Some(instr) = obj.payload.get("instructions").and_then(Value::as_map) else { continue };
            let Some(addr) = instr.get("data_addr").and_then(Value::as_uint) else { continue };
            let length = instr.get("data").and_then(Value::as_bytes).map_or(0, <[u8]>::len) as u64;
            for (entry_addr, entry) in self.snap.entry_points_of(instr) {
                indices.entry_points.insert(entry_addr, (code, entry));
            }
            codes.push((addr, length, code));
        }
        codes.sort_by_key(|&(addr, ..)| addr);

        let mut overlaps = Vec::new();
        for ((a_addr, a_len, _), (b_addr, ..)) in codes.iter().copied().tuple_windows() {
            if a_addr + a_len > b_addr {
                overlaps.push((a_addr, b_addr));
            }
        }
        for (a_addr, b_addr) in overlaps {
            self.warn(format!("code regions at {a_addr:#x} and {b_addr:#x} overlap"))?;
        }

        indices.code_addrs = codes.iter().map(|&(addr, ..)| addr).collect();
        indices.code_objs = codes.into_iter().map(|(.., code)| code).collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_point_shapes() {
        let checked = EntryPoint { polymorphic: false, checked: true };
        let unchecked = EntryPoint { checked: false, ..checked };
        assert!(!unchecked.checked);
        assert!(!unchecked.polymorphic);
    }
}
