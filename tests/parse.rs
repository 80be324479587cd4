//! End-to-end parsing scenarios over synthesized snapshot blobs

use vm_snapshot::base_object_count;
use vm_snapshot::consts::EXPECTED_VERSION;
use vm_snapshot::prelude::*;
use vm_snapshot::tables::{self, TypeTable};

const FULL: i64 = 0;
const FULL_JIT: i64 = 2;

/// Little-endian writer mirroring the wire encodings the parser reads.
#[derive(Default)]
struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn i64(&mut self, value: i64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    fn uleb(&mut self, mut value: u64) {
        loop {
            let group = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.u8(group);
                return;
            }
            self.u8(group | 0x80);
        }
    }

    fn sleb(&mut self, mut value: i64) {
        loop {
            let group = (value & 0x7f) as u8;
            value >>= 7;
            let done = (value == 0 && group & 0x40 == 0) || (value == -1 && group & 0x40 != 0);
            if done {
                self.u8(group);
                return;
            }
            self.u8(group | 0x80);
        }
    }

    /// Pad the stream so the next byte lands on `alignment`.
    fn align(&mut self, alignment: usize) {
        while self.bytes.len() % alignment != 0 {
            self.u8(0);
        }
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }
}

fn cid_of(name: &str) -> i32 {
    tables::class_id(name).expect("predefined class") as i32
}

/// Start a snapshot blob: magic, length placeholder, kind, version,
/// features and the four header counts.
fn begin(kind: i64, features: &str, num_base: u64, num_objects: u64, num_clusters: u64) -> Writer {
    let mut w = Writer::default();
    w.u32(0xdcdc_f5f5);
    w.i64(0); // patched by finish()
    w.i64(kind);
    assert_eq!(EXPECTED_VERSION.len(), 32);
    w.raw(EXPECTED_VERSION.as_bytes());
    w.raw(features.as_bytes());
    w.u8(0);
    w.uleb(num_base);
    w.uleb(num_objects);
    w.uleb(num_clusters);
    w.uleb(0); // code order length
    w
}

/// Patch the body length into the header and return the blob.
fn finish(mut w: Writer) -> Vec<u8> {
    let length = (w.bytes.len() - 4) as i64;
    w.bytes[4..12].copy_from_slice(&length.to_le_bytes());
    w.bytes
}

/// Like [`finish`], but padded out to the read-only region alignment that
/// code-carrying snapshots require.
fn finish_with_code(w: Writer) -> Vec<u8> {
    let mut bytes = finish(w);
    while bytes.len() % 32 != 0 {
        bytes.push(0);
    }
    bytes
}

fn object_store_field_count(kind: Kind) -> usize {
    TypeTable::build(kind, false).fields("ObjectStore").expect("ObjectStore field list").len()
}

/// Isolate roots: one null reference per object-store field.
fn write_isolate_roots(w: &mut Writer, kind: Kind) {
    for _ in 0..object_store_field_count(kind) {
        w.uleb(1);
    }
}

fn parse(data: &[u8]) -> Snapshot {
    Snapshot::parse(data, None, Options::default()).expect("snapshot should parse")
}

fn payload_of(snap: &Snapshot, id: RefId) -> &Payload {
    &snap.refs.get(id).expect("object exists").payload
}

/// Collect every reference stored anywhere in a value.
fn collect_refs(value: &Value, out: &mut Vec<RefId>) {
    match value {
        Value::Ref(id) => out.push(*id),
        Value::List(values) => values.iter().for_each(|v| collect_refs(v, out)),
        Value::Map(map) => map.values().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

/* SCENARIOS */

#[test]
fn empty_isolate() {
    let num_base = base_object_count(false) as u64;
    let mut w = begin(FULL, "x64 product", num_base, 0, 0);
    write_isolate_roots(&mut w, Kind::Full);
    let snap = parse(&finish(w));

    assert_eq!(snap.kind, Kind::Full);
    assert_eq!(snap.arch, Arch::X64);
    assert!(snap.is_64);
    assert_eq!(snap.refs.len() as u64, num_base + 1);
    assert_eq!(snap.clusters.iter().filter(|c| !c.synthetic).count(), 0);
    assert_eq!(snap.refs.root().id, RefId::Root);
    // The roots referenced the shared null object.
    let null_sources = &snap.refs.get(RefId::Id(1)).unwrap().sources;
    assert_eq!(null_sources.len(), object_store_field_count(Kind::Full));
    assert!(null_sources.iter().all(|source| source.parent == RefId::Root));
}

#[test]
fn single_mint() {
    let num_base = base_object_count(false) as u64;
    let mut w = begin(FULL, "x64 product", num_base, 1, 1);
    w.i32(cid_of("Mint"));
    w.uleb(1);
    w.i64(0x1122_3344_5566_7788);
    write_isolate_roots(&mut w, Kind::Full);
    let snap = parse(&finish(w));

    let id = RefId::Id(num_base as u32 + 1);
    assert_eq!(payload_of(&snap, id).get("value"), Some(&Value::Int(0x1122_3344_5566_7788)));
    let cluster = snap.cluster_of(id).unwrap();
    assert_eq!(cluster.handler, HandlerKind::Mint);
    assert_eq!(cluster.cid, ClassRef::Cid(tables::class_id("Mint").unwrap()));
    assert!(snap.is_cid(id, "Mint"));
    assert!(snap.is_own(id));
    assert!(!snap.is_base(id));
}

#[test]
fn one_byte_string_without_rodata() {
    let num_base = base_object_count(false) as u64;
    let mut w = begin(FULL, "x64 product", num_base, 1, 1);
    w.i32(cid_of("OneByteString"));
    w.uleb(1);
    w.uleb(3); // length, allocation pass
    // Fill pass repeats the length before the payload.
    w.uleb(3);
    w.u8(1);
    w.u32(0x1234_5678);
    w.raw(b"abc");
    write_isolate_roots(&mut w, Kind::Full);
    let snap = parse(&finish(w));

    let id = RefId::Id(num_base as u32 + 1);
    let payload = payload_of(&snap, id);
    assert_eq!(payload.get("value"), Some(&Value::Str("abc".into())));
    assert_eq!(payload.get("canonical"), Some(&Value::Bool(true)));
    assert_eq!(payload.get("hash"), Some(&Value::Uint(0x1234_5678)));
    assert!(snap.is_string(id));

    // String index consistency.
    let indices = snap.indices.as_ref().unwrap();
    assert_eq!(indices.strings.get("abc"), Some(&id));
    for (value, string_id) in &indices.strings {
        assert_eq!(payload_of(&snap, *string_id).get("value"), Some(&Value::Str(value.clone())));
    }
}

/// Builds: three mints, an array holding the first two, and a growable
/// array viewing one element of it.
fn array_snapshot() -> Vec<u8> {
    let num_base = base_object_count(false) as u64;
    let mut w = begin(FULL, "x64 product", num_base, 5, 3);
    let base = num_base as u32;

    // Alloc: Mint x3, Array x1, GrowableObjectArray x1.
    w.i32(cid_of("Mint"));
    w.uleb(3);
    w.i64(7);
    w.i64(8);
    w.i64(1); // backing length of the growable array
    w.i32(cid_of("Array"));
    w.uleb(1);
    w.uleb(2);
    w.i32(cid_of("GrowableObjectArray"));
    w.uleb(1);

    // Fill: the mint cluster has no fill section payload.
    // Array: count, canonical, type_arguments, elements.
    w.uleb(2);
    w.u8(0);
    w.uleb(1);
    w.uleb(u64::from(base) + 1);
    w.uleb(u64::from(base) + 2);
    // GrowableObjectArray: canonical bit, then the table-driven fields
    // (type_arguments, length, data).
    w.u8(0);
    w.uleb(1);
    w.uleb(u64::from(base) + 3);
    w.uleb(u64::from(base) + 4);

    write_isolate_roots(&mut w, Kind::Full);
    finish(w)
}

#[test]
fn array_of_mints() {
    let data = array_snapshot();
    let snap = parse(&data);
    let base = base_object_count(false) as u32;
    let (mint_a, mint_b) = (RefId::Id(base + 1), RefId::Id(base + 2));
    let array = RefId::Id(base + 4);
    let growable = RefId::Id(base + 5);

    assert_eq!(snap.values(array), Some(vec![Value::Ref(mint_a), Value::Ref(mint_b)]));
    assert!(snap.is_array(array));

    // The growable array is truncated to its length.
    assert_eq!(snap.values(growable), Some(vec![Value::Ref(mint_a)]));

    // Base-object arrays flatten to nothing.
    assert_eq!(snap.values(RefId::Id(4)), Some(vec![]));

    // The array records itself as a source of its elements.
    let sources = &snap.refs.get(mint_a).unwrap().sources;
    assert!(sources.iter().any(|s| s.parent == array));
}

#[test]
fn reference_graph_invariants() {
    let data = array_snapshot();
    let snap = parse(&data);

    // Table slot and id agree; every object sits in its cluster exactly
    // once.
    for id in snap.refs.ids() {
        let obj = snap.refs.get(id).expect("dense table");
        assert_eq!(obj.id, id);
        let owned = snap.clusters[obj.cluster].refs.iter().filter(|r| **r == id).count();
        assert_eq!(owned, 1, "object {id} must appear once in its cluster");
    }
    // Cluster membership round-trips.
    for (index, cluster) in snap.clusters.iter().enumerate() {
        for id in &cluster.refs {
            assert_eq!(snap.refs.get(*id).expect("member exists").cluster, index);
        }
    }
    // The table is dense: base + own objects, plus the root slot.
    assert_eq!(snap.refs.len() as u64, snap.num_base_objects + snap.num_objects + 1);
    // Every stored reference resolves.
    let mut all_refs = Vec::new();
    for obj in snap.refs.iter() {
        for value in obj.payload.values() {
            collect_refs(value, &mut all_refs);
        }
    }
    for value in snap.refs.root().payload.values() {
        collect_refs(value, &mut all_refs);
    }
    for id in all_refs {
        assert!(snap.refs.get(id).is_some(), "dangling reference {id}");
    }
}

#[test]
fn parsing_is_deterministic() {
    let data = array_snapshot();
    let a = parse(&data);
    let b = parse(&data);
    assert_eq!(format!("{:?}", a.refs), format!("{:?}", b.refs));
    assert_eq!(format!("{:?}", a.clusters), format!("{:?}", b.clusters));
    assert_eq!(format!("{:?}", a.classes), format!("{:?}", b.classes));
    assert_eq!(format!("{:?}", a.indices), format!("{:?}", b.indices));
}

#[test]
fn debug_snapshot_checks_section_markers() {
    let num_base = base_object_count(false) as u64;
    let build = |marker: u16| {
        let mut w = begin(FULL, "x64 debug", num_base, 1, 1);
        w.i32(cid_of("Mint"));
        w.uleb(1);
        w.i64(42);
        // Debug snapshots confirm the reference count and a marker after
        // every alloc cluster.
        w.i32(num_base as i32 + 2);
        w.u16(0xabab);
        // Fill section of the mint cluster, closed by the marker under
        // test.
        let marker_pos = w.len();
        w.u16(marker);
        write_isolate_roots(&mut w, Kind::Full);
        w.u16(0xabab); // marker closing the roots fill
        (finish(w), marker_pos as u64)
    };

    let (good, _) = build(0xabab);
    let snap = parse(&good);
    assert!(snap.is_debug);

    let (bad, marker_pos) = build(0x1234);
    match Snapshot::parse(&bad, None, Options::default()) {
        Err(ParseError::Inconsistency { offset, .. }) => assert_eq!(offset, marker_pos),
        other => panic!("expected a strict-mode marker failure, got {other:?}"),
    }
    // Out of strict mode the same violation is only a warning.
    let opts = Options { strict: false, ..Options::default() };
    assert!(Snapshot::parse(&bad, None, opts).is_ok());
}

#[test]
fn circular_instances() {
    let num_base = base_object_count(false) as u64;
    let base = num_base as u32;
    let mut w = begin(FULL, "x64 product", num_base, 2, 1);
    // One user-defined class: instances with a single reference field.
    w.i32(1000);
    w.uleb(2);
    w.uleb(2); // next field offset, compact
    w.uleb(2); // instance size, compact
    // Fill: each instance points at the other.
    w.u8(0);
    w.uleb(u64::from(base) + 2);
    w.u8(0);
    w.uleb(u64::from(base) + 1);
    write_isolate_roots(&mut w, Kind::Full);
    let opts = Options { strict: false, ..Options::default() };
    let snap = Snapshot::parse(&finish(w), None, opts).expect("cyclic graphs parse");

    let a = RefId::Id(base + 1);
    let b = RefId::Id(base + 2);
    let follow = |id: RefId| {
        payload_of(&snap, id).get("fields").and_then(Value::as_list).and_then(|fields| fields[0].as_ref_id())
    };
    assert_eq!(follow(a), Some(b));
    assert_eq!(follow(b), Some(a));
    assert!(snap.is_instance(a));
    // No class with id 1000 exists, so the linker left a null back-pointer.
    assert_eq!(payload_of(&snap, a).get("_class"), Some(&Value::Null));
}

#[test]
fn class_linking() {
    let num_base = base_object_count(false) as u64;
    let base = num_base as u32;
    let class_fields = TypeTable::build(Kind::Full, false).fields("Class").unwrap().len();

    let mut w = begin(FULL, "x64 product", num_base, 2, 2);
    // Alloc: one user class, then one instance of it.
    w.i32(cid_of("Class"));
    w.uleb(0); // no predefined classes in this cluster
    w.uleb(1);
    w.i32(1000);
    w.uleb(1);
    w.uleb(2);
    w.uleb(2);
    // Fill the class: reference fields first, then the scalar block.
    for _ in 0..class_fields {
        w.uleb(1);
    }
    w.i32(1000); // cid
    w.u32(0); // binary_declaration
    w.i32(4); // instance_size_in_words
    w.i32(2); // next_field_offset_in_words
    w.i32(-1); // type_arguments_field_offset_in_words
    w.u16(0); // num_type_arguments
    w.u16(0); // num_native_fields
    w.i32(0); // token_pos
    w.i32(0); // end_token_pos
    w.u32(0); // state_bits
    // Fill the instance: canonical bit plus one field.
    w.u8(0);
    w.uleb(1);
    write_isolate_roots(&mut w, Kind::Full);
    let snap = parse(&finish(w));

    let class = RefId::Id(base + 1);
    let instance = RefId::Id(base + 2);
    assert_eq!(snap.classes.get(&1000), Some(&class));
    assert_eq!(payload_of(&snap, instance).get("_class"), Some(&Value::Ref(class)));
    assert!(snap
        .refs
        .get(class)
        .unwrap()
        .sources
        .iter()
        .any(|source| source.parent == instance));
    // The instance's class id matches its cluster's.
    assert_eq!(payload_of(&snap, class).get("cid"), Some(&Value::Int(1000)));
    assert_eq!(snap.cluster_of(instance).unwrap().cid, ClassRef::Cid(1000));
    // Predefined classes from the base object set are linked too.
    assert!(snap.classes.contains_key(&tables::class_id("Mint").unwrap()));
}

#[test]
fn typed_data_payloads() {
    let num_base = base_object_count(false) as u64;
    let base = num_base as u32;
    let mut w = begin(FULL, "x64 product", num_base, 2, 2);
    // Alloc: an internal byte array and an external int32 array.
    w.i32(cid_of("TypedDataUint8Array"));
    w.uleb(1);
    w.uleb(4);
    w.i32(cid_of("ExternalTypedDataInt32Array"));
    w.uleb(1);
    // Fill: internal (count, canonical, raw bytes)...
    w.uleb(4);
    w.u8(1);
    w.raw(&[0xde, 0xad, 0xbe, 0xef]);
    // ...then external (count, 8-byte alignment, elements).
    w.uleb(2);
    w.align(8);
    w.i32(-7);
    w.i32(1_000_000);
    write_isolate_roots(&mut w, Kind::Full);
    let snap = parse(&finish(w));

    let bytes = RefId::Id(base + 1);
    let ints = RefId::Id(base + 2);
    assert_eq!(payload_of(&snap, bytes).get("value"), Some(&Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef])));
    assert_eq!(payload_of(&snap, bytes).get("canonical"), Some(&Value::Bool(true)));
    assert_eq!(
        payload_of(&snap, ints).get("value"),
        Some(&Value::List(vec![Value::Int(-7), Value::Int(1_000_000)])),
    );
    let cluster = snap.cluster_of(ints).unwrap();
    assert_eq!(cluster.handler, HandlerKind::TypedData { elem: ElemKind::Int32, external: true });
}

#[test]
fn object_pool_entries() {
    let num_base = base_object_count(false) as u64;
    let base = num_base as u32;
    let mut w = begin(FULL, "x64 product", num_base, 1, 1);
    w.i32(cid_of("ObjectPool"));
    w.uleb(1);
    w.uleb(3); // pool length, allocation pass
    // Fill: entry count, then tagged entries.
    w.uleb(3);
    w.u8(0x00); // patchable tagged object
    w.uleb(1);
    w.u8(0x81); // unpatchable immediate
    w.sleb(-5);
    w.u8(0x02); // native function carries no payload
    write_isolate_roots(&mut w, Kind::Full);
    let snap = parse(&finish(w));

    let pool = RefId::Id(base + 1);
    let entries = payload_of(&snap, pool).get("entries").and_then(Value::as_list).unwrap();
    assert_eq!(entries.len(), 3);
    let entry = |n: usize| entries[n].as_map().unwrap();
    assert_eq!(entry(0).get("patchable"), Some(&Value::Bool(true)));
    assert_eq!(entry(0).get("raw_obj"), Some(&Value::Ref(RefId::Id(1))));
    assert_eq!(entry(1).get("patchable"), Some(&Value::Bool(false)));
    assert_eq!(entry(1).get("raw_value"), Some(&Value::Int(-5)));
    assert_eq!(entry(2).get("raw_obj"), None);
    assert_eq!(entry(2).get("raw_value"), None);
}

/* CODE-CARRYING SNAPSHOTS */

/// Write one instructions object into `w` and return the offset its
/// descriptor should reference.
fn write_instructions(w: &mut Writer, code: &[u8], size_and_flags: u32, unchecked: u32) -> i32 {
    w.align(32);
    let offset = w.len() as i32;
    w.u32(0xaa); // tags
    w.u32(0); // padding
    w.u32(size_and_flags);
    w.u32(unchecked);
    w.raw(&[0xcc; 16]); // 64-bit sentinel block
    w.raw(code);
    offset
}

/// Isolate JIT snapshot with two code objects and their instructions blob.
fn jit_snapshot() -> (Vec<u8>, Vec<u8>) {
    let num_base = base_object_count(true) as u64;
    let code_fields = TypeTable::build(Kind::FullJit, false).fields("Code").unwrap().len();

    let mut instr = Writer::default();
    let first = write_instructions(&mut instr, &[0x90; 16], 16, 0);
    // The second object is single-entry and exposes an unchecked entry.
    let second = write_instructions(&mut instr, &[0x90; 24], 24 | 1 << 31, 4);

    let mut w = begin(FULL_JIT, "x64 product", num_base, 2, 1);
    w.i32(cid_of("Code"));
    w.uleb(2);
    w.i32(0); // state bits
    w.i32(0);
    w.uleb(0); // no deferred code
    // Fill: instructions + active instructions, then the reference fields.
    for offset in [first, second] {
        w.i32(offset);
        w.i32(offset);
        for _ in 0..code_fields {
            w.uleb(1);
        }
    }
    write_isolate_roots(&mut w, Kind::FullJit);
    (finish_with_code(w), instr.bytes)
}

#[test]
fn code_address_search() {
    let (data, instr) = jit_snapshot();
    let snap = Snapshot::parse(&data, Some(&instr), Options::default()).expect("JIT snapshot parses");
    let base = base_object_count(true) as u32;
    let code_a = RefId::Id(base + 1);
    let code_b = RefId::Id(base + 2);

    let instr_a = payload_of(&snap, code_a).get("instructions").and_then(Value::as_map).unwrap();
    let addr_a = instr_a.get("data_addr").and_then(Value::as_uint).unwrap();
    assert_eq!(addr_a, 32); // 16-byte header plus the sentinel block
    assert_eq!(instr_a.get("data").and_then(Value::as_bytes).map(<[u8]>::len), Some(16));

    // Every instruction byte maps back to its code object and offset.
    for k in 0..16 {
        assert_eq!(snap.search_address(addr_a + k), Some((code_a, k)));
    }
    assert_eq!(snap.search_address(addr_a - 1), None);
    assert_eq!(snap.search_address(addr_a + 16), None);

    let instr_b = payload_of(&snap, code_b).get("instructions").and_then(Value::as_map).unwrap();
    let addr_b = instr_b.get("data_addr").and_then(Value::as_uint).unwrap();
    for k in 0..24 {
        assert_eq!(snap.search_address(addr_b + k), Some((code_b, k)));
    }

    // Sorted code regions must not overlap.
    let indices = snap.indices.as_ref().unwrap();
    assert_eq!(indices.code_addrs.len(), 2);
    assert!(addr_a + 16 <= addr_b);
}

#[test]
fn entry_points_follow_flags() {
    let (data, instr) = jit_snapshot();
    let snap = Snapshot::parse(&data, Some(&instr), Options::default()).unwrap();
    let base = base_object_count(true) as u32;
    let code_a = RefId::Id(base + 1);
    let code_b = RefId::Id(base + 2);
    let addr_of = |code: RefId| {
        payload_of(&snap, code)
            .get("instructions")
            .and_then(Value::as_map)
            .and_then(|i| i.get("data_addr"))
            .and_then(Value::as_uint)
            .unwrap()
    };
    let entry_points = &snap.indices.as_ref().unwrap().entry_points;

    // x64 JIT: monomorphic at +8, polymorphic at +40.
    let (addr_a, addr_b) = (addr_of(code_a), addr_of(code_b));
    assert_eq!(entry_points.get(&(addr_a + 8)), Some(&(code_a, EntryPoint { polymorphic: false, checked: true })));
    assert_eq!(entry_points.get(&(addr_a + 40)), Some(&(code_a, EntryPoint { polymorphic: true, checked: true })));
    // The single-entry object has no polymorphic entry, but exposes the
    // unchecked pair shifted by its unchecked offset.
    assert_eq!(entry_points.get(&(addr_b + 8)), Some(&(code_b, EntryPoint { polymorphic: false, checked: true })));
    assert_eq!(entry_points.get(&(addr_b + 40)), None);
    assert_eq!(entry_points.get(&(addr_b + 12)), Some(&(code_b, EntryPoint { polymorphic: false, checked: false })));
}

#[test]
fn rodata_can_be_stubbed_out() {
    let (data, instr) = jit_snapshot();
    let opts = Options { parse_rodata: false, ..Options::default() };
    let snap = Snapshot::parse(&data, Some(&instr), opts).unwrap();
    let base = base_object_count(true) as u32;

    let stub = payload_of(&snap, RefId::Id(base + 1)).get("instructions").and_then(Value::as_map).unwrap();
    assert_eq!(stub.get("offset"), Some(&Value::Uint(0)));
    assert!(stub.get("data").is_none());
    // Without parsed instructions there is nothing to index.
    assert_eq!(snap.search_address(40), None);
    assert!(snap.indices.as_ref().unwrap().code_objs.is_empty());
}

#[test]
fn rodata_strings() {
    let num_base = base_object_count(true) as u64;
    let base = num_base as u32;
    let mut w = begin(FULL_JIT, "x64 product", num_base, 2, 2);
    // Alloc: a read-only one-byte string at rodata offset 0...
    w.i32(cid_of("OneByteString"));
    w.uleb(1);
    w.uleb(0);
    // ...and a canonical read-only string at rodata offset 32. Offset
    // deltas are scaled by the 16-byte object alignment.
    w.i32(cid_of("String"));
    w.uleb(1);
    w.uleb(2);
    // Canonical-set table: length, first element, one fill gap.
    w.uleb(16);
    w.uleb(3);
    w.uleb(0);
    // Read-only clusters carry no fill data.
    write_isolate_roots(&mut w, Kind::FullJit);
    let mut data = finish_with_code(w);

    let rodata_start = data.len() as u64;
    // Offset 0: tags, hash, then the tagged length word (twice the
    // character count).
    let mut ro = Writer::default();
    ro.u32(0);
    ro.u32(0x99);
    ro.u64(6);
    ro.raw(b"abc");
    ro.align(32);
    // Offset 32: a string header of three word-sized small integers.
    ro.u64(0); // tags
    ro.u64(4); // length (tagged 2)
    ro.u64(0); // hash
    ro.raw(b"hi");
    data.extend_from_slice(&ro.bytes);

    let snap = Snapshot::parse(&data, None, Options::default()).expect("rodata snapshot parses");
    let one_byte = RefId::Id(base + 1);
    let raw_string = RefId::Id(base + 2);
    assert_eq!(payload_of(&snap, one_byte).get("value"), Some(&Value::Str("abc".into())));
    assert_eq!(payload_of(&snap, one_byte).get("hash"), Some(&Value::Uint(0x99)));
    assert_eq!(payload_of(&snap, raw_string).get("value"), Some(&Value::Bytes(b"hi".to_vec())));
    assert_eq!(payload_of(&snap, raw_string).get("length"), Some(&Value::Int(2)));
    assert_eq!(
        payload_of(&snap, raw_string).get("obj_ptr"),
        Some(&Value::Uint(rodata_start + 32 + 1)),
    );
    let string_cluster = snap.cluster_of(raw_string).unwrap();
    assert_eq!(string_cluster.meta.get("table_length"), Some(&Value::Uint(16)));
    assert_eq!(string_cluster.meta.get("first_element"), Some(&Value::Uint(3)));
    assert_eq!(snap.indices.as_ref().unwrap().strings.get("abc"), Some(&one_byte));
}

/* SNAPSHOT COMPOSITION */

#[test]
fn isolate_reuses_vm_snapshot_objects() {
    // VM snapshot: one mint next to the synthesized base objects.
    let vm_base = base_object_count(false) as u64;
    let mut w = begin(FULL, "x64 product", vm_base, 1, 1);
    w.i32(cid_of("Mint"));
    w.uleb(1);
    w.i64(42);
    w.uleb(1); // root: symbol_table
    let vm_blob = finish(w);
    let vm_opts = Options { vm: true, ..Options::default() };
    let vm_snap = Snapshot::parse(&vm_blob, None, vm_opts).expect("VM snapshot parses");
    assert_eq!(vm_snap.refs.len() as u64, vm_base + 2);
    assert_eq!(vm_snap.refs.root().payload.get("symbol_table"), Some(&Value::Ref(RefId::Id(1))));

    // Isolate snapshot on top: every VM object becomes a base object.
    let isolate_base = vm_base + 1;
    let mut w = begin(FULL, "x64 product", isolate_base, 1, 1);
    w.i32(cid_of("OneByteString"));
    w.uleb(1);
    w.uleb(2);
    w.uleb(2);
    w.u8(0);
    w.u32(0);
    w.raw(b"hi");
    write_isolate_roots(&mut w, Kind::Full);
    let opts = Options { base: Some(vm_snap), ..Options::default() };
    let snap = Snapshot::parse(&finish(w), None, opts).expect("isolate snapshot parses");

    let mint = RefId::Id(isolate_base as u32);
    let string = RefId::Id(isolate_base as u32 + 1);
    assert!(snap.is_base(mint));
    assert!(snap.is_own(string));
    assert_eq!(payload_of(&snap, mint).get("value"), Some(&Value::Int(42)));
    assert_eq!(payload_of(&snap, string).get("value"), Some(&Value::Str("hi".into())));
    // Adopted clusters participate in the indices.
    assert!(snap.get_refs("Mint").contains(&mint));
    assert!(snap.get_refs("OneByteString").contains(&string));
    // Cluster membership stays coherent across the adoption.
    for (index, cluster) in snap.clusters.iter().enumerate() {
        for id in &cluster.refs {
            assert_eq!(snap.refs.get(*id).unwrap().cluster, index);
        }
    }
}

/* FAILURE MODES */

#[test]
fn bad_magic_is_fatal() {
    let num_base = base_object_count(false) as u64;
    let mut w = begin(FULL, "x64 product", num_base, 0, 0);
    write_isolate_roots(&mut w, Kind::Full);
    let mut data = finish(w);
    data[0] = 0x00;
    match Snapshot::parse(&data, None, Options::default()) {
        Err(ParseError::FormatMismatch { offset, .. }) => assert_eq!(offset, 0),
        other => panic!("expected a format mismatch, got {other:?}"),
    }
}

#[test]
fn wrong_version_is_fatal() {
    let num_base = base_object_count(false) as u64;
    let mut w = begin(FULL, "x64 product", num_base, 0, 0);
    write_isolate_roots(&mut w, Kind::Full);
    let mut data = finish(w);
    data[20] ^= 0xff; // first version byte
    assert!(matches!(
        Snapshot::parse(&data, None, Options::default()),
        Err(ParseError::FormatMismatch { .. }),
    ));
}

#[test]
fn unknown_kind_is_fatal() {
    let num_base = base_object_count(false) as u64;
    let mut w = begin(9, "x64 product", num_base, 0, 0);
    write_isolate_roots(&mut w, Kind::Full);
    assert!(matches!(
        Snapshot::parse(&finish(w), None, Options::default()),
        Err(ParseError::FormatMismatch { .. }),
    ));
}

#[test]
fn undetectable_arch_is_fatal() {
    let num_base = base_object_count(false) as u64;
    let mut w = begin(FULL, "product dart_vm", num_base, 0, 0);
    write_isolate_roots(&mut w, Kind::Full);
    assert!(matches!(
        Snapshot::parse(&finish(w), None, Options::default()),
        Err(ParseError::FormatMismatch { .. }),
    ));
}

#[test]
fn truncated_body_runs_out_of_stream() {
    let num_base = base_object_count(false) as u64;
    let mut w = begin(FULL, "x64 product", num_base, 0, 0);
    write_isolate_roots(&mut w, Kind::Full);
    let mut data = finish(w);
    // Shrink the declared length: the body now ends before the roots do.
    let length = (data.len() - 4 - 10) as i64;
    data[4..12].copy_from_slice(&length.to_le_bytes());
    let opts = Options { strict: false, ..Options::default() };
    assert!(matches!(
        Snapshot::parse(&data, None, opts),
        Err(ParseError::EndOfStream { .. }),
    ));
}

#[test]
fn unimplemented_cluster_kind_is_reported() {
    let num_base = base_object_count(false) as u64;
    let mut w = begin(FULL, "x64 product", num_base, 1, 1);
    w.i32(cid_of("Context"));
    w.uleb(1);
    write_isolate_roots(&mut w, Kind::Full);
    match Snapshot::parse(&finish(w), None, Options::default()) {
        Err(ParseError::UnimplementedHandler { name, .. }) => assert_eq!(name, "Context"),
        other => panic!("expected an unimplemented handler, got {other:?}"),
    }
}

#[test]
fn dangling_reference_behavior_depends_on_strictness() {
    let num_base = base_object_count(false) as u64;
    let base = num_base as u32;
    let build = || {
        let mut w = begin(FULL, "x64 product", num_base, 1, 1);
        w.i32(cid_of("Array"));
        w.uleb(1);
        w.uleb(1);
        w.uleb(1);
        w.u8(0);
        w.uleb(1);
        w.uleb(9999); // dangling element
        write_isolate_roots(&mut w, Kind::Full);
        finish(w)
    };

    assert!(matches!(
        Snapshot::parse(&build(), None, Options::default()),
        Err(ParseError::Inconsistency { .. }),
    ));

    let opts = Options { strict: false, ..Options::default() };
    let snap = Snapshot::parse(&build(), None, opts).unwrap();
    let array = RefId::Id(base + 1);
    let elements = payload_of(&snap, array).get("value").and_then(Value::as_list).unwrap();
    let broken = elements[0].as_map().expect("broken-reference placeholder");
    assert_eq!(broken.get("broken"), Some(&Value::Uint(9999)));
}
