//! Snapshot driver: header parsing, the two-pass cluster loop and roots

use std::collections::BTreeMap;
use std::mem;

use indexmap::IndexMap;

use crate::base_objects::base_entries;
use crate::clusters::{ClassRef, Cluster, HandlerKind};
use crate::consts::{
    Arch, Kind, EXPECTED_VERSION, MAGIC_VALUE, MAX_PREFERRED_CODE_ALIGNMENT, SECTION_MARKER, VERSION_LEN,
};
use crate::error::ParseError;
use crate::link::Indices;
use crate::reader::SnapshotReader;
use crate::refs::RefTable;
use crate::tables::{self, TypeTable};
use crate::value::{PathSeg, Payload, RefId, SourceRef, Value};

/// Caller-supplied parsing options.
#[derive(Debug)]
pub struct Options {
    /// Treat the blob as a VM snapshot rather than an isolate snapshot.
    pub vm: bool,
    /// Previously-parsed VM snapshot whose objects seed the reference
    /// table. The base is consumed; its objects are re-parented into the
    /// new snapshot.
    pub base: Option<Snapshot>,
    /// Added to every reported data-blob offset.
    pub data_offset: u64,
    /// Added to every reported instructions-blob offset.
    pub instructions_offset: u64,
    /// Escalate inconsistency warnings into errors.
    pub strict: bool,
    /// Parse offset-addressed objects out of the read-only region. When
    /// disabled, strings, descriptors and instructions become stubs that
    /// only record their offset.
    pub parse_rodata: bool,
    /// Hand code-source-map payloads to a decoder. Decoding is delegated
    /// to external tooling, so payloads currently stay raw bytes either
    /// way.
    pub parse_csm: bool,
    /// Build the convenience indices (strings, code addresses, entry
    /// points) after linking.
    pub build_tables: bool,
    /// Maximum diagnostic level to emit: -1 silent, 0 error, 1 warning,
    /// 2 notice, 3 info, 4 debug.
    pub print_level: i8,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            vm: false,
            base: None,
            data_offset: 0,
            instructions_offset: 0,
            strict: true,
            parse_rodata: true,
            parse_csm: true,
            build_tables: true,
            print_level: 3,
        }
    }
}

/// A fully parsed snapshot: the reference table, the clusters, the class
/// table and the optional convenience indices.
#[derive(Debug)]
pub struct Snapshot {
    /// Snapshot kind from the header.
    pub kind: Kind,
    /// Architecture derived from the features string.
    pub arch: Arch,
    /// Version hash from the header.
    pub version: String,
    /// Parsed features string: name to present/absent.
    pub features: IndexMap<String, bool>,
    /// Whether the architecture uses 64-bit words.
    pub is_64: bool,
    /// Whether the snapshot was produced by a product-mode runtime.
    pub is_product: bool,
    /// Whether the snapshot was produced by a debug-mode runtime (and thus
    /// carries section markers).
    pub is_debug: bool,
    /// Whether the snapshot is ahead-of-time compiled product code.
    pub is_precompiled: bool,
    /// Whether the snapshot carries machine code and a read-only region.
    pub includes_code: bool,
    /// Whether the snapshot may carry interpreter bytecode.
    pub includes_bytecode: bool,
    /// log2 of the object alignment in the read-only region.
    pub object_alignment_log2: u32,
    /// Body length from the header, excluding the magic.
    pub length: i64,
    /// Base-object count expected by the header.
    pub num_base_objects: u64,
    /// Object count expected by the header.
    pub num_objects: u64,
    /// Cluster count expected by the header.
    pub num_clusters: u64,
    /// Length of the code order table, from the header.
    pub code_order_length: u64,
    /// Offset added to reported data offsets.
    pub data_offset: u64,
    /// Offset added to reported instruction addresses.
    pub instructions_offset: u64,
    /// Absolute offset of the read-only region, when present.
    pub rodata_offset: Option<u64>,
    /// The reference table.
    pub refs: RefTable,
    /// Every cluster, including the adopted base clusters and the pseudo
    /// clusters the parser synthesizes.
    pub clusters: Vec<Cluster>,
    /// Class id to class object, built by the linker.
    pub classes: BTreeMap<i64, RefId>,
    /// Convenience indices, when `build_tables` was enabled.
    pub indices: Option<Indices>,
}

impl Snapshot {
    /// Parse a snapshot from its data blob and optional instructions blob.
    pub fn parse(data: &[u8], instructions: Option<&[u8]>, options: Options) -> Result<Self, ParseError> {
        let mut parser = Parser::new(data, instructions, options);
        parser.run()?;
        Ok(parser.finish())
    }

    fn empty(options: &Options) -> Self {
        Self {
            kind: Kind::Invalid,
            arch: Arch::X64,
            version: String::new(),
            features: IndexMap::new(),
            is_64: true,
            is_product: false,
            is_debug: false,
            is_precompiled: false,
            includes_code: false,
            includes_bytecode: false,
            object_alignment_log2: 4,
            length: 0,
            num_base_objects: 0,
            num_objects: 0,
            num_clusters: 0,
            code_order_length: 0,
            data_offset: options.data_offset,
            instructions_offset: options.instructions_offset,
            rodata_offset: None,
            refs: RefTable::new(),
            clusters: Vec::new(),
            classes: BTreeMap::new(),
            indices: None,
        }
    }

    /// Whether `id` belongs to the base object set.
    pub fn is_base(&self, id: RefId) -> bool {
        matches!(id, RefId::Id(raw) if u64::from(raw) <= self.num_base_objects)
    }

    /// Whether `id` was allocated by this snapshot rather than the base.
    pub fn is_own(&self, id: RefId) -> bool {
        matches!(id, RefId::Id(raw) if u64::from(raw) > self.num_base_objects)
    }

    /// Whether `id` is the shared null object.
    pub fn is_null(&self, id: RefId) -> bool {
        id == RefId::Id(1)
    }

    /// Whether the object's cluster has the named predefined class.
    pub fn is_cid(&self, id: RefId, name: &str) -> bool {
        self.cluster_of(id).map_or(false, |cluster| cluster.cid.cid() == tables::class_id(name))
    }

    /// Whether the object is a fixed-length array.
    pub fn is_array(&self, id: RefId) -> bool {
        self.is_cid(id, "Array") || self.is_cid(id, "ImmutableArray")
    }

    /// Whether the object is a string.
    pub fn is_string(&self, id: RefId) -> bool {
        self.is_cid(id, "OneByteString") || self.is_cid(id, "TwoByteString")
    }

    /// Whether the object is a class instance (the generic instance class
    /// or any user-defined class).
    pub fn is_instance(&self, id: RefId) -> bool {
        self.cluster_of(id).map_or(false, |cluster| match cluster.cid.cid() {
            Some(cid) => Some(cid) == tables::class_id("Instance") || cid >= tables::num_predefined_cids(),
            None => false,
        })
    }

    /// The cluster an object belongs to.
    pub fn cluster_of(&self, id: RefId) -> Option<&Cluster> {
        self.refs.get(id).and_then(|obj| self.clusters.get(obj.cluster))
    }

    /// Flatten an array-like object into its elements.
    ///
    /// Base-object arrays are empty; growable arrays are truncated to
    /// their length; fixed arrays yield their backing list.
    pub fn values(&self, id: RefId) -> Option<Vec<Value>> {
        let obj = self.refs.get(id)?;
        let cluster = self.clusters.get(obj.cluster)?;
        if cluster.cid == ClassRef::BaseObject {
            return Some(Vec::new());
        }
        if cluster.cid.cid() == tables::class_id("GrowableObjectArray") {
            let length = obj
                .payload
                .get("length")
                .and_then(Value::as_ref_id)
                .and_then(|len| self.refs.get(len))
                .and_then(|len| len.payload.get("value"))
                .and_then(Value::as_uint)?;
            let data = obj.payload.get("data").and_then(Value::as_ref_id)?;
            let mut values = self.values(data)?;
            values.truncate(length as usize);
            return Some(values);
        }
        if self.is_array(id) {
            return obj.payload.get("value").and_then(Value::as_list).map(<[Value]>::to_vec);
        }
        None
    }
}

/// Ephemeral parse state: the stream cursors plus the snapshot being
/// built.
pub(crate) struct Parser<'a> {
    pub(crate) data: SnapshotReader<'a>,
    pub(crate) instructions: Option<SnapshotReader<'a>>,
    pub(crate) rodata: Option<SnapshotReader<'a>>,
    pub(crate) opts: Options,
    pub(crate) types: TypeTable,
    pub(crate) snap: Snapshot,
    full_data: &'a [u8],
    own_clusters: Vec<usize>,
}

impl<'a> Parser<'a> {
    fn new(data: &'a [u8], instructions: Option<&'a [u8]>, opts: Options) -> Self {
        let snap = Snapshot::empty(&opts);
        Self {
            data: SnapshotReader::new(data, opts.data_offset),
            instructions: instructions.map(|blob| SnapshotReader::new(blob, opts.instructions_offset)),
            rodata: None,
            types: TypeTable::build(Kind::Invalid, false),
            snap,
            opts,
            full_data: data,
            own_clusters: Vec::new(),
        }
    }

    fn run(&mut self) -> Result<(), ParseError> {
        self.parse_header()?;
        self.initialize_settings()?;
        self.initialize_references()?;

        self.info("reading allocation clusters");
        for _ in 0..self.snap.num_clusters {
            self.read_cluster()?;
        }
        let produced = (self.snap.refs.len() - 1) as u64;
        let expected = self.snap.num_base_objects + self.snap.num_objects;
        if produced != expected {
            self.warn(format!("expected {expected} objects after allocation, produced {produced}"))?;
        }

        self.info("reading fill clusters");
        for i in 0..self.own_clusters.len() {
            let cluster = self.own_clusters[i];
            self.read_fill_cluster(cluster, None)?;
        }

        self.read_roots()?;

        let body_end = 4 + self.snap.length as usize;
        if self.data.pos() != body_end {
            self.warn(format!(
                "snapshot body should end at {:#x} but the cursor is at {:#x}",
                self.snap.data_offset + body_end as u64,
                self.data.offset(),
            ))?;
        }

        self.link_cids()?;
        if self.opts.build_tables {
            self.build_tables()?;
        }
        self.info("snapshot parsed");
        Ok(())
    }

    fn finish(self) -> Snapshot {
        self.snap
    }

    /* REPORTING */

    /// Report an inconsistency: an error in strict mode, a logged warning
    /// otherwise.
    pub(crate) fn warn(&mut self, message: String) -> Result<(), ParseError> {
        let offset = self.data.offset();
        self.warn_at(offset, message)
    }

    /// [`Parser::warn`] with an explicit offset.
    pub(crate) fn warn_at(&mut self, offset: u64, message: String) -> Result<(), ParseError> {
        if self.opts.strict {
            return Err(ParseError::Inconsistency { offset, reason: message });
        }
        if self.opts.print_level >= 1 {
            tracing::warn!(offset, "{message}");
        }
        Ok(())
    }

    pub(crate) fn notice(&self, message: impl AsRef<str>) {
        if self.opts.print_level >= 2 {
            tracing::info!(offset = self.data.offset(), "{}", message.as_ref());
        }
    }

    pub(crate) fn info(&self, message: impl AsRef<str>) {
        if self.opts.print_level >= 3 {
            tracing::info!(offset = self.data.offset(), "{}", message.as_ref());
        }
    }

    pub(crate) fn debug(&self, message: impl AsRef<str>) {
        if self.opts.print_level >= 4 {
            tracing::debug!(offset = self.data.offset(), "{}", message.as_ref());
        }
    }

    /* HEADER & SETTINGS */

    fn parse_header(&mut self) -> Result<(), ParseError> {
        let magic = self.data.read_uint(32)?;
        if magic != u64::from(MAGIC_VALUE) {
            return Err(ParseError::FormatMismatch {
                offset: self.snap.data_offset,
                reason: format!("bad magic value {magic:#010x}"),
            });
        }
        let length = self.data.read_int(64)?;
        if length < 0 {
            return Err(ParseError::FormatMismatch {
                offset: self.snap.data_offset + 4,
                reason: format!("negative body length {length}"),
            });
        }
        let kind_raw = self.data.read_int(64)?;
        let kind = Kind::from_raw(kind_raw).ok_or_else(|| ParseError::FormatMismatch {
            offset: self.snap.data_offset + 12,
            reason: format!("unrecognized snapshot kind {kind_raw}"),
        })?;
        self.snap.length = length;
        self.snap.kind = kind;
        self.snap.includes_code = kind.includes_code();
        self.snap.includes_bytecode = kind.includes_bytecode();
        self.notice(format!("header: length={length} kind={}", kind.name()));

        // Carve out the read-only region and truncate the body to the
        // declared length.
        let data_end = 4 + length as usize;
        if self.full_data.len() < data_end {
            self.warn(format!("data blob should be at least {data_end} bytes, got {}", self.full_data.len()))?;
        }
        if self.snap.includes_code {
            let rodata_start = ((data_end - 1) / MAX_PREFERRED_CODE_ALIGNMENT + 1) * MAX_PREFERRED_CODE_ALIGNMENT;
            if self.full_data.len() < rodata_start {
                self.warn(format!("the read-only data region at {rodata_start:#x} is not present"))?;
            }
            let slice = self.full_data.get(rodata_start..).unwrap_or(&[]);
            let absolute = self.snap.data_offset + rodata_start as u64;
            self.snap.rodata_offset = Some(absolute);
            self.rodata = Some(SnapshotReader::new(slice, absolute));
        } else if self.full_data.len() > data_end {
            self.notice(format!(
                "there are {} excess bytes at the end of the data blob",
                self.full_data.len() - data_end,
            ));
        }
        self.data.truncate(data_end);

        let version_bytes = self.data.read_bytes(VERSION_LEN)?;
        let version = String::from_utf8_lossy(version_bytes).into_owned();
        if version != EXPECTED_VERSION {
            return Err(ParseError::FormatMismatch {
                offset: self.snap.data_offset + 20,
                reason: format!("version {version:?} is not the supported {EXPECTED_VERSION:?}"),
            });
        }
        self.snap.version = version;

        let features_offset = self.data.offset();
        let features_raw = self.data.read_cstr()?;
        let features_raw = String::from_utf8_lossy(features_raw).into_owned();
        self.snap.features = parse_features(&features_raw, features_offset)?;
        self.notice(format!("features: {features_raw:?}"));

        if let Some(base) = self.opts.base.as_ref() {
            if base.version != self.snap.version || base.kind != self.snap.kind || base.features != self.snap.features
            {
                let message = "snapshot header does not match the base snapshot".to_string();
                self.warn(message)?;
            }
        }

        self.snap.num_base_objects = self.data.read_unsigned()?;
        self.snap.num_objects = self.data.read_unsigned()?;
        self.snap.num_clusters = self.data.read_unsigned()?;
        self.snap.code_order_length = self.data.read_unsigned()?;
        self.notice(format!(
            "base objects: {}, objects: {}, clusters: {}, code order length: {}",
            self.snap.num_base_objects, self.snap.num_objects, self.snap.num_clusters, self.snap.code_order_length,
        ));
        Ok(())
    }

    fn initialize_settings(&mut self) -> Result<(), ParseError> {
        let mut archs = self.snap.features.keys().filter_map(|token| Arch::from_feature(token));
        let arch = match (archs.next(), archs.next()) {
            (Some(arch), None) => arch,
            _ => {
                return Err(ParseError::FormatMismatch {
                    offset: self.data.offset(),
                    reason: "cannot determine the architecture from the features string".to_string(),
                })
            }
        };
        self.snap.arch = arch;
        let word_size = tables::word_size(arch);
        self.snap.is_64 = word_size == 8;
        self.snap.is_debug = self.snap.features.get("debug").copied().unwrap_or(false);
        self.snap.is_product = self.snap.features.get("product").copied().unwrap_or(false);
        self.snap.is_precompiled = self.snap.kind == Kind::FullAot && self.snap.is_product;
        self.snap.object_alignment_log2 = (2 * word_size).trailing_zeros();
        self.types = TypeTable::build(self.snap.kind, self.snap.is_precompiled);
        Ok(())
    }

    /* REFERENCES */

    fn initialize_references(&mut self) -> Result<(), ParseError> {
        let expected = self.snap.num_base_objects;
        let provided = if let Some(base) = self.opts.base.take() {
            let provided = (base.refs.len() - 1) as u64;
            let keep = provided.min(expected) as usize + 1;
            let Snapshot { refs, mut clusters, .. } = base;
            // The base's root cluster is not adopted; this snapshot grows its
            // own during the roots step.
            if clusters.last().map_or(false, |cluster| cluster.cid == ClassRef::ObjectStore) {
                clusters.pop();
            }
            self.snap.clusters = clusters;
            for object in refs.into_objects().into_iter().take(keep).skip(1) {
                self.snap.refs.adopt(object);
            }
            provided
        } else {
            let cluster = self.push_cluster(ClassRef::BaseObject, HandlerKind::BaseObject, true);
            for entry in base_entries(self.snap.includes_code) {
                let mut payload = Payload::new();
                payload.insert("type".into(), Value::Str(entry.type_name.into()));
                payload.insert("value".into(), Value::Str(entry.value));
                if let Some(cid) = entry.cid {
                    payload.insert("cid".into(), Value::Int(cid));
                }
                self.alloc_ref(cluster, payload);
            }
            (self.snap.refs.len() - 1) as u64
        };

        if provided != expected {
            self.notice(format!("snapshot expects {expected} base objects, but {provided} are available"));
        }
        if ((self.snap.refs.len() - 1) as u64) < expected {
            let cluster = self.push_cluster(ClassRef::UnknownBase, HandlerKind::UnknownBase, true);
            while ((self.snap.refs.len() - 1) as u64) < expected {
                self.alloc_ref(cluster, Payload::new());
            }
        }
        Ok(())
    }

    /// Append a cluster and return its index.
    pub(crate) fn push_cluster(&mut self, cid: ClassRef, handler: HandlerKind, synthetic: bool) -> usize {
        self.snap.clusters.push(Cluster {
            cid,
            handler,
            refs: Vec::new(),
            meta: Payload::new(),
            synthetic,
        });
        self.snap.clusters.len() - 1
    }

    /// Allocate an object into the reference table and its cluster.
    pub(crate) fn alloc_ref(&mut self, cluster: usize, payload: Payload) -> RefId {
        let id = self.snap.refs.alloc(cluster, payload);
        self.snap.clusters[cluster].refs.push(id);
        id
    }

    /// Read a reference id and resolve it, recording the back-reference on
    /// the target. A dangling id yields a broken-reference placeholder.
    pub(crate) fn read_ref_value(&mut self, parent: RefId, path: Vec<PathSeg>) -> Result<Value, ParseError> {
        let raw = self.data.read_unsigned()?;
        if !self.snap.refs.contains(raw) {
            self.warn(format!("reference to a non-existent object id {raw}"))?;
            let mut broken = Payload::new();
            broken.insert("broken".into(), Value::Uint(raw));
            return Ok(Value::Map(broken));
        }
        let id = RefId::Id(raw as u32);
        if let Some(target) = self.snap.refs.get_mut(id) {
            target.sources.push(SourceRef { parent, path });
        }
        Ok(Value::Ref(id))
    }

    /// Read a reference and store it as the named field of `x`.
    pub(crate) fn store_ref(&mut self, x: &mut Payload, name: &str, parent: RefId) -> Result<(), ParseError> {
        let value = self.read_ref_value(parent, vec![PathSeg::Field(name.into())])?;
        x.insert(name.into(), value);
        Ok(())
    }

    /* CLUSTER PASSES */

    fn read_cluster(&mut self) -> Result<(), ParseError> {
        let cid = self.data.read_cid()?;
        let handler = HandlerKind::for_cid(cid, self.snap.includes_code).map_err(|name| {
            ParseError::UnimplementedHandler { offset: self.data.offset(), name }
        })?;
        self.debug(format!("reading cluster with cid={}", ClassRef::Cid(cid).display_name()));
        let cluster = self.push_cluster(ClassRef::Cid(cid), handler, false);
        self.own_clusters.push(cluster);
        self.alloc_cluster(cluster)?;

        if self.snap.is_debug {
            let serializer_next = self.data.read_int(32)?;
            let parser_next = i64::from(self.snap.refs.next_id());
            if serializer_next != parser_next {
                self.warn(format!(
                    "reference count diverged after cluster allocation (serializer={serializer_next}, parser={parser_next})",
                ))?;
            }
            self.enforce_section_marker()?;
        }
        Ok(())
    }

    /// Fill every object of a cluster: the driver-side reads (canonical
    /// bit, instructions, table-driven reference fields), then the
    /// handler's own fill routine, then the section marker.
    pub(crate) fn read_fill_cluster(
        &mut self,
        cluster: usize,
        explicit_refs: Option<Vec<RefId>>,
    ) -> Result<(), ParseError> {
        let handler = self.snap.clusters[cluster].handler;
        self.debug(format!("filling cluster {}", self.snap.clusters[cluster].cid.display_name()));
        let ref_list = explicit_refs.unwrap_or_else(|| self.snap.clusters[cluster].refs.clone());
        let fields = if handler.reads_from_table() {
            match self.types.fields(handler.name()) {
                Some(fields) => fields.to_vec(),
                None => {
                    self.warn(format!("no reference-field list for handler {}", handler.name()))?;
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        for ref_id in ref_list {
            self.debug(format!("filling ref {ref_id}"));
            let mut x = match self.snap.refs.get_mut(ref_id) {
                Some(obj) if obj.cluster == cluster => mem::take(&mut obj.payload),
                Some(_) => {
                    self.warn(format!("object {ref_id} is filled by a cluster it does not belong to"))?;
                    continue;
                }
                None => {
                    self.warn(format!("object {ref_id} vanished before the fill pass"))?;
                    continue;
                }
            };
            if handler.reads_from_table() {
                if matches!(handler, HandlerKind::Closure | HandlerKind::GrowableObjectArray) {
                    x.insert("canonical".into(), Value::Bool(self.data.read_bool()?));
                }
                if handler == HandlerKind::Code {
                    let instructions = self.read_instructions()?;
                    x.insert("instructions".into(), instructions);
                    if !self.snap.is_precompiled && self.snap.kind == Kind::FullJit {
                        let active = self.read_instructions()?;
                        x.insert("active_instructions".into(), active);
                    }
                }
                for field in &fields {
                    self.store_ref(&mut x, field, ref_id)?;
                }
            }
            self.fill_object(cluster, ref_id, &mut x)?;
            if let Some(obj) = self.snap.refs.get_mut(ref_id) {
                obj.payload = x;
            }
        }
        self.enforce_section_marker()
    }

    /// Read an instructions descriptor out of the instructions blob.
    pub(crate) fn read_instructions(&mut self) -> Result<Value, ParseError> {
        let offset = self.data.read_int(32)?;
        if offset < 0 {
            self.notice("reference to base instructions, returning a null object");
            return Ok(Value::Null);
        }
        if !self.opts.parse_rodata {
            let mut stub = Payload::new();
            stub.insert("offset".into(), Value::Uint(self.snap.instructions_offset + offset as u64));
            return Ok(Value::Map(stub));
        }
        let Some(mut reader) = self.instructions.take() else {
            self.warn("an instructions blob is required but was not provided".to_string())?;
            return Ok(Value::Null);
        };
        reader.seek(offset as usize);
        let result = self.read_instructions_at(&mut reader);
        self.instructions = Some(reader);
        result
    }

    fn read_instructions_at(&mut self, reader: &mut SnapshotReader<'_>) -> Result<Value, ParseError> {
        let tags = reader.read_uint(32)?;
        reader.read_uint(32)?; // padding
        let size_and_flags = reader.read_uint(32)?;
        let unchecked_offset = reader.read_uint(32)?;
        if self.snap.is_64 {
            // Sentinel bytes between the header and the code on 64-bit
            // targets.
            reader.read_bytes(16)?;
        }
        let size = size_and_flags & 0x7fff_ffff;
        let single_entry = size_and_flags >> 31 & 1 != 0;
        let data_addr = reader.offset();
        let data = reader.read_bytes(size as usize)?.to_vec();

        let mut flags = Payload::new();
        flags.insert("single_entry".into(), Value::Bool(single_entry));
        let mut x = Payload::new();
        x.insert("tags".into(), Value::Uint(tags));
        x.insert("flags".into(), Value::Map(flags));
        x.insert("unchecked_entrypoint_pc_offset".into(), Value::Uint(unchecked_offset));
        x.insert("data".into(), Value::Bytes(data));
        x.insert("data_addr".into(), Value::Uint(data_addr));
        Ok(Value::Map(x))
    }

    /// Verify the inter-section marker. Only debug snapshots carry one.
    pub(crate) fn enforce_section_marker(&mut self) -> Result<(), ParseError> {
        if !self.snap.is_debug {
            return Ok(());
        }
        let offset = self.data.offset();
        let marker = self.data.read_uint(16)?;
        if marker != u64::from(SECTION_MARKER) {
            self.warn_at(offset, format!("section marker mismatch (read {marker:#06x})"))?;
        }
        Ok(())
    }

    /* ROOTS */

    fn read_roots(&mut self) -> Result<(), ParseError> {
        self.info("reading roots");
        let cluster = self.push_cluster(ClassRef::ObjectStore, HandlerKind::ObjectStore, true);
        self.snap.clusters[cluster].refs.push(RefId::Root);
        self.snap.refs.root_mut().cluster = cluster;

        if self.opts.vm {
            let mut x = mem::take(&mut self.snap.refs.root_mut().payload);
            self.store_ref(&mut x, "symbol_table", RefId::Root)?;
            if self.snap.includes_code {
                let stub_count = tables::stub_code_list().len();
                let mut stubs = Vec::with_capacity(stub_count);
                for n in 0..stub_count {
                    let path = vec![PathSeg::Field("_stubs".into()), PathSeg::Index(n)];
                    stubs.push(self.read_ref_value(RefId::Root, path)?);
                }
                x.insert("_stubs".into(), Value::List(stubs));
            }
            self.snap.refs.root_mut().payload = x;
            self.enforce_section_marker()
        } else {
            self.read_fill_cluster(cluster, Some(vec![RefId::Root]))
        }
    }
}

/// Split a features string into name/present pairs. Tokens may carry a
/// `no-` prefix (absent) and optional surrounding quotes.
fn parse_features(features: &str, offset: u64) -> Result<IndexMap<String, bool>, ParseError> {
    let mut result = IndexMap::new();
    for token in features.split_whitespace() {
        let (name, present) = match token.strip_prefix("no-") {
            Some(rest) => (rest, false),
            None => (token, true),
        };
        let name = name.trim_matches('"');
        if name.is_empty() {
            continue;
        }
        if result.insert(name.to_string(), present).is_some() {
            return Err(ParseError::FormatMismatch {
                offset,
                reason: format!("duplicate feature {name:?}"),
            });
        }
    }
    Ok(result)
}
