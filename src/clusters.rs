//! Per-class-kind cluster deserialization handlers

use crate::consts::{decode_pool_entry_tag, Kind, PoolEntryType, DATA_SERIALIZATION_ALIGNMENT, RAW_INSTANCE_SIZE_IN_WORDS};
use crate::error::ParseError;
use crate::snapshot::Parser;
use crate::tables;
use crate::value::{PathSeg, Payload, RefId, Value};

mod rodata;

/// Class identity of a cluster: a wire class id, or one of the pseudo
/// clusters the parser synthesizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassRef {
    /// Regular class id read from the stream.
    Cid(i64),
    /// Pseudo cluster holding the synthesized base objects.
    BaseObject,
    /// Pseudo cluster holding the root pseudo-object.
    ObjectStore,
    /// Pseudo cluster for placeholder refs of a mismatched base snapshot.
    UnknownBase,
}

impl ClassRef {
    /// The numeric class id, if this is a regular cluster.
    pub const fn cid(&self) -> Option<i64> {
        match self {
            Self::Cid(cid) => Some(*cid),
            _ => None,
        }
    }

    /// Display name: the predefined class name, the numeric id for user
    /// classes, or the pseudo-cluster name.
    pub fn display_name(&self) -> String {
        match self {
            Self::Cid(cid) => match tables::class_name(*cid) {
                Some(name) if *cid < tables::num_predefined_cids() => name.to_string(),
                _ => cid.to_string(),
            },
            Self::BaseObject => "BaseObject".to_string(),
            Self::ObjectStore => "ObjectStore".to_string(),
            Self::UnknownBase => "UnknownBase".to_string(),
        }
    }
}

/// A group of objects sharing a class id, with the per-cluster metadata
/// recorded during the allocation pass.
#[derive(Debug, Clone)]
pub struct Cluster {
    /// Class identity of the cluster.
    pub cid: ClassRef,
    /// Handler that deserialized it.
    pub handler: HandlerKind,
    /// Objects of the cluster, in allocation order.
    pub refs: Vec<RefId>,
    /// Handler-specific metadata written during allocation.
    pub meta: Payload,
    /// Whether the cluster was synthesized by the parser rather than read
    /// from the stream.
    pub synthetic: bool,
}

/// Element type of a typed-data array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemKind {
    /// Signed 8-bit elements.
    Int8,
    /// Unsigned 8-bit elements.
    Uint8,
    /// Signed 16-bit elements.
    Int16,
    /// Unsigned 16-bit elements.
    Uint16,
    /// Signed 32-bit elements.
    Int32,
    /// Unsigned 32-bit elements.
    Uint32,
    /// Signed 64-bit elements.
    Int64,
    /// Unsigned 64-bit elements.
    Uint64,
}

impl ElemKind {
    /// Derive the element kind and storage variant from a typed-data class
    /// name such as `TypedDataInt16Array` or `ExternalTypedDataUint8Array`.
    pub fn from_class_name(name: &str) -> Option<(Self, bool)> {
        let (stripped, external) = match name.strip_prefix("External") {
            Some(rest) => (rest, true),
            None => (name, false),
        };
        let elem = stripped.strip_prefix("TypedData")?.strip_suffix("Array")?;
        let elem = match elem {
            "Int8" => Self::Int8,
            "Uint8" => Self::Uint8,
            "Int16" => Self::Int16,
            "Uint16" => Self::Uint16,
            "Int32" => Self::Int32,
            "Uint32" => Self::Uint32,
            "Int64" => Self::Int64,
            "Uint64" => Self::Uint64,
            _ => return None,
        };
        Some((elem, external))
    }

    /// Element width in bits.
    pub const fn bits(&self) -> u32 {
        match self {
            Self::Int8 | Self::Uint8 => 8,
            Self::Int16 | Self::Uint16 => 16,
            Self::Int32 | Self::Uint32 => 32,
            Self::Int64 | Self::Uint64 => 64,
        }
    }

    /// Whether elements are sign-extended.
    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }
}

/// Deserialization handler of a cluster. One variant per class kind with
/// cluster-specific wire layout; shared layouts (count-only, per-object
/// length, read-only-data offsets) are factored into the allocation helpers
/// rather than a handler hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)] // variant names mirror the class kinds one-to-one
pub enum HandlerKind {
    Class,
    Instance,
    Type,
    TypeRef,
    TypeParameter,
    Closure,
    ClosureData,
    SignatureData,
    UnlinkedCall,
    MegamorphicCache,
    SubtypeTestCache,
    UnhandledException,
    Namespace,
    WeakProperty,
    StackTrace,
    GrowableObjectArray,
    FunctionType,
    Mint,
    Double,
    PatchClass,
    Function,
    Field,
    Script,
    Library,
    Code,
    ObjectPool,
    ExceptionHandlers,
    TypeArguments,
    Array,
    ContextScope,
    ICData,
    LibraryPrefix,
    RegExp,
    KernelProgramInfo,
    TypedData { elem: ElemKind, external: bool },
    RoString,
    RoOneByteString,
    RoTwoByteString,
    OneByteString,
    TwoByteString,
    PcDescriptors,
    CodeSourceMap,
    StackMap,
    ObjectStore,
    BaseObject,
    UnknownBase,
}

impl HandlerKind {
    /// Resolve the handler for a cluster's class id. Snapshots with code
    /// store their strings in the read-only region, so the string handlers
    /// switch layout on `includes_code`. Returns the handler name on
    /// failure so the caller can report it.
    pub fn for_cid(cid: i64, includes_code: bool) -> Result<Self, String> {
        if cid >= tables::num_predefined_cids() {
            return Ok(Self::Instance);
        }
        if tables::is_typed_data_cid(cid) || tables::is_external_typed_data_cid(cid) {
            let name = tables::class_name(cid).unwrap_or("TypedData");
            return match ElemKind::from_class_name(name) {
                Some((elem, external)) => Ok(Self::TypedData { elem, external }),
                None => Err(name.to_string()),
            };
        }
        if tables::is_typed_data_view_cid(cid) {
            return Err("TypedDataView".to_string());
        }
        let name = match tables::class_name(cid) {
            Some(name) => name,
            None => return Err(format!("cid {cid}")),
        };
        match name {
            "Class" => Ok(Self::Class),
            "Instance" => Ok(Self::Instance),
            "Type" => Ok(Self::Type),
            "TypeRef" => Ok(Self::TypeRef),
            "TypeParameter" => Ok(Self::TypeParameter),
            "Closure" => Ok(Self::Closure),
            "ClosureData" => Ok(Self::ClosureData),
            "SignatureData" => Ok(Self::SignatureData),
            "UnlinkedCall" => Ok(Self::UnlinkedCall),
            "MegamorphicCache" => Ok(Self::MegamorphicCache),
            "SubtypeTestCache" => Ok(Self::SubtypeTestCache),
            "UnhandledException" => Ok(Self::UnhandledException),
            "Namespace" => Ok(Self::Namespace),
            "WeakProperty" => Ok(Self::WeakProperty),
            "StackTrace" => Ok(Self::StackTrace),
            "GrowableObjectArray" => Ok(Self::GrowableObjectArray),
            "FunctionType" => Ok(Self::FunctionType),
            "Mint" => Ok(Self::Mint),
            "Double" => Ok(Self::Double),
            "PatchClass" => Ok(Self::PatchClass),
            "Function" => Ok(Self::Function),
            "Field" => Ok(Self::Field),
            "Script" => Ok(Self::Script),
            "Library" => Ok(Self::Library),
            "Code" => Ok(Self::Code),
            "ObjectPool" => Ok(Self::ObjectPool),
            "ExceptionHandlers" => Ok(Self::ExceptionHandlers),
            "TypeArguments" => Ok(Self::TypeArguments),
            "Array" | "ImmutableArray" => Ok(Self::Array),
            "ContextScope" => Ok(Self::ContextScope),
            "ICData" => Ok(Self::ICData),
            "LibraryPrefix" => Ok(Self::LibraryPrefix),
            "RegExp" => Ok(Self::RegExp),
            "KernelProgramInfo" => Ok(Self::KernelProgramInfo),
            "String" if includes_code => Ok(Self::RoString),
            "OneByteString" if includes_code => Ok(Self::RoOneByteString),
            "TwoByteString" if includes_code => Ok(Self::RoTwoByteString),
            "OneByteString" => Ok(Self::OneByteString),
            "TwoByteString" => Ok(Self::TwoByteString),
            "PcDescriptors" => Ok(Self::PcDescriptors),
            "CodeSourceMap" => Ok(Self::CodeSourceMap),
            "StackMap" => Ok(Self::StackMap),
            _ => Err(name.to_string()),
        }
    }

    /// Name used to look up the handler's reference-field list and to label
    /// diagnostics.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Class => "Class",
            Self::Instance => "Instance",
            Self::Type => "Type",
            Self::TypeRef => "TypeRef",
            Self::TypeParameter => "TypeParameter",
            Self::Closure => "Closure",
            Self::ClosureData => "ClosureData",
            Self::SignatureData => "SignatureData",
            Self::UnlinkedCall => "UnlinkedCall",
            Self::MegamorphicCache => "MegamorphicCache",
            Self::SubtypeTestCache => "SubtypeTestCache",
            Self::UnhandledException => "UnhandledException",
            Self::Namespace => "Namespace",
            Self::WeakProperty => "WeakProperty",
            Self::StackTrace => "StackTrace",
            Self::GrowableObjectArray => "GrowableObjectArray",
            Self::FunctionType => "FunctionType",
            Self::Mint => "Mint",
            Self::Double => "Double",
            Self::PatchClass => "PatchClass",
            Self::Function => "Function",
            Self::Field => "Field",
            Self::Script => "Script",
            Self::Library => "Library",
            Self::Code => "Code",
            Self::ObjectPool => "ObjectPool",
            Self::ExceptionHandlers => "ExceptionHandlers",
            Self::TypeArguments => "TypeArguments",
            Self::Array => "Array",
            Self::ContextScope => "ContextScope",
            Self::ICData => "ICData",
            Self::LibraryPrefix => "LibraryPrefix",
            Self::RegExp => "RegExp",
            Self::KernelProgramInfo => "KernelProgramInfo",
            Self::TypedData { .. } => "TypedData",
            Self::RoString => "String",
            Self::RoOneByteString | Self::OneByteString => "OneByteString",
            Self::RoTwoByteString | Self::TwoByteString => "TwoByteString",
            Self::PcDescriptors => "PcDescriptors",
            Self::CodeSourceMap => "CodeSourceMap",
            Self::StackMap => "StackMap",
            Self::ObjectStore => "ObjectStore",
            Self::BaseObject => "BaseObject",
            Self::UnknownBase => "UnknownBase",
        }
    }

    /// Whether the driver reads this handler's reference fields (from the
    /// static field table) before invoking its fill routine.
    pub const fn reads_from_table(&self) -> bool {
        !matches!(
            self,
            Self::Instance
                | Self::Mint
                | Self::Double
                | Self::TypedData { .. }
                | Self::ObjectPool
                | Self::ExceptionHandlers
                | Self::TypeArguments
                | Self::Array
                | Self::ContextScope
                | Self::RoString
                | Self::RoOneByteString
                | Self::RoTwoByteString
                | Self::OneByteString
                | Self::TwoByteString
                | Self::PcDescriptors
                | Self::CodeSourceMap
                | Self::StackMap
                | Self::BaseObject
                | Self::UnknownBase
        )
    }

    /// Whether this handler parses its objects out of the read-only data
    /// region during allocation.
    pub const fn is_rodata(&self) -> bool {
        matches!(
            self,
            Self::RoString
                | Self::RoOneByteString
                | Self::RoTwoByteString
                | Self::PcDescriptors
                | Self::CodeSourceMap
                | Self::StackMap
        )
    }
}

impl<'a> Parser<'a> {
    /* ALLOCATION */

    /// Run the allocation routine of the cluster's handler.
    pub(crate) fn alloc_cluster(&mut self, cluster: usize) -> Result<(), ParseError> {
        let handler = self.snap.clusters[cluster].handler;
        match handler {
            HandlerKind::Class => self.alloc_class(cluster),
            HandlerKind::Instance => self.alloc_instance(cluster),
            HandlerKind::Type => self.alloc_type(cluster),
            HandlerKind::Mint => self.alloc_mint(cluster),
            HandlerKind::Code => self.alloc_code(cluster),
            HandlerKind::TypedData { external: false, .. }
            | HandlerKind::ObjectPool
            | HandlerKind::ExceptionHandlers
            | HandlerKind::TypeArguments
            | HandlerKind::Array
            | HandlerKind::ContextScope
            | HandlerKind::OneByteString
            | HandlerKind::TwoByteString => self.alloc_with_lengths(cluster),
            handler if handler.is_rodata() => self.alloc_rodata(cluster),
            _ => self.alloc_simple(cluster),
        }
    }

    /// Count-only allocation: `count` objects with empty payloads.
    fn alloc_simple(&mut self, cluster: usize) -> Result<(), ParseError> {
        let count = self.data.read_unsigned()?;
        for _ in 0..count {
            self.alloc_ref(cluster, Payload::new());
        }
        Ok(())
    }

    /// Count followed by a per-object length recorded in the payload.
    fn alloc_with_lengths(&mut self, cluster: usize) -> Result<(), ParseError> {
        let count = self.data.read_unsigned()?;
        for _ in 0..count {
            let length = self.data.read_unsigned()?;
            let mut payload = Payload::new();
            payload.insert("length".into(), Value::Uint(length));
            self.alloc_ref(cluster, payload);
        }
        Ok(())
    }

    fn alloc_class(&mut self, cluster: usize) -> Result<(), ParseError> {
        let predefined = self.data.read_unsigned()?;
        for _ in 0..predefined {
            let cid = self.data.read_cid()?;
            let mut payload = Payload::new();
            payload.insert("cid".into(), Value::Int(cid));
            payload.insert("predefined".into(), Value::Bool(true));
            self.alloc_ref(cluster, payload);
        }
        let user = self.data.read_unsigned()?;
        for _ in 0..user {
            let mut payload = Payload::new();
            payload.insert("predefined".into(), Value::Bool(false));
            self.alloc_ref(cluster, payload);
        }
        Ok(())
    }

    fn alloc_instance(&mut self, cluster: usize) -> Result<(), ParseError> {
        let count = self.data.read_unsigned()?;
        let next_field_offset = self.data.read_cint(32)?;
        let instance_size = self.data.read_cint(32)?;
        let meta = &mut self.snap.clusters[cluster].meta;
        meta.insert("next_field_offset_in_words".into(), Value::Uint(next_field_offset));
        meta.insert("instance_size_in_words".into(), Value::Uint(instance_size));
        for _ in 0..count {
            self.alloc_ref(cluster, Payload::new());
        }
        Ok(())
    }

    fn alloc_type(&mut self, cluster: usize) -> Result<(), ParseError> {
        let canonical = self.data.read_unsigned()?;
        let total = canonical + self.data.read_unsigned()?;
        for i in 0..total {
            let mut payload = Payload::new();
            payload.insert("canonical".into(), Value::Bool(i < canonical));
            self.alloc_ref(cluster, payload);
        }
        Ok(())
    }

    fn alloc_mint(&mut self, cluster: usize) -> Result<(), ParseError> {
        let count = self.data.read_unsigned()?;
        for _ in 0..count {
            let value = self.data.read_int(64)?;
            let mut payload = Payload::new();
            payload.insert("value".into(), Value::Int(value));
            self.alloc_ref(cluster, payload);
        }
        Ok(())
    }

    fn alloc_code(&mut self, cluster: usize) -> Result<(), ParseError> {
        let count = self.data.read_unsigned()?;
        for _ in 0..count {
            let state_bits = self.data.read_int(32)?;
            let mut payload = Payload::new();
            payload.insert("state_bits".into(), Value::Int(state_bits));
            self.alloc_ref(cluster, payload);
        }
        let deferred = self.data.read_unsigned()?;
        for _ in 0..deferred {
            let state_bits = self.data.read_int(32)?;
            let mut payload = Payload::new();
            payload.insert("state_bits".into(), Value::Int(state_bits));
            payload.insert("deferred".into(), Value::Bool(true));
            self.alloc_ref(cluster, payload);
        }
        Ok(())
    }

    /* FILL */

    /// Run the fill routine of the cluster's handler for one object,
    /// merging the read fields into `x`.
    pub(crate) fn fill_object(&mut self, cluster: usize, ref_id: RefId, x: &mut Payload) -> Result<(), ParseError> {
        let handler = self.snap.clusters[cluster].handler;
        match handler {
            HandlerKind::Class => self.fill_class(x),
            HandlerKind::Instance => self.fill_instance(cluster, ref_id, x),
            HandlerKind::Type => self.fill_type(x),
            HandlerKind::TypeParameter => self.fill_type_parameter(x),
            HandlerKind::MegamorphicCache => self.fill_megamorphic_cache(x),
            HandlerKind::Double => self.fill_double(x),
            HandlerKind::PatchClass => self.fill_patch_class(x),
            HandlerKind::Function => self.fill_function(ref_id, x),
            HandlerKind::Field => self.fill_field(x),
            HandlerKind::Script => self.fill_script(x),
            HandlerKind::Library => self.fill_library(x),
            HandlerKind::ObjectPool => self.fill_object_pool(ref_id, x),
            HandlerKind::ExceptionHandlers => self.fill_exception_handlers(ref_id, x),
            HandlerKind::TypeArguments => self.fill_type_arguments(ref_id, x),
            HandlerKind::Array => self.fill_array(ref_id, x),
            HandlerKind::ContextScope => self.fill_context_scope(ref_id, x),
            HandlerKind::ICData => self.fill_ic_data(x),
            HandlerKind::LibraryPrefix => self.fill_library_prefix(x),
            HandlerKind::RegExp => self.fill_regexp(x),
            HandlerKind::KernelProgramInfo => self.fill_kernel_program_info(x),
            HandlerKind::TypedData { elem, external } => self.fill_typed_data(elem, external, x),
            HandlerKind::OneByteString => self.fill_one_byte_string(x),
            HandlerKind::TwoByteString => self.fill_two_byte_string(x),
            // Everything else either has no fill data or was fully parsed
            // during allocation.
            _ => Ok(()),
        }
    }

    fn fill_class(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        let cid = self.data.read_cid()?;
        let predefined = matches!(x.get("predefined"), Some(Value::Bool(true)));
        if predefined {
            let alloc_cid = x.get("cid").and_then(Value::as_int);
            if alloc_cid != Some(cid) {
                self.warn(format!(
                    "predefined class changed id between passes (alloc={}, fill={cid})",
                    alloc_cid.map_or_else(|| "?".to_string(), |cid| cid.to_string()),
                ))?;
            }
        } else if cid < tables::num_predefined_cids() {
            self.warn(format!("user class carries the predefined id {cid}"))?;
        }
        x.insert("cid".into(), Value::Int(cid));

        if !self.snap.is_precompiled && self.snap.kind != Kind::FullAot {
            let decl = self.data.read_uint(32)?;
            x.insert("binary_declaration".into(), Value::Uint(decl));
        }
        x.insert("instance_size_in_words".into(), Value::Int(self.data.read_int(32)?));
        x.insert("next_field_offset_in_words".into(), Value::Int(self.data.read_int(32)?));
        x.insert("type_arguments_field_offset_in_words".into(), Value::Int(self.data.read_int(32)?));
        x.insert("num_type_arguments".into(), Value::Int(self.data.read_int(16)?));
        x.insert("num_native_fields".into(), Value::Uint(self.data.read_uint(16)?));
        x.insert("token_pos".into(), Value::Int(self.data.read_token_position()?));
        x.insert("end_token_pos".into(), Value::Int(self.data.read_token_position()?));
        x.insert("state_bits".into(), Value::Uint(self.data.read_uint(32)?));
        Ok(())
    }

    fn fill_instance(&mut self, cluster: usize, ref_id: RefId, x: &mut Payload) -> Result<(), ParseError> {
        x.insert("canonical".into(), Value::Bool(self.data.read_bool()?));
        let next_field_offset = self.snap.clusters[cluster]
            .meta
            .get("next_field_offset_in_words")
            .and_then(Value::as_uint)
            .unwrap_or(RAW_INSTANCE_SIZE_IN_WORDS);
        let count = next_field_offset.saturating_sub(RAW_INSTANCE_SIZE_IN_WORDS);
        let mut fields = Vec::with_capacity(count as usize);
        for n in 0..count {
            let path = vec![PathSeg::Field("fields".into()), PathSeg::Index(n as usize)];
            fields.push(self.read_ref_value(ref_id, path)?);
        }
        x.insert("fields".into(), Value::List(fields));
        Ok(())
    }

    fn fill_type(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        x.insert("token_pos".into(), Value::Int(self.data.read_token_position()?));
        x.insert("type_state".into(), Value::Int(self.data.read_int(8)?));
        Ok(())
    }

    fn fill_type_parameter(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        x.insert("parameterized_class_id".into(), Value::Int(self.data.read_int(32)?));
        x.insert("token_pos".into(), Value::Int(self.data.read_token_position()?));
        x.insert("index".into(), Value::Int(self.data.read_int(16)?));
        x.insert("flags".into(), Value::Uint(self.data.read_uint(8)?));
        Ok(())
    }

    fn fill_megamorphic_cache(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        x.insert("filled_entry_count".into(), Value::Int(self.data.read_int(32)?));
        Ok(())
    }

    fn fill_double(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        x.insert("canonical".into(), Value::Bool(self.data.read_bool()?));
        x.insert("value".into(), Value::Double(self.data.read_double()?));
        Ok(())
    }

    fn fill_patch_class(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        if !self.snap.is_precompiled && self.snap.kind != Kind::FullAot {
            x.insert("library_kernel_offset".into(), Value::Int(self.data.read_int(32)?));
        }
        Ok(())
    }

    fn fill_function(&mut self, ref_id: RefId, x: &mut Payload) -> Result<(), ParseError> {
        let kind = self.snap.kind;
        if !self.snap.is_precompiled {
            if kind == Kind::FullJit {
                self.store_ref(x, "unoptimized_code", ref_id)?;
            }
            if self.snap.includes_bytecode {
                self.store_ref(x, "bytecode", ref_id)?;
            }
        }
        if self.snap.includes_code {
            self.store_ref(x, "code", ref_id)?;
        }
        if kind == Kind::FullJit {
            self.store_ref(x, "ic_data_array", ref_id)?;
        }
        if !self.snap.is_precompiled && kind != Kind::FullAot {
            x.insert("token_pos".into(), Value::Int(self.data.read_token_position()?));
            x.insert("end_token_pos".into(), Value::Int(self.data.read_token_position()?));
            x.insert("binary_declaration".into(), Value::Uint(self.data.read_uint(32)?));
        }
        x.insert("packed_fields".into(), Value::Uint(self.data.read_uint(32)?));
        x.insert("kind_tag".into(), Value::Uint(self.data.read_uint(64)?));
        Ok(())
    }

    fn fill_field(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        if self.snap.kind != Kind::FullAot {
            x.insert("token_pos".into(), Value::Int(self.data.read_token_position()?));
            x.insert("end_token_pos".into(), Value::Int(self.data.read_token_position()?));
            x.insert("guarded_cid".into(), Value::Int(self.data.read_cid()?));
            x.insert("is_nullable".into(), Value::Int(self.data.read_cid()?));
            x.insert("static_type_exactness_state".into(), Value::Int(self.data.read_int(8)?));
            if !self.snap.is_precompiled {
                x.insert("binary_declaration".into(), Value::Uint(self.data.read_uint(32)?));
            }
        }
        x.insert("kind_bits".into(), Value::Uint(self.data.read_uint(16)?));
        Ok(())
    }

    fn fill_script(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        x.insert("line_offset".into(), Value::Int(self.data.read_int(32)?));
        x.insert("col_offset".into(), Value::Int(self.data.read_int(32)?));
        x.insert("kind".into(), Value::Int(self.data.read_int(8)?));
        x.insert("kernel_script_index".into(), Value::Int(self.data.read_int(32)?));
        Ok(())
    }

    fn fill_library(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        x.insert("index".into(), Value::Int(self.data.read_int(32)?));
        x.insert("num_imports".into(), Value::Uint(self.data.read_uint(16)?));
        x.insert("load_state".into(), Value::Int(self.data.read_int(8)?));
        x.insert("is_dart_scheme".into(), Value::Bool(self.data.read_bool()?));
        x.insert("debuggable".into(), Value::Bool(self.data.read_bool()?));
        if !self.snap.is_precompiled {
            x.insert("binary_declaration".into(), Value::Uint(self.data.read_uint(32)?));
        }
        Ok(())
    }

    fn fill_object_pool(&mut self, ref_id: RefId, x: &mut Payload) -> Result<(), ParseError> {
        let count = self.data.read_unsigned()?;
        let mut entries = Vec::with_capacity(count as usize);
        for n in 0..count {
            let tag = self.data.read_uint(8)? as u8;
            let (patchable, raw_type) = decode_pool_entry_tag(tag);
            let mut entry = Payload::new();
            entry.insert("patchable".into(), Value::Bool(patchable));
            entry.insert("type".into(), Value::Uint(u64::from(raw_type)));
            match PoolEntryType::from_raw(raw_type) {
                Some(PoolEntryType::TaggedObject) | Some(PoolEntryType::NativeEntryData) => {
                    let path = vec![
                        PathSeg::Field("entries".into()),
                        PathSeg::Index(n as usize),
                        PathSeg::Field("raw_obj".into()),
                    ];
                    let value = self.read_ref_value(ref_id, path)?;
                    entry.insert("raw_obj".into(), value);
                }
                Some(PoolEntryType::Immediate) => {
                    entry.insert("raw_value".into(), Value::Int(self.data.read_signed()?));
                }
                Some(PoolEntryType::NativeFunction) | Some(PoolEntryType::NativeFunctionWrapper) => {}
                None => self.warn(format!("unknown object-pool entry type {raw_type}"))?,
            }
            entries.push(Value::Map(entry));
        }
        x.insert("entries".into(), Value::List(entries));
        Ok(())
    }

    fn fill_exception_handlers(&mut self, ref_id: RefId, x: &mut Payload) -> Result<(), ParseError> {
        let count = self.data.read_unsigned()?;
        self.store_ref(x, "handled_types_data", ref_id)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut info = Payload::new();
            info.insert("handler_pc_offset".into(), Value::Uint(self.data.read_uint(32)?));
            info.insert("outer_try_index".into(), Value::Int(self.data.read_int(16)?));
            info.insert("needs_stacktrace".into(), Value::Int(self.data.read_int(8)?));
            info.insert("has_catch_all".into(), Value::Int(self.data.read_int(8)?));
            info.insert("is_generated".into(), Value::Int(self.data.read_int(8)?));
            entries.push(Value::Map(info));
        }
        x.insert("entries".into(), Value::List(entries));
        Ok(())
    }

    fn fill_type_arguments(&mut self, ref_id: RefId, x: &mut Payload) -> Result<(), ParseError> {
        let count = self.data.read_unsigned()?;
        x.insert("canonical".into(), Value::Bool(self.data.read_bool()?));
        x.insert("hash".into(), Value::Int(self.data.read_int(32)?));
        self.store_ref(x, "instantiations", ref_id)?;
        let mut types = Vec::with_capacity(count as usize);
        for n in 0..count {
            let path = vec![PathSeg::Field("types".into()), PathSeg::Index(n as usize)];
            types.push(self.read_ref_value(ref_id, path)?);
        }
        x.insert("types".into(), Value::List(types));
        Ok(())
    }

    fn fill_array(&mut self, ref_id: RefId, x: &mut Payload) -> Result<(), ParseError> {
        let count = self.data.read_unsigned()?;
        x.insert("canonical".into(), Value::Bool(self.data.read_bool()?));
        self.store_ref(x, "type_arguments", ref_id)?;
        let mut value = Vec::with_capacity(count as usize);
        for n in 0..count {
            let path = vec![PathSeg::Field("value".into()), PathSeg::Index(n as usize)];
            value.push(self.read_ref_value(ref_id, path)?);
        }
        x.insert("value".into(), Value::List(value));
        Ok(())
    }

    fn fill_context_scope(&mut self, ref_id: RefId, x: &mut Payload) -> Result<(), ParseError> {
        let length = self.data.read_unsigned()?;
        x.insert("implicit".into(), Value::Bool(self.data.read_bool()?));
        let mut variables = Vec::with_capacity(length as usize);
        for i in 0..length {
            let mut var = Payload::new();
            var.insert("declaration_token_pos".into(), Value::Uint(self.data.read_unsigned()?));
            var.insert("token_pos".into(), Value::Uint(self.data.read_unsigned()?));
            for field in ["name", "is_final", "is_const", "value_or_type"] {
                let path = vec![
                    PathSeg::Field("variables".into()),
                    PathSeg::Index(i as usize),
                    PathSeg::Field(field.into()),
                ];
                let value = self.read_ref_value(ref_id, path)?;
                var.insert(field.into(), value);
            }
            var.insert("context_index".into(), Value::Uint(self.data.read_unsigned()?));
            var.insert("context_level".into(), Value::Uint(self.data.read_unsigned()?));
            variables.push(Value::Map(var));
        }
        x.insert("variables".into(), Value::List(variables));
        Ok(())
    }

    fn fill_ic_data(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        if !self.snap.is_precompiled {
            x.insert("deopt_id".into(), Value::Int(self.data.read_int(32)?));
        }
        x.insert("state_bits".into(), Value::Int(self.data.read_int(32)?));
        Ok(())
    }

    fn fill_library_prefix(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        x.insert("num_imports".into(), Value::Uint(self.data.read_uint(16)?));
        x.insert("deferred_load".into(), Value::Bool(self.data.read_bool()?));
        Ok(())
    }

    fn fill_regexp(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        x.insert("num_one_byte_registers".into(), Value::Int(self.data.read_int(32)?));
        x.insert("num_two_byte_registers".into(), Value::Int(self.data.read_int(32)?));
        x.insert("type_flags".into(), Value::Int(self.data.read_int(8)?));
        Ok(())
    }

    fn fill_kernel_program_info(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        x.insert("kernel_binary_version".into(), Value::Uint(self.data.read_uint(32)?));
        Ok(())
    }

    fn fill_typed_data(&mut self, elem: ElemKind, external: bool, x: &mut Payload) -> Result<(), ParseError> {
        let count = self.data.read_unsigned()?;
        if external {
            self.data.align_to(DATA_SERIALIZATION_ALIGNMENT)?;
        } else {
            x.insert("canonical".into(), Value::Bool(self.data.read_bool()?));
        }
        let value = if elem == ElemKind::Uint8 {
            // Fast path: unsigned bytes are kept as a raw payload.
            Value::Bytes(self.data.read_bytes(count as usize)?.to_vec())
        } else {
            let mut elems = Vec::with_capacity(count as usize);
            for _ in 0..count {
                elems.push(if elem.is_signed() {
                    Value::Int(self.data.read_int(elem.bits())?)
                } else {
                    Value::Uint(self.data.read_uint(elem.bits())?)
                });
            }
            Value::List(elems)
        };
        x.insert("value".into(), value);
        Ok(())
    }

    fn fill_one_byte_string(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        let length = self.read_string_length(x)?;
        x.insert("canonical".into(), Value::Bool(self.data.read_bool()?));
        x.insert("hash".into(), Value::Uint(self.data.read_uint(32)?));
        let bytes = self.data.read_bytes(length as usize)?;
        x.insert("value".into(), Value::Str(bytes.iter().map(|&b| b as char).collect()));
        Ok(())
    }

    fn fill_two_byte_string(&mut self, x: &mut Payload) -> Result<(), ParseError> {
        let length = self.read_string_length(x)?;
        x.insert("canonical".into(), Value::Bool(self.data.read_bool()?));
        x.insert("hash".into(), Value::Uint(self.data.read_uint(32)?));
        let bytes = self.data.read_bytes(length as usize * 2)?.to_vec();
        let value = self.decode_utf16(&bytes)?;
        x.insert("value".into(), Value::Str(value));
        Ok(())
    }

    /// The fill stream repeats the string length recorded at allocation
    /// time; a disagreement means the two passes went out of sync.
    fn read_string_length(&mut self, x: &Payload) -> Result<u64, ParseError> {
        let length = self.data.read_unsigned()?;
        let alloc_length = x.get("length").and_then(Value::as_uint);
        if alloc_length != Some(length) {
            self.warn(format!(
                "string length disagrees between passes (alloc={}, fill={length})",
                alloc_length.map_or_else(|| "?".to_string(), |len| len.to_string()),
            ))?;
        }
        Ok(length)
    }

    pub(crate) fn decode_utf16(&mut self, bytes: &[u8]) -> Result<String, ParseError> {
        let units: Vec<u16> =
            bytes.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]])).collect();
        match String::from_utf16(&units) {
            Ok(value) => Ok(value),
            Err(_) => {
                self.warn("string payload is not valid UTF-16".to_string())?;
                Ok(String::from_utf16_lossy(&units))
            }
        }
    }
}
