//! Snapshot format parameters

/* HEADER */

/// Magic value opening every snapshot data blob.
pub const MAGIC_VALUE: u32 = 0xdcdc_f5f5;

/// Length of the ASCII version hash embedded in the header.
pub const VERSION_LEN: usize = 32;

/// Version hash this parser was written against. The header must match it
/// exactly.
pub const EXPECTED_VERSION: &str = "9cf77f4405212c45daf608e1cd646852";

/* SECTION LAYOUT */

/// Marker written between sections of debug-mode snapshots.
pub const SECTION_MARKER: u16 = 0xabab;

/// Alignment of the read-only data region appended after the clustered body.
pub const MAX_PREFERRED_CODE_ALIGNMENT: usize = 32;

/// Alignment of externally-stored typed data payloads within the stream.
pub const DATA_SERIALIZATION_ALIGNMENT: usize = 8;

/// Tag added to an object's address to form a heap pointer.
pub const HEAP_OBJECT_TAG: u64 = 1;

/// Word count a raw instance header occupies before its fields.
pub const RAW_INSTANCE_SIZE_IN_WORDS: u64 = 1;

/* CACHED BASE-OBJECT TABLES */

/// Number of cached argument descriptors in the base object set.
pub const CACHED_DESCRIPTOR_COUNT: usize = 32;

/// Number of cached IC-data arrays in the base object set.
pub const CACHED_ICDATA_ARRAY_COUNT: usize = 4;

/* SNAPSHOT KIND */

/// What a snapshot carries besides the object heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Full snapshot of an application.
    Full,
    /// Full snapshot of the core libraries.
    FullCore,
    /// Full snapshot plus JIT-compiled code.
    FullJit,
    /// Full snapshot plus AOT-compiled code.
    FullAot,
    /// Produced by the snapshot generator itself.
    None,
    /// Reserved invalid kind.
    Invalid,
}

impl Kind {
    /// Decode the kind from its wire index.
    pub const fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Self::Full),
            1 => Some(Self::FullCore),
            2 => Some(Self::FullJit),
            3 => Some(Self::FullAot),
            4 => Some(Self::None),
            5 => Some(Self::Invalid),
            _ => None,
        }
    }

    /// Whether snapshots of this kind carry machine code and a read-only
    /// data region.
    pub const fn includes_code(&self) -> bool {
        matches!(self, Self::FullJit | Self::FullAot)
    }

    /// Whether snapshots of this kind may carry interpreter bytecode.
    pub const fn includes_bytecode(&self) -> bool {
        matches!(self, Self::Full | Self::FullJit)
    }

    /// Display name of the kind.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Full => "Full",
            Self::FullCore => "FullCore",
            Self::FullJit => "FullJIT",
            Self::FullAot => "FullAOT",
            Self::None => "None",
            Self::Invalid => "Invalid",
        }
    }
}

/* ARCHITECTURE */

/// Target architecture a snapshot was produced for, derived from the
/// features string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 32-bit x86.
    Ia32,
    /// 64-bit x86.
    X64,
    /// 32-bit ARM.
    Arm,
    /// 64-bit ARM.
    Arm64,
}

impl Arch {
    /// Match a feature token against the known architectures. Variant
    /// suffixes (`arm-softfp`, `x64-win`, ...) are accepted.
    pub fn from_feature(token: &str) -> Option<Self> {
        match token.split('-').next() {
            Some("ia32") => Some(Self::Ia32),
            Some("x64") => Some(Self::X64),
            Some("arm") => Some(Self::Arm),
            Some("arm64") => Some(Self::Arm64),
            _ => None,
        }
    }

    /// Key of the architecture in the bundled offset tables.
    pub const fn key(&self) -> &'static str {
        match self {
            Self::Ia32 => "ia32",
            Self::X64 => "x64",
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
        }
    }
}

/* OBJECT POOL ENTRIES */

/// Type discriminant of an object-pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEntryType {
    /// Reference to a heap object.
    TaggedObject,
    /// Raw immediate value.
    Immediate,
    /// Address of a native function.
    NativeFunction,
    /// Address of a native function trampoline.
    NativeFunctionWrapper,
    /// Reference to native entry data.
    NativeEntryData,
}

impl PoolEntryType {
    /// Decode the entry type from the low bits of its tag byte.
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::TaggedObject),
            1 => Some(Self::Immediate),
            2 => Some(Self::NativeFunction),
            3 => Some(Self::NativeFunctionWrapper),
            4 => Some(Self::NativeEntryData),
            _ => None,
        }
    }
}

/// Split an object-pool entry tag byte into its patchable bit and type
/// bits.
pub const fn decode_pool_entry_tag(tag: u8) -> (bool, u8) {
    (tag >> 7 == 0, tag & 0x7f)
}
