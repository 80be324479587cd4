//! Offset-addressed object parsing for the read-only data region

use crate::clusters::HandlerKind;
use crate::consts::HEAP_OBJECT_TAG;
use crate::error::ParseError;
use crate::reader::SnapshotReader;
use crate::snapshot::Parser;
use crate::tables;
use crate::value::{Payload, Value};

impl<'a> Parser<'a> {
    /// Allocation routine shared by the handlers whose objects live in the
    /// read-only region: a count, then per-object offset deltas (scaled by
    /// the object alignment) into that region.
    pub(crate) fn alloc_rodata(&mut self, cluster: usize) -> Result<(), ParseError> {
        let handler = self.snap.clusters[cluster].handler;
        let count = self.data.read_unsigned()?;
        let mut running = 0u64;
        for _ in 0..count {
            running += self.data.read_unsigned()? << self.snap.object_alignment_log2;
            let payload = self.parse_rodata_object(handler, running)?;
            self.alloc_ref(cluster, payload);
        }

        // The read-only string cluster is emitted as a canonical set: a
        // hash-table layout follows the offsets and has to be consumed to
        // keep the stream in sync.
        if self.snap.clusters[cluster].cid.cid() == tables::class_id("String") {
            let table_length = self.data.read_unsigned()?;
            let first_element = self.data.read_unsigned()?;
            let meta = &mut self.snap.clusters[cluster].meta;
            meta.insert("table_length".into(), Value::Uint(table_length));
            meta.insert("first_element".into(), Value::Uint(first_element));
            let mut position = first_element;
            for _ in 0..count {
                position += self.data.read_unsigned()?;
                if position >= table_length {
                    self.warn(format!(
                        "canonical-set position {position} is out of range (table length {table_length})",
                    ))?;
                }
                position += 1;
            }
        }
        Ok(())
    }

    fn parse_rodata_object(&mut self, handler: HandlerKind, offset: u64) -> Result<Payload, ParseError> {
        if !self.opts.parse_rodata {
            let mut stub = Payload::new();
            stub.insert("offset".into(), Value::Uint(self.snap.rodata_offset.unwrap_or(0) + offset));
            return Ok(stub);
        }
        let Some(mut reader) = self.rodata.take() else {
            self.warn("the read-only data region is required but not present".to_string())?;
            let mut stub = Payload::new();
            stub.insert("offset".into(), Value::Uint(offset));
            return Ok(stub);
        };
        reader.seek(offset as usize);
        let result = self.parse_rodata_object_at(&mut reader, handler);
        self.rodata = Some(reader);
        result
    }

    fn parse_rodata_object_at(
        &mut self,
        reader: &mut SnapshotReader<'_>,
        handler: HandlerKind,
    ) -> Result<Payload, ParseError> {
        let is_64 = self.snap.is_64;
        let mut x = Payload::new();
        match handler {
            HandlerKind::RoString => {
                x.insert("obj_ptr".into(), Value::Uint(reader.offset() + HEAP_OBJECT_TAG));
                x.insert("tags".into(), Value::Int(reader.read_smi(is_64)?));
                let length = reader.read_smi(is_64)?;
                x.insert("length".into(), Value::Int(length));
                x.insert("hash".into(), Value::Int(reader.read_smi(is_64)?));
                x.insert("value".into(), Value::Bytes(reader.read_bytes(length.max(0) as usize)?.to_vec()));
            }
            HandlerKind::RoOneByteString | HandlerKind::RoTwoByteString => {
                // The length word is a tagged small integer holding twice
                // the character count.
                let tags = reader.read_uint(32)?;
                let (hash, raw_length) = if is_64 {
                    let hash = reader.read_uint(32)?;
                    (hash, reader.read_uint(64)?)
                } else {
                    let raw_length = reader.read_uint(32)?;
                    (reader.read_uint(32)?, raw_length)
                };
                x.insert("tags".into(), Value::Uint(tags));
                x.insert("hash".into(), Value::Uint(hash));
                let chars = (raw_length / 2) as usize;
                let value = if handler == HandlerKind::RoOneByteString {
                    reader.read_bytes(chars)?.iter().map(|&b| b as char).collect()
                } else {
                    let bytes = reader.read_bytes(chars * 2)?.to_vec();
                    self.decode_utf16(&bytes)?
                };
                x.insert("value".into(), Value::Str(value));
            }
            HandlerKind::PcDescriptors | HandlerKind::CodeSourceMap => {
                x.insert("tags".into(), Value::Uint(reader.read_uint(32)?));
                let length = if is_64 {
                    reader.read_uint(32)?;
                    reader.read_uint(64)?
                } else {
                    reader.read_uint(32)?
                };
                // Code-source-map payloads are an encoded byte program;
                // decoding is left to external tooling.
                x.insert("data".into(), Value::Bytes(reader.read_bytes(length as usize)?.to_vec()));
            }
            HandlerKind::StackMap => {
                x.insert("tags".into(), Value::Uint(reader.read_uint(32)?));
                if is_64 {
                    reader.read_uint(32)?;
                }
                x.insert("pc_offset".into(), Value::Uint(reader.read_uint(32)?));
                let mut length = reader.read_uint(16)?;
                x.insert("slow_path_bit_count".into(), Value::Uint(reader.read_uint(16)?));
                let mut bits = Vec::with_capacity(length as usize);
                while length > 0 {
                    let byte = reader.read_byte()?;
                    for i in 0..8 {
                        if length == 0 {
                            break;
                        }
                        bits.push(Value::Bool(byte >> i & 1 != 0));
                        length -= 1;
                    }
                }
                x.insert("bits".into(), Value::List(bits));
            }
            _ => unreachable!("handler {:?} does not parse read-only data", handler),
        }
        Ok(x)
    }
}
