//! Shader binding table records, tables, and the table descriptor.

use std::fmt;
use std::mem::{align_of, size_of};

use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::device::{DeviceBuffer, DeviceContext};
use crate::error::{Error, Result};
use crate::pipeline::{ProgramGroup, ProgramGroupKind};

/// Alignment of every SBT record and table.
pub const SBT_RECORD_ALIGNMENT: usize = 16;
/// Size of the opaque dispatch header at the start of every record.
pub const SBT_RECORD_HEADER_SIZE: usize = 32;

const HEADER_MAGIC: [u8; 4] = *b"RTSB";

/// Opaque per-record dispatch header.
///
/// Only [`ProgramGroup::pack_header`] produces a resolvable header. A zeroed
/// header is representable (the type is `Pod`) but faults at dispatch.
#[repr(C, align(16))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DispatchHeader {
    bytes: [u8; SBT_RECORD_HEADER_SIZE],
}

unsafe impl Zeroable for DispatchHeader {}
unsafe impl Pod for DispatchHeader {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeaderFields {
    pub kind_tag: u32,
    pub context_id: u64,
    pub group_id: u64,
    pub checksum: u64,
}

impl DispatchHeader {
    pub(crate) fn encode(
        kind: ProgramGroupKind,
        context_id: u64,
        group_id: u64,
        checksum: u64,
    ) -> Self {
        let mut bytes = [0u8; SBT_RECORD_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&HEADER_MAGIC);
        bytes[4..8].copy_from_slice(&kind.tag().to_le_bytes());
        bytes[8..16].copy_from_slice(&context_id.to_le_bytes());
        bytes[16..24].copy_from_slice(&group_id.to_le_bytes());
        bytes[24..32].copy_from_slice(&checksum.to_le_bytes());
        Self { bytes }
    }

    pub(crate) fn from_bytes(bytes: [u8; SBT_RECORD_HEADER_SIZE]) -> Self {
        Self { bytes }
    }

    pub(crate) fn decode(&self) -> Option<HeaderFields> {
        if !self.is_packed() {
            return None;
        }
        let word = |range: std::ops::Range<usize>| {
            let mut out = [0u8; 8];
            out.copy_from_slice(&self.bytes[range]);
            u64::from_le_bytes(out)
        };
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&self.bytes[4..8]);
        Some(HeaderFields {
            kind_tag: u32::from_le_bytes(tag),
            context_id: word(8..16),
            group_id: word(16..24),
            checksum: word(24..32),
        })
    }

    /// True when the header was produced by a program group.
    pub fn is_packed(&self) -> bool {
        self.bytes[..4] == HEADER_MAGIC
    }

    pub fn as_bytes(&self) -> &[u8; SBT_RECORD_HEADER_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for DispatchHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Some(fields) => f
                .debug_struct("DispatchHeader")
                .field("kind", &fields.kind_tag)
                .field("group", &fields.group_id)
                .finish(),
            None => f.write_str("DispatchHeader(unpacked)"),
        }
    }
}

/// Raygen record: header plus an opaque data pointer.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaygenRecord {
    header: DispatchHeader,
    pub data: u64,
    _reserved: u64,
}

/// Miss record: header plus an opaque data pointer.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissRecord {
    header: DispatchHeader,
    pub data: u64,
    _reserved: u64,
}

/// Hit group record: header plus the id of the object it shades.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitgroupRecord {
    header: DispatchHeader,
    pub object_id: i32,
    _reserved: [u32; 3],
}

unsafe impl Zeroable for RaygenRecord {}
unsafe impl Pod for RaygenRecord {}
unsafe impl Zeroable for MissRecord {}
unsafe impl Pod for MissRecord {}
unsafe impl Zeroable for HitgroupRecord {}
unsafe impl Pod for HitgroupRecord {}

const _: () = {
    assert!(size_of::<DispatchHeader>() == SBT_RECORD_HEADER_SIZE);
    assert!(size_of::<RaygenRecord>() == 48);
    assert!(size_of::<MissRecord>() == 48);
    assert!(size_of::<HitgroupRecord>() == 48);
    assert!(align_of::<RaygenRecord>() == SBT_RECORD_ALIGNMENT);
    assert!(align_of::<MissRecord>() == SBT_RECORD_ALIGNMENT);
    assert!(align_of::<HitgroupRecord>() == SBT_RECORD_ALIGNMENT);
};

/// A record type that can live in a shader binding table.
pub trait SbtRecord: Pod {
    /// Program group role whose header this record carries.
    const KIND: ProgramGroupKind;
    /// User data stored after the header.
    type Payload: Copy;

    #[doc(hidden)]
    fn assemble(header: DispatchHeader, payload: Self::Payload) -> Self;

    fn header(&self) -> &DispatchHeader;

    /// Builds a record whose header resolves to `group`.
    fn pack(group: &ProgramGroup, payload: Self::Payload) -> Result<Self> {
        if group.kind() != Self::KIND {
            return Err(Error::Sbt(format!(
                "cannot pack a {} program group into a {} record",
                group.kind(),
                Self::KIND
            )));
        }
        Ok(Self::assemble(group.pack_header(), payload))
    }
}

impl SbtRecord for RaygenRecord {
    const KIND: ProgramGroupKind = ProgramGroupKind::RayGen;
    type Payload = u64;

    fn assemble(header: DispatchHeader, data: u64) -> Self {
        Self {
            header,
            data,
            _reserved: 0,
        }
    }

    fn header(&self) -> &DispatchHeader {
        &self.header
    }
}

impl SbtRecord for MissRecord {
    const KIND: ProgramGroupKind = ProgramGroupKind::Miss;
    type Payload = u64;

    fn assemble(header: DispatchHeader, data: u64) -> Self {
        Self {
            header,
            data,
            _reserved: 0,
        }
    }

    fn header(&self) -> &DispatchHeader {
        &self.header
    }
}

impl SbtRecord for HitgroupRecord {
    const KIND: ProgramGroupKind = ProgramGroupKind::HitGroup;
    type Payload = i32;

    fn assemble(header: DispatchHeader, object_id: i32) -> Self {
        Self {
            header,
            object_id,
            _reserved: [0; 3],
        }
    }

    fn header(&self) -> &DispatchHeader {
        &self.header
    }
}

/// Address, stride, and record count of one device-resident table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SbtRegion {
    pub address: u64,
    pub stride: u32,
    pub count: u32,
}

/// Device-resident array of packed records of one kind.
#[derive(Debug)]
pub struct SbtTable {
    kind: ProgramGroupKind,
    buffer: DeviceBuffer,
    stride: u32,
    count: u32,
}

impl SbtTable {
    /// Uploads `records` into a buffer sized exactly to the array.
    pub fn build<R: SbtRecord>(context: &DeviceContext, records: &[R]) -> Result<Self> {
        if let Some(index) = records
            .iter()
            .position(|record| !record.header().is_packed())
        {
            return Err(Error::Sbt(format!(
                "{} record {index} has an unpacked dispatch header",
                R::KIND
            )));
        }
        let count = u32::try_from(records.len())
            .map_err(|_| Error::Sbt(format!("{} records exceed the table limit", records.len())))?;
        let buffer = DeviceBuffer::alloc_and_upload(context, records)?;
        debug!(
            kind = %R::KIND,
            address = format_args!("{:#x}", buffer.device_address()),
            count,
            "built sbt table"
        );
        Ok(Self {
            kind: R::KIND,
            buffer,
            stride: size_of::<R>() as u32,
            count,
        })
    }

    pub fn kind(&self) -> ProgramGroupKind {
        self.kind
    }

    pub fn region(&self) -> SbtRegion {
        SbtRegion {
            address: self.buffer.device_address(),
            stride: self.stride,
            count: self.count,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.buffer.size_in_bytes()
    }
}

/// Descriptor handed to a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShaderBindingTable {
    pub raygen_record: u64,
    pub miss: SbtRegion,
    pub hitgroup: SbtRegion,
}

impl ShaderBindingTable {
    /// Assembles a descriptor from the three tables.
    pub fn new(raygen: &SbtTable, miss: &SbtTable, hitgroup: &SbtTable) -> Result<Self> {
        for (table, kind) in [
            (raygen, ProgramGroupKind::RayGen),
            (miss, ProgramGroupKind::Miss),
            (hitgroup, ProgramGroupKind::HitGroup),
        ] {
            if table.kind() != kind {
                return Err(Error::Sbt(format!(
                    "{} table supplied where a {kind} table was expected",
                    table.kind()
                )));
            }
        }
        if raygen.region().count != 1 {
            return Err(Error::Sbt(format!(
                "raygen table must hold exactly one record, found {}",
                raygen.region().count
            )));
        }
        let sbt = Self {
            raygen_record: raygen.region().address,
            miss: miss.region(),
            hitgroup: hitgroup.region(),
        };
        sbt.validate()?;
        Ok(sbt)
    }

    /// Host-side checks every launch performs.
    pub fn validate(&self) -> Result<()> {
        if self.raygen_record == 0 {
            return Err(Error::Sbt("raygen record address is null".to_string()));
        }
        if self.raygen_record % SBT_RECORD_ALIGNMENT as u64 != 0 {
            return Err(Error::Sbt(format!(
                "raygen record address {:#x} is not {SBT_RECORD_ALIGNMENT}-byte aligned",
                self.raygen_record
            )));
        }
        for (name, region, record_size) in [
            ("miss", &self.miss, size_of::<MissRecord>()),
            ("hit group", &self.hitgroup, size_of::<HitgroupRecord>()),
        ] {
            if region.count == 0 {
                return Err(Error::Sbt(format!("{name} table must not be empty")));
            }
            if region.address == 0 {
                return Err(Error::Sbt(format!("{name} table address is null")));
            }
            if region.address % SBT_RECORD_ALIGNMENT as u64 != 0 {
                return Err(Error::Sbt(format!(
                    "{name} table address {:#x} is not {SBT_RECORD_ALIGNMENT}-byte aligned",
                    region.address
                )));
            }
            if region.stride as usize != record_size {
                return Err(Error::Sbt(format!(
                    "{name} table stride {} does not match its {record_size}-byte records",
                    region.stride
                )));
            }
        }
        Ok(())
    }
}

/// Scene object that selects a hit group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneObject {
    /// Index into the hit group list passed to [`ShaderBindingTables::build`].
    pub hit_group: usize,
}

/// The three tables of a frame plus their descriptor.
///
/// Built once per pipeline; the tables own their device memory and must
/// outlive every launch that uses the descriptor.
#[derive(Debug)]
pub struct ShaderBindingTables {
    raygen: SbtTable,
    miss: SbtTable,
    hitgroup: SbtTable,
    descriptor: ShaderBindingTable,
}

impl ShaderBindingTables {
    /// Packs one raygen record, one miss record per miss group, and one hit
    /// record per scene object.
    ///
    /// With no objects a single placeholder record (object id 0) is packed
    /// from the first hit group so the hit table is never empty. Each hit
    /// record's object id is its index in the table.
    pub fn build(
        context: &DeviceContext,
        raygen: &ProgramGroup,
        miss_groups: &[ProgramGroup],
        hit_groups: &[ProgramGroup],
        objects: &[SceneObject],
    ) -> Result<Self> {
        if miss_groups.is_empty() {
            return Err(Error::Sbt("at least one miss program group is required".to_string()));
        }
        let Some(first_hit) = hit_groups.first() else {
            return Err(Error::Sbt("at least one hit program group is required".to_string()));
        };

        let raygen_records = [RaygenRecord::pack(raygen, 0)?];
        let miss_records = miss_groups
            .iter()
            .map(|group| MissRecord::pack(group, 0))
            .collect::<Result<Vec<_>>>()?;

        let hit_records = if objects.is_empty() {
            vec![HitgroupRecord::pack(first_hit, 0)?]
        } else {
            objects
                .iter()
                .enumerate()
                .map(|(index, object)| {
                    let group = hit_groups.get(object.hit_group).ok_or_else(|| {
                        Error::Sbt(format!(
                            "object {index} selects hit group {} but only {} exist",
                            object.hit_group,
                            hit_groups.len()
                        ))
                    })?;
                    let object_id = i32::try_from(index)
                        .map_err(|_| Error::Sbt(format!("object index {index} overflows i32")))?;
                    HitgroupRecord::pack(group, object_id)
                })
                .collect::<Result<Vec<_>>>()?
        };

        let raygen = SbtTable::build(context, &raygen_records)?;
        let miss = SbtTable::build(context, &miss_records)?;
        let hitgroup = SbtTable::build(context, &hit_records)?;
        let descriptor = ShaderBindingTable::new(&raygen, &miss, &hitgroup)?;

        Ok(Self {
            raygen,
            miss,
            hitgroup,
            descriptor,
        })
    }

    pub fn descriptor(&self) -> &ShaderBindingTable {
        &self.descriptor
    }

    pub fn raygen(&self) -> &SbtTable {
        &self.raygen
    }

    pub fn miss(&self) -> &SbtTable {
        &self.miss
    }

    pub fn hitgroup(&self) -> &SbtTable {
        &self.hitgroup
    }

    pub fn layout(&self) -> SbtLayout {
        SbtLayout {
            tables: [&self.raygen, &self.miss, &self.hitgroup]
                .into_iter()
                .map(|table| TableLayout {
                    kind: table.kind(),
                    region: table.region(),
                    bytes: table.size_in_bytes(),
                })
                .collect(),
        }
    }
}

/// Per-table summary of a built shader binding table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub kind: ProgramGroupKind,
    pub region: SbtRegion,
    pub bytes: usize,
}

/// Printable summary of all three tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbtLayout {
    pub tables: Vec<TableLayout>,
}

impl fmt::Display for SbtLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<9} {:>18} {:>7} {:>6} {:>7}", "table", "address", "stride", "count", "bytes")?;
        for table in &self.tables {
            writeln!(
                f,
                "{:<9} {:>#18x} {:>7} {:>6} {:>7}",
                table.kind.to_string(),
                table.region.address,
                table.region.stride,
                table.region.count,
                table.bytes
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{EntryRef, Module, ProgramGroupDesc};
    use crate::programs::DEVICE_PROGRAMS;
    use crate::types::{DeviceOptions, ModuleCompileOptions, PipelineCompileOptions};

    struct Fixture {
        ctx: DeviceContext,
        raygen: ProgramGroup,
        miss: ProgramGroup,
        hit: ProgramGroup,
    }

    fn fixture() -> Fixture {
        let ctx = DeviceContext::create(&DeviceOptions::default()).unwrap();
        let (module, _) = Module::new(
            &ctx,
            &ModuleCompileOptions::default(),
            &PipelineCompileOptions::default(),
            DEVICE_PROGRAMS,
        )
        .unwrap();
        let group = |desc: ProgramGroupDesc<'_>| ProgramGroup::new(&ctx, &desc).unwrap().0;
        let raygen = group(ProgramGroupDesc::RayGen(EntryRef::new(
            &module,
            "__raygen__renderFrame",
        )));
        let miss = group(ProgramGroupDesc::Miss(EntryRef::new(&module, "__miss__radiance")));
        let hit = group(ProgramGroupDesc::HitGroup {
            closest_hit: Some(EntryRef::new(&module, "__closesthit__radiance")),
            any_hit: Some(EntryRef::new(&module, "__anyhit__radiance")),
        });
        Fixture {
            ctx,
            raygen,
            miss,
            hit,
        }
    }

    #[test]
    fn pack_header_is_deterministic() {
        let fx = fixture();
        let a = RaygenRecord::pack(&fx.raygen, 7).unwrap();
        let b = RaygenRecord::pack(&fx.raygen, 7).unwrap();
        assert_eq!(a, b);
        assert!(a.header().is_packed());
        assert_ne!(fx.raygen.pack_header(), fx.miss.pack_header());
    }

    #[test]
    fn pack_rejects_wrong_role() {
        let fx = fixture();
        let err = MissRecord::pack(&fx.raygen, 0).unwrap_err();
        assert!(matches!(err, Error::Sbt(_)));
    }

    #[test]
    fn zeroed_records_are_refused() {
        let fx = fixture();
        let err = SbtTable::build(&fx.ctx, &[MissRecord::zeroed()]).unwrap_err();
        assert!(matches!(err, Error::Sbt(ref msg) if msg.contains("unpacked")));
    }

    #[test]
    fn placeholder_hit_record_when_scene_is_empty() {
        let fx = fixture();
        let tables = ShaderBindingTables::build(
            &fx.ctx,
            &fx.raygen,
            std::slice::from_ref(&fx.miss),
            std::slice::from_ref(&fx.hit),
            &[],
        )
        .unwrap();
        let sbt = tables.descriptor();
        assert_eq!(sbt.hitgroup.count, 1);
        assert_eq!(sbt.hitgroup.stride, 48);
        assert_eq!(sbt.miss.count, 1);
        assert_eq!(sbt.raygen_record % 16, 0);
        assert_eq!(tables.hitgroup().size_in_bytes(), 48);
        assert!(tables.layout().to_string().contains("hitgroup"));
    }

    #[test]
    fn one_hit_record_per_object() {
        let fx = fixture();
        let objects = [SceneObject { hit_group: 0 }; 3];
        let tables = ShaderBindingTables::build(
            &fx.ctx,
            &fx.raygen,
            std::slice::from_ref(&fx.miss),
            std::slice::from_ref(&fx.hit),
            &objects,
        )
        .unwrap();
        assert_eq!(tables.descriptor().hitgroup.count, 3);
        assert_eq!(tables.hitgroup().size_in_bytes(), 3 * 48);

        let err = ShaderBindingTables::build(
            &fx.ctx,
            &fx.raygen,
            std::slice::from_ref(&fx.miss),
            std::slice::from_ref(&fx.hit),
            &[SceneObject { hit_group: 2 }],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Sbt(_)));
    }

    #[test]
    fn empty_tables_fail_validation() {
        let sbt = ShaderBindingTable {
            raygen_record: 0x7f00_0000_0000,
            miss: SbtRegion {
                address: 0x7f00_0000_0100,
                stride: 48,
                count: 0,
            },
            hitgroup: SbtRegion {
                address: 0x7f00_0000_0200,
                stride: 48,
                count: 1,
            },
        };
        assert!(matches!(sbt.validate(), Err(Error::Sbt(ref msg)) if msg.contains("miss")));

        let misaligned = ShaderBindingTable {
            raygen_record: 0x7f00_0000_0008,
            ..sbt
        };
        assert!(misaligned.validate().is_err());
    }

    #[test]
    fn stride_must_equal_record_size() {
        let fx = fixture();
        let tables = ShaderBindingTables::build(
            &fx.ctx,
            &fx.raygen,
            std::slice::from_ref(&fx.miss),
            std::slice::from_ref(&fx.hit),
            &[],
        )
        .unwrap();
        let sbt = *tables.descriptor();
        assert!(sbt.validate().is_ok());

        let short_miss = ShaderBindingTable {
            miss: SbtRegion {
                stride: 32,
                ..sbt.miss
            },
            ..sbt
        };
        assert!(matches!(
            short_miss.validate(),
            Err(Error::Sbt(ref msg)) if msg.contains("miss table stride 32")
        ));

        let wide_hits = ShaderBindingTable {
            hitgroup: SbtRegion {
                stride: 64,
                ..sbt.hitgroup
            },
            ..sbt
        };
        assert!(matches!(
            wide_hits.validate(),
            Err(Error::Sbt(ref msg)) if msg.contains("hit group table stride 64")
        ));
    }
}
