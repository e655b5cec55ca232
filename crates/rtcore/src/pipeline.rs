//! Pipeline assembly: modules, program groups, linking, and stack sizing.
//!
//! The ordering is fixed: a `DeviceContext` compiles `Module`s, program
//! groups are created from module entry points, groups are linked into a
//! `Pipeline`, and the pipeline's stack budget is set exactly once before
//! the first launch.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::compile::{compile_module_source, CompiledEntry};
use crate::device::DeviceContext;
use crate::error::{Error, Result};
use crate::programs::{ProgramFn, ProgramSemantic};
use crate::sbt::DispatchHeader;
use crate::types::{
    DebugLevel, ModuleCompileOptions, PipelineCompileOptions, PipelineLinkOptions, StackSizes,
    MAX_TRACE_DEPTH_LIMIT, MAX_TRAVERSABLE_GRAPH_DEPTH,
};

/// Compiled device program source.
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

struct ModuleInner {
    id: u64,
    context: DeviceContext,
    options: ModuleCompileOptions,
    pipeline_options: PipelineCompileOptions,
    entries: Vec<CompiledEntry>,
}

impl Module {
    /// Compiles `source` and returns the module together with the compiler log.
    pub fn new(
        context: &DeviceContext,
        options: &ModuleCompileOptions,
        pipeline_options: &PipelineCompileOptions,
        source: &str,
    ) -> Result<(Self, String)> {
        let (entries, log) =
            compile_module_source(source, context.registry(), options, pipeline_options)?;
        surface_log("module compile", &log);

        let module = Self {
            inner: Arc::new(ModuleInner {
                id: context.next_handle(),
                context: context.clone(),
                options: *options,
                pipeline_options: pipeline_options.clone(),
                entries,
            }),
        };
        info!(
            module = module.inner.id,
            entries = module.inner.entries.len(),
            "created module"
        );
        Ok((module, log))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn options(&self) -> &ModuleCompileOptions {
        &self.inner.options
    }

    pub fn pipeline_options(&self) -> &PipelineCompileOptions {
        &self.inner.pipeline_options
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.inner.entries.iter().map(|entry| entry.decl.name.as_str())
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    pub(crate) fn entry(&self, name: &str) -> Option<&CompiledEntry> {
        self.inner.entries.iter().find(|entry| entry.decl.name == name)
    }

    fn context_id(&self) -> u64 {
        self.inner.context.id()
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.inner.id)
            .field("entries", &self.entry_names().collect::<Vec<_>>())
            .finish()
    }
}

/// Role a program group plays in the shader binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramGroupKind {
    RayGen,
    Miss,
    HitGroup,
}

impl ProgramGroupKind {
    pub(crate) fn tag(self) -> u32 {
        match self {
            ProgramGroupKind::RayGen => 1,
            ProgramGroupKind::Miss => 2,
            ProgramGroupKind::HitGroup => 3,
        }
    }
}

impl std::fmt::Display for ProgramGroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgramGroupKind::RayGen => f.write_str("raygen"),
            ProgramGroupKind::Miss => f.write_str("miss"),
            ProgramGroupKind::HitGroup => f.write_str("hitgroup"),
        }
    }
}

/// An entry point inside a module.
#[derive(Debug, Clone, Copy)]
pub struct EntryRef<'a> {
    pub module: &'a Module,
    pub entry: &'a str,
}

impl<'a> EntryRef<'a> {
    pub fn new(module: &'a Module, entry: &'a str) -> Self {
        Self { module, entry }
    }
}

/// Description of a program group to create.
#[derive(Debug, Clone, Copy)]
pub enum ProgramGroupDesc<'a> {
    RayGen(EntryRef<'a>),
    Miss(EntryRef<'a>),
    HitGroup {
        closest_hit: Option<EntryRef<'a>>,
        any_hit: Option<EntryRef<'a>>,
    },
}

impl ProgramGroupDesc<'_> {
    pub fn kind(&self) -> ProgramGroupKind {
        match self {
            ProgramGroupDesc::RayGen(_) => ProgramGroupKind::RayGen,
            ProgramGroupDesc::Miss(_) => ProgramGroupKind::Miss,
            ProgramGroupDesc::HitGroup { .. } => ProgramGroupKind::HitGroup,
        }
    }

    fn label(&self) -> String {
        match self {
            ProgramGroupDesc::RayGen(entry) | ProgramGroupDesc::Miss(entry) => {
                entry.entry.to_string()
            }
            ProgramGroupDesc::HitGroup {
                closest_hit,
                any_hit,
            } => [closest_hit, any_hit]
                .into_iter()
                .flatten()
                .map(|entry| entry.entry)
                .collect::<Vec<_>>()
                .join("+"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BoundProgram {
    pub semantic: ProgramSemantic,
    pub entry: CompiledEntry,
}

/// Program group: one role bound to compiled entry points.
#[derive(Clone)]
pub struct ProgramGroup {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    id: u64,
    context: DeviceContext,
    kind: ProgramGroupKind,
    programs: Vec<BoundProgram>,
    pipeline_options: PipelineCompileOptions,
    debug_level: DebugLevel,
    checksum: u64,
}

impl ProgramGroup {
    /// Creates a program group, validating every named entry point.
    pub fn new(context: &DeviceContext, desc: &ProgramGroupDesc<'_>) -> Result<(Self, String)> {
        let label = desc.label();
        let fail = |reason: String| Error::ProgramGroup {
            entry: label.clone(),
            reason,
            log: String::new(),
        };

        let slots: Vec<(EntryRef<'_>, ProgramSemantic)> = match *desc {
            ProgramGroupDesc::RayGen(entry) => vec![(entry, ProgramSemantic::RayGen)],
            ProgramGroupDesc::Miss(entry) => vec![(entry, ProgramSemantic::Miss)],
            ProgramGroupDesc::HitGroup {
                closest_hit,
                any_hit,
            } => closest_hit
                .map(|entry| (entry, ProgramSemantic::ClosestHit))
                .into_iter()
                .chain(any_hit.map(|entry| (entry, ProgramSemantic::AnyHit)))
                .collect(),
        };
        if slots.is_empty() {
            return Err(fail(
                "hit group names neither a closest-hit nor an any-hit program".to_string(),
            ));
        }

        let mut programs = Vec::with_capacity(slots.len());
        for (slot, semantic) in &slots {
            if slot.module.context_id() != context.id() {
                return Err(fail(format!(
                    "module {} belongs to a different device context",
                    slot.module.id()
                )));
            }
            let compiled = slot.module.entry(slot.entry).ok_or_else(|| {
                fail(format!(
                    "entry point '{}' not found in module {}",
                    slot.entry,
                    slot.module.id()
                ))
            })?;
            if compiled.decl.semantic != *semantic {
                return Err(fail(format!(
                    "entry point '{}' is a {} program but the slot requires a {} program (prefix {})",
                    slot.entry,
                    compiled.decl.semantic,
                    semantic,
                    semantic.prefix()
                )));
            }
            programs.push(BoundProgram {
                semantic: *semantic,
                entry: compiled.clone(),
            });
        }

        let pipeline_options = slots[0].0.module.pipeline_options().clone();
        let debug_level = slots[0].0.module.options().debug_level;
        if slots
            .iter()
            .any(|(slot, _)| slot.module.pipeline_options() != &pipeline_options)
        {
            return Err(fail(
                "closest-hit and any-hit modules were compiled with incompatible pipeline options"
                    .to_string(),
            ));
        }

        let mut log = String::new();
        if desc.kind() == ProgramGroupKind::HitGroup
            && !programs
                .iter()
                .any(|program| program.semantic == ProgramSemantic::ClosestHit)
        {
            let _ = writeln!(log, "note: hit group '{label}' has no closest-hit program");
        }
        surface_log("program group", &log);

        let id = context.next_handle();
        let checksum = header_checksum(desc.kind(), context.id(), id, &programs);
        debug!(group = id, kind = %desc.kind(), entries = %label, "created program group");

        Ok((
            Self {
                inner: Arc::new(GroupInner {
                    id,
                    context: context.clone(),
                    kind: desc.kind(),
                    programs,
                    pipeline_options,
                    debug_level,
                    checksum,
                }),
            },
            log,
        ))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> ProgramGroupKind {
        self.inner.kind
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.inner
            .programs
            .iter()
            .map(|program| program.entry.decl.name.as_str())
    }

    /// Packs this group's identity into an SBT record header.
    ///
    /// This is the only way to obtain a resolvable header; the output is
    /// deterministic for a given group.
    pub fn pack_header(&self) -> DispatchHeader {
        DispatchHeader::encode(
            self.inner.kind,
            self.inner.context.id(),
            self.inner.id,
            self.inner.checksum,
        )
    }

    fn context_id(&self) -> u64 {
        self.inner.context.id()
    }
}

impl std::fmt::Debug for ProgramGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramGroup")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("entries", &self.entry_names().collect::<Vec<_>>())
            .finish()
    }
}

/// FNV-1a over the group identity; detects headers packed for other groups.
fn header_checksum(
    kind: ProgramGroupKind,
    context_id: u64,
    group_id: u64,
    programs: &[BoundProgram],
) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    let mut feed = |bytes: &[u8]| {
        for byte in bytes {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(PRIME);
        }
    };
    feed(&kind.tag().to_le_bytes());
    feed(&context_id.to_le_bytes());
    feed(&group_id.to_le_bytes());
    for program in programs {
        feed(program.entry.decl.name.as_bytes());
        feed(&[0]);
    }
    hash
}

/// Program group as seen by the executor after linking.
pub(crate) struct LinkedGroup {
    pub kind: ProgramGroupKind,
    pub checksum: u64,
    pub programs: Vec<(ProgramSemantic, String, ProgramFn)>,
}

/// Launch-time view of a pipeline; shared with the stream.
///
/// Holds no reference to the context so dropping it on the stream worker
/// can never tear the context down.
pub(crate) struct LinkedProgram {
    pub context_id: u64,
    pub pipeline_id: u64,
    pub groups: HashMap<u64, LinkedGroup>,
    pub max_trace_depth: u32,
    pub num_payload_values: u32,
}

/// Linked, launch-ready pipeline.
pub struct Pipeline {
    id: u64,
    context: DeviceContext,
    groups: Vec<ProgramGroup>,
    linked: Arc<LinkedProgram>,
    link_options: PipelineLinkOptions,
    stack_sizes: Option<StackSizes>,
    launched: AtomicBool,
}

impl Pipeline {
    /// Validates and links `groups` into a pipeline.
    ///
    /// Every compatibility check runs before anything is linked: the group
    /// list must contain a raygen group, all groups must come from this
    /// context and be compiled with `pipeline_options`, and no entry may use
    /// more payload or attribute values, or a deeper trace, than declared.
    pub fn link(
        context: &DeviceContext,
        pipeline_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
        groups: &[ProgramGroup],
    ) -> Result<(Self, String)> {
        let fail = |reason: String| Error::Link {
            reason,
            log: String::new(),
        };

        if groups.is_empty() {
            return Err(fail(
                "no program groups supplied; a ray generation group is required".to_string(),
            ));
        }
        match groups
            .iter()
            .filter(|group| group.kind() == ProgramGroupKind::RayGen)
            .count()
        {
            0 => return Err(fail("pipeline has no ray generation program group".to_string())),
            1 => {}
            n => {
                return Err(fail(format!(
                    "pipeline has {n} ray generation program groups; exactly one is allowed"
                )))
            }
        }
        if link_options.max_trace_depth > MAX_TRACE_DEPTH_LIMIT {
            return Err(fail(format!(
                "max trace depth {} exceeds the runtime limit of {MAX_TRACE_DEPTH_LIMIT}",
                link_options.max_trace_depth
            )));
        }
        pipeline_options.validate().map_err(|err| fail(err.to_string()))?;

        let mut linked_groups = HashMap::with_capacity(groups.len());
        for group in groups {
            if group.context_id() != context.id() {
                return Err(fail(format!(
                    "program group {} belongs to a different device context",
                    group.id()
                )));
            }
            if &group.inner.pipeline_options != pipeline_options {
                return Err(fail(format!(
                    "program group {} was compiled with different pipeline compile options",
                    group.id()
                )));
            }
            for program in &group.inner.programs {
                let decl = &program.entry.decl;
                if decl.payload_values > pipeline_options.num_payload_values {
                    return Err(fail(format!(
                        "'{}' uses {} payload values but the pipeline declares {}",
                        decl.name, decl.payload_values, pipeline_options.num_payload_values
                    )));
                }
                if decl.attribute_values > pipeline_options.num_attribute_values {
                    return Err(fail(format!(
                        "'{}' uses {} attribute values but the pipeline declares {}",
                        decl.name, decl.attribute_values, pipeline_options.num_attribute_values
                    )));
                }
                if decl.trace_depth > link_options.max_trace_depth {
                    return Err(fail(format!(
                        "'{}' traces {} levels deep but max trace depth is {}",
                        decl.name, decl.trace_depth, link_options.max_trace_depth
                    )));
                }
            }
            linked_groups.insert(
                group.id(),
                LinkedGroup {
                    kind: group.kind(),
                    checksum: group.inner.checksum,
                    programs: group
                        .inner
                        .programs
                        .iter()
                        .map(|program| {
                            (
                                program.semantic,
                                program.entry.decl.name.clone(),
                                program.entry.body,
                            )
                        })
                        .collect(),
                },
            );
        }

        let mut log = String::new();
        if let Some(group) = groups
            .iter()
            .find(|group| group.inner.debug_level != link_options.debug_level)
        {
            let _ = writeln!(
                log,
                "warning: link debug level {:?} differs from module debug level {:?} (group {})",
                link_options.debug_level,
                group.inner.debug_level,
                group.id()
            );
        }
        surface_log("pipeline link", &log);

        let id = context.next_handle();
        let linked = Arc::new(LinkedProgram {
            context_id: context.id(),
            pipeline_id: id,
            groups: linked_groups,
            max_trace_depth: link_options.max_trace_depth,
            num_payload_values: pipeline_options.num_payload_values,
        });
        info!(
            pipeline = id,
            groups = groups.len(),
            max_trace_depth = link_options.max_trace_depth,
            "linked pipeline"
        );

        Ok((
            Self {
                id,
                context: context.clone(),
                groups: groups.to_vec(),
                linked,
                link_options: *link_options,
                stack_sizes: None,
                launched: AtomicBool::new(false),
            },
            log,
        ))
    }

    /// Sets the stack budget. Must be called exactly once, before the first launch.
    pub fn set_stack_size(&mut self, sizes: StackSizes) -> Result<()> {
        if self.launched.load(Ordering::SeqCst) {
            return Err(Error::PipelineState(
                "stack sizes cannot change after the pipeline has been launched".to_string(),
            ));
        }
        if self.stack_sizes.is_some() {
            return Err(Error::PipelineState(
                "stack sizes were already set for this pipeline".to_string(),
            ));
        }
        if sizes.max_traversable_graph_depth == 0
            || sizes.max_traversable_graph_depth > MAX_TRAVERSABLE_GRAPH_DEPTH
        {
            return Err(Error::PipelineState(format!(
                "max traversable graph depth must be within 1..={MAX_TRAVERSABLE_GRAPH_DEPTH}, got {}",
                sizes.max_traversable_graph_depth
            )));
        }
        debug!(pipeline = self.id, ?sizes, "configured pipeline stack sizes");
        self.stack_sizes = Some(sizes);
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context_id(&self) -> u64 {
        self.context.id()
    }

    pub fn stack_sizes(&self) -> Option<StackSizes> {
        self.stack_sizes
    }

    pub fn link_options(&self) -> &PipelineLinkOptions {
        &self.link_options
    }

    pub fn program_groups(&self) -> &[ProgramGroup] {
        &self.groups
    }

    pub fn has_launched(&self) -> bool {
        self.launched.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_launched(&self) {
        self.launched.store(true, Ordering::SeqCst);
    }

    pub(crate) fn linked(&self) -> Arc<LinkedProgram> {
        Arc::clone(&self.linked)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("groups", &self.groups.len())
            .field("stack_sizes", &self.stack_sizes)
            .finish()
    }
}

/// Context-side constructors matching the runtime create calls.
impl DeviceContext {
    pub fn compile_module(
        &self,
        options: &ModuleCompileOptions,
        pipeline_options: &PipelineCompileOptions,
        source: &str,
    ) -> Result<(Module, String)> {
        Module::new(self, options, pipeline_options, source)
    }

    pub fn create_program_group(&self, desc: &ProgramGroupDesc<'_>) -> Result<(ProgramGroup, String)> {
        ProgramGroup::new(self, desc)
    }

    pub fn link_pipeline(
        &self,
        pipeline_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
        groups: &[ProgramGroup],
    ) -> Result<(Pipeline, String)> {
        Pipeline::link(self, pipeline_options, link_options, groups)
    }
}

fn surface_log(stage: &str, log: &str) {
    for line in log.lines().filter(|line| !line.trim().is_empty()) {
        warn!(stage, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programs::DEVICE_PROGRAMS;
    use crate::types::DeviceOptions;

    fn context() -> DeviceContext {
        DeviceContext::create(&DeviceOptions::default()).unwrap()
    }

    fn module(ctx: &DeviceContext, options: &PipelineCompileOptions) -> Module {
        Module::new(ctx, &ModuleCompileOptions::default(), options, DEVICE_PROGRAMS)
            .unwrap()
            .0
    }

    fn raygen(ctx: &DeviceContext, module: &Module) -> ProgramGroup {
        ProgramGroup::new(
            ctx,
            &ProgramGroupDesc::RayGen(EntryRef::new(module, "__raygen__renderFrame")),
        )
        .unwrap()
        .0
    }

    fn link(ctx: &DeviceContext, groups: &[ProgramGroup]) -> Result<(Pipeline, String)> {
        Pipeline::link(
            ctx,
            &PipelineCompileOptions::default(),
            &PipelineLinkOptions::default(),
            groups,
        )
    }

    #[test]
    fn program_group_validates_entries() {
        let ctx = context();
        let module = module(&ctx, &PipelineCompileOptions::default());

        let missing = ProgramGroup::new(
            &ctx,
            &ProgramGroupDesc::RayGen(EntryRef::new(&module, "__raygen__absent")),
        )
        .unwrap_err();
        assert!(matches!(missing, Error::ProgramGroup { ref reason, .. } if reason.contains("not found")));

        let wrong_role = ProgramGroup::new(
            &ctx,
            &ProgramGroupDesc::Miss(EntryRef::new(&module, "__raygen__renderFrame")),
        )
        .unwrap_err();
        assert!(matches!(wrong_role, Error::ProgramGroup { ref reason, .. } if reason.contains("__miss__")));

        let empty = ProgramGroup::new(
            &ctx,
            &ProgramGroupDesc::HitGroup {
                closest_hit: None,
                any_hit: None,
            },
        )
        .unwrap_err();
        assert!(matches!(empty, Error::ProgramGroup { .. }));

        let other = context();
        let foreign = ProgramGroup::new(
            &other,
            &ProgramGroupDesc::RayGen(EntryRef::new(&module, "__raygen__renderFrame")),
        )
        .unwrap_err();
        assert!(matches!(foreign, Error::ProgramGroup { ref reason, .. } if reason.contains("different device context")));
    }

    #[test]
    fn hit_group_modules_must_agree() {
        let ctx = context();
        let a = module(&ctx, &PipelineCompileOptions::default());
        let b = module(
            &ctx,
            &PipelineCompileOptions {
                num_payload_values: 4,
                ..PipelineCompileOptions::default()
            },
        );
        let err = ProgramGroup::new(
            &ctx,
            &ProgramGroupDesc::HitGroup {
                closest_hit: Some(EntryRef::new(&a, "__closesthit__radiance")),
                any_hit: Some(EntryRef::new(&b, "__anyhit__radiance")),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::ProgramGroup { ref reason, .. } if reason.contains("incompatible")));
    }

    #[test]
    fn link_requires_exactly_one_raygen() {
        let ctx = context();
        let module = module(&ctx, &PipelineCompileOptions::default());
        let miss = ProgramGroup::new(
            &ctx,
            &ProgramGroupDesc::Miss(EntryRef::new(&module, "__miss__radiance")),
        )
        .unwrap()
        .0;

        assert!(matches!(link(&ctx, &[]), Err(Error::Link { .. })));
        assert!(matches!(
            link(&ctx, &[miss.clone()]),
            Err(Error::Link { ref reason, .. }) if reason.contains("no ray generation")
        ));
        let two = [raygen(&ctx, &module), raygen(&ctx, &module), miss.clone()];
        assert!(matches!(link(&ctx, &two), Err(Error::Link { .. })));
        assert!(link(&ctx, &[raygen(&ctx, &module), miss]).is_ok());
    }

    #[test]
    fn link_rejects_mismatched_options_and_depths() {
        let ctx = context();
        let module = module(&ctx, &PipelineCompileOptions::default());
        let groups = [raygen(&ctx, &module)];

        let mismatched = Pipeline::link(
            &ctx,
            &PipelineCompileOptions {
                num_attribute_values: 3,
                ..PipelineCompileOptions::default()
            },
            &PipelineLinkOptions::default(),
            &groups,
        );
        assert!(matches!(mismatched, Err(Error::Link { ref reason, .. }) if reason.contains("different pipeline compile options")));

        let too_deep = Pipeline::link(
            &ctx,
            &PipelineCompileOptions::default(),
            &PipelineLinkOptions {
                max_trace_depth: 32,
                ..PipelineLinkOptions::default()
            },
            &groups,
        );
        assert!(matches!(too_deep, Err(Error::Link { .. })));

        let other = context();
        assert!(matches!(link(&other, &groups), Err(Error::Link { .. })));
    }

    #[test]
    fn payload_usage_is_checked_at_link() {
        let ctx = context();
        let narrow = PipelineCompileOptions {
            num_payload_values: 1,
            ..PipelineCompileOptions::default()
        };
        let module = module(&ctx, &narrow);
        let miss = ProgramGroup::new(
            &ctx,
            &ProgramGroupDesc::Miss(EntryRef::new(&module, "__miss__radiance")),
        )
        .unwrap()
        .0;
        let err = Pipeline::link(
            &ctx,
            &narrow,
            &PipelineLinkOptions::default(),
            &[raygen(&ctx, &module), miss],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Link { ref reason, .. } if reason.contains("payload values")));
    }

    #[test]
    fn stack_size_is_set_exactly_once() {
        let ctx = context();
        let module = module(&ctx, &PipelineCompileOptions::default());
        let (mut pipeline, _) = link(&ctx, &[raygen(&ctx, &module)]).unwrap();

        let zero_depth = StackSizes {
            max_traversable_graph_depth: 0,
            ..StackSizes::default()
        };
        assert!(matches!(
            pipeline.set_stack_size(zero_depth),
            Err(Error::PipelineState(_))
        ));
        pipeline.set_stack_size(StackSizes::default()).unwrap();
        assert_eq!(pipeline.stack_sizes(), Some(StackSizes::default()));
        assert!(matches!(
            pipeline.set_stack_size(StackSizes::default()),
            Err(Error::PipelineState(_))
        ));
    }

    #[test]
    fn context_entry_points_delegate() {
        let ctx = context();
        let (module, log) = ctx
            .compile_module(
                &ModuleCompileOptions::default(),
                &PipelineCompileOptions::default(),
                DEVICE_PROGRAMS,
            )
            .unwrap();
        assert!(log.is_empty());
        assert!(module.has_entry("__anyhit__radiance"));
        let (group, _) = ctx
            .create_program_group(&ProgramGroupDesc::HitGroup {
                closest_hit: None,
                any_hit: Some(EntryRef::new(&module, "__anyhit__radiance")),
            })
            .unwrap();
        assert_eq!(group.kind(), ProgramGroupKind::HitGroup);
        assert!(group.pack_header().is_packed());
    }
}
