//! Pipelines shared by unit tests.

use crate::device::{DeviceContext, ProgramContext};
use crate::error::DeviceFault;
use crate::launch::LaunchParams;
use crate::pipeline::{EntryRef, Module, Pipeline, ProgramGroup, ProgramGroupDesc};
use crate::programs::{ProgramFn, ProgramRegistry, DEVICE_PROGRAMS};
use crate::sbt::ShaderBindingTables;
use crate::types::{
    DeviceOptions, ModuleCompileOptions, PipelineCompileOptions, PipelineLinkOptions, StackSizes,
};

pub(crate) struct Rig {
    pub tables: ShaderBindingTables,
    pub pipeline: Pipeline,
    pub ctx: DeviceContext,
}

/// Built-in programs on a fresh context, stack sizes set.
pub(crate) fn builtin() -> Rig {
    let ctx = DeviceContext::create(&DeviceOptions::default()).unwrap();
    builtin_on(&ctx, Some(StackSizes::default()))
}

pub(crate) fn builtin_on(ctx: &DeviceContext, stack: Option<StackSizes>) -> Rig {
    assemble(
        ctx,
        DEVICE_PROGRAMS,
        ["__raygen__renderFrame", "__miss__radiance", "__closesthit__radiance"],
        PipelineLinkOptions::default(),
        stack,
    )
}

const TRACING_PROGRAMS: &str = "\
.version 1
.launch_params optixLaunchParams
.entry __raygen__tracer registers=16 payload=2 trace_depth=1
.entry __miss__count registers=8 payload=2 trace_depth=1
.entry __closesthit__radiance registers=8 payload=2 attributes=2
";

/// Raygen traces one ray per pixel; the miss program recurses once and
/// counts its invocations in payload slot 0.
pub(crate) fn tracing(link: PipelineLinkOptions) -> Rig {
    let mut registry = ProgramRegistry::with_builtin();
    registry
        .register("__raygen__tracer", tracer)
        .register("__miss__count", counting_miss);
    let ctx = DeviceContext::create_with_registry(&DeviceOptions::default(), registry).unwrap();
    assemble(
        &ctx,
        TRACING_PROGRAMS,
        ["__raygen__tracer", "__miss__count", "__closesthit__radiance"],
        link,
        Some(StackSizes::default()),
    )
}

const CUSTOM_RAYGEN_PROGRAMS: &str = "\
.version 1
.launch_params optixLaunchParams
.entry __raygen__custom registers=16
.entry __miss__radiance registers=8 payload=2
.entry __closesthit__radiance registers=8 payload=2 attributes=2
";

/// Built-in miss and hit programs around a caller-supplied raygen body.
pub(crate) fn with_raygen(raygen: ProgramFn) -> Rig {
    let mut registry = ProgramRegistry::with_builtin();
    registry.register("__raygen__custom", raygen);
    let ctx = DeviceContext::create_with_registry(&DeviceOptions::default(), registry).unwrap();
    assemble(
        &ctx,
        CUSTOM_RAYGEN_PROGRAMS,
        ["__raygen__custom", "__miss__radiance", "__closesthit__radiance"],
        PipelineLinkOptions::default(),
        Some(StackSizes::default()),
    )
}

fn assemble(
    ctx: &DeviceContext,
    source: &str,
    [raygen, miss, hit]: [&str; 3],
    link: PipelineLinkOptions,
    stack: Option<StackSizes>,
) -> Rig {
    let pipeline_options = PipelineCompileOptions::default();
    let (module, _) = Module::new(
        ctx,
        &ModuleCompileOptions::default(),
        &pipeline_options,
        source,
    )
    .unwrap();
    let group = |desc: ProgramGroupDesc<'_>| ProgramGroup::new(ctx, &desc).unwrap().0;
    let groups = vec![
        group(ProgramGroupDesc::RayGen(EntryRef::new(&module, raygen))),
        group(ProgramGroupDesc::Miss(EntryRef::new(&module, miss))),
        group(ProgramGroupDesc::HitGroup {
            closest_hit: Some(EntryRef::new(&module, hit)),
            any_hit: None,
        }),
    ];
    let (mut pipeline, _) = Pipeline::link(ctx, &pipeline_options, &link, &groups).unwrap();
    if let Some(stack) = stack {
        pipeline.set_stack_size(stack).unwrap();
    }
    let tables = ShaderBindingTables::build(
        ctx,
        &groups[0],
        std::slice::from_ref(&groups[1]),
        std::slice::from_ref(&groups[2]),
        &[],
    )
    .unwrap();
    Rig {
        tables,
        pipeline,
        ctx: ctx.clone(),
    }
}

fn tracer(ctx: &mut ProgramContext<'_>) -> Result<(), DeviceFault> {
    let mut payload = [0u32; 2];
    ctx.trace(0, &mut payload)?;
    let params: LaunchParams = ctx.params()?;
    let [x, y, _] = ctx.launch_index();
    let index = u64::from(x) + u64::from(y) * params.fb_size[0] as u64;
    ctx.store(params.color_buffer + index * 4, &payload[0])
}

fn counting_miss(ctx: &mut ProgramContext<'_>) -> Result<(), DeviceFault> {
    let mut payload = [ctx.payload().first().copied().unwrap_or(0) + 1, 0];
    if ctx.depth() < 2 {
        ctx.trace(0, &mut payload)?;
    }
    if let Some(slot) = ctx.payload_mut().first_mut() {
        *slot = payload[0];
    }
    Ok(())
}
