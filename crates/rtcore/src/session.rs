use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::device::{DeviceBuffer, DeviceContext};
use crate::error::{Error, Result};
use crate::launch::LaunchOrchestrator;
use crate::pipeline::{EntryRef, Module, Pipeline, ProgramGroup, ProgramGroupDesc};
use crate::programs::{ProgramRegistry, DEVICE_PROGRAMS};
use crate::sbt::{SceneObject, ShaderBindingTables};
use crate::types::{
    DeviceOptions, FaultPolicy, ModuleCompileOptions, PipelineCompileOptions, PipelineLinkOptions,
    StackSizes,
};

pub const DEFAULT_WIDTH: u32 = 1200;
pub const DEFAULT_HEIGHT: u32 = 1024;

/// Entry points the session binds into program groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoints {
    pub raygen: String,
    pub miss: String,
    pub closest_hit: Option<String>,
    pub any_hit: Option<String>,
}

impl Default for EntryPoints {
    fn default() -> Self {
        Self {
            raygen: "__raygen__renderFrame".to_string(),
            miss: "__miss__radiance".to_string(),
            closest_hit: Some("__closesthit__radiance".to_string()),
            any_hit: Some("__anyhit__radiance".to_string()),
        }
    }
}

/// Everything needed to stand up a render session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub device: DeviceOptions,
    pub module: ModuleCompileOptions,
    pub pipeline: PipelineCompileOptions,
    pub link: PipelineLinkOptions,
    pub stack: StackSizes,
    /// Module listing compiled at startup.
    pub program_source: String,
    pub registry: ProgramRegistry,
    pub entries: EntryPoints,
    pub objects: Vec<SceneObject>,
    pub width: u32,
    pub height: u32,
    /// Watchdog for each frame; `None` waits indefinitely.
    pub sync_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            device: DeviceOptions::default(),
            module: ModuleCompileOptions::default(),
            pipeline: PipelineCompileOptions::default(),
            link: PipelineLinkOptions::default(),
            stack: StackSizes::default(),
            program_source: DEVICE_PROGRAMS.to_string(),
            registry: ProgramRegistry::with_builtin(),
            entries: EntryPoints::default(),
            objects: Vec::new(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            sync_timeout: None,
        }
    }
}

/// One rendered frame read back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    /// Host frame counter after the frame was dispatched (1 for the first frame).
    pub frame_id: i32,
    /// Frame id the device observed in its launch params (0 for the first frame).
    pub launch_frame_id: i32,
    pub width: u32,
    pub height: u32,
    /// Row-major `0xAABBGGRR` pixels, `width * height` of them.
    pub pixels: Vec<u32>,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum FrameOutcome {
    Completed(FrameReport),
    /// The frame faulted and the session carried on under [`FaultPolicy::Skip`].
    Skipped { frame_id: i32, error: Error },
}

/// Owns the whole pipeline for the lifetime of a run.
///
/// Construction order is context, module, program groups, pipeline, SBT,
/// launch buffers, color buffer. Fields are declared in the reverse order so
/// they are released in reverse.
pub struct RenderSession {
    color_buffer: DeviceBuffer,
    orchestrator: LaunchOrchestrator,
    tables: ShaderBindingTables,
    pipeline: Pipeline,
    groups: Vec<ProgramGroup>,
    module: Module,
    context: DeviceContext,
    width: u32,
    height: u32,
    sync_timeout: Option<Duration>,
}

impl RenderSession {
    pub fn new(settings: &SessionSettings) -> Result<Self> {
        check_dimensions(settings.width, settings.height)?;

        let context = DeviceContext::create_with_registry(&settings.device, settings.registry.clone())?;
        let (module, _) = context.compile_module(
            &settings.module,
            &settings.pipeline,
            &settings.program_source,
        )?;

        let entries = &settings.entries;
        let (raygen, _) = context.create_program_group(&ProgramGroupDesc::RayGen(EntryRef::new(
            &module,
            &entries.raygen,
        )))?;
        let (miss, _) = context.create_program_group(&ProgramGroupDesc::Miss(EntryRef::new(
            &module,
            &entries.miss,
        )))?;
        let (hit, _) = context.create_program_group(&ProgramGroupDesc::HitGroup {
            closest_hit: entries
                .closest_hit
                .as_deref()
                .map(|entry| EntryRef::new(&module, entry)),
            any_hit: entries
                .any_hit
                .as_deref()
                .map(|entry| EntryRef::new(&module, entry)),
        })?;
        let groups = vec![raygen, miss, hit];

        let (mut pipeline, _) = context.link_pipeline(&settings.pipeline, &settings.link, &groups)?;
        pipeline.set_stack_size(settings.stack)?;

        let tables = ShaderBindingTables::build(
            &context,
            &groups[0],
            std::slice::from_ref(&groups[1]),
            std::slice::from_ref(&groups[2]),
            &settings.objects,
        )?;
        let orchestrator = LaunchOrchestrator::new(&context)?;
        let color_buffer = DeviceBuffer::alloc(&context, pixel_bytes(settings.width, settings.height))?;

        info!(
            width = settings.width,
            height = settings.height,
            pipeline = pipeline.id(),
            "render session ready"
        );

        Ok(Self {
            color_buffer,
            orchestrator,
            tables,
            pipeline,
            groups,
            module,
            context,
            width: settings.width,
            height: settings.height,
            sync_timeout: settings.sync_timeout,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn program_groups(&self) -> &[ProgramGroup] {
        &self.groups
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn tables(&self) -> &ShaderBindingTables {
        &self.tables
    }

    pub fn frame_counter(&self) -> i32 {
        self.orchestrator.frame_counter()
    }

    /// Runs one `prepare -> launch -> wait -> download` cycle.
    pub fn render_frame(&mut self) -> Result<FrameReport> {
        let started = Instant::now();
        let params = self.orchestrator.prepare_frame(
            self.width,
            self.height,
            self.color_buffer.device_address(),
        )?;
        let in_flight = self.orchestrator.launch(
            &self.pipeline,
            self.tables.descriptor(),
            self.width,
            self.height,
            1,
        )?;
        let synced = match self.sync_timeout {
            Some(timeout) => in_flight.wait_timeout(timeout)?,
            None => in_flight.wait()?,
        };
        let pixels = synced.download(&self.color_buffer)?;
        drop(synced);

        Ok(FrameReport {
            frame_id: self.orchestrator.frame_counter(),
            launch_frame_id: params.frame_id,
            width: self.width,
            height: self.height,
            pixels,
            elapsed: started.elapsed(),
        })
    }

    /// Renders `frames` frames, applying `policy` to frames that fault.
    ///
    /// Setup-class errors (launch rejections, buffer failures) always abort.
    pub fn render(&mut self, frames: u32, policy: FaultPolicy) -> Result<Vec<FrameOutcome>> {
        let mut outcomes = Vec::with_capacity(frames as usize);
        for _ in 0..frames {
            match self.render_frame() {
                Ok(report) => {
                    info!(
                        frame = report.frame_id,
                        elapsed = ?report.elapsed,
                        "frame complete"
                    );
                    outcomes.push(FrameOutcome::Completed(report));
                }
                Err(err) if err.is_frame_fault() && policy == FaultPolicy::Skip => {
                    let frame_id = self.orchestrator.frame_counter();
                    warn!(frame = frame_id, error = %err, "frame faulted; skipping");
                    if let Err(pending) = self.orchestrator.synchronize() {
                        warn!(frame = frame_id, error = %pending, "faulted frame drained with an error");
                    }
                    outcomes.push(FrameOutcome::Skipped {
                        frame_id,
                        error: err,
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(outcomes)
    }

    /// Reallocates the color buffer for a new frame size.
    ///
    /// Waits for outstanding work first; the old buffer address is stale afterwards.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        check_dimensions(width, height)?;
        self.orchestrator.synchronize()?;
        self.color_buffer.resize(pixel_bytes(width, height))?;
        self.width = width;
        self.height = height;
        info!(width, height, "resized color buffer");
        Ok(())
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        if let Err(err) = self.context.synchronize() {
            warn!(error = %err, "device work faulted while closing render session");
        }
    }
}

fn check_dimensions(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::Launch(format!(
            "frame dimensions must be non-zero, got {width}x{height}"
        )));
    }
    Ok(())
}

fn pixel_bytes(width: u32, height: u32) -> usize {
    width as usize * height as usize * std::mem::size_of::<u32>()
}
