//! Ray-tracing pipeline runtime for raylaunch.
//!
//! The crate assembles a ray-tracing pipeline on a device context, builds the
//! shader binding table that maps records to compiled programs, and drives
//! asynchronous launches that render into a device color buffer. The overall
//! flow is:
//!
//! ```text
//!   DeviceContext ──▶ Module ──▶ ProgramGroup ×3 ──▶ Pipeline (+ stack sizes)
//!                                     │                    │
//!                                     ▼                    │
//!                          ShaderBindingTables             │
//!                                     │ descriptor         │
//!                                     ▼                    ▼
//!   LaunchOrchestrator: prepare_frame ─▶ launch ─▶ InFlight::wait ─▶ download
//!                                                                    │
//!                                                                    ▼
//!                                                              ImageSink (PNG)
//! ```
//!
//! `RenderSession` owns every stage in construction order and tears them down
//! in reverse. The device itself is emulated on the host: memory is a flat
//! address space with bounds checking, launches run on a per-context stream
//! thread, and device programs are Rust functions bound by entry-point name
//! through a `ProgramRegistry`.

pub mod compile;
pub mod device;
pub mod error;
pub mod launch;
pub mod output;
pub mod pipeline;
pub mod programs;
pub mod sbt;
pub mod session;
pub mod types;

#[cfg(test)]
mod fixtures;

pub use device::{enumerate_devices, DeviceBuffer, DeviceContext, DeviceInfo, ProgramContext};
pub use error::{DeviceFault, Error, Result};
pub use launch::{FrameState, InFlight, LaunchOrchestrator, LaunchParams, SyncedFrame};
pub use output::{ImageSink, PngSink};
pub use pipeline::{EntryRef, Module, Pipeline, ProgramGroup, ProgramGroupDesc, ProgramGroupKind};
pub use programs::{ProgramFn, ProgramRegistry, ProgramSemantic, DEVICE_PROGRAMS};
pub use sbt::{
    DispatchHeader, HitgroupRecord, MissRecord, RaygenRecord, SbtLayout, SbtRecord, SbtRegion,
    SbtTable, SceneObject, ShaderBindingTable, ShaderBindingTables,
};
pub use session::{EntryPoints, FrameOutcome, FrameReport, RenderSession, SessionSettings};
pub use types::{
    DebugLevel, DeviceOptions, FaultPolicy, ModuleCompileOptions, OptLevel, PipelineCompileOptions,
    PipelineLinkOptions, StackSizes, TraversableGraph,
};
