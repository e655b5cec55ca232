//! Host-side model of the ray-tracing device runtime.
//!
//! - `context` enumerates devices and owns the per-context stream, memory,
//!   program registry, and runtime log callback.
//! - `memory` is the flat device address space plus the `DeviceBuffer`
//!   collaborator used for every upload and readback.
//! - `stream` runs enqueued work in order on a worker thread and is the only
//!   place completion (and device faults) become visible to the host.
//! - `exec` walks a launch grid, resolves SBT records back to program bodies,
//!   and gives device programs their view of memory and launch state.

mod context;
mod exec;
mod memory;
mod stream;

pub use context::{enumerate_devices, DeviceContext, DeviceInfo, ENV_VISIBLE_DEVICES};
pub use exec::ProgramContext;
pub use memory::DeviceBuffer;
pub use stream::Ticket;

pub(crate) use exec::LaunchPlan;
