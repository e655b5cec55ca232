use std::mem::size_of;
use std::sync::Arc;

use bytemuck::Pod;
use tracing::trace;

use crate::error::DeviceFault;
use crate::pipeline::{LinkedGroup, LinkedProgram, ProgramGroupKind};
use crate::programs::{ProgramFn, ProgramSemantic};
use crate::sbt::{DispatchHeader, ShaderBindingTable, SBT_RECORD_HEADER_SIZE};

use super::context::DeviceLog;
use super::memory::Heap;

/// Everything a launch needs once it is on the stream.
///
/// Holds no `DeviceContext` handle; the plan is dropped on the stream worker.
pub(crate) struct LaunchPlan {
    pub linked: Arc<LinkedProgram>,
    pub sbt: ShaderBindingTable,
    pub params_address: u64,
    pub params_size: usize,
    pub dims: [u32; 3],
    pub log: DeviceLog,
}

impl LaunchPlan {
    /// Reads the header at `address` and maps it back to a linked group.
    fn resolve(
        &self,
        heap: &mut Heap,
        address: u64,
        kind: ProgramGroupKind,
    ) -> Result<&LinkedGroup, DeviceFault> {
        let mut bytes = [0u8; SBT_RECORD_HEADER_SIZE];
        heap.read(address, &mut bytes)?;
        let invalid = DeviceFault::InvalidHeader { address };
        let fields = DispatchHeader::from_bytes(bytes).decode().ok_or(invalid.clone())?;
        if fields.context_id != self.linked.context_id || fields.kind_tag != kind.tag() {
            return Err(invalid);
        }
        let group = self.linked.groups.get(&fields.group_id).ok_or(invalid.clone())?;
        if group.kind != kind || group.checksum != fields.checksum {
            return Err(invalid);
        }
        Ok(group)
    }

    fn program(
        &self,
        heap: &mut Heap,
        address: u64,
        kind: ProgramGroupKind,
        semantic: ProgramSemantic,
    ) -> Result<Option<(&str, ProgramFn)>, DeviceFault> {
        let group = self.resolve(heap, address, kind)?;
        Ok(group
            .programs
            .iter()
            .find(|(candidate, _, _)| *candidate == semantic)
            .map(|(_, name, body)| (name.as_str(), *body)))
    }

    /// Every record in the miss and hit tables must resolve before any program runs.
    fn verify_tables(&self, heap: &mut Heap) -> Result<(), DeviceFault> {
        for (region, kind) in [
            (self.sbt.miss, ProgramGroupKind::Miss),
            (self.sbt.hitgroup, ProgramGroupKind::HitGroup),
        ] {
            for index in 0..u64::from(region.count) {
                let address = region.address + index * u64::from(region.stride);
                self.resolve(heap, address, kind)?;
            }
        }
        Ok(())
    }
}

/// Runs one launch to completion against `heap`.
pub(crate) fn execute(plan: &LaunchPlan, heap: &mut Heap) -> Result<(), DeviceFault> {
    let mut params = vec![0u8; plan.params_size];
    heap.read(plan.params_address, &mut params)?;
    plan.verify_tables(heap)?;

    let raygen_address = plan.sbt.raygen_record;
    let (entry, body) = plan
        .program(
            heap,
            raygen_address,
            ProgramGroupKind::RayGen,
            ProgramSemantic::RayGen,
        )?
        .ok_or(DeviceFault::InvalidHeader {
            address: raygen_address,
        })?;

    trace!(
        pipeline = plan.linked.pipeline_id,
        entry,
        dims = ?plan.dims,
        "executing launch"
    );

    let [width, height, depth] = plan.dims;
    let mut no_payload: [u32; 0] = [];
    for z in 0..depth {
        for y in 0..height {
            for x in 0..width {
                let mut ctx = ProgramContext {
                    heap: &mut *heap,
                    launch: plan,
                    params: &params,
                    entry,
                    record_address: raygen_address,
                    index: [x, y, z],
                    depth: 0,
                    payload: &mut no_payload,
                };
                body(&mut ctx)?;
            }
        }
    }
    Ok(())
}

/// A device program's view of the launch it runs in.
pub struct ProgramContext<'a> {
    heap: &'a mut Heap,
    launch: &'a LaunchPlan,
    params: &'a [u8],
    entry: &'a str,
    record_address: u64,
    index: [u32; 3],
    depth: u32,
    payload: &'a mut [u32],
}

impl<'a> ProgramContext<'a> {
    /// Grid coordinate of the invocation.
    pub fn launch_index(&self) -> [u32; 3] {
        self.index
    }

    pub fn launch_dimensions(&self) -> [u32; 3] {
        self.launch.dims
    }

    pub fn entry(&self) -> &str {
        self.entry
    }

    /// Trace recursion level; zero inside the raygen program.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Reads the launch parameter block as `T`.
    pub fn params<T: Pod>(&self) -> Result<T, DeviceFault> {
        let len = size_of::<T>();
        let bytes = self.params.get(..len).ok_or(DeviceFault::OutOfBounds {
            access: "load",
            address: self.launch.params_address,
            len,
        })?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Reads the user data that follows the header of the current record.
    pub fn record_data<T: Pod>(&mut self) -> Result<T, DeviceFault> {
        self.load(self.record_address + SBT_RECORD_HEADER_SIZE as u64)
    }

    pub fn load<T: Pod>(&mut self, address: u64) -> Result<T, DeviceFault> {
        let mut value = T::zeroed();
        self.heap.read(address, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    pub fn store<T: Pod>(&mut self, address: u64, value: &T) -> Result<(), DeviceFault> {
        self.heap.write(address, bytemuck::bytes_of(value))
    }

    /// Device-side print; forwarded to the runtime log at print level.
    pub fn print(&self, message: &str) {
        self.launch.log.emit(4, "device", message);
    }

    pub fn payload(&self) -> &[u32] {
        &*self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u32] {
        &mut *self.payload
    }

    /// Builds a fault attributed to the running program.
    pub fn abort(&self, message: impl Into<String>) -> DeviceFault {
        DeviceFault::ProgramAbort {
            entry: self.entry.to_string(),
            message: message.into(),
        }
    }

    /// Traces a ray with `payload` registers.
    ///
    /// No geometry is bound, so every ray misses and runs the miss program
    /// stored at `miss_index`.
    pub fn trace(&mut self, miss_index: u32, payload: &mut [u32]) -> Result<(), DeviceFault> {
        let launch: &'a LaunchPlan = self.launch;
        let depth = self.depth + 1;
        if depth > launch.linked.max_trace_depth {
            return Err(DeviceFault::TraceDepthExceeded {
                depth,
                max: launch.linked.max_trace_depth,
            });
        }
        if payload.len() > launch.linked.num_payload_values as usize {
            return Err(DeviceFault::PayloadOverflow {
                used: payload.len(),
                declared: launch.linked.num_payload_values,
            });
        }
        let region = launch.sbt.miss;
        if miss_index >= region.count {
            return Err(DeviceFault::MissingRecord {
                table: "miss",
                index: miss_index,
                count: region.count,
            });
        }

        let address = region.address + u64::from(miss_index) * u64::from(region.stride);
        let Some((entry, body)) = launch.program(
            self.heap,
            address,
            ProgramGroupKind::Miss,
            ProgramSemantic::Miss,
        )?
        else {
            return Err(DeviceFault::InvalidHeader { address });
        };

        let mut child = ProgramContext {
            heap: &mut *self.heap,
            launch,
            params: self.params,
            entry,
            record_address: address,
            index: self.index,
            depth,
            payload,
        };
        body(&mut child)
    }
}
