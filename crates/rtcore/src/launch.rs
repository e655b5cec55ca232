//! Launch parameters, the per-frame state machine, and asynchronous dispatch.

use std::mem::size_of;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, trace};

use crate::device::{DeviceBuffer, DeviceContext, LaunchPlan, Ticket};
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::sbt::{ShaderBindingTable, SBT_RECORD_HEADER_SIZE};

/// Per-frame constants read by device programs.
///
/// Matches the device layout `{ int frameID; uint32_t *colorBuffer; int2 fbSize; }`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchParams {
    pub frame_id: i32,
    _pad0: u32,
    /// Device address of the `width * height` RGBA8 color buffer.
    pub color_buffer: u64,
    pub fb_size: [i32; 2],
}

unsafe impl Zeroable for LaunchParams {}
unsafe impl Pod for LaunchParams {}

const _: () = {
    assert!(size_of::<LaunchParams>() == 24);
    assert!(std::mem::offset_of!(LaunchParams, color_buffer) == 8);
    assert!(std::mem::offset_of!(LaunchParams, fb_size) == 16);
};

impl LaunchParams {
    pub fn new(frame_id: i32, color_buffer: u64, fb_size: [i32; 2]) -> Self {
        Self {
            frame_id,
            _pad0: 0,
            color_buffer,
            fb_size,
        }
    }
}

/// Where the current frame is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    ParamsUploaded,
    Dispatched,
    Synced,
}

/// Drives `prepare -> launch -> wait -> download` for one stream.
#[derive(Debug)]
pub struct LaunchOrchestrator {
    context: DeviceContext,
    params_buffer: DeviceBuffer,
    params: LaunchParams,
    frame_counter: i32,
    state: FrameState,
    pending: Option<Ticket>,
}

impl LaunchOrchestrator {
    /// Allocates the launch parameter buffer once; it is reused by every frame.
    pub fn new(context: &DeviceContext) -> Result<Self> {
        let params_buffer = DeviceBuffer::alloc(context, size_of::<LaunchParams>())?;
        Ok(Self {
            context: context.clone(),
            params_buffer,
            params: LaunchParams::zeroed(),
            frame_counter: 0,
            state: FrameState::Idle,
            pending: None,
        })
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Number of frames whose parameters were uploaded so far.
    pub fn frame_counter(&self) -> i32 {
        self.frame_counter
    }

    /// Parameters of the most recent upload.
    pub fn params(&self) -> &LaunchParams {
        &self.params
    }

    /// Fills and uploads the launch parameters for the next frame.
    ///
    /// The returned params carry the frame id the device will observe. The
    /// host counter advances after the upload, so ids increase by one on
    /// every call and never reset.
    pub fn prepare_frame(
        &mut self,
        width: u32,
        height: u32,
        color_buffer: u64,
    ) -> Result<LaunchParams> {
        if self.state == FrameState::Dispatched {
            return Err(Error::Launch(
                "previous frame is still in flight; wait or synchronize first".to_string(),
            ));
        }
        let dim = |value: u32, name: &str| {
            i32::try_from(value)
                .map_err(|_| Error::Launch(format!("frame {name} {value} does not fit in i32")))
        };
        let params = LaunchParams::new(
            self.frame_counter,
            color_buffer,
            [dim(width, "width")?, dim(height, "height")?],
        );
        self.params_buffer.upload(std::slice::from_ref(&params))?;
        self.frame_counter = self
            .frame_counter
            .checked_add(1)
            .ok_or_else(|| Error::Launch("frame counter overflowed".to_string()))?;
        self.params = params;
        self.state = FrameState::ParamsUploaded;
        trace!(frame = params.frame_id, width, height, "uploaded launch params");
        Ok(params)
    }

    /// Enqueues the launch and returns without waiting for it.
    pub fn launch(
        &mut self,
        pipeline: &Pipeline,
        sbt: &ShaderBindingTable,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<InFlight<'_>> {
        if self.state != FrameState::ParamsUploaded {
            return Err(Error::Launch(format!(
                "launch requires uploaded params, frame is {:?}",
                self.state
            )));
        }
        if pipeline.stack_sizes().is_none() {
            return Err(Error::Launch(
                "pipeline stack sizes must be set before the first launch".to_string(),
            ));
        }
        if pipeline.context_id() != self.context.id() {
            return Err(Error::Launch(
                "pipeline belongs to a different device context than the stream".to_string(),
            ));
        }
        if width == 0 || height == 0 || depth == 0 {
            return Err(Error::Launch(format!(
                "launch dimensions must be non-zero, got {width}x{height}x{depth}"
            )));
        }
        if self.params_buffer.size_in_bytes() < size_of::<LaunchParams>() {
            return Err(Error::Launch(format!(
                "launch parameter buffer holds {} bytes, {} required",
                self.params_buffer.size_in_bytes(),
                size_of::<LaunchParams>()
            )));
        }
        sbt.validate().map_err(|err| Error::Launch(err.to_string()))?;

        let regions = [
            ("raygen record", sbt.raygen_record, SBT_RECORD_HEADER_SIZE),
            (
                "miss table",
                sbt.miss.address,
                sbt.miss.stride as usize * sbt.miss.count as usize,
            ),
            (
                "hit group table",
                sbt.hitgroup.address,
                sbt.hitgroup.stride as usize * sbt.hitgroup.count as usize,
            ),
        ];
        for (name, address, len) in regions {
            if !self.context.is_resident(address, len) {
                return Err(Error::Launch(format!(
                    "{name} at {address:#x} is no longer allocated"
                )));
            }
        }

        let plan = LaunchPlan {
            linked: pipeline.linked(),
            sbt: *sbt,
            params_address: self.params_buffer.device_address(),
            params_size: size_of::<LaunchParams>(),
            dims: [width, height, depth],
            log: self.context.log(),
        };
        let ticket = self.context.submit(plan)?;
        pipeline.mark_launched();
        self.state = FrameState::Dispatched;
        self.pending = Some(ticket);
        debug!(
            pipeline = pipeline.id(),
            frame = self.params.frame_id,
            width,
            height,
            depth,
            "launch enqueued"
        );

        Ok(InFlight {
            orchestrator: self,
            ticket,
            width,
            height,
        })
    }

    /// Barrier for a frame whose `InFlight` handle was dropped or timed out.
    pub fn synchronize(&mut self) -> Result<()> {
        let Some(ticket) = self.pending.take() else {
            return Ok(());
        };
        match self.context.stream().wait_for(ticket, None) {
            Ok(()) => {
                self.state = FrameState::Synced;
                Ok(())
            }
            Err(err) => {
                self.state = FrameState::Idle;
                Err(err)
            }
        }
    }
}

/// A dispatched frame; waiting on it is the only path to its results.
#[must_use = "a launched frame must be waited on before its output is read"]
#[derive(Debug)]
pub struct InFlight<'a> {
    orchestrator: &'a mut LaunchOrchestrator,
    ticket: Ticket,
    width: u32,
    height: u32,
}

impl<'a> InFlight<'a> {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Blocks until the launch completed. Device faults surface here.
    pub fn wait(self) -> Result<SyncedFrame<'a>> {
        self.finish(None)
    }

    /// Like [`InFlight::wait`] but gives up after `timeout`.
    ///
    /// On timeout the frame stays in flight; the work is not cancelled and
    /// [`LaunchOrchestrator::synchronize`] must be called before the next frame.
    pub fn wait_timeout(self, timeout: Duration) -> Result<SyncedFrame<'a>> {
        self.finish(Some(timeout))
    }

    fn finish(self, timeout: Option<Duration>) -> Result<SyncedFrame<'a>> {
        let orchestrator = self.orchestrator;
        match orchestrator.context.stream().wait_for(self.ticket, timeout) {
            Ok(()) => {
                orchestrator.pending = None;
                orchestrator.state = FrameState::Synced;
                Ok(SyncedFrame {
                    orchestrator,
                    width: self.width,
                    height: self.height,
                })
            }
            Err(err @ Error::SyncTimeout(_)) => Err(err),
            Err(err) => {
                orchestrator.pending = None;
                orchestrator.state = FrameState::Idle;
                Err(err)
            }
        }
    }
}

/// A completed frame whose output may be read back.
#[derive(Debug)]
pub struct SyncedFrame<'a> {
    orchestrator: &'a mut LaunchOrchestrator,
    width: u32,
    height: u32,
}

impl SyncedFrame<'_> {
    pub fn frame_id(&self) -> i32 {
        self.orchestrator.params.frame_id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Reads exactly `width * height` pixels from `color_buffer`.
    pub fn download(&self, color_buffer: &DeviceBuffer) -> Result<Vec<u32>> {
        let count = self.width as usize * self.height as usize;
        let mut pixels = vec![0u32; count];
        color_buffer.download(&mut pixels)?;
        Ok(pixels)
    }
}

impl Drop for SyncedFrame<'_> {
    fn drop(&mut self) {
        self.orchestrator.state = FrameState::Idle;
    }
}
