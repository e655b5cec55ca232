use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::programs::ProgramRegistry;
use crate::types::DeviceOptions;

use super::exec::{execute, LaunchPlan};
use super::memory::DeviceMemory;
use super::stream::{Stream, Ticket};

/// Environment variable restricting which device ordinals are visible.
///
/// An empty value hides every device, a comma separated list keeps only the
/// listed ordinals.
pub const ENV_VISIBLE_DEVICES: &str = "RTCORE_VISIBLE_DEVICES";

/// Oldest compute capability the runtime can drive.
pub const MIN_COMPUTE_CAPABILITY: (u32, u32) = (5, 0);

const DEFAULT_MEMORY_CAPACITY: u64 = 2 * 1024 * 1024 * 1024;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Properties of a device the runtime can bind a context to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub ordinal: u32,
    pub name: String,
    pub compute_capability: (u32, u32),
    pub memory_capacity: u64,
}

/// Lists the devices visible to this process.
pub fn enumerate_devices() -> Vec<DeviceInfo> {
    let host = DeviceInfo {
        ordinal: 0,
        name: "rtcore host ray-tracing device".to_string(),
        compute_capability: (7, 5),
        memory_capacity: DEFAULT_MEMORY_CAPACITY,
    };
    match std::env::var(ENV_VISIBLE_DEVICES) {
        Ok(filter) => {
            let visible: Vec<u32> = filter
                .split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect();
            if visible.contains(&host.ordinal) {
                vec![host]
            } else {
                Vec::new()
            }
        }
        Err(_) => vec![host],
    }
}

/// Runtime log callback, forwarded into `tracing`.
///
/// Levels follow the runtime convention: 1 fatal, 2 error, 3 warning, 4 print.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeviceLog {
    level: u32,
}

impl DeviceLog {
    pub fn new(level: u32) -> Self {
        Self { level }
    }

    pub fn emit(&self, level: u32, tag: &str, message: &str) {
        if level == 0 || level > self.level {
            return;
        }
        match level {
            1 | 2 => error!(target: "rtcore::device", level, tag, "{message}"),
            3 => warn!(target: "rtcore::device", level, tag, "{message}"),
            _ => info!(target: "rtcore::device", level, tag, "{message}"),
        }
    }
}

pub(crate) struct ContextInner {
    id: u64,
    device: DeviceInfo,
    // Declared before `memory` so the stream drains before memory goes away.
    stream: Stream,
    memory: DeviceMemory,
    log: DeviceLog,
    registry: ProgramRegistry,
    next_handle: AtomicU64,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Err(err) = self.stream.synchronize() {
            warn!(error = %err, "pending device work faulted during context teardown");
        }
        debug!(context = self.id, "destroyed device context");
    }
}

/// Execution context bound to one device and one stream.
///
/// Modules, program groups, and pipelines keep the context alive, so their
/// lifetime can never exceed it. Cloning is cheap and shares the context.
#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<ContextInner>,
}

impl DeviceContext {
    /// Creates a context with the built-in device programs registered.
    pub fn create(options: &DeviceOptions) -> Result<Self> {
        Self::create_with_registry(options, ProgramRegistry::with_builtin())
    }

    /// Creates a context whose modules resolve entry points against `registry`.
    pub fn create_with_registry(options: &DeviceOptions, registry: ProgramRegistry) -> Result<Self> {
        let devices = enumerate_devices();
        if devices.is_empty() {
            return Err(Error::DeviceInit(
                "no compatible ray-tracing device is visible".to_string(),
            ));
        }
        let mut device = devices
            .into_iter()
            .find(|device| device.ordinal == options.ordinal)
            .ok_or_else(|| {
                Error::DeviceInit(format!("no device with ordinal {}", options.ordinal))
            })?;
        if device.compute_capability < MIN_COMPUTE_CAPABILITY {
            return Err(Error::DeviceInit(format!(
                "device '{}' has compute capability {}.{}; {}.{} or newer is required",
                device.name,
                device.compute_capability.0,
                device.compute_capability.1,
                MIN_COMPUTE_CAPABILITY.0,
                MIN_COMPUTE_CAPABILITY.1
            )));
        }
        if let Some(capacity) = options.memory_capacity {
            device.memory_capacity = capacity;
        }

        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst);
        let stream = Stream::spawn(format!("rtcore-stream-{id}"))?;
        let memory = DeviceMemory::new(device.memory_capacity);
        let log = DeviceLog::new(options.log_level);

        info!(
            context = id,
            device = %device.name,
            ordinal = device.ordinal,
            memory = device.memory_capacity,
            "created device context"
        );
        log.emit(4, "CONTEXT", &format!("running on {}", device.name));

        Ok(Self {
            inner: Arc::new(ContextInner {
                id,
                device,
                stream,
                memory,
                log,
                registry,
                next_handle: AtomicU64::new(1),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.inner.device
    }

    /// Host barrier: blocks until all work enqueued on the context stream finished.
    pub fn synchronize(&self) -> Result<()> {
        self.inner.stream.synchronize()
    }

    pub(crate) fn memory(&self) -> &DeviceMemory {
        &self.inner.memory
    }

    pub(crate) fn stream(&self) -> &Stream {
        &self.inner.stream
    }

    pub(crate) fn log(&self) -> DeviceLog {
        self.inner.log
    }

    pub(crate) fn registry(&self) -> &ProgramRegistry {
        &self.inner.registry
    }

    /// True when `[address, address + len)` lies inside one live allocation.
    pub(crate) fn is_resident(&self, address: u64, len: usize) -> bool {
        self.inner.memory.lock().contains(address, len)
    }

    /// Enqueues a launch on the context stream.
    pub(crate) fn submit(&self, plan: LaunchPlan) -> Result<Ticket> {
        let memory = self.inner.memory.clone();
        self.inner.stream.enqueue(Box::new(move || {
            let mut heap = memory.lock();
            execute(&plan, &mut heap)
        }))
    }

    /// Allocates a handle id unique within this context.
    pub(crate) fn next_handle(&self) -> u64 {
        self.inner.next_handle.fetch_add(1, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device.name)
            .finish()
    }
}
