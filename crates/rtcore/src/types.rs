use crate::error::{Error, Result};

/// Upper bound on payload values a pipeline may declare.
pub const MAX_PAYLOAD_VALUES: u32 = 32;
/// Upper bound on attribute values a pipeline may declare.
pub const MAX_ATTRIBUTE_VALUES: u32 = 8;
/// Largest `max_trace_depth` the runtime accepts at link time.
pub const MAX_TRACE_DEPTH_LIMIT: u32 = 31;
/// Largest traversable graph depth accepted by `set_stack_size`.
pub const MAX_TRAVERSABLE_GRAPH_DEPTH: u32 = 31;

/// Optimisation level applied when compiling a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OptLevel {
    Level0,
    Level1,
    Level2,
    Level3,
    #[default]
    Default,
}

/// Amount of debug information kept in compiled modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DebugLevel {
    #[default]
    None,
    Minimal,
    Moderate,
    Full,
}

/// Shapes of traversable graph that trace calls may receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TraversableGraph {
    AllowAny,
    #[default]
    AllowSingleGas,
    AllowSingleLevelInstancing,
}

/// Per-module compile options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleCompileOptions {
    /// Register budget per entry point; `0` leaves it unbounded.
    pub max_register_count: u32,
    pub opt_level: OptLevel,
    pub debug_level: DebugLevel,
}

impl Default for ModuleCompileOptions {
    fn default() -> Self {
        Self {
            max_register_count: 50,
            opt_level: OptLevel::Default,
            debug_level: DebugLevel::None,
        }
    }
}

/// Options shared by every module and program group of one pipeline.
///
/// Modules compiled with different pipeline options cannot be linked
/// together; the payload and attribute counts are a pipeline-wide contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineCompileOptions {
    pub uses_motion_blur: bool,
    pub traversable_graph: TraversableGraph,
    pub num_payload_values: u32,
    pub num_attribute_values: u32,
    /// Name of the launch-parameter variable device programs read from.
    pub launch_params_variable: String,
}

impl Default for PipelineCompileOptions {
    fn default() -> Self {
        Self {
            uses_motion_blur: false,
            traversable_graph: TraversableGraph::AllowSingleGas,
            num_payload_values: 2,
            num_attribute_values: 2,
            launch_params_variable: "optixLaunchParams".to_string(),
        }
    }
}

impl PipelineCompileOptions {
    /// Rejects slot counts the runtime cannot allocate.
    pub fn validate(&self) -> Result<()> {
        if self.num_payload_values > MAX_PAYLOAD_VALUES {
            return Err(Error::Compile {
                log: format!(
                    "pipeline declares {} payload values; at most {MAX_PAYLOAD_VALUES} are supported",
                    self.num_payload_values
                ),
            });
        }
        if self.num_attribute_values > MAX_ATTRIBUTE_VALUES {
            return Err(Error::Compile {
                log: format!(
                    "pipeline declares {} attribute values; at most {MAX_ATTRIBUTE_VALUES} are supported",
                    self.num_attribute_values
                ),
            });
        }
        if self.launch_params_variable.trim().is_empty() {
            return Err(Error::Compile {
                log: "launch params variable name must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Options applied when program groups are linked into a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineLinkOptions {
    /// Maximum recursion depth of trace calls.
    pub max_trace_depth: u32,
    pub debug_level: DebugLevel,
}

impl Default for PipelineLinkOptions {
    fn default() -> Self {
        Self {
            max_trace_depth: 2,
            debug_level: DebugLevel::None,
        }
    }
}

/// Explicit stack budget of a linked pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackSizes {
    /// Direct stack for callables invoked from intersection or any-hit.
    pub direct_callable_from_traversal: u32,
    /// Direct stack for callables invoked from raygen, miss, or closest-hit.
    pub direct_callable_from_state: u32,
    pub continuation: u32,
    pub max_traversable_graph_depth: u32,
}

impl Default for StackSizes {
    fn default() -> Self {
        Self {
            direct_callable_from_traversal: 2 * 1024,
            direct_callable_from_state: 2 * 1024,
            continuation: 2 * 1024,
            max_traversable_graph_depth: 1,
        }
    }
}

/// Device selection and runtime logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Ordinal of the device to bind the context to.
    pub ordinal: u32,
    /// Highest runtime log level forwarded to tracing (0 silences, 4 prints everything).
    pub log_level: u32,
    /// Overrides the device memory capacity in bytes.
    pub memory_capacity: Option<u64>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            ordinal: 0,
            log_level: 4,
            memory_capacity: None,
        }
    }
}

/// What to do when a frame faults on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPolicy {
    /// Stop rendering and return the fault.
    #[default]
    Abort,
    /// Report the faulted frame and continue with the next one.
    Skip,
}

impl std::fmt::Display for FaultPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultPolicy::Abort => f.write_str("abort"),
            FaultPolicy::Skip => f.write_str("skip"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_defaults() {
        let module = ModuleCompileOptions::default();
        assert_eq!(module.max_register_count, 50);
        let pipeline = PipelineCompileOptions::default();
        assert_eq!(pipeline.num_payload_values, 2);
        assert_eq!(pipeline.num_attribute_values, 2);
        assert_eq!(PipelineLinkOptions::default().max_trace_depth, 2);
        assert_eq!(StackSizes::default().continuation, 2048);
    }

    #[test]
    fn rejects_oversized_payload() {
        let options = PipelineCompileOptions {
            num_payload_values: MAX_PAYLOAD_VALUES + 1,
            ..PipelineCompileOptions::default()
        };
        assert!(matches!(options.validate(), Err(Error::Compile { .. })));
    }
}
