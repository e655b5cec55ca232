use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rtconfig::{
    DebugLevelSetting, FaultPolicySetting, OptLevelSetting, RunConfig, TraversableGraphSetting,
};
use rtcore::{
    DebugLevel, DeviceOptions, EntryPoints, FaultPolicy, ModuleCompileOptions, OptLevel,
    PipelineCompileOptions, PipelineLinkOptions, SessionSettings, StackSizes, DEVICE_PROGRAMS,
};

use crate::cli::RunArgs;

/// Resolved run: session settings plus what to do with the frames.
#[derive(Debug)]
pub struct RunPlan {
    pub session: SessionSettings,
    pub frames: u32,
    pub output: PathBuf,
    pub policy: FaultPolicy,
}

/// Loads `path` if it exists; a missing file yields the reference defaults.
///
/// An explicitly requested file must exist.
pub fn load_config(path: &Path, explicit: bool) -> Result<RunConfig> {
    if !explicit && !path.exists() {
        tracing::debug!(path = %path.display(), "no run configuration found; using defaults");
        return Ok(RunConfig::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read run configuration {}", path.display()))?;
    let config = RunConfig::from_toml_str(&raw)
        .with_context(|| format!("failed to load run configuration {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded run configuration");
    Ok(config)
}

/// Applies command-line overrides on top of the file values.
pub fn apply_overrides(config: &mut RunConfig, args: &RunArgs) -> Result<()> {
    if let Some((width, height)) = args.size {
        config.frame.width = width;
        config.frame.height = height;
    }
    if let Some(frames) = args.frames {
        config.frame.count = frames;
    }
    if let Some(output) = &args.output {
        config.output.path = output.clone();
    }
    if let Some(program) = &args.program {
        // Listings named on the command line are relative to the working directory.
        let program = if program.is_absolute() {
            program.clone()
        } else {
            std::env::current_dir()
                .context("failed to resolve the working directory")?
                .join(program)
        };
        config.module.source = Some(program);
    }
    if let Some(policy) = args.on_fault {
        config.sync.on_fault = policy;
    }
    config
        .validate()
        .context("command-line overrides produced an invalid configuration")?;
    Ok(())
}

pub fn build_plan(config: &RunConfig, base_dir: &Path) -> Result<RunPlan> {
    let program_source = match &config.module.source {
        Some(path) => {
            let path = resolve_relative(base_dir, path);
            fs::read_to_string(&path)
                .with_context(|| format!("failed to read module listing {}", path.display()))?
        }
        None => DEVICE_PROGRAMS.to_string(),
    };

    let session = SessionSettings {
        device: DeviceOptions {
            ordinal: config.device.ordinal,
            log_level: config.device.log_level,
            memory_capacity: config.memory_capacity(),
        },
        module: ModuleCompileOptions {
            max_register_count: config.module.max_register_count,
            opt_level: map_opt_level(config.module.opt_level),
            debug_level: map_debug_level(config.module.debug_level),
        },
        pipeline: PipelineCompileOptions {
            uses_motion_blur: config.pipeline.motion_blur,
            traversable_graph: map_traversable_graph(config.pipeline.traversable_graph),
            num_payload_values: config.pipeline.payload_values,
            num_attribute_values: config.pipeline.attribute_values,
            launch_params_variable: config.pipeline.launch_params.clone(),
        },
        link: PipelineLinkOptions {
            max_trace_depth: config.pipeline.max_trace_depth,
            debug_level: map_debug_level(config.pipeline.link_debug_level),
        },
        stack: StackSizes {
            direct_callable_from_traversal: config.stack.direct_callable_from_traversal,
            direct_callable_from_state: config.stack.direct_callable_from_state,
            continuation: config.stack.continuation,
            max_traversable_graph_depth: config.stack.max_traversable_graph_depth,
        },
        program_source,
        entries: EntryPoints {
            raygen: config.programs.raygen.clone(),
            miss: config.programs.miss.clone(),
            closest_hit: config.programs.closest_hit.clone(),
            any_hit: config.programs.any_hit.clone(),
        },
        width: config.frame.width,
        height: config.frame.height,
        sync_timeout: config.sync.timeout,
        ..SessionSettings::default()
    };

    Ok(RunPlan {
        session,
        frames: config.frame.count,
        output: config.output.path.clone(),
        policy: match config.sync.on_fault {
            FaultPolicySetting::Abort => FaultPolicy::Abort,
            FaultPolicySetting::Skip => FaultPolicy::Skip,
        },
    })
}

/// `frame.png` for a single frame, `frame-0003.png` for frame 3 of several.
pub fn frame_path(output: &Path, frame_id: i32, total: u32) -> PathBuf {
    if total <= 1 {
        return output.to_path_buf();
    }
    let stem = output
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "frame".to_string());
    let name = match output.extension() {
        Some(ext) => format!("{stem}-{frame_id:04}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{frame_id:04}"),
    };
    output.with_file_name(name)
}

fn resolve_relative(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn map_opt_level(setting: OptLevelSetting) -> OptLevel {
    match setting {
        OptLevelSetting::Level0 => OptLevel::Level0,
        OptLevelSetting::Level1 => OptLevel::Level1,
        OptLevelSetting::Level2 => OptLevel::Level2,
        OptLevelSetting::Level3 => OptLevel::Level3,
        OptLevelSetting::Default => OptLevel::Default,
    }
}

fn map_debug_level(setting: DebugLevelSetting) -> DebugLevel {
    match setting {
        DebugLevelSetting::None => DebugLevel::None,
        DebugLevelSetting::Minimal => DebugLevel::Minimal,
        DebugLevelSetting::Moderate => DebugLevel::Moderate,
        DebugLevelSetting::Full => DebugLevel::Full,
    }
}

fn map_traversable_graph(setting: TraversableGraphSetting) -> rtcore::TraversableGraph {
    match setting {
        TraversableGraphSetting::Any => rtcore::TraversableGraph::AllowAny,
        TraversableGraphSetting::SingleGas => rtcore::TraversableGraph::AllowSingleGas,
        TraversableGraphSetting::SingleLevelInstancing => {
            rtcore::TraversableGraph::AllowSingleLevelInstancing
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_the_reference_run() {
        let plan = build_plan(&RunConfig::default(), Path::new(".")).unwrap();
        let reference = SessionSettings::default();
        assert_eq!(plan.session.width, reference.width);
        assert_eq!(plan.session.height, reference.height);
        assert_eq!(plan.session.module, reference.module);
        assert_eq!(plan.session.pipeline, reference.pipeline);
        assert_eq!(plan.session.link, reference.link);
        assert_eq!(plan.session.stack, reference.stack);
        assert_eq!(plan.session.device, reference.device);
        assert_eq!(plan.session.entries, reference.entries);
        assert_eq!(plan.session.program_source, DEVICE_PROGRAMS);
        assert_eq!(plan.frames, 1);
        assert_eq!(plan.output, PathBuf::from("osc_example2.png"));
        assert_eq!(plan.policy, FaultPolicy::Abort);
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = RunConfig::from_toml_str(
            "version = 1\n[frame]\nwidth = 640\nheight = 480\n[sync]\ntimeout = \"2s\"\n",
        )
        .unwrap();
        let args = RunArgs {
            size: Some((32, 16)),
            frames: Some(4),
            output: Some(PathBuf::from("out/frame.png")),
            on_fault: Some(FaultPolicySetting::Skip),
            ..RunArgs::default()
        };
        apply_overrides(&mut config, &args).unwrap();

        let plan = build_plan(&config, Path::new(".")).unwrap();
        assert_eq!((plan.session.width, plan.session.height), (32, 16));
        assert_eq!(plan.frames, 4);
        assert_eq!(plan.output, PathBuf::from("out/frame.png"));
        assert_eq!(plan.policy, FaultPolicy::Skip);
        assert_eq!(plan.session.sync_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn module_source_is_read_relative_to_the_config() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("custom.rtm"), DEVICE_PROGRAMS).unwrap();
        let mut config = RunConfig::default();
        config.module.source = Some(PathBuf::from("custom.rtm"));

        let plan = build_plan(&config, dir.path()).unwrap();
        assert_eq!(plan.session.program_source, DEVICE_PROGRAMS);

        config.module.source = Some(PathBuf::from("missing.rtm"));
        let err = build_plan(&config, dir.path()).unwrap_err();
        assert!(err.to_string().contains("missing.rtm"));
    }

    #[test]
    fn missing_implicit_config_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raylaunch.toml");
        assert_eq!(load_config(&path, false).unwrap(), RunConfig::default());
        assert!(load_config(&path, true).is_err());
    }

    #[test]
    fn frame_paths_are_numbered_for_sequences() {
        let output = Path::new("renders/out.png");
        assert_eq!(frame_path(output, 1, 1), PathBuf::from("renders/out.png"));
        assert_eq!(frame_path(output, 3, 5), PathBuf::from("renders/out-0003.png"));
        assert_eq!(frame_path(Path::new("raw"), 2, 2), PathBuf::from("raw-0002"));
    }
}
