use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rtcore::{enumerate_devices, FrameOutcome, ImageSink, PngSink, RenderSession};
use tracing_subscriber::EnvFilter;

use crate::cli::RunArgs;
use crate::paths::AppPaths;
use crate::settings::{apply_overrides, build_plan, frame_path, load_config, RunPlan};

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub fn run(args: RunArgs) -> Result<()> {
    let plan = resolve_plan(&args)?;
    tracing::info!(
        width = plan.session.width,
        height = plan.session.height,
        frames = plan.frames,
        policy = %plan.policy,
        output = %plan.output.display(),
        "starting render run"
    );

    let mut session =
        RenderSession::new(&plan.session).context("failed to set up the ray-tracing pipeline")?;
    let outcomes = session
        .render(plan.frames, plan.policy)
        .context("frame rendering aborted")?;

    let mut written = 0usize;
    for outcome in outcomes {
        match outcome {
            FrameOutcome::Completed(report) => {
                let path = frame_path(&plan.output, report.frame_id, plan.frames);
                PngSink::new(&path)
                    .write(&report.pixels, report.width, report.height)
                    .with_context(|| format!("failed to write frame {}", report.frame_id))?;
                tracing::debug!(
                    frame = report.frame_id,
                    elapsed = ?report.elapsed,
                    path = %path.display(),
                    "frame written"
                );
                println!("Image rendered, and saved to {} ... done.", path.display());
                written += 1;
            }
            FrameOutcome::Skipped { frame_id, error } => {
                tracing::warn!(frame = frame_id, error = %error, "frame skipped; no image written");
            }
        }
    }

    if written == 0 {
        bail!("every frame faulted; no image was written");
    }
    Ok(())
}

/// Builds the pipeline and tables without launching and prints their layout.
pub fn describe_sbt(args: RunArgs) -> Result<()> {
    let plan = resolve_plan(&args)?;
    let session =
        RenderSession::new(&plan.session).context("failed to set up the ray-tracing pipeline")?;

    let pipeline = session.pipeline();
    println!("Pipeline {} on context {}", pipeline.id(), pipeline.context_id());
    for group in session.program_groups() {
        println!(
            "  {:<8} group {:<4} entries={}",
            group.kind().to_string(),
            group.id(),
            group.entry_names().collect::<Vec<_>>().join(",")
        );
    }
    if let Some(stack) = pipeline.stack_sizes() {
        println!(
            "  stack: traversal={} state={} continuation={} graph_depth={}",
            stack.direct_callable_from_traversal,
            stack.direct_callable_from_state,
            stack.continuation,
            stack.max_traversable_graph_depth
        );
    }
    println!();
    print!("{}", session.tables().layout());
    Ok(())
}

pub fn list_devices() -> Result<()> {
    let devices = enumerate_devices();
    if devices.is_empty() {
        println!("No ray-tracing devices are visible.");
        return Ok(());
    }

    println!("Devices:");
    for device in devices {
        let (major, minor) = device.compute_capability;
        println!(
            "  {:<3} {:<36} sm_{major}{minor} memory={} MiB",
            device.ordinal,
            device.name,
            device.memory_capacity / (1024 * 1024)
        );
    }
    Ok(())
}

fn resolve_plan(args: &RunArgs) -> Result<RunPlan> {
    let (config_path, explicit) = match &args.config {
        Some(path) => (path.clone(), true),
        None => {
            let paths = AppPaths::discover()?;
            tracing::debug!(config = %paths.config_dir().display(), "resolved raylaunch paths");
            (paths.config_file(), false)
        }
    };
    let mut config = load_config(&config_path, explicit)?;
    apply_overrides(&mut config, args)?;
    build_plan(&config, &config_base_dir(&config_path))
}

fn config_base_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
