use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rtconfig::FaultPolicySetting;

#[derive(Parser, Debug)]
#[command(
    name = "raylaunch",
    author,
    version,
    about = "Assemble a ray-tracing pipeline and render frames to PNG",
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser, Debug, Default)]
pub struct RunArgs {
    /// Run configuration file; defaults to `raylaunch.toml` in the config directory.
    #[arg(long, value_name = "FILE", env = "RAYLAUNCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the frame size (e.g. `1200x1024`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Option<(u32, u32)>,

    /// Number of frames to render.
    #[arg(long, value_name = "N", value_parser = parse_frames)]
    pub frames: Option<u32>,

    /// PNG path for the rendered frame; numbered per frame when rendering several.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Module listing to compile instead of the built-in programs.
    #[arg(long, value_name = "FILE")]
    pub program: Option<PathBuf>,

    /// What to do when a frame faults on the device: `abort` or `skip`.
    #[arg(long, value_name = "POLICY", value_parser = parse_fault_policy)]
    pub on_fault: Option<FaultPolicySetting>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the devices the runtime can bind to.
    Devices,
    /// Build the pipeline and print the shader binding table layout without launching.
    Sbt,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("size must not be empty".to_string());
    }
    let (w, h) = trimmed
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("invalid size '{trimmed}'; expected WIDTHxHEIGHT"))?;
    let width = w
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid width '{}'", w.trim()))?;
    let height = h
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid height '{}'", h.trim()))?;
    if width == 0 || height == 0 {
        return Err("frame dimensions must be greater than zero".into());
    }
    Ok((width, height))
}

pub fn parse_frames(value: &str) -> Result<u32, String> {
    match value.trim().parse::<u32>() {
        Ok(0) => Err("frame count must be at least 1".into()),
        Ok(count) => Ok(count),
        Err(_) => Err(format!("invalid frame count '{}'", value.trim())),
    }
}

pub fn parse_fault_policy(value: &str) -> Result<FaultPolicySetting, String> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "abort" | "stop" => Ok(FaultPolicySetting::Abort),
        "skip" | "continue" => Ok(FaultPolicySetting::Skip),
        other => Err(format!(
            "unknown fault policy '{other}'; expected abort or skip"
        )),
    }
}
