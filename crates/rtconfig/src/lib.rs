//! Versioned TOML run configuration for raylaunch.
//!
//! Every section is optional and falls back to the reference run: a
//! 1200x1024 frame rendered by the built-in test-pattern programs and
//! written to `osc_example2.png`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// Only config version this crate understands.
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RunConfig {
    pub version: u32,
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub module: ModuleSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub stack: StackSection,
    #[serde(default)]
    pub programs: ProgramsSection,
    #[serde(default)]
    pub frame: FrameSection,
    #[serde(default)]
    pub output: OutputSection,
    #[serde(default)]
    pub sync: SyncSection,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            device: DeviceSection::default(),
            module: ModuleSection::default(),
            pipeline: PipelineSection::default(),
            stack: StackSection::default(),
            programs: ProgramsSection::default(),
            frame: FrameSection::default(),
            output: OutputSection::default(),
            sync: SyncSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceSection {
    pub ordinal: u32,
    /// Runtime log verbosity: 0 silent, 1 fatal, 2 error, 3 warning, 4 print.
    pub log_level: u32,
    /// Overrides the device memory capacity, in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<u64>,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            ordinal: 0,
            log_level: 4,
            memory_mib: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ModuleSection {
    /// `0` leaves the register budget unbounded.
    pub max_register_count: u32,
    #[serde(deserialize_with = "deserialize_opt_level")]
    pub opt_level: OptLevelSetting,
    pub debug_level: DebugLevelSetting,
    /// Module listing to compile instead of the built-in programs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl Default for ModuleSection {
    fn default() -> Self {
        Self {
            max_register_count: 50,
            opt_level: OptLevelSetting::Default,
            debug_level: DebugLevelSetting::None,
            source: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptLevelSetting {
    #[serde(rename = "0")]
    Level0,
    #[serde(rename = "1")]
    Level1,
    #[serde(rename = "2")]
    Level2,
    #[serde(rename = "3")]
    Level3,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugLevelSetting {
    None,
    Minimal,
    Moderate,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraversableGraphSetting {
    Any,
    SingleGas,
    SingleLevelInstancing,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineSection {
    pub payload_values: u32,
    pub attribute_values: u32,
    pub launch_params: String,
    pub max_trace_depth: u32,
    pub traversable_graph: TraversableGraphSetting,
    pub motion_blur: bool,
    pub link_debug_level: DebugLevelSetting,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            payload_values: 2,
            attribute_values: 2,
            launch_params: "optixLaunchParams".to_string(),
            max_trace_depth: 2,
            traversable_graph: TraversableGraphSetting::SingleGas,
            motion_blur: false,
            link_debug_level: DebugLevelSetting::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StackSection {
    pub direct_callable_from_traversal: u32,
    pub direct_callable_from_state: u32,
    pub continuation: u32,
    pub max_traversable_graph_depth: u32,
}

impl Default for StackSection {
    fn default() -> Self {
        Self {
            direct_callable_from_traversal: 2048,
            direct_callable_from_state: 2048,
            continuation: 2048,
            max_traversable_graph_depth: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProgramsSection {
    pub raygen: String,
    pub miss: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closest_hit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub any_hit: Option<String>,
}

impl Default for ProgramsSection {
    fn default() -> Self {
        Self {
            raygen: "__raygen__renderFrame".to_string(),
            miss: "__miss__radiance".to_string(),
            closest_hit: Some("__closesthit__radiance".to_string()),
            any_hit: Some("__anyhit__radiance".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FrameSection {
    pub width: u32,
    pub height: u32,
    /// Number of frames to render.
    pub count: u32,
}

impl Default for FrameSection {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 1024,
            count: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputSection {
    pub path: PathBuf,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("osc_example2.png"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicySetting {
    #[default]
    Abort,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncSection {
    /// Per-frame watchdog; unset waits indefinitely.
    #[serde(
        deserialize_with = "deserialize_duration_opt",
        serialize_with = "serialize_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    pub on_fault: FaultPolicySetting,
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("seconds as a number or a duration string such as \"2s\"")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            humantime::parse_duration(v.trim())
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(Duration::from_secs(v)))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u64::try_from(v)
                .map(|secs| Some(Duration::from_secs(secs)))
                .map_err(|_| E::custom("duration must be non-negative"))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            if !v.is_finite() || v.is_sign_negative() {
                return Err(E::custom("duration must be a non-negative number of seconds"));
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }
    }

    deserializer.deserialize_any(Visitor)
}

fn serialize_duration_opt<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(duration) => {
            serializer.serialize_str(&humantime::format_duration(*duration).to_string())
        }
        None => serializer.serialize_none(),
    }
}

fn deserialize_opt_level<'de, D>(deserializer: D) -> Result<OptLevelSetting, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Helper {
        Str(String),
        Num(i64),
    }

    let raw = match Helper::deserialize(deserializer)? {
        Helper::Str(raw) => raw,
        Helper::Num(value) => value.to_string(),
    };
    parse_opt_level(&raw).map_err(de::Error::custom)
}

/// Accepts `0`-`3`, `O0`-`O3`, and `default`.
pub fn parse_opt_level(raw: &str) -> Result<OptLevelSetting, String> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized == "default" {
        return Ok(OptLevelSetting::Default);
    }
    match normalized.strip_prefix('o').unwrap_or(&normalized) {
        "0" => Ok(OptLevelSetting::Level0),
        "1" => Ok(OptLevelSetting::Level1),
        "2" => Ok(OptLevelSetting::Level2),
        "3" => Ok(OptLevelSetting::Level3),
        _ => Err(format!(
            "invalid optimisation level '{raw}'; expected 0-3 or 'default'"
        )),
    }
}

impl RunConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: RunConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|err| ConfigError::Invalid(format!("failed to serialise configuration: {err}")))
    }

    /// Memory override in bytes.
    pub fn memory_capacity(&self) -> Option<u64> {
        self.device
            .memory_mib
            .map(|mib| mib.saturating_mul(1024 * 1024))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected {CONFIG_VERSION}",
                self.version
            )));
        }

        if self.device.log_level > 4 {
            return Err(ConfigError::Invalid(format!(
                "device.log_level must be within 0..=4, got {}",
                self.device.log_level
            )));
        }
        if self.device.memory_mib == Some(0) {
            return Err(ConfigError::Invalid(
                "device.memory_mib must be greater than zero".into(),
            ));
        }

        if self.pipeline.launch_params.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "pipeline.launch_params may not be empty".into(),
            ));
        }

        let depth = self.stack.max_traversable_graph_depth;
        if !(1..=31).contains(&depth) {
            return Err(ConfigError::Invalid(format!(
                "stack.max_traversable_graph_depth must be within 1..=31, got {depth}"
            )));
        }

        check_entry("programs.raygen", &self.programs.raygen, "__raygen__")?;
        check_entry("programs.miss", &self.programs.miss, "__miss__")?;
        if let Some(entry) = &self.programs.closest_hit {
            check_entry("programs.closest_hit", entry, "__closesthit__")?;
        }
        if let Some(entry) = &self.programs.any_hit {
            check_entry("programs.any_hit", entry, "__anyhit__")?;
        }
        if self.programs.closest_hit.is_none() && self.programs.any_hit.is_none() {
            return Err(ConfigError::Invalid(
                "programs must name a closest_hit or an any_hit entry".into(),
            ));
        }

        if self.frame.width == 0 || self.frame.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "frame size must be non-zero, got {}x{}",
                self.frame.width, self.frame.height
            )));
        }
        if self.frame.count == 0 {
            return Err(ConfigError::Invalid(
                "frame.count must be at least 1".into(),
            ));
        }

        if self.output.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("output.path may not be empty".into()));
        }

        if self.sync.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::Invalid(
                "sync.timeout must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

fn check_entry(key: &str, entry: &str, prefix: &str) -> Result<(), ConfigError> {
    match entry.strip_prefix(prefix) {
        Some(rest) if !rest.is_empty() => Ok(()),
        _ => Err(ConfigError::Invalid(format!(
            "{key} '{entry}' must start with '{prefix}' followed by a name"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = 1

[device]
log_level = 3
memory_mib = 512

[module]
max_register_count = 64
opt_level = 3
debug_level = "minimal"
source = "programs/pattern.rtm"

[pipeline]
max_trace_depth = 4
traversable_graph = "single-level-instancing"

[stack]
continuation = 4096

[programs]
raygen = "__raygen__gradient"
any_hit = "__anyhit__shadow"

[frame]
width = 640
height = 480
count = 3

[output]
path = "frames/out.png"

[sync]
timeout = "1500ms"
on_fault = "skip"
"#;

    #[test]
    fn parses_sample_config() {
        let config = RunConfig::from_toml_str(SAMPLE).expect("parse config");
        assert_eq!(config.device.log_level, 3);
        assert_eq!(config.memory_capacity(), Some(512 * 1024 * 1024));
        assert_eq!(config.module.opt_level, OptLevelSetting::Level3);
        assert_eq!(config.module.debug_level, DebugLevelSetting::Minimal);
        assert_eq!(config.pipeline.max_trace_depth, 4);
        assert_eq!(config.pipeline.payload_values, 2);
        assert_eq!(
            config.pipeline.traversable_graph,
            TraversableGraphSetting::SingleLevelInstancing
        );
        assert_eq!(config.stack.continuation, 4096);
        assert_eq!(config.stack.direct_callable_from_state, 2048);
        assert_eq!(config.programs.raygen, "__raygen__gradient");
        assert_eq!(config.programs.miss, "__miss__radiance");
        assert_eq!(config.programs.any_hit.as_deref(), Some("__anyhit__shadow"));
        assert_eq!((config.frame.width, config.frame.height, config.frame.count), (640, 480, 3));
        assert_eq!(config.sync.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.sync.on_fault, FaultPolicySetting::Skip);
    }

    #[test]
    fn minimal_config_uses_reference_defaults() {
        let config = RunConfig::from_toml_str("version = 1").unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.output.path, PathBuf::from("osc_example2.png"));
        assert_eq!((config.frame.width, config.frame.height), (1200, 1024));
        assert_eq!(config.module.max_register_count, 50);
        assert_eq!(config.sync.timeout, None);
    }

    #[test]
    fn numeric_timeout_is_seconds() {
        let config = RunConfig::from_toml_str("version = 1\n[sync]\ntimeout = 5\n").unwrap();
        assert_eq!(config.sync.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn rejects_unknown_version() {
        let err = RunConfig::from_toml_str("version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_bad_entry_prefix() {
        let err = RunConfig::from_toml_str(
            r#"
version = 1
[programs]
miss = "__raygen__oops"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("programs.miss")));
    }

    #[test]
    fn rejects_zero_sized_frames_and_graph_depth() {
        for body in [
            "[frame]\nwidth = 0",
            "[frame]\ncount = 0",
            "[stack]\nmax_traversable_graph_depth = 0",
            "[sync]\ntimeout = \"0s\"",
        ] {
            let input = format!("version = 1\n{body}\n");
            let err = RunConfig::from_toml_str(&input).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{body}");
        }
    }

    #[test]
    fn rejects_malformed_values() {
        let err = RunConfig::from_toml_str("version = 1\n[module]\nopt_level = 7\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        let err =
            RunConfig::from_toml_str("version = 1\n[sync]\ntimeout = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn opt_level_spellings() {
        assert_eq!(parse_opt_level("O2"), Ok(OptLevelSetting::Level2));
        assert_eq!(parse_opt_level("default"), Ok(OptLevelSetting::Default));
        assert!(parse_opt_level("fast").is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = RunConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(RunConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
