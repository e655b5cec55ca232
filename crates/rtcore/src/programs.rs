//! Device program bodies and the registry modules are compiled against.
//!
//! Module source only declares entry points; the executable body of each
//! entry is a Rust function registered here under the same name.

use std::collections::HashMap;

use crate::device::ProgramContext;
use crate::error::DeviceFault;
use crate::launch::LaunchParams;

/// Signature shared by every device program.
pub type ProgramFn = fn(&mut ProgramContext<'_>) -> Result<(), DeviceFault>;

/// Role of an entry point, derived from its name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramSemantic {
    RayGen,
    Miss,
    ClosestHit,
    AnyHit,
}

impl ProgramSemantic {
    /// Classifies `__raygen__`, `__miss__`, `__closesthit__`, and `__anyhit__` entries.
    pub fn from_entry(name: &str) -> Option<Self> {
        let (semantic, rest) = [
            ("__raygen__", ProgramSemantic::RayGen),
            ("__miss__", ProgramSemantic::Miss),
            ("__closesthit__", ProgramSemantic::ClosestHit),
            ("__anyhit__", ProgramSemantic::AnyHit),
        ]
        .into_iter()
        .find_map(|(prefix, semantic)| name.strip_prefix(prefix).map(|rest| (semantic, rest)))?;
        (!rest.is_empty()).then_some(semantic)
    }

    pub fn prefix(self) -> &'static str {
        match self {
            ProgramSemantic::RayGen => "__raygen__",
            ProgramSemantic::Miss => "__miss__",
            ProgramSemantic::ClosestHit => "__closesthit__",
            ProgramSemantic::AnyHit => "__anyhit__",
        }
    }
}

impl std::fmt::Display for ProgramSemantic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgramSemantic::RayGen => f.write_str("ray generation"),
            ProgramSemantic::Miss => f.write_str("miss"),
            ProgramSemantic::ClosestHit => f.write_str("closest hit"),
            ProgramSemantic::AnyHit => f.write_str("any hit"),
        }
    }
}

/// Entry-point name to program body table.
#[derive(Clone, Default)]
pub struct ProgramRegistry {
    bodies: HashMap<String, ProgramFn>,
}

impl ProgramRegistry {
    /// Empty registry; modules compiled against it resolve nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the programs declared by [`DEVICE_PROGRAMS`].
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register("__raygen__renderFrame", render_frame)
            .register("__miss__radiance", radiance_miss)
            .register("__closesthit__radiance", radiance_closest_hit)
            .register("__anyhit__radiance", radiance_any_hit);
        registry
    }

    pub fn register(&mut self, entry: impl Into<String>, body: ProgramFn) -> &mut Self {
        self.bodies.insert(entry.into(), body);
        self
    }

    pub fn get(&self, entry: &str) -> Option<ProgramFn> {
        self.bodies.get(entry).copied()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.bodies.contains_key(entry)
    }
}

impl std::fmt::Debug for ProgramRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.bodies.keys().collect();
        names.sort();
        f.debug_struct("ProgramRegistry").field("entries", &names).finish()
    }
}

/// Module listing for the built-in programs.
pub const DEVICE_PROGRAMS: &str = r#"# Frame test pattern: one raygen writing the color buffer, placeholder
# radiance programs for the miss and hit tables.
.version 1
.launch_params optixLaunchParams
.entry __raygen__renderFrame registers=24 payload=0 attributes=0 trace_depth=0
.entry __miss__radiance registers=8 payload=2 attributes=0 trace_depth=0
.entry __closesthit__radiance registers=8 payload=2 attributes=2 trace_depth=0
.entry __anyhit__radiance registers=8 payload=2 attributes=2 trace_depth=0
"#;

/// Writes `0xffBBGGRR` with `r = x % 256`, `g = y % 256`, `b = (x + y) % 256`.
fn render_frame(ctx: &mut ProgramContext<'_>) -> Result<(), DeviceFault> {
    let params: LaunchParams = ctx.params()?;
    let [ix, iy, _] = ctx.launch_index();

    if params.frame_id == 0 && ix == 0 && iy == 0 {
        ctx.print("############################################");
        ctx.print(&format!(
            "Hello world from the raygen program! (within a {}x{}-sized launch)",
            params.fb_size[0], params.fb_size[1]
        ));
        ctx.print("############################################");
    }

    let r = ix % 256;
    let g = iy % 256;
    let b = (ix + iy) % 256;
    let rgba = 0xff00_0000 | r | (g << 8) | (b << 16);

    let width = params.fb_size[0].max(0) as u64;
    let fb_index = u64::from(ix) + u64::from(iy) * width;
    ctx.store(params.color_buffer + fb_index * 4, &rgba)
}

fn radiance_miss(_ctx: &mut ProgramContext<'_>) -> Result<(), DeviceFault> {
    Ok(())
}

fn radiance_closest_hit(_ctx: &mut ProgramContext<'_>) -> Result<(), DeviceFault> {
    Ok(())
}

fn radiance_any_hit(_ctx: &mut ProgramContext<'_>) -> Result<(), DeviceFault> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_entry_prefixes() {
        assert_eq!(
            ProgramSemantic::from_entry("__raygen__renderFrame"),
            Some(ProgramSemantic::RayGen)
        );
        assert_eq!(
            ProgramSemantic::from_entry("__anyhit__radiance"),
            Some(ProgramSemantic::AnyHit)
        );
        assert_eq!(ProgramSemantic::from_entry("__miss__"), None);
        assert_eq!(ProgramSemantic::from_entry("renderFrame"), None);
    }

    #[test]
    fn builtin_registry_covers_the_listing() {
        let registry = ProgramRegistry::with_builtin();
        for entry in [
            "__raygen__renderFrame",
            "__miss__radiance",
            "__closesthit__radiance",
            "__anyhit__radiance",
        ] {
            assert!(registry.contains(entry), "{entry} missing");
        }
    }
}
