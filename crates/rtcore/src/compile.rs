use std::collections::HashSet;
use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::programs::{ProgramFn, ProgramRegistry, ProgramSemantic};
use crate::types::{DebugLevel, ModuleCompileOptions, OptLevel, PipelineCompileOptions};

/// Only listing version this compiler understands.
pub const LISTING_VERSION: u32 = 1;

/// One `.entry` line of a module listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDecl {
    pub name: String,
    pub semantic: ProgramSemantic,
    pub registers: u32,
    pub payload_values: u32,
    pub attribute_values: u32,
    pub trace_depth: u32,
    pub line: usize,
}

/// Parsed module source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleListing {
    pub version: u32,
    pub launch_params: Option<String>,
    pub entries: Vec<EntryDecl>,
}

impl ModuleListing {
    pub fn entry(&self, name: &str) -> Option<&EntryDecl> {
        self.entries.iter().find(|entry| entry.name == name)
    }
}

/// Entry point after its body was resolved.
#[derive(Clone)]
pub(crate) struct CompiledEntry {
    pub decl: EntryDecl,
    pub body: ProgramFn,
}

impl std::fmt::Debug for CompiledEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledEntry").field("decl", &self.decl).finish()
    }
}

/// Parses module source into a listing.
///
/// The format is line oriented:
///
/// 1. `#` and `//` start comments, blank lines are ignored.
/// 2. `.version N` must appear before any entry.
/// 3. `.launch_params NAME` names the launch-parameter variable.
/// 4. `.entry NAME key=value...` declares an entry with `registers`,
///    `payload`, `attributes`, and `trace_depth` (all default to zero).
///
/// Every problem is collected so the caller gets one log with line numbers.
pub fn parse_listing(source: &str) -> Result<ModuleListing, Vec<String>> {
    let mut issues = Vec::new();
    let mut version = None;
    let mut launch_params = None;
    let mut entries: Vec<EntryDecl> = Vec::new();
    let mut seen = HashSet::new();

    for (index, raw) in source.lines().enumerate() {
        let line_no = index + 1;
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }

        let mut tokens = line.split_whitespace();
        let Some(directive) = tokens.next() else {
            continue;
        };
        match directive {
            ".version" => match tokens.next().map(str::parse::<u32>) {
                Some(Ok(value)) => {
                    if version.replace(value).is_some() {
                        issues.push(format!("line {line_no}: duplicate .version directive"));
                    }
                }
                _ => issues.push(format!("line {line_no}: .version expects an integer")),
            },
            ".launch_params" => match tokens.next() {
                Some(name) => launch_params = Some(name.to_string()),
                None => issues.push(format!("line {line_no}: .launch_params expects a name")),
            },
            ".entry" => {
                if version.is_none() {
                    issues.push(format!("line {line_no}: .entry before .version"));
                }
                let Some(name) = tokens.next() else {
                    issues.push(format!("line {line_no}: .entry expects a name"));
                    continue;
                };
                let Some(semantic) = ProgramSemantic::from_entry(name) else {
                    issues.push(format!(
                        "line {line_no}: entry '{name}' has no recognised semantic prefix \
                         (__raygen__, __miss__, __closesthit__, __anyhit__)"
                    ));
                    continue;
                };
                if !seen.insert(name.to_string()) {
                    issues.push(format!("line {line_no}: duplicate entry '{name}'"));
                    continue;
                }
                let mut decl = EntryDecl {
                    name: name.to_string(),
                    semantic,
                    registers: 0,
                    payload_values: 0,
                    attribute_values: 0,
                    trace_depth: 0,
                    line: line_no,
                };
                for pair in tokens {
                    if let Err(issue) = apply_entry_attribute(&mut decl, pair) {
                        issues.push(format!("line {line_no}: {issue}"));
                    }
                }
                entries.push(decl);
            }
            other => issues.push(format!("line {line_no}: unknown directive '{other}'")),
        }

        if directive != ".entry" {
            if let Some(extra) = line.split_whitespace().nth(2) {
                issues.push(format!("line {line_no}: unexpected token '{extra}'"));
            }
        }
    }

    let Some(version) = version else {
        issues.push("module source has no .version directive".to_string());
        return Err(issues);
    };
    if version != LISTING_VERSION {
        issues.push(format!(
            "unsupported listing version {version}; expected {LISTING_VERSION}"
        ));
    }

    if issues.is_empty() {
        Ok(ModuleListing {
            version,
            launch_params,
            entries,
        })
    } else {
        Err(issues)
    }
}

fn strip_comment(line: &str) -> &str {
    let cut = [line.find('#'), line.find("//")]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(line.len());
    &line[..cut]
}

fn apply_entry_attribute(decl: &mut EntryDecl, pair: &str) -> Result<(), String> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, found '{pair}'"))?;
    let value: u32 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{key}' expects a non-negative integer, found '{value}'"))?;
    match key.trim() {
        "registers" => decl.registers = value,
        "payload" => decl.payload_values = value,
        "attributes" => decl.attribute_values = value,
        "trace_depth" => decl.trace_depth = value,
        other => return Err(format!("unknown entry attribute '{other}'")),
    }
    Ok(())
}

/// Compiles module source against `registry`.
///
/// Returns the resolved entries and the (possibly empty) warning log. Fails
/// with `Error::Compile` when the source is malformed, an entry has no
/// registered body, or an entry exceeds the register budget.
pub(crate) fn compile_module_source(
    source: &str,
    registry: &ProgramRegistry,
    options: &ModuleCompileOptions,
    pipeline_options: &PipelineCompileOptions,
) -> Result<(Vec<CompiledEntry>, String)> {
    pipeline_options.validate()?;

    let listing = parse_listing(source).map_err(|issues| Error::Compile {
        log: issues.join("\n"),
    })?;

    let mut errors = Vec::new();
    let mut log = String::new();
    let mut compiled = Vec::with_capacity(listing.entries.len());

    for decl in &listing.entries {
        if options.max_register_count != 0 && decl.registers > options.max_register_count {
            errors.push(format!(
                "line {}: entry '{}' uses {} registers, exceeding the budget of {}",
                decl.line, decl.name, decl.registers, options.max_register_count
            ));
            continue;
        }
        match registry.get(&decl.name) {
            Some(body) => compiled.push(CompiledEntry {
                decl: decl.clone(),
                body,
            }),
            None => errors.push(format!(
                "line {}: entry '{}' has no program body registered with the runtime",
                decl.line, decl.name
            )),
        }
    }

    if !errors.is_empty() {
        return Err(Error::Compile {
            log: errors.join("\n"),
        });
    }

    match listing.launch_params.as_deref() {
        Some(name) if name != pipeline_options.launch_params_variable => {
            let _ = writeln!(
                log,
                "warning: module declares launch params '{name}' but the pipeline expects '{}'",
                pipeline_options.launch_params_variable
            );
        }
        None => {
            let _ = writeln!(
                log,
                "warning: module does not declare a launch params variable"
            );
        }
        _ => {}
    }
    if options.debug_level == DebugLevel::Full && options.opt_level != OptLevel::Level0 {
        let _ = writeln!(
            log,
            "warning: full debug information requested with optimisations enabled"
        );
    }
    if compiled.is_empty() {
        let _ = writeln!(log, "warning: module declares no entry points");
    }

    Ok((compiled, log))
}
