//! Ingressify render: template function tables, minijinja compile/render and
//! output file writes.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ingressify_core::IngressRule;
use metrics::{counter, histogram};
use minijinja::{context, Environment, UndefinedBehavior, Value};
use tracing::{debug, info};

pub mod adapter;
mod funcs;

pub use funcs::{builtin_funcs, helper_funcs};

const TEMPLATE_NAME: &str = "ingressify";

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("reading template {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("compiling template: {0}")]
    Compile(#[source] minijinja::Error),
    #[error("rendering template: {0}")]
    Render(#[source] minijinja::Error),
    #[error("writing output {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
}

/// Named values (usually functions) exposed as template globals.
#[derive(Debug, Clone, Default)]
pub struct FuncTable {
    funcs: BTreeMap<String, Value>,
}

impl FuncTable {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert, replacing any previous entry of the same name.
    pub fn insert(&mut self, name: &str, value: Value) {
        self.funcs.insert(name.to_string(), value);
    }

    /// Union of `tables`; on key collisions the later table wins.
    pub fn merge<I: IntoIterator<Item = FuncTable>>(tables: I) -> FuncTable {
        let mut out = FuncTable::new();
        for t in tables {
            out.funcs.extend(t.funcs);
        }
        out
    }

    pub fn get(&self, name: &str) -> Option<&Value> { self.funcs.get(name) }
    pub fn len(&self) -> usize { self.funcs.len() }
    pub fn is_empty(&self) -> bool { self.funcs.is_empty() }
    pub fn names(&self) -> impl Iterator<Item = &str> { self.funcs.keys().map(String::as_str) }
}

/// Helpers first so the rule functions win on a name clash.
pub fn default_funcs() -> FuncTable {
    FuncTable::merge([helper_funcs(), builtin_funcs()])
}

/// A compiled template bound to its function table.
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl std::fmt::Debug for TemplateRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRenderer").finish_non_exhaustive()
    }
}

impl TemplateRenderer {
    /// Parse `source`. Undefined names are errors at render time.
    pub fn compile(source: impl Into<String>, funcs: &FuncTable) -> Result<Self, TemplateError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        for (name, value) in &funcs.funcs {
            env.add_global(name.clone(), value.clone());
        }
        env.add_template_owned(TEMPLATE_NAME, source.into()).map_err(TemplateError::Compile)?;
        debug!(funcs = funcs.len(), "template compiled");
        Ok(Self { env })
    }

    pub fn compile_file(path: impl AsRef<Path>, funcs: &FuncTable) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| TemplateError::Read { path: path.to_path_buf(), source })?;
        info!(template = %path.display(), "loaded template");
        Self::compile(source, funcs)
    }

    /// Render with `rules` bound as the `rules` context variable.
    pub fn render(&self, rules: &[IngressRule]) -> Result<String, TemplateError> {
        let started = Instant::now();
        let tmpl = self.env.get_template(TEMPLATE_NAME).map_err(TemplateError::Render)?;
        let out = tmpl
            .render(context! { rules => adapter::rules_to_value(rules.to_vec()) })
            .map_err(TemplateError::Render)?;
        histogram!("template_render_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(rules = rules.len(), bytes = out.len(), "template rendered");
        Ok(out)
    }
}

/// How the output file is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Write a sibling temp file and rename it over the destination.
    Atomic,
    /// Truncate and write in place; readers may observe a partial file.
    Overwrite,
}

impl WriteMode {
    pub fn from_atomic(atomic: bool) -> Self {
        if atomic { WriteMode::Atomic } else { WriteMode::Overwrite }
    }
}

pub fn write_output(bytes: &[u8], path: &Path, mode: WriteMode) -> Result<(), TemplateError> {
    let wrap = |source| TemplateError::Write { path: path.to_path_buf(), source };
    match mode {
        WriteMode::Overwrite => std::fs::write(path, bytes).map_err(wrap)?,
        WriteMode::Atomic => write_atomic(bytes, path).map_err(wrap)?,
    }
    counter!("output_writes", 1u64);
    info!(out = %path.display(), bytes = bytes.len(), mode = ?mode, "output written");
    Ok(())
}

fn write_atomic(bytes: &[u8], path: &Path) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    // keep the destination's permissions; temp files are created 0600
    match std::fs::metadata(path) {
        Ok(meta) => tmp.as_file().set_permissions(meta.permissions())?,
        Err(_) => set_default_mode(tmp.as_file())?,
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(unix)]
fn set_default_mode(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_default_mode(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}
