//! Compile-then-load pipeline for script sources.
//!
//! `compile` parses the main source (and optionally every sibling source in
//! the working directory) into [`UnitBlob`]s. `load` stages the blobs in a
//! uniquely named archive, reads it back, verifies every unit again, deletes
//! the archive and links the program: the main source is the entry point,
//! the others contribute their function definitions.

pub mod sources;
pub mod staging;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use rhai::{Dynamic, Engine, EvalAltResult, AST};
use thiserror::Error;
use tracing::debug;

use crate::config::CompilerConfig;
use staging::StagingArchive;

/// Errors from compiling or loading a program.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{unit}: {message}")]
    Parse { unit: String, message: String },

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("staging failed: {0}")]
    Stage(String),

    #[error("load failed{}: {message}", .unit.as_ref().map(|u| format!(" for {u}")).unwrap_or_default())]
    Load { unit: Option<String>, message: String },

    #[error("entry unit {} not found among [{}]", .entry.as_deref().unwrap_or("<none>"), .units.join(", "))]
    NoEntryPoint {
        entry: Option<String>,
        units: Vec<String>,
    },

    #[error("compiler is no longer available")]
    Detached,
}

/// One lowered source unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitBlob {
    pub name: String,
    pub code: String,
}

/// The blobs produced by one compile pass, entry unit first.
#[derive(Debug, Clone, Default)]
pub struct CompiledUnit {
    pub units: Vec<UnitBlob>,
}

impl CompiledUnit {
    /// Name of the unit that will run: the main source of the pass.
    pub fn entry(&self) -> Option<&str> {
        self.units.first().map(|u| u.name.as_str())
    }
}

/// Per-compiler settings.
#[derive(Debug, Clone)]
pub struct CompilerSettings {
    /// Directory sibling sources are pulled from.
    pub source_dir: PathBuf,
    /// Extension of sibling sources.
    pub extension: String,
    /// Directory for staging archives.
    pub staging_dir: PathBuf,
    pub max_operations: u64,
}

impl CompilerSettings {
    pub fn new(source_dir: &Path, config: &CompilerConfig) -> Self {
        Self {
            source_dir: source_dir.to_path_buf(),
            extension: config.extension.clone(),
            staging_dir: source_dir.join(&config.staging_dir_name),
            max_operations: config.max_operations,
        }
    }

    fn staging_dir_name(&self) -> Option<&str> {
        self.staging_dir.file_name().and_then(|n| n.to_str())
    }
}

/// Errors raised while running a loaded program.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("script stopped")]
    Stopped,

    #[error("{0}")]
    Runtime(String),
}

impl From<Box<EvalAltResult>> for ScriptError {
    fn from(err: Box<EvalAltResult>) -> Self {
        if is_terminated(&err) {
            Self::Stopped
        } else {
            Self::Runtime(err.to_string())
        }
    }
}

fn is_terminated(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorTerminated(..) => true,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
        | EvalAltResult::ErrorInModule(_, inner, _) => is_terminated(inner),
        _ => false,
    }
}

impl From<ScriptError> for Box<EvalAltResult> {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::Stopped => {
                EvalAltResult::ErrorTerminated(Dynamic::UNIT, rhai::Position::NONE).into()
            }
            other => other.to_string().into(),
        }
    }
}

/// Something that can be run to completion.
pub trait Runnable {
    fn run(&self) -> Result<Dynamic, ScriptError>;
}

/// A loaded program bound to the compiler that produced it.
#[derive(Clone)]
pub struct Script {
    name: String,
    ast: Arc<AST>,
    compiler: Arc<Compiler>,
}

impl Script {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Runnable for Script {
    fn run(&self) -> Result<Dynamic, ScriptError> {
        debug!(script = %self.name, "Running");
        Ok(self.compiler.engine.eval_ast::<Dynamic>(&self.ast)?)
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Compiler and loader for one execution context.
///
/// Compile passes on one compiler are serialized by the accumulator lock.
pub struct Compiler {
    engine: Engine,
    settings: CompilerSettings,
    accumulator: Mutex<Vec<UnitBlob>>,
    this: Weak<Compiler>,
}

impl Compiler {
    /// Build a compiler. `configure` registers the script API on the engine
    /// and receives a weak handle for functions that compile nested code.
    pub fn new<F>(settings: CompilerSettings, configure: F) -> Arc<Self>
    where
        F: FnOnce(&mut Engine, Weak<Self>),
    {
        Arc::new_cyclic(|this| {
            let mut engine = Engine::new();
            if settings.max_operations > 0 {
                engine.set_max_operations(settings.max_operations);
            }
            configure(&mut engine, this.clone());
            Self {
                engine,
                settings,
                accumulator: Mutex::new(Vec::new()),
                this: this.clone(),
            }
        })
    }

    pub const fn settings(&self) -> &CompilerSettings {
        &self.settings
    }

    /// Parse `source` (and the sibling sources, if asked) into blobs.
    pub fn compile(
        &self,
        source: &str,
        source_name: &str,
        pull_siblings: bool,
    ) -> Result<CompiledUnit, CompileError> {
        let mut acc = self.accumulator.lock().unwrap_or_else(PoisonError::into_inner);
        self.compile_into(&mut acc, source, source_name, pull_siblings)?;
        Ok(CompiledUnit {
            units: std::mem::take(&mut *acc),
        })
    }

    /// Compile and load under one lock.
    pub fn evaluate(
        &self,
        source: &str,
        source_name: &str,
        pull_siblings: bool,
    ) -> Result<Script, CompileError> {
        let mut acc = self.accumulator.lock().unwrap_or_else(PoisonError::into_inner);
        self.compile_into(&mut acc, source, source_name, pull_siblings)?;
        let unit = CompiledUnit {
            units: std::mem::take(&mut *acc),
        };
        self.load(&unit)
    }

    fn compile_into(
        &self,
        acc: &mut Vec<UnitBlob>,
        source: &str,
        source_name: &str,
        pull_siblings: bool,
    ) -> Result<(), CompileError> {
        acc.clear();
        acc.push(self.lower(source_name, source)?);

        if pull_siblings {
            let main_path = self.settings.source_dir.join(source_name);
            let skip: Vec<&str> = self.settings.staging_dir_name().into_iter().collect();
            let siblings = sources::sibling_sources(
                &self.settings.source_dir,
                &self.settings.extension,
                &skip,
                &[main_path.as_path()],
            )
            .map_err(|source| CompileError::Io {
                path: self.settings.source_dir.clone(),
                source,
            })?;

            for path in siblings {
                let text = std::fs::read_to_string(&path).map_err(|source| CompileError::Io {
                    path: path.clone(),
                    source,
                })?;
                let name = sources::unit_name(&self.settings.source_dir, &path);
                acc.push(self.lower(&name, &text)?);
            }
        }

        debug!(units = acc.len(), "Compiled source units");
        Ok(())
    }

    fn lower(&self, name: &str, code: &str) -> Result<UnitBlob, CompileError> {
        self.parse(name, code).map_err(|message| CompileError::Parse {
            unit: name.to_string(),
            message,
        })?;
        Ok(UnitBlob {
            name: name.to_string(),
            code: code.to_string(),
        })
    }

    fn parse(&self, name: &str, code: &str) -> Result<AST, String> {
        let mut ast = self.engine.compile(code).map_err(|e| e.to_string())?;
        ast.set_source(name);
        Ok(ast)
    }

    /// Stage `unit`, load it back and link the program.
    ///
    /// The staging archive is gone by the time this returns, whatever the
    /// outcome.
    pub fn load(&self, unit: &CompiledUnit) -> Result<Script, CompileError> {
        let compiler = self.this.upgrade().ok_or(CompileError::Detached)?;

        let (manifest, staged) = {
            let archive = StagingArchive::write(&self.settings.staging_dir, unit)?;
            archive.read()?
        };

        let mut loaded = Vec::with_capacity(staged.len());
        for (name, code) in staged {
            let ast = self.parse(&name, &code).map_err(|message| CompileError::Load {
                unit: Some(name.clone()),
                message,
            })?;
            loaded.push((name, ast));
        }

        let entry = manifest
            .entry
            .as_deref()
            .and_then(|entry| loaded.iter().position(|(name, _)| name == entry))
            .ok_or_else(|| CompileError::NoEntryPoint {
                entry: manifest.entry.clone(),
                units: loaded.iter().map(|(name, _)| name.clone()).collect(),
            })?;

        let mut program = AST::empty();
        for (index, (_, ast)) in loaded.iter().enumerate() {
            if index != entry {
                program = program.merge(&ast.clone_functions_only());
            }
        }
        let (name, entry_ast) = &loaded[entry];
        program = program.merge(entry_ast);
        program.set_source(name.as_str());

        debug!(entry = %name, units = loaded.len(), "Loaded program");
        Ok(Script {
            name: name.clone(),
            ast: Arc::new(program),
            compiler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiler(dir: &Path) -> Arc<Compiler> {
        let settings = CompilerSettings::new(dir, &CompilerConfig::default());
        Compiler::new(settings, |_, _| {})
    }

    fn staging_is_empty(dir: &Path) -> bool {
        let staging = dir.join(".staging");
        !staging.exists() || std::fs::read_dir(staging).unwrap().next().is_none()
    }

    #[test]
    fn evaluates_a_simple_program() {
        let dir = tempfile::tempdir().unwrap();
        let script = compiler(dir.path()).evaluate("40 + 2", "main.rhai", true).unwrap();
        assert_eq!(script.run().unwrap().as_int().unwrap(), 42);
        assert!(staging_is_empty(dir.path()));
    }

    #[test]
    fn siblings_contribute_functions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("util.rhai"), "fn double(x) { x * 2 }\nprint(\"ignored\");").unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/more.rhai"), "fn inc(x) { x + 1 }").unwrap();

        let c = compiler(dir.path());
        let unit = c.compile("inc(double(20))", "main.rhai", true).unwrap();
        let names: Vec<_> = unit.units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["main.rhai", "lib/more.rhai", "util.rhai"]);
        assert_eq!(unit.entry(), Some("main.rhai"));

        let script = c.load(&unit).unwrap();
        assert_eq!(script.name(), "main.rhai");
        assert_eq!(script.run().unwrap().as_int().unwrap(), 41);
    }

    #[test]
    fn siblings_are_skipped_when_not_pulled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.rhai"), "fn (").unwrap();

        let c = compiler(dir.path());
        assert!(c.compile("1", "main.rhai", false).is_ok());
        assert!(matches!(
            c.compile("1", "main.rhai", true),
            Err(CompileError::Parse { unit, .. }) if unit == "broken.rhai"
        ));
    }

    #[test]
    fn parse_error_names_the_unit() {
        let dir = tempfile::tempdir().unwrap();
        let err = compiler(dir.path()).evaluate("let x = ;", "main.rhai", true).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("main.rhai: "), "{message}");
        assert!(staging_is_empty(dir.path()));
    }

    #[test]
    fn empty_and_comment_only_mains_run_to_unit() {
        let dir = tempfile::tempdir().unwrap();
        let c = compiler(dir.path());
        for source in ["", "// just a comment"] {
            let script = c.evaluate(source, "main.rhai", true).unwrap();
            assert_eq!(script.name(), "main.rhai");
            assert!(script.run().unwrap().is_unit());
        }
        assert!(staging_is_empty(dir.path()));
    }

    #[test]
    fn main_stays_entry_even_when_it_only_defines_functions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run.rhai"), "answer()").unwrap();

        let c = compiler(dir.path());
        let unit = c.compile("fn answer() { 7 }", "main.rhai", true).unwrap();
        assert_eq!(unit.entry(), Some("main.rhai"));

        let script = c.load(&unit).unwrap();
        assert_eq!(script.name(), "main.rhai");
        assert!(script.run().unwrap().is_unit());
    }

    #[test]
    fn empty_unit_has_no_entry_point() {
        let dir = tempfile::tempdir().unwrap();
        let err = compiler(dir.path()).load(&CompiledUnit::default()).unwrap_err();
        assert!(matches!(err, CompileError::NoEntryPoint { entry: None, .. }));
        assert!(staging_is_empty(dir.path()));
    }

    #[test]
    fn runtime_errors_surface_as_script_errors() {
        let dir = tempfile::tempdir().unwrap();
        let script = compiler(dir.path()).evaluate("throw \"bad\"", "main.rhai", false).unwrap();
        assert!(matches!(script.run(), Err(ScriptError::Runtime(m)) if m.contains("bad")));
    }

    #[test]
    fn compilers_are_independent() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("lib.rhai"), "fn who() { \"a\" }").unwrap();
        std::fs::write(b.path().join("lib.rhai"), "fn who() { \"b\" }").unwrap();

        let sa = compiler(a.path()).evaluate("who()", "main.rhai", true).unwrap();
        let sb = compiler(b.path()).evaluate("who()", "main.rhai", true).unwrap();
        assert_eq!(sa.run().unwrap().into_string().unwrap(), "a");
        assert_eq!(sb.run().unwrap().into_string().unwrap(), "b");
    }
}
