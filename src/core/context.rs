//! Purpose: Script-context lifecycle manager: compiled-unit cache plus native library registry.
//! Exports: `Context`, `ContextOptions`.
//! Role: Facade hosts use to compile, cache and run named scripts in fresh states.
//! Invariants: Every state a context hands out has every registered library installed.
//! Invariants: Cache and registry share one lock, held only for lookups and inserts.
//! Invariants: Interpreter faults surface as `Error` values; nothing unwinds past this boundary.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::error::{Error, ErrorKind};
use crate::core::library::Library;
use crate::core::lua::State;
use crate::core::unit::{CompileOutcome, CompiledUnit, Origin, Recompile, UnitCache, UnitInfo};
use crate::core::value::Globals;

const INLINE_CHUNK: &str = "=(inline)";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ContextOptions {
    /// Open the standard libraries (`print`, `string`, ...) in every state.
    pub standard_libraries: bool,
}

impl ContextOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_standard_libraries(mut self, enabled: bool) -> Self {
        self.standard_libraries = enabled;
        self
    }
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            standard_libraries: true,
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    units: UnitCache,
    libraries: BTreeMap<String, Library>,
}

#[derive(Debug, Default)]
pub struct Context {
    options: ContextOptions,
    registry: Mutex<Registry>,
}

impl Context {
    pub fn new() -> Self {
        Self::with_options(ContextOptions::default())
    }

    pub fn with_options(options: ContextOptions) -> Self {
        Self {
            options,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn options(&self) -> ContextOptions {
        self.options
    }

    /// Fresh owning state with an empty stack and every library installed.
    pub fn new_state(&self) -> Result<State, Error> {
        let libraries = self.lock().libraries.values().cloned().collect::<Vec<_>>();
        self.prepare_state(&libraries)
    }

    /// Fresh state with the unit bound to `name` loaded on top of the stack, ready to call.
    pub fn new_state_for(&self, name: &str) -> Result<State, Error> {
        let (libraries, bytecode, chunk_name) = {
            let registry = self.lock();
            let unit = registry.units.get(name).ok_or_else(|| unit_not_found(name))?;
            let libraries = registry.libraries.values().cloned().collect::<Vec<_>>();
            (libraries, unit.bytecode(), unit.chunk_name())
        };
        let state = self.prepare_state(&libraries)?;
        state
            .load_bytecode(&bytecode, &chunk_name)
            .map_err(|err| err.with_name(name))?;
        Ok(state)
    }

    /// Compiles `source` under `name`; see `Recompile` for what happens when `name` is bound.
    pub fn compile_string(
        &self,
        name: &str,
        source: &str,
        policy: Recompile,
    ) -> Result<CompileOutcome, Error> {
        if let Some(outcome) = self.skip_bound(name, policy) {
            return Ok(outcome);
        }
        let unit = CompiledUnit::compile(name, source.as_bytes(), Origin::Inline)?;
        Ok(self.bind(unit, policy))
    }

    /// Compiles the file at `path` under `name`; a discarded recompile does not read the file.
    pub fn compile_file(
        &self,
        name: &str,
        path: impl AsRef<Path>,
        policy: Recompile,
    ) -> Result<CompileOutcome, Error> {
        let path = path.as_ref();
        if let Some(outcome) = self.skip_bound(name, policy) {
            return Ok(outcome);
        }
        let source = read_source(path).map_err(|err| err.with_name(name))?;
        let unit = CompiledUnit::compile(name, &source, Origin::File(path.to_path_buf()))?;
        Ok(self.bind(unit, policy))
    }

    /// Compiles and runs `source` once without touching the unit cache.
    pub fn compile_string_and_run(&self, source: &str) -> Result<(), Error> {
        self.run_transient(source.as_bytes(), INLINE_CHUNK)
    }

    /// Compiles and runs the file at `path` once without touching the unit cache.
    pub fn compile_file_and_run(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let source = read_source(path)?;
        self.run_transient(&source, &Origin::File(path.to_path_buf()).chunk_name(""))
            .map_err(|err| err.with_path(path))
    }

    /// Runs the unit bound to `name` in a fresh state.
    pub fn run(&self, name: &str) -> Result<(), Error> {
        let state = self.new_state_for(name)?;
        tracing::debug!(unit = name, "running unit");
        state.call(0, 0).map_err(|err| err.with_name(name))
    }

    /// Runs the unit bound to `name` with `globals` assigned first, then reads
    /// each listed global back into the map.
    pub fn run_with_globals(&self, name: &str, globals: &mut Globals) -> Result<(), Error> {
        let state = self.new_state_for(name)?;
        for (key, value) in globals.iter() {
            state
                .set_global(key, value)
                .map_err(|err| err.with_name(name))?;
        }
        tracing::debug!(unit = name, globals = globals.len(), "running unit with globals");
        state.call(0, 0).map_err(|err| err.with_name(name))?;
        for (key, value) in globals.iter_mut() {
            *value = state.global(key).map_err(|err| err.with_name(name))?;
        }
        Ok(())
    }

    /// Takes ownership of `library`; every state created afterwards has it installed.
    ///
    /// A library whose namespace is already registered is rejected.
    pub fn add_library(&self, library: Library) -> Result<(), Error> {
        library.validate_names()?;
        let mut registry = self.lock();
        if registry.libraries.contains_key(library.name()) {
            return Err(Error::new(ErrorKind::DuplicateLibrary)
                .with_message("library namespace already registered")
                .with_name(library.name())
                .with_hint("Rename the library with `set_name` before adding it."));
        }
        tracing::debug!(library = %library.name(), functions = library.len(), "added library");
        registry
            .libraries
            .insert(library.name().to_string(), library);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().units.contains(name)
    }

    pub fn unit_info(&self, name: &str) -> Result<UnitInfo, Error> {
        self.lock()
            .units
            .get(name)
            .map(CompiledUnit::info)
            .ok_or_else(|| unit_not_found(name))
    }

    pub fn unit_names(&self) -> Vec<String> {
        self.lock().units.names()
    }

    pub fn library_names(&self) -> Vec<String> {
        self.lock().libraries.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // Every mutation is a single insert, so a poisoned registry is still consistent.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prepare_state(&self, libraries: &[Library]) -> Result<State, Error> {
        let state = if self.options.standard_libraries {
            State::new()?
        } else {
            State::bare()?
        };
        for library in libraries {
            library.install(&state)?;
        }
        Ok(state)
    }

    fn skip_bound(&self, name: &str, policy: Recompile) -> Option<CompileOutcome> {
        if policy == Recompile::Discard && self.contains(name) {
            tracing::debug!(unit = name, "unit already bound; discarding new source");
            return Some(CompileOutcome::Discarded);
        }
        None
    }

    fn bind(&self, unit: CompiledUnit, policy: Recompile) -> CompileOutcome {
        let name = unit.name().to_string();
        let digest = unit.digest().to_string();
        let outcome = self.lock().units.bind(unit, policy);
        match outcome {
            CompileOutcome::Bound => tracing::debug!(unit = %name, %digest, "bound unit"),
            CompileOutcome::Replaced => tracing::info!(unit = %name, %digest, "replaced unit"),
            CompileOutcome::Discarded => {
                tracing::debug!(unit = %name, "unit bound concurrently; discarding new source")
            }
        }
        outcome
    }

    fn run_transient(&self, source: &[u8], chunk_name: &str) -> Result<(), Error> {
        let state = self.new_state()?;
        state.load_source(source, chunk_name)?;
        state.call(0, 0)
    }
}

fn read_source(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read script")
            .with_path(path)
            .with_source(err)
    })
}

fn unit_not_found(name: &str) -> Error {
    Error::new(ErrorKind::NotFound)
        .with_message("no compiled unit")
        .with_name(name)
}
