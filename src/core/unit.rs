//! Purpose: Compiled script units and the per-name binding cache.
//! Exports: `CompiledUnit`, `UnitInfo`, `Origin`, `Recompile`, `CompileOutcome`, `UnitCache`.
//! Role: Holds the bytecode a `Context` hands to fresh states on every run.
//! Invariants: A name maps to at most one unit.
//! Invariants: A bound name only changes under `Recompile::Override`, and only with a unit that compiled.
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::core::error::Error;
use crate::core::lua::State;

/// What to do when a name is already bound.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Recompile {
    /// Keep the existing unit; the new source is neither read nor parsed.
    #[default]
    Discard,
    /// Compile the new source and replace the existing unit if it succeeds.
    Override,
}

impl From<bool> for Recompile {
    fn from(allow_override: bool) -> Self {
        if allow_override {
            Recompile::Override
        } else {
            Recompile::Discard
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompileOutcome {
    Bound,
    Replaced,
    Discarded,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Origin {
    Inline,
    File(PathBuf),
}

impl Origin {
    /// Chunk name handed to the interpreter; shows up in error messages.
    pub(crate) fn chunk_name(&self, name: &str) -> String {
        match self {
            Origin::Inline => name.to_string(),
            Origin::File(path) => format!("@{}", path.display()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CompiledUnit {
    name: String,
    origin: Origin,
    bytecode: Arc<[u8]>,
    digest: String,
    compiled_at: OffsetDateTime,
}

impl CompiledUnit {
    /// Parses `source` in a transient state and captures its bytecode.
    pub fn compile(name: &str, source: &[u8], origin: Origin) -> Result<Self, Error> {
        let chunk_name = origin.chunk_name(name);
        let state = State::bare()?;
        state.load_source(source, &chunk_name).map_err(|err| {
            let err = err.with_name(name);
            match &origin {
                Origin::File(path) => err.with_path(path.clone()),
                Origin::Inline => err,
            }
        })?;
        let bytecode = state.dump_function().map_err(|err| err.with_name(name))?;
        Ok(Self {
            name: name.to_string(),
            origin,
            bytecode: bytecode.into(),
            digest: source_digest(source),
            compiled_at: OffsetDateTime::now_utc(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytecode(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytecode)
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub(crate) fn chunk_name(&self) -> String {
        self.origin.chunk_name(&self.name)
    }

    pub fn info(&self) -> UnitInfo {
        UnitInfo {
            name: self.name.clone(),
            origin: self.origin.clone(),
            digest: self.digest.clone(),
            bytecode_len: self.bytecode.len(),
            compiled_at: self.compiled_at,
        }
    }
}

/// Read-only snapshot of a bound unit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnitInfo {
    pub name: String,
    pub origin: Origin,
    /// Lowercase hex SHA-256 of the source text.
    pub digest: String,
    pub bytecode_len: usize,
    pub compiled_at: OffsetDateTime,
}

impl UnitInfo {
    pub fn path(&self) -> Option<&Path> {
        match &self.origin {
            Origin::File(path) => Some(path),
            Origin::Inline => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct UnitCache {
    units: BTreeMap<String, CompiledUnit>,
}

impl UnitCache {
    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&CompiledUnit> {
        self.units.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.units.keys().cloned().collect()
    }

    /// Applies the binding policy for `unit.name`.
    pub fn bind(&mut self, unit: CompiledUnit, policy: Recompile) -> CompileOutcome {
        if !self.units.contains_key(&unit.name) {
            self.units.insert(unit.name.clone(), unit);
            return CompileOutcome::Bound;
        }
        match policy {
            Recompile::Discard => CompileOutcome::Discarded,
            Recompile::Override => {
                self.units.insert(unit.name.clone(), unit);
                CompileOutcome::Replaced
            }
        }
    }
}

pub(crate) fn source_digest(source: &[u8]) -> String {
    let digest = Sha256::digest(source);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::{CompileOutcome, CompiledUnit, Origin, Recompile, UnitCache, source_digest};
    use crate::core::error::ErrorKind;
    use std::path::PathBuf;

    fn unit(name: &str, source: &str) -> CompiledUnit {
        CompiledUnit::compile(name, source.as_bytes(), Origin::Inline).expect("compile")
    }

    #[test]
    fn first_binding_wins_by_default() {
        let mut cache = UnitCache::default();
        let first = unit("test", "x = 1");
        let digest = first.digest().to_string();

        assert_eq!(cache.bind(first, Recompile::default()), CompileOutcome::Bound);
        assert_eq!(
            cache.bind(unit("test", "x = 2"), Recompile::Discard),
            CompileOutcome::Discarded
        );
        assert_eq!(cache.get("test").expect("bound").digest(), digest);
        assert_eq!(cache.names(), vec!["test".to_string()]);
    }

    #[test]
    fn override_replaces_binding() {
        let mut cache = UnitCache::default();
        cache.bind(unit("test", "x = 1"), Recompile::Override);
        let second = unit("test", "x = 2");
        let digest = second.digest().to_string();

        assert_eq!(
            cache.bind(second, Recompile::Override),
            CompileOutcome::Replaced
        );
        assert_eq!(cache.get("test").expect("bound").digest(), digest);
    }

    #[test]
    fn names_are_sorted() {
        let mut cache = UnitCache::default();
        cache.bind(unit("b", "return 1"), Recompile::Discard);
        cache.bind(unit("a", "return 2"), Recompile::Discard);
        assert_eq!(cache.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn compile_error_carries_name_and_path() {
        let origin = Origin::File(PathBuf::from("scripts/broken.lua"));
        let err = CompiledUnit::compile("broken", b"while {}[1]", origin).expect_err("syntax");
        assert_eq!(err.kind(), ErrorKind::Compile);
        assert_eq!(err.name(), Some("broken"));
        assert!(err.message().unwrap_or_default().starts_with("scripts/broken.lua:1:"));
    }

    #[test]
    fn info_reports_origin_and_digest() {
        let compiled = CompiledUnit::compile(
            "hello",
            b"print('hi')",
            Origin::File(PathBuf::from("hello.lua")),
        )
        .expect("compile");
        let info = compiled.info();
        assert_eq!(info.name, "hello");
        assert_eq!(info.path(), Some(std::path::Path::new("hello.lua")));
        assert_eq!(info.digest, source_digest(b"print('hi')"));
        assert!(info.bytecode_len > 0);
    }

    #[test]
    fn digest_is_lowercase_hex_sha256() {
        assert_eq!(
            source_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn bool_maps_to_policy() {
        assert_eq!(Recompile::from(true), Recompile::Override);
        assert_eq!(Recompile::from(false), Recompile::Discard);
    }
}
