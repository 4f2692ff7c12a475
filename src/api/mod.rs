//! Purpose: Define the public Rust API boundary for luahost.
//! Exports: Context, state, library, unit and error types; the raw interpreter API as `ffi`.
//! Role: Public, additive-only surface; hides internal module layout.
//! Invariants: This module is the only public path to core types.
//! Invariants: `ffi` is the interpreter's own C API, for writing native functions.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::context::{Context, ContextOptions};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::library::Library;
pub use crate::core::lua::{NativeFunction, Ownership, State, StateRef};
pub use crate::core::unit::{CompileOutcome, Origin, Recompile, UnitInfo};
pub use crate::core::value::{Globals, Value};
pub use mlua::ffi;
