//! Purpose: Embed Lua scripts behind a shared context of cached units and native libraries.
//! Exports: `api` (context, states, libraries, units, errors).
//! Role: Library crate backing the `luahost` CLI and host applications.
//! Invariants: Interpreter failures reach callers only as `api::Error` values.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
mod core;
