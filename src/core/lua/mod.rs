//! Purpose: Ownership-tagged wrapper around one Lua interpreter instance.
//! Exports: `State`, `StateRef`, `Ownership`, `NativeFunction`.
//! Role: Lifetime shim plus the protected-call boundary every context operation goes through.
//! Invariants: An `Owned` state closes its handle exactly once, on drop; `Borrowed` never closes.
//! Invariants: Loads, runs, dumps and library setup run in protected mode; non-OK statuses become `Error`.
//! Invariants: All FFI interaction is confined to this module + `sys` (library install uses `protected`).
use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::ops::Deref;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr::{self, NonNull};

use crate::core::error::{Error, ErrorKind};
use crate::core::value::Value;

pub mod sys;

/// Host function callable from scripts through the interpreter's calling convention.
///
/// Arguments are read off the state's stack (`1..=lua_gettop`), results are
/// pushed, and the return value is the number of results.
pub type NativeFunction = sys::lua_CFunction;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ownership {
    /// Closes the interpreter on drop.
    Owned,
    /// Shares another handle's interpreter; never closes it.
    Borrowed,
}

#[derive(Debug)]
pub struct State {
    raw: NonNull<sys::lua_State>,
    ownership: Ownership,
}

impl State {
    /// Opens a new interpreter with the standard libraries loaded.
    pub fn new() -> Result<Self, Error> {
        let state = Self::bare()?;
        state.open_standard_libraries()?;
        Ok(state)
    }

    /// Opens a new interpreter with an empty global namespace.
    pub fn bare() -> Result<Self, Error> {
        let raw = NonNull::new(unsafe { sys::luaL_newstate() }).ok_or_else(|| {
            Error::new(ErrorKind::EnvironmentInit).with_message("failed to allocate lua state")
        })?;
        tracing::debug!(state = ?raw, "opened lua state");
        Ok(Self {
            raw,
            ownership: Ownership::Owned,
        })
    }

    /// Wraps an existing interpreter handle.
    ///
    /// With `reuse` the returned state borrows the interpreter: stack and
    /// globals are shared with the original handle and dropping it leaves the
    /// interpreter open. Without `reuse` the returned state takes ownership and
    /// closes the interpreter when dropped.
    ///
    /// # Safety
    ///
    /// `raw` must be null or an open interpreter handle. When borrowing, the
    /// handle must stay open for as long as the returned state is alive. When
    /// taking ownership, nothing else may close the handle.
    pub unsafe fn from_raw(raw: *mut sys::lua_State, reuse: bool) -> Result<Self, Error> {
        let raw = NonNull::new(raw).ok_or_else(|| {
            Error::new(ErrorKind::EnvironmentInit).with_message("lua state handle is null")
        })?;
        let ownership = if reuse {
            Ownership::Borrowed
        } else {
            Ownership::Owned
        };
        Ok(Self { raw, ownership })
    }

    /// Borrowed view sharing this interpreter, bounded by `self`'s lifetime.
    pub fn reuse(&self) -> StateRef<'_> {
        StateRef {
            state: State {
                raw: self.raw,
                ownership: Ownership::Borrowed,
            },
            _owner: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *mut sys::lua_State {
        self.raw.as_ptr()
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_owned(&self) -> bool {
        self.ownership == Ownership::Owned
    }

    pub fn top(&self) -> i32 {
        unsafe { sys::lua_gettop(self.as_ptr()) }
    }

    pub fn set_top(&self, index: i32) {
        unsafe { sys::lua_settop(self.as_ptr(), index) }
    }

    pub fn pop(&self, count: i32) {
        unsafe { sys::lua_pop(self.as_ptr(), count) }
    }

    pub fn push_string(&self, value: &str) {
        unsafe {
            sys::lua_pushlstring(self.as_ptr(), value.as_ptr() as *const c_char, value.len());
        }
    }

    pub fn push_value(&self, value: &Value) -> Result<(), Error> {
        ensure_pushable(value)?;
        unsafe { push_raw(self.as_ptr(), value) };
        Ok(())
    }

    pub fn to_value(&self, index: i32) -> Value {
        unsafe { value_at(self.as_ptr(), index) }
    }

    /// Assigns a global in protected mode (globals may carry metamethods).
    pub fn set_global(&self, name: &str, value: &Value) -> Result<(), Error> {
        ensure_pushable(value)?;
        let name = c_name(name)?;
        let mut access = GlobalAccess {
            name: name.as_ptr(),
            value: Some(value),
        };
        self.protected(
            set_global_protected,
            &mut access as *mut GlobalAccess as *mut c_void,
            0,
            ErrorKind::Runtime,
        )
    }

    /// Reads a global in protected mode.
    pub fn global(&self, name: &str) -> Result<Value, Error> {
        let name = c_name(name)?;
        let mut access = GlobalAccess {
            name: name.as_ptr(),
            value: None,
        };
        self.protected(
            get_global_protected,
            &mut access as *mut GlobalAccess as *mut c_void,
            1,
            ErrorKind::Runtime,
        )?;
        let value = self.to_value(-1);
        self.pop(1);
        Ok(value)
    }

    /// Parses `source` as text and pushes the resulting main function.
    pub fn load_source(&self, source: &[u8], chunk_name: &str) -> Result<(), Error> {
        self.load(source, chunk_name, c"t")
    }

    /// Loads a chunk produced by `dump_function` and pushes its main function.
    pub fn load_bytecode(&self, bytecode: &[u8], chunk_name: &str) -> Result<(), Error> {
        self.load(bytecode, chunk_name, c"b")
    }

    /// Serializes the function on top of the stack, leaving it in place.
    pub fn dump_function(&self) -> Result<Vec<u8>, Error> {
        let mut out: Vec<u8> = Vec::new();
        let status = unsafe {
            sys::lua_dump(
                self.as_ptr(),
                write_chunk,
                &mut out as *mut Vec<u8> as *mut c_void,
                0,
            )
        };
        if status != 0 || out.is_empty() {
            return Err(Error::new(ErrorKind::Internal).with_message("failed to dump compiled chunk"));
        }
        Ok(out)
    }

    /// Calls the function below `nargs` arguments in protected mode.
    ///
    /// On failure the error object is popped and returned as `Runtime`.
    pub fn call(&self, nargs: i32, nresults: i32) -> Result<(), Error> {
        let status = unsafe { sys::lua_pcall(self.as_ptr(), nargs, nresults, 0) };
        if status != sys::LUA_OK {
            return Err(self.take_error(status, ErrorKind::Runtime));
        }
        Ok(())
    }

    /// Runs `body` as a protected C function with `data` as its only argument.
    ///
    /// `body` must not own values with destructors: interpreter errors unwind
    /// through it with `longjmp`.
    pub(crate) fn protected(
        &self,
        body: NativeFunction,
        data: *mut c_void,
        nresults: i32,
        kind: ErrorKind,
    ) -> Result<(), Error> {
        let ptr = self.as_ptr();
        let status = unsafe {
            sys::lua_pushcfunction(ptr, body);
            sys::lua_pushlightuserdata(ptr, data);
            sys::lua_pcall(ptr, 1, nresults, 0)
        };
        if status != sys::LUA_OK {
            return Err(self.take_error(status, kind));
        }
        Ok(())
    }

    fn open_standard_libraries(&self) -> Result<(), Error> {
        self.protected(
            open_libs_protected,
            ptr::null_mut(),
            0,
            ErrorKind::EnvironmentInit,
        )
        .map_err(|err| err.with_hint("standard library initialization failed"))
    }

    fn load(&self, chunk: &[u8], chunk_name: &str, mode: &CStr) -> Result<(), Error> {
        let name = c_name(chunk_name)?;
        let status = unsafe {
            sys::luaL_loadbufferx(
                self.as_ptr(),
                chunk.as_ptr() as *const c_char,
                chunk.len(),
                name.as_ptr(),
                mode.as_ptr(),
            )
        };
        if status != sys::LUA_OK {
            return Err(self.take_error(status, ErrorKind::Compile));
        }
        Ok(())
    }

    /// Pops the error object left by a failed call and converts it.
    fn take_error(&self, status: c_int, phase: ErrorKind) -> Error {
        let message = self.error_object_message();
        self.pop(1);
        let kind = if status == sys::LUA_ERRSYNTAX {
            ErrorKind::Compile
        } else {
            phase
        };
        let mut err = Error::new(kind).with_message(message);
        if status == sys::LUA_ERRMEM {
            err = err.with_hint("the interpreter ran out of memory");
        }
        err
    }

    /// Describes the error object on top of the stack, leaving it in place.
    ///
    /// Strings and numbers are used as is; other values go through their
    /// `__tostring` metamethod when it yields a string.
    fn error_object_message(&self) -> String {
        let ptr = self.as_ptr();
        unsafe {
            let tp = sys::lua_type(ptr, -1);
            if tp == sys::LUA_TSTRING || tp == sys::LUA_TNUMBER {
                return string_at(ptr, -1);
            }
            sys::lua_pushcfunction(ptr, describe_error_protected);
            sys::lua_pushvalue(ptr, -2);
            let status = sys::lua_pcall(ptr, 1, 1, 0);
            let described = if status == sys::LUA_OK && sys::lua_type(ptr, -1) == sys::LUA_TSTRING {
                Some(string_at(ptr, -1))
            } else {
                None
            };
            sys::lua_pop(ptr, 1);
            described.unwrap_or_else(|| format!("(error object is a {} value)", type_name(ptr, tp)))
        }
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if self.ownership == Ownership::Owned {
            tracing::debug!(state = ?self.raw, "closing lua state");
            unsafe { sys::lua_close(self.as_ptr()) };
        }
    }
}

/// Borrowed `State` that cannot outlive the handle it was taken from.
#[derive(Debug)]
pub struct StateRef<'a> {
    state: State,
    _owner: PhantomData<&'a State>,
}

impl Deref for StateRef<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        &self.state
    }
}

pub(crate) fn c_name(name: &str) -> Result<CString, Error> {
    CString::new(name).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("name contains a nul byte")
            .with_name(name.replace('\0', "\\0"))
            .with_source(err)
    })
}

fn ensure_pushable(value: &Value) -> Result<(), Error> {
    if let Value::Other(type_name) = value {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("cannot pass a {type_name} value into lua")));
    }
    Ok(())
}

struct GlobalAccess<'a> {
    name: *const c_char,
    value: Option<&'a Value>,
}

unsafe extern "C-unwind" fn open_libs_protected(state: *mut sys::lua_State) -> c_int {
    unsafe { sys::luaL_openlibs(state) };
    0
}

unsafe extern "C-unwind" fn set_global_protected(state: *mut sys::lua_State) -> c_int {
    unsafe {
        let access = &*(sys::lua_touserdata(state, 1) as *const GlobalAccess<'_>);
        if let Some(value) = access.value {
            push_raw(state, value);
        } else {
            sys::lua_pushnil(state);
        }
        sys::lua_setglobal(state, access.name);
    }
    0
}

unsafe extern "C-unwind" fn get_global_protected(state: *mut sys::lua_State) -> c_int {
    unsafe {
        let access = &*(sys::lua_touserdata(state, 1) as *const GlobalAccess<'_>);
        sys::lua_getglobal(state, access.name);
    }
    1
}

unsafe extern "C-unwind" fn describe_error_protected(state: *mut sys::lua_State) -> c_int {
    unsafe {
        if sys::luaL_callmeta(state, 1, c"__tostring".as_ptr()) != 0 {
            return 1;
        }
    }
    0
}

unsafe extern "C-unwind" fn write_chunk(
    _state: *mut sys::lua_State,
    data: *const c_void,
    len: usize,
    out: *mut c_void,
) -> c_int {
    unsafe {
        let out = &mut *(out as *mut Vec<u8>);
        out.extend_from_slice(std::slice::from_raw_parts(data as *const u8, len));
    }
    0
}

unsafe fn push_raw(state: *mut sys::lua_State, value: &Value) {
    unsafe {
        match value {
            Value::Nil | Value::Other(_) => sys::lua_pushnil(state),
            Value::Boolean(value) => sys::lua_pushboolean(state, c_int::from(*value)),
            Value::Integer(value) => sys::lua_pushinteger(state, *value),
            Value::Number(value) => sys::lua_pushnumber(state, *value),
            Value::String(value) => {
                sys::lua_pushlstring(state, value.as_ptr() as *const c_char, value.len());
            }
        }
    }
}

unsafe fn value_at(state: *mut sys::lua_State, index: c_int) -> Value {
    unsafe {
        match sys::lua_type(state, index) {
            sys::LUA_TNONE | sys::LUA_TNIL => Value::Nil,
            sys::LUA_TBOOLEAN => Value::Boolean(sys::lua_toboolean(state, index) != 0),
            sys::LUA_TNUMBER if sys::lua_isinteger(state, index) != 0 => {
                Value::Integer(sys::lua_tointeger(state, index))
            }
            sys::LUA_TNUMBER => Value::Number(sys::lua_tonumber(state, index)),
            sys::LUA_TSTRING => Value::String(string_at(state, index)),
            other => Value::Other(type_name(state, other)),
        }
    }
}

unsafe fn string_at(state: *mut sys::lua_State, index: c_int) -> String {
    unsafe {
        let mut len: usize = 0;
        let ptr = sys::lua_tolstring(state, index, &mut len as *mut usize);
        if ptr.is_null() {
            return String::new();
        }
        let bytes = std::slice::from_raw_parts(ptr as *const u8, len);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

unsafe fn type_name(state: *mut sys::lua_State, tp: c_int) -> String {
    unsafe {
        CStr::from_ptr(sys::lua_typename(state, tp))
            .to_string_lossy()
            .into_owned()
    }
}
