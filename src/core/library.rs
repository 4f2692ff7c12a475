//! Purpose: Named bundles of native functions exposed to scripts as global tables.
//! Exports: `Library`.
//! Role: Registry entry owned by a `Context`; installed into every state it creates.
//! Invariants: Function names are unique within a library; the last registration wins.
//! Invariants: Installation creates the namespace table only when the global is not already a table.
use std::collections::BTreeMap;
use std::os::raw::{c_char, c_int, c_void};

use crate::core::error::{Error, ErrorKind};
use crate::core::lua::{NativeFunction, State, c_name, sys};

#[derive(Clone, Debug)]
pub struct Library {
    name: String,
    functions: BTreeMap<String, NativeFunction>,
}

impl Library {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the namespace scripts will see. Only the caller that still
    /// owns the library can do this; a context takes ownership on add.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Registers `function` as `<library>.<name>`, returning any function it replaced.
    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        function: NativeFunction,
    ) -> Option<NativeFunction> {
        self.functions.insert(name.into(), function)
    }

    pub fn with_function(mut self, name: impl Into<String>, function: NativeFunction) -> Self {
        self.add_function(name, function);
        self
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Binds every function into `state` under this library's namespace.
    pub fn install(&self, state: &State) -> Result<(), Error> {
        let namespace = c_name(&self.name)?;
        let mut names = Vec::with_capacity(self.functions.len());
        for name in self.functions.keys() {
            names.push(c_name(name)?);
        }
        let entries = names
            .iter()
            .zip(self.functions.values())
            .map(|(name, function)| (name.as_ptr(), *function))
            .collect::<Vec<_>>();
        let mut plan = InstallPlan {
            namespace: namespace.as_ptr(),
            entries: &entries,
        };

        state
            .protected(
                install_protected,
                &mut plan as *mut InstallPlan<'_> as *mut c_void,
                0,
                ErrorKind::EnvironmentInit,
            )
            .map_err(|err| err.with_name(self.name.clone()))?;
        tracing::debug!(library = %self.name, functions = self.functions.len(), "installed library");
        Ok(())
    }

    pub(crate) fn validate_names(&self) -> Result<(), Error> {
        c_name(&self.name)?;
        for name in self.functions.keys() {
            c_name(name).map_err(|err| err.with_message("function name contains a nul byte"))?;
        }
        Ok(())
    }
}

struct InstallPlan<'a> {
    namespace: *const c_char,
    entries: &'a [(*const c_char, NativeFunction)],
}

unsafe extern "C-unwind" fn install_protected(state: *mut sys::lua_State) -> c_int {
    unsafe {
        let plan = &*(sys::lua_touserdata(state, 1) as *const InstallPlan<'_>);
        if sys::lua_getglobal(state, plan.namespace) != sys::LUA_TTABLE {
            sys::lua_pop(state, 1);
            sys::lua_newtable(state);
        }
        for (name, function) in plan.entries {
            sys::lua_pushcfunction(state, *function);
            sys::lua_setfield(state, -2, *name);
        }
        sys::lua_setglobal(state, plan.namespace);
    }
    0
}

#[cfg(test)]
mod tests {
    use super::Library;
    use crate::core::error::ErrorKind;
    use crate::core::lua::{State, sys};
    use crate::core::value::Value;
    use std::os::raw::c_int;

    unsafe extern "C-unwind" fn answer(state: *mut sys::lua_State) -> c_int {
        unsafe { sys::lua_pushinteger(state, 42) };
        1
    }

    unsafe extern "C-unwind" fn other(state: *mut sys::lua_State) -> c_int {
        unsafe { sys::lua_pushinteger(state, 7) };
        1
    }

    fn run(state: &State, source: &str) {
        state.load_source(source.as_bytes(), "test").expect("load");
        state.call(0, 0).expect("call");
    }

    #[test]
    fn installed_functions_are_namespaced() {
        let library = Library::new("mathx").with_function("answer", answer);
        let state = State::new().expect("state");
        library.install(&state).expect("install");
        assert_eq!(state.top(), 0);

        run(&state, "result = mathx.answer()");
        assert_eq!(state.global("result").expect("result"), Value::Integer(42));
        assert_eq!(state.global("answer").expect("answer"), Value::Nil);
    }

    #[test]
    fn last_registration_wins() {
        let mut library = Library::new("dup");
        assert!(library.add_function("f", answer).is_none());
        assert!(library.add_function("f", other).is_some());
        assert_eq!(library.len(), 1);

        let state = State::new().expect("state");
        library.install(&state).expect("install");
        run(&state, "result = dup.f()");
        assert_eq!(state.global("result").expect("result"), Value::Integer(7));
    }

    #[test]
    fn existing_namespace_table_is_extended() {
        let state = State::new().expect("state");
        Library::new("string")
            .with_function("answer", answer)
            .install(&state)
            .expect("install");

        run(&state, "a = string.answer(); b = string.upper('x')");
        assert_eq!(state.global("a").expect("a"), Value::Integer(42));
        assert_eq!(state.global("b").expect("b"), Value::from("X"));
    }

    #[test]
    fn rename_changes_the_exposed_namespace() {
        let mut library = Library::new("old").with_function("answer", answer);
        library.set_name("new");
        assert_eq!(library.name(), "new");

        let state = State::new().expect("state");
        library.install(&state).expect("install");
        assert_eq!(state.global("old").expect("old"), Value::Nil);
        run(&state, "result = new.answer()");
        assert_eq!(state.global("result").expect("result"), Value::Integer(42));
    }

    #[test]
    fn nul_in_names_is_rejected_before_touching_state() {
        let library = Library::new("bad").with_function("f\0g", answer);
        assert_eq!(
            library.validate_names().expect_err("nul").kind(),
            ErrorKind::Usage
        );

        let state = State::new().expect("state");
        let err = library.install(&state).expect_err("nul");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(state.top(), 0);
    }
}
