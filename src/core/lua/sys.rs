// Raw bindings to the vendored Lua 5.4 interpreter, re-exported from `mlua::ffi`.
pub use mlua::ffi::{
    LUA_ERRMEM, LUA_ERRSYNTAX, LUA_OK, LUA_TBOOLEAN, LUA_TNIL, LUA_TNONE, LUA_TNUMBER, LUA_TSTRING,
    LUA_TTABLE, lua_CFunction, lua_State, lua_close, lua_dump, lua_getglobal, lua_gettop,
    lua_isinteger, lua_newtable, lua_pcall, lua_pop, lua_pushboolean, lua_pushcfunction,
    lua_pushinteger, lua_pushlightuserdata, lua_pushlstring, lua_pushnil, lua_pushnumber,
    lua_pushvalue, lua_setfield, lua_setglobal, lua_settop, lua_toboolean, lua_tointeger, lua_tolstring,
    lua_tonumber, lua_touserdata, lua_type, lua_typename, luaL_callmeta, luaL_loadbufferx, luaL_newstate,
    luaL_openlibs,
};
