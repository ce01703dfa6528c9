// src/lua.rs - Lua scripts for atomic operations
use redis::Script;

pub struct LuaScripts {
    pub transition: Script,
    pub pop_due: Script,
}

impl LuaScripts {
    pub fn new() -> Self {
        Self {
            transition: Script::new(include_str!("./lua/transition.lua")),
            pop_due: Script::new(include_str!("./lua/pop_due.lua")),
        }
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}
