//! IR module: functions and module-level constants.

use std::collections::HashMap;

use crate::func::Func;
use crate::global::{GlobalArray, GlobalId};

/// Handle to a function in a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

impl FuncId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A module owning lifted functions and their constant arrays.
#[derive(Clone, Debug, Default)]
pub struct Module {
    funcs: Vec<Func>,
    by_name: HashMap<String, FuncId>,
    globals: Vec<GlobalArray>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a function by linkage name.
    pub fn get_function(&self, name: &str) -> Option<FuncId> {
        self.by_name.get(name).copied()
    }

    /// Declare a function, or return the existing one with that name.
    pub fn declare_function(&mut self, name: &str) -> FuncId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = FuncId(self.funcs.len() as u32);
        self.funcs.push(Func::declare(name));
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn func(&self, id: FuncId) -> &Func {
        &self.funcs[id.index()]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut Func {
        &mut self.funcs[id.index()]
    }

    pub fn funcs(&self) -> impl Iterator<Item = (FuncId, &Func)> {
        self.funcs
            .iter()
            .enumerate()
            .map(|(i, f)| (FuncId(i as u32), f))
    }

    /// Install a module-level constant array.
    pub fn add_global(&mut self, global: GlobalArray) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(global);
        id
    }

    pub fn global(&self, id: GlobalId) -> &GlobalArray {
        &self.globals[id.index()]
    }

    pub fn globals(&self) -> impl Iterator<Item = (GlobalId, &GlobalArray)> {
        self.globals
            .iter()
            .enumerate()
            .map(|(i, g)| (GlobalId(i as u32), g))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_is_idempotent() {
        let mut m = Module::new();
        let a = m.declare_function("sub_1000");
        let b = m.declare_function("sub_1000");
        assert_eq!(a, b);
        assert_eq!(m.get_function("sub_1000"), Some(a));
        assert_eq!(m.get_function("sub_2000"), None);
    }
}
