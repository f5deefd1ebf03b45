//! Modules, variables-by-name, and the process-wide module registry.
//!
//! This is the minimal module system the memoizer needs: named binding
//! tables (obarrays), a uses-list searched after local bindings, optional
//! public interfaces, and a registry resolving module names to modules.
//! The boot module `(lilt)` is created on first use and seeded with the
//! special-form and memoizer-primitive bindings.

use std::{cell::RefCell, rc::Rc};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    error::{Exception, MemoResult},
    intern::Symbol,
    memoize::define_core_syntax,
    value::Value,
    variable::Variable,
};

/// Name of the boot module holding the core syntax bindings.
const BOOT_MODULE_NAME: &str = "lilt";

#[derive(Debug)]
struct ModuleData {
    /// The module name, a list of symbols such as `(lilt)`.
    name: Value,
    /// Bindings in definition order.
    obarray: RefCell<IndexMap<Symbol, Variable, ahash::RandomState>>,
    /// Modules whose bindings are visible here, searched after local ones.
    uses: RefCell<Vec<Module>>,
    /// The subset of bindings exported to `(@ …)` references; `None` means
    /// the module exports everything (itself).
    public_interface: RefCell<Option<Module>>,
}

/// A module. Clones share the underlying binding table.
#[derive(Debug, Clone)]
pub struct Module(Rc<ModuleData>);

impl Module {
    /// Creates an empty, unregistered module named `name`.
    pub fn new(name: Value) -> Self {
        Self(Rc::new(ModuleData {
            name,
            obarray: RefCell::new(IndexMap::default()),
            uses: RefCell::new(Vec::new()),
            public_interface: RefCell::new(None),
        }))
    }

    /// The module's name list.
    pub fn name(&self) -> Value {
        self.0.name.clone()
    }

    /// Defines `sym`, reusing its existing local variable cell if one
    /// exists.
    pub fn define(&self, sym: Symbol, value: Value) -> Variable {
        let mut obarray = self.0.obarray.borrow_mut();
        if let Some(var) = obarray.get(&sym) {
            var.set(value);
            return var.clone();
        }
        let var = Variable::new(value);
        obarray.insert(sym, var.clone());
        var
    }

    /// The variable bound locally to `sym`, ignoring used modules.
    pub fn local_variable(&self, sym: &Symbol) -> Option<Variable> {
        self.0.obarray.borrow().get(sym).cloned()
    }

    /// The local variable cell for `sym`, creating an unbound one if none
    /// exists yet.
    pub fn ensure_local_variable(&self, sym: Symbol) -> Variable {
        let mut obarray = self.0.obarray.borrow_mut();
        if let Some(var) = obarray.get(&sym) {
            return var.clone();
        }
        let var = Variable::unbound();
        obarray.insert(sym, var.clone());
        var
    }

    /// The variable `sym` names here: a local binding, or the first match
    /// in the uses-list.
    pub fn variable(&self, sym: &Symbol) -> Option<Variable> {
        if let Some(var) = self.local_variable(sym) {
            return Some(var);
        }
        self.0
            .uses
            .borrow()
            .iter()
            .find_map(|used| used.variable(sym))
    }

    /// As [`Module::variable`], raising `unbound-variable` when `sym`
    /// names nothing at all.
    pub fn lookup(&self, sym: &Symbol) -> MemoResult<Variable> {
        self.variable(sym)
            .ok_or_else(|| Exception::unbound_variable(sym))
    }

    /// Makes `used`'s bindings visible here.
    pub fn use_module(&self, used: Module) {
        self.0.uses.borrow_mut().push(used);
    }

    /// The module's public interface; the module itself when none was set.
    pub fn public_interface(&self) -> Module {
        self.0
            .public_interface
            .borrow()
            .clone()
            .unwrap_or_else(|| self.clone())
    }

    pub fn set_public_interface(&self, interface: Module) {
        *self.0.public_interface.borrow_mut() = Some(interface);
    }

    /// Identity comparison; module names are not unique across a process.
    pub fn is_same(&self, other: &Module) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

thread_local! {
    static REGISTRY: RefCell<AHashMap<String, Module>> = RefCell::new(AHashMap::new());
    static CURRENT: RefCell<Option<Module>> = const { RefCell::new(None) };
}

/// Resolves a module name (a list of symbols) to a module, creating and
/// registering an empty one on first mention.
pub fn resolve_module(name: &Value) -> Module {
    let key = name.to_string();
    REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        if let Some(module) = registry.get(&key) {
            return module.clone();
        }
        let module = Module::new(name.clone());
        registry.insert(key, module.clone());
        module
    })
}

/// The boot module `(lilt)`, created and seeded with core syntax on first
/// use.
pub fn boot_module() -> Module {
    let name = Value::list(vec![Value::Symbol(Symbol::intern(BOOT_MODULE_NAME))]);
    let key = name.to_string();
    let existing = REGISTRY.with(|registry| registry.borrow().get(&key).cloned());
    if let Some(module) = existing {
        return module;
    }
    let module = Module::new(name);
    REGISTRY.with(|registry| {
        registry.borrow_mut().insert(key, module.clone());
    });
    define_core_syntax(&module);
    module
}

/// The module in which `memoize_expression` resolves free identifiers.
/// Defaults to the boot module.
pub fn current_module() -> Module {
    let current = CURRENT.with(|cell| cell.borrow().clone());
    match current {
        Some(module) => module,
        None => {
            let module = boot_module();
            CURRENT.with(|cell| *cell.borrow_mut() = Some(module.clone()));
            module
        }
    }
}

/// Replaces the current module, returning the previous one.
pub fn set_current_module(module: Module) -> Module {
    let previous = current_module();
    CURRENT.with(|cell| *cell.borrow_mut() = Some(module));
    previous
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_reuses_the_variable_cell() {
        let module = Module::new(Value::list(vec![Value::Symbol(Symbol::intern("scratch"))]));
        let sym = Symbol::intern("x");
        let first = module.define(sym.clone(), Value::Int(1));
        let second = module.define(sym.clone(), Value::Int(2));
        assert_eq!(first, second);
        assert!(first.get().unwrap().equal(&Value::Int(2)));
    }

    #[test]
    fn uses_list_is_searched_after_local_bindings() {
        let base = Module::new(Value::list(vec![Value::Symbol(Symbol::intern("base"))]));
        let user = Module::new(Value::list(vec![Value::Symbol(Symbol::intern("user"))]));
        let sym = Symbol::intern("shared");
        base.define(sym.clone(), Value::Int(10));
        assert!(user.variable(&sym).is_none());
        user.use_module(base);
        assert!(user.variable(&sym).is_some());
        user.define(sym.clone(), Value::Int(11));
        assert!(user.variable(&sym).unwrap().get().unwrap().equal(&Value::Int(11)));
    }

    #[test]
    fn resolve_module_registers_on_first_mention() {
        let name = Value::list(vec![
            Value::Symbol(Symbol::intern("demo")),
            Value::Symbol(Symbol::intern("inner")),
        ]);
        let a = resolve_module(&name);
        let b = resolve_module(&name);
        assert!(a.is_same(&b));
    }

    #[test]
    fn boot_module_carries_core_syntax() {
        let boot = boot_module();
        let lambda = boot.variable(&Symbol::intern("lambda")).unwrap();
        assert!(matches!(lambda.get(), Some(Value::Syntax(_))));
        let prim = boot.variable(&Symbol::intern("@apply")).unwrap();
        assert!(matches!(prim.get(), Some(Value::Memoizer(_))));
    }

    #[test]
    fn lookup_raises_unbound_variable() {
        let module = Module::new(Value::list(vec![Value::Symbol(Symbol::intern("empty"))]));
        let err = module.lookup(&Symbol::intern("ghost")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ExcKind::UnboundVariable);
    }
}
