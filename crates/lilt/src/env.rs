//! The lexical environment seen during memoization.
//!
//! An environment is an ordered frame of bound names in front of the module
//! whose top level the expression belongs to. Position in the frame *is*
//! the lexical index the evaluator will use: index 0 names the most
//! recently bound variable.

use crate::{intern::Symbol, module::Module, value::Value};

/// Compile-time environment: a module plus the lexically bound names.
#[derive(Debug, Clone)]
pub struct Env {
    module: Module,
    frame: Vec<Symbol>,
}

impl Env {
    /// The top-level environment of `module`, with nothing lexically bound.
    pub fn toplevel(module: Module) -> Self {
        Self {
            module,
            frame: Vec::new(),
        }
    }

    #[inline]
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// True when no lexical bindings are in scope — where `define` is
    /// legal.
    #[inline]
    pub fn is_toplevel(&self) -> bool {
        self.frame.is_empty()
    }

    /// The frame index of `sym`, innermost binding first; `None` when
    /// free.
    pub fn lexical_index(&self, sym: &Symbol) -> Option<usize> {
        self.frame.iter().position(|bound| bound == sym)
    }

    /// True when `sym` has no lexical binding here. Keywords like `else`
    /// and `=>` are only literal while free.
    pub fn is_free(&self, sym: &Symbol) -> bool {
        self.lexical_index(sym).is_none()
    }

    /// Extends with `vars` given in source order: the last declared
    /// variable lands at index 0, pushing existing bindings deeper.
    pub fn extend(&self, vars: &[Symbol]) -> Self {
        let mut frame = Vec::with_capacity(vars.len() + self.frame.len());
        frame.extend(vars.iter().rev().cloned());
        frame.extend_from_slice(&self.frame);
        Self {
            module: self.module.clone(),
            frame,
        }
    }

    /// Extends with a single variable.
    pub fn extend_one(&self, var: &Symbol) -> Self {
        self.extend(std::slice::from_ref(var))
    }

    /// The macro-registry lookup behind special-form dispatch: a free
    /// symbol whose module variable holds a syntax transformer or a
    /// memoizer primitive. Anything else — lexically bound, unbound, or
    /// an ordinary value — is not a macro here.
    pub(crate) fn macro_binding(&self, sym: &Symbol) -> Option<Value> {
        if !self.is_free(sym) {
            return None;
        }
        let value = self.module.variable(sym)?.get()?;
        matches!(value, Value::Syntax(_) | Value::Memoizer(_)).then_some(value)
    }
}
