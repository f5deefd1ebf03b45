//! The un-memoizer: a best-effort inverse for diagnostics.
//!
//! Memoization erases names, so this is lossy by design: lexical references
//! print as `<0>`, `<1>`, …, and binding positions print the placeholder
//! `_`. The output is what `#<memoized …>` displays — debug output, not a
//! lossless printer.

use std::rc::Rc;

use crate::{
    intern::Symbol,
    memo::{Arity, Memoized, kw_spec_data},
    value::Value,
};

const PLACEHOLDER: &str = "_";

fn sym(name: &str) -> Value {
    Value::Symbol(Symbol::intern(name))
}

fn int(n: usize) -> Value {
    Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

fn lexical(index: usize) -> Value {
    sym(&format!("<{index}>"))
}

fn unmemoize_exprs(nodes: &[Rc<Memoized>]) -> Vec<Value> {
    nodes.iter().map(|node| unmemoize_expression(node)).collect()
}

/// `((_ init) …)` — the binding names are gone.
fn unmemoize_bindings(inits: &[Rc<Memoized>]) -> Value {
    Value::list(
        inits
            .iter()
            .map(|init| Value::list(vec![sym(PLACEHOLDER), unmemoize_expression(init)]))
            .collect(),
    )
}

/// A formals list of `count` placeholders, dotted with one more when
/// `rest`.
fn placeholder_formals(count: usize, rest: bool) -> Value {
    let mut formals = if rest { sym(PLACEHOLDER) } else { Value::Nil };
    for _ in 0..count {
        formals = Value::cons(sym(PLACEHOLDER), formals);
    }
    formals
}

fn unresolved_module_ref(module: &Value, name: &Symbol, public: bool) -> Value {
    Value::list(vec![
        sym(if public { "@" } else { "@@" }),
        module.clone(),
        Value::Symbol(name.clone()),
    ])
}

/// Reconstructs a printable S-expression from a memoized tree.
pub fn unmemoize_expression(node: &Memoized) -> Value {
    match node {
        Memoized::Begin { body } => Value::cons(sym("begin"), Value::list(unmemoize_exprs(body))),
        Memoized::If { test, then, alt } => Value::list(vec![
            sym("if"),
            unmemoize_expression(test),
            unmemoize_expression(then),
            unmemoize_expression(alt),
        ]),
        Memoized::Lambda { body, arity } => match arity {
            Arity::Fixed { nreq } => Value::list(vec![
                sym("lambda"),
                placeholder_formals(*nreq, false),
                unmemoize_expression(body),
            ]),
            Arity::Rest { nreq } => Value::list(vec![
                sym("lambda"),
                placeholder_formals(*nreq, true),
                unmemoize_expression(body),
            ]),
            Arity::Full {
                nreq,
                rest,
                nopt,
                kw,
                inits,
                alternate,
            } => {
                let spec = Value::list(vec![
                    int(*nreq),
                    Value::Bool(*rest),
                    int(*nopt),
                    kw_spec_data(kw.as_ref()),
                    Value::list(unmemoize_exprs(inits)),
                ]);
                let clause = Value::list(vec![spec, unmemoize_expression(body)]);
                let alternates = match alternate {
                    Some(alt) => unmemoize_expression(alt).list_tail(1).clone(),
                    None => Value::Nil,
                };
                Value::cons(sym("case-lambda*"), Value::cons(clause, alternates))
            }
        },
        Memoized::Let { inits, body } => Value::list(vec![
            sym("let"),
            unmemoize_bindings(inits),
            unmemoize_expression(body),
        ]),
        Memoized::Quote { datum } => Value::list(vec![sym("quote"), datum.clone()]),
        Memoized::Define { name, value } => Value::list(vec![
            sym("define"),
            Value::Symbol(name.clone()),
            unmemoize_expression(value),
        ]),
        Memoized::Dynwind { pre, expr, post } => Value::list(vec![
            sym("@dynamic-wind"),
            unmemoize_expression(pre),
            unmemoize_expression(expr),
            unmemoize_expression(post),
        ]),
        Memoized::WithFluids { fluids, vals, body } => {
            let binds = fluids
                .iter()
                .zip(vals.iter())
                .map(|(fluid, val)| {
                    Value::list(vec![unmemoize_expression(fluid), unmemoize_expression(val)])
                })
                .collect();
            Value::list(vec![
                sym("with-fluids"),
                Value::list(binds),
                unmemoize_expression(body),
            ])
        }
        Memoized::Apply { proc, args } => Value::list(vec![
            sym("@apply"),
            unmemoize_expression(proc),
            unmemoize_expression(args),
        ]),
        Memoized::CallCc { proc } => Value::list(vec![
            sym("@call-with-current-continuation"),
            unmemoize_expression(proc),
        ]),
        Memoized::CallWithValues { producer, consumer } => Value::list(vec![
            sym("@call-with-values"),
            unmemoize_expression(producer),
            unmemoize_expression(consumer),
        ]),
        Memoized::Call { proc, args } => Value::cons(
            unmemoize_expression(proc),
            Value::list(unmemoize_exprs(args)),
        ),
        Memoized::LexicalRef { index } => lexical(*index),
        Memoized::LexicalSet { index, value } => Value::list(vec![
            sym("set!"),
            lexical(*index),
            unmemoize_expression(value),
        ]),
        Memoized::ToplevelRef { name, var } => match var.get() {
            Some(cell) => Value::Variable(cell.clone()),
            None => Value::Symbol(name.clone()),
        },
        Memoized::ToplevelSet { name, var, value } => {
            let target = match var.get() {
                Some(cell) => Value::Variable(cell.clone()),
                None => Value::Symbol(name.clone()),
            };
            Value::list(vec![sym("set!"), target, unmemoize_expression(value)])
        }
        Memoized::ModuleRef {
            module,
            name,
            public,
            var,
        } => match var.get() {
            Some(cell) => Value::Variable(cell.clone()),
            None => unresolved_module_ref(module, name, *public),
        },
        Memoized::ModuleSet {
            value,
            module,
            name,
            public,
            var,
        } => {
            let target = match var.get() {
                Some(cell) => Value::Variable(cell.clone()),
                None => unresolved_module_ref(module, name, *public),
            };
            Value::list(vec![sym("set!"), target, unmemoize_expression(value)])
        }
        Memoized::Prompt { tag, expr, handler } => Value::list(vec![
            sym("@prompt"),
            unmemoize_expression(tag),
            unmemoize_expression(expr),
            unmemoize_expression(handler),
        ]),
    }
}
