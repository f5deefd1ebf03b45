//! The memoizer: lowering of surface Scheme into memoized trees.
//!
//! `memoize` walks an S-expression recursively. A pair whose head is a free
//! symbol bound to a syntax transformer lowers through that transformer; a
//! head bound to a memoizer primitive has its operands memoized first and
//! the primitive emits the node; anything else is an ordinary call. Symbols
//! become lexical or top-level references, other atoms quote themselves.
//!
//! Every special form validates its shape before descending and reports
//! failures as syntax errors with a message from the fixed catalog below,
//! the offending form, and — where the reader provided one — its source
//! location.

use std::{
    cell::{Cell, OnceCell},
    fmt,
    rc::Rc,
};

use smallvec::SmallVec;

use crate::{
    env::Env,
    error::{Exception, MemoResult},
    intern::{Symbol, gensym},
    memo::{Arity, KwSpec, Memoized},
    module::{Module, current_module},
    value::Value,
};

const BAD_EXPRESSION: &str = "Bad expression";
const MISSING_OR_EXTRA_EXPRESSION: &str = "Missing or extra expression in";
const MISSING_EXPRESSION: &str = "Missing expression in";
const EXTRA_EXPRESSION: &str = "Extra expression in";
const BAD_DEFINE: &str = "Bad define placement";
const MISSING_CLAUSES: &str = "Missing clauses";
const MISPLACED_ELSE_CLAUSE: &str = "Misplaced else clause";
const BAD_COND_CLAUSE: &str = "Bad cond clause";
const MISSING_RECIPIENT: &str = "Missing recipient in";
const BAD_VARIABLE: &str = "Bad variable";
const BAD_BINDINGS: &str = "Bad bindings";
const BAD_BINDING: &str = "Bad binding";
const DUPLICATE_BINDING: &str = "Duplicate binding";
const BAD_FORMALS: &str = "Bad formals";
const BAD_FORMAL: &str = "Bad formal";
const DUPLICATE_FORMAL: &str = "Duplicate formal";
const EXPECTED_PROPER_LIST: &str = "expected a proper list";
const DEEPLY_NESTED: &str = "Expression too deeply nested in";

/// Maximum recursion depth while memoizing.
///
/// Bounds descent into pathological input (and into reentrant syntax
/// transformers) so it surfaces as a syntax error instead of exhausting the
/// stack.
#[cfg(not(debug_assertions))]
pub(crate) const MAX_NESTING_DEPTH: u16 = 1000;
/// Lower in debug builds, where stack frames are much larger.
#[cfg(debug_assertions)]
pub(crate) const MAX_NESTING_DEPTH: u16 = 200;

thread_local! {
    static NESTING_DEPTH: Cell<u16> = const { Cell::new(0) };
}

struct NestingGuard;

impl NestingGuard {
    fn enter(expr: &Value) -> MemoResult<Self> {
        let depth = NESTING_DEPTH.with(Cell::get);
        if depth >= MAX_NESTING_DEPTH {
            return Err(err(DEEPLY_NESTED, expr));
        }
        NESTING_DEPTH.with(|d| d.set(depth + 1));
        Ok(Self)
    }
}

impl Drop for NestingGuard {
    fn drop(&mut self) {
        NESTING_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

fn err(message: &str, form: &Value) -> Exception {
    Exception::syntax_error(message, form, None)
}

fn err_in(message: &str, form: &Value, expr: &Value) -> Exception {
    Exception::syntax_error(message, form, Some(expr))
}

fn sym(name: &str) -> Symbol {
    Symbol::intern(name)
}

/// Signature of a syntax transformer's lowering function.
pub type ExpandFn = fn(&Value, &Env) -> MemoResult<Rc<Memoized>>;
/// Signature of a memoizer primitive's node emitter.
pub type EmitFn = fn(&[Rc<Memoized>]) -> Rc<Memoized>;

/// A primitive macro: lowers a whole source form (head included) into a
/// memoized tree. The special forms are transformers registered in the boot
/// module, so shadowing one lexically turns it back into an ordinary name.
pub struct SyntaxTransformer {
    name: &'static str,
    expand: ExpandFn,
}

impl SyntaxTransformer {
    pub fn new(name: &'static str, expand: ExpandFn) -> Self {
        Self { name, expand }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn expand(&self, expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
        (self.expand)(expr, env)
    }
}

impl fmt::Debug for SyntaxTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntaxTransformer").field("name", &self.name).finish()
    }
}

/// A memoizer primitive: takes already-memoized operands and emits one
/// node. These back the internal `@apply`, `@prompt`, … forms the boot
/// code expands into.
pub struct MemoizerPrim {
    name: &'static str,
    nargs: usize,
    emit: EmitFn,
}

impl MemoizerPrim {
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn nargs(&self) -> usize {
        self.nargs
    }

    pub(crate) fn apply(&self, args: &[Rc<Memoized>]) -> MemoResult<Rc<Memoized>> {
        if args.len() != self.nargs {
            return Err(Exception::wrong_number_of_args(self.name));
        }
        Ok((self.emit)(args))
    }
}

impl fmt::Debug for MemoizerPrim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizerPrim")
            .field("name", &self.name)
            .field("nargs", &self.nargs)
            .finish()
    }
}

/// Seeds `module` with the special forms and memoizer primitives. Runs
/// once, at boot-module creation.
pub(crate) fn define_core_syntax(module: &Module) {
    // True primitive syntax.
    let primitive: [(&'static str, ExpandFn); 11] = [
        ("@", m_at),
        ("@@", m_atat),
        ("begin", m_begin),
        ("define", m_define),
        ("with-fluids", m_with_fluids),
        ("eval-when", m_eval_when),
        ("if", m_if),
        ("lambda", m_lambda),
        ("let", m_let),
        ("quote", m_quote),
        ("set!", m_set_x),
    ];
    // Convenient syntax during boot, lowered to primitive syntax here.
    // A full expander replaces these bindings once it is up.
    let boot: [(&'static str, ExpandFn); 8] = [
        ("and", m_and),
        ("cond", m_cond),
        ("letrec", m_letrec),
        ("let*", m_letstar),
        ("or", m_or),
        ("lambda*", m_lambda_star),
        ("case-lambda", m_case_lambda),
        ("case-lambda*", m_case_lambda_star),
    ];
    for (name, expand) in primitive.into_iter().chain(boot) {
        module.define(
            Symbol::intern(name),
            Value::Syntax(Rc::new(SyntaxTransformer::new(name, expand))),
        );
    }

    let memoizers: [(&'static str, usize, EmitFn); 5] = [
        ("@apply", 2, memo_apply),
        ("@call-with-current-continuation", 1, memo_call_cc),
        ("@call-with-values", 2, memo_call_with_values),
        ("@dynamic-wind", 3, memo_dynamic_wind),
        ("@prompt", 3, memo_prompt),
    ];
    for (name, nargs, emit) in memoizers {
        module.define(
            Symbol::intern(name),
            Value::Memoizer(Rc::new(MemoizerPrim { name, nargs, emit })),
        );
    }
}

/// Memoizes `expr` in the lexical environment `env`.
pub fn memoize(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    let _guard = NestingGuard::enter(expr)?;
    match expr {
        Value::Pair(pair) => {
            let mut memoizer = None;
            if let Value::Symbol(head) = &pair.car {
                match env.macro_binding(head) {
                    Some(Value::Syntax(transformer)) => return transformer.expand(expr, env),
                    Some(Value::Memoizer(prim)) => memoizer = Some(prim),
                    _ => {}
                }
            }
            let mut args = Vec::new();
            let mut cursor = &pair.cdr;
            while let Value::Pair(rest) = cursor {
                args.push(memoize(&rest.car, env)?);
                cursor = &rest.cdr;
            }
            if !cursor.is_nil() {
                return Err(err(EXPECTED_PROPER_LIST, cursor));
            }
            match memoizer {
                Some(prim) => prim.apply(&args),
                None => Ok(Rc::new(Memoized::Call {
                    proc: memoize(&pair.car, env)?,
                    args: args.into_boxed_slice(),
                })),
            }
        }
        Value::Symbol(symbol) => Ok(match env.lexical_index(symbol) {
            Some(index) => Memoized::lexical_ref(index),
            None => Memoized::toplevel_ref(symbol.clone()),
        }),
        datum => Ok(Memoized::quote(datum.clone())),
    }
}

/// Memoizes `expr` at the top level of the current module.
pub fn memoize_expression(expr: &Value) -> MemoResult<Rc<Memoized>> {
    memoize(expr, &Env::toplevel(current_module()))
}

/// Boot-time alias for [`memoize_expression`].
pub fn macroexpand(expr: &Value) -> MemoResult<Rc<Memoized>> {
    memoize_expression(expr)
}

fn memoize_exprs(forms: &Value, env: &Env) -> MemoResult<Vec<Rc<Memoized>>> {
    forms.iter_list().map(|form| memoize(form, env)).collect()
}

/// Memoizes a body: a single form passes through unwrapped, several become
/// a `Begin`. An empty or improper body is a syntax error on the
/// reconstructed `(begin …)` form.
fn memoize_sequence(forms: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    if forms.list_len().is_none_or(|n| n < 1) {
        let shape = Value::cons(Value::Symbol(sym("begin")), forms.clone());
        return Err(err(BAD_EXPRESSION, &shape));
    }
    match forms {
        Value::Pair(pair) if pair.cdr.is_nil() => memoize(&pair.car, env),
        _ => Ok(Rc::new(Memoized::Begin {
            body: memoize_exprs(forms, env)?.into_boxed_slice(),
        })),
    }
}

fn m_quote(expr: &Value, _env: &Env) -> MemoResult<Rc<Memoized>> {
    let Some(operands) = expr.list_tail(1).list_elements() else {
        return Err(err(BAD_EXPRESSION, expr));
    };
    if operands.len() != 1 {
        return Err(err(MISSING_OR_EXTRA_EXPRESSION, expr));
    }
    Ok(Memoized::quote(operands[0].clone()))
}

fn m_if(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    let Some(operands) = expr.list_tail(1).list_elements() else {
        return Err(err(MISSING_OR_EXTRA_EXPRESSION, expr));
    };
    if operands.len() != 2 && operands.len() != 3 {
        return Err(err(MISSING_OR_EXTRA_EXPRESSION, expr));
    }
    Ok(Rc::new(Memoized::If {
        test: memoize(operands[0], env)?,
        then: memoize(operands[1], env)?,
        alt: if operands.len() == 3 {
            memoize(operands[2], env)?
        } else {
            Memoized::unspecified()
        },
    }))
}

fn m_begin(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    memoize_sequence(expr.list_tail(1), env)
}

fn m_set_x(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    let Some(operands) = expr.list_tail(1).list_elements() else {
        return Err(err(BAD_EXPRESSION, expr));
    };
    if operands.len() != 2 {
        return Err(err(MISSING_OR_EXTRA_EXPRESSION, expr));
    }
    let variable = operands[0];
    // Memoize the target first; its node kind tells us which set to emit.
    let target = memoize(variable, env)?;
    match &*target {
        Memoized::LexicalRef { index } => Ok(Rc::new(Memoized::LexicalSet {
            index: *index,
            value: memoize(operands[1], env)?,
        })),
        Memoized::ToplevelRef { name, .. } => Ok(Rc::new(Memoized::ToplevelSet {
            name: name.clone(),
            var: OnceCell::new(),
            value: memoize(operands[1], env)?,
        })),
        Memoized::ModuleRef {
            module,
            name,
            public,
            ..
        } => Ok(Rc::new(Memoized::ModuleSet {
            value: memoize(operands[1], env)?,
            module: module.clone(),
            name: name.clone(),
            public: *public,
            var: OnceCell::new(),
        })),
        _ => Err(err_in(BAD_VARIABLE, variable, expr)),
    }
}

/* `define` is only allowed where no lexical bindings are in scope. The
 * value expression may observe the name unbound: in
 * `(define foo (begin (set! foo 1) (+ foo 1)))` the inner set! runs before
 * the define completes. */
fn m_define(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    let tail = expr.list_tail(1);
    let Some(operands) = tail.list_elements() else {
        return Err(err(BAD_EXPRESSION, expr));
    };
    if operands.len() < 2 {
        return Err(err(MISSING_EXPRESSION, expr));
    }
    if !env.is_toplevel() {
        return Err(err(BAD_DEFINE, expr));
    }
    let variable = operands[0];
    if let Some(proto) = variable.as_pair() {
        // (define (name . formals) body …) sugar.
        let Some(name) = proto.car.as_symbol() else {
            return Err(err_in(BAD_VARIABLE, variable, expr));
        };
        let lambda = Value::cons(
            Value::Symbol(sym("lambda")),
            Value::cons(proto.cdr.clone(), tail.list_tail(1).clone()),
        );
        return Ok(Rc::new(Memoized::Define {
            name: name.clone(),
            value: memoize(&lambda, env)?,
        }));
    }
    let Some(name) = variable.as_symbol() else {
        return Err(err_in(BAD_VARIABLE, variable, expr));
    };
    if operands.len() != 2 {
        return Err(err(MISSING_OR_EXTRA_EXPRESSION, expr));
    }
    Ok(Rc::new(Memoized::Define {
        name: name.clone(),
        value: memoize(operands[1], env)?,
    }))
}

fn m_and(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    let tail = expr.list_tail(1);
    match tail {
        Value::Nil => Ok(Memoized::quote(Value::Bool(true))),
        Value::Pair(pair) if pair.cdr.is_nil() => memoize(&pair.car, env),
        Value::Pair(pair) => Ok(Rc::new(Memoized::If {
            test: memoize(&pair.car, env)?,
            then: m_and(tail, env)?,
            alt: Memoized::quote(Value::Bool(false)),
        })),
        _ => Err(err(BAD_EXPRESSION, expr)),
    }
}

fn m_or(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    let tail = expr.list_tail(1);
    if tail.list_len().is_none() {
        return Err(err(BAD_EXPRESSION, expr));
    }
    or_chain(tail, env)
}

/// Each operand is bound to a gensym so it is tested and returned without
/// double evaluation: `(let ((t e)) (if t t rest))`, chained.
fn or_chain(operands: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    let Value::Pair(pair) = operands else {
        return Ok(Memoized::quote(Value::Bool(false)));
    };
    let init = memoize(&pair.car, env)?;
    let inner_env = env.extend_one(&gensym("or"));
    let rest = or_chain(&pair.cdr, &inner_env)?;
    Ok(Rc::new(Memoized::Let {
        inits: vec![init].into_boxed_slice(),
        body: Rc::new(Memoized::If {
            test: Memoized::lexical_ref(0),
            then: Memoized::lexical_ref(0),
            alt: rest,
        }),
    }))
}

fn m_cond(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    // `else` and `=>` are literal keywords only while lexically free.
    let else_literal = env.is_free(&sym("else"));
    let arrow_literal = env.is_free(&sym("=>"));
    let clauses = expr.list_tail(1);
    let Some(len) = clauses.list_len() else {
        return Err(err(BAD_EXPRESSION, expr));
    };
    if len < 1 {
        return Err(err(MISSING_CLAUSES, expr));
    }
    cond_clauses(clauses, env, else_literal, arrow_literal, expr)
}

fn cond_clauses(
    clauses: &Value,
    env: &Env,
    else_literal: bool,
    arrow_literal: bool,
    whole: &Value,
) -> MemoResult<Rc<Memoized>> {
    let Value::Pair(pair) = clauses else {
        return Ok(Memoized::unspecified());
    };
    let clause = &pair.car;
    let remaining = &pair.cdr;
    let Some(parts) = clause.list_elements().filter(|p| !p.is_empty()) else {
        return Err(err_in(BAD_COND_CLAUSE, clause, whole));
    };
    let test = parts[0];

    if else_literal && matches!(test, Value::Symbol(s) if *s == sym("else")) {
        if parts.len() < 2 {
            return Err(err_in(BAD_COND_CLAUSE, clause, whole));
        }
        if !remaining.is_nil() {
            return Err(err_in(MISPLACED_ELSE_CLAUSE, clause, whole));
        }
        let body = Value::cons(Value::Symbol(sym("begin")), clause.list_tail(1).clone());
        return memoize(&body, env);
    }

    if arrow_literal
        && parts.len() >= 2
        && matches!(parts[1], Value::Symbol(s) if *s == sym("=>"))
    {
        if parts.len() == 2 {
            return Err(err_in(MISSING_RECIPIENT, clause, whole));
        }
        if parts.len() != 3 {
            return Err(err_in(EXTRA_EXPRESSION, clause, whole));
        }
        let init = memoize(test, env)?;
        let inner_env = env.extend_one(&gensym("cond"));
        // Both the recipient and the remaining clauses live inside the
        // binding introduced for the test value.
        let recipient = memoize(parts[2], &inner_env)?;
        let rest = cond_clauses(remaining, &inner_env, else_literal, arrow_literal, whole)?;
        return Ok(Rc::new(Memoized::Let {
            inits: vec![init].into_boxed_slice(),
            body: Rc::new(Memoized::If {
                test: Memoized::lexical_ref(0),
                then: Rc::new(Memoized::Call {
                    proc: recipient,
                    args: vec![Memoized::lexical_ref(0)].into_boxed_slice(),
                }),
                alt: rest,
            }),
        }));
    }

    let body = Value::cons(Value::Symbol(sym("begin")), clause.list_tail(1).clone());
    Ok(Rc::new(Memoized::If {
        test: memoize(test, env)?,
        then: memoize(&body, env)?,
        alt: cond_clauses(remaining, env, else_literal, arrow_literal, whole)?,
    }))
}

fn m_eval_when(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    let Some(whole) = expr.list_elements() else {
        return Err(err(BAD_EXPRESSION, expr));
    };
    if whole.len() < 3 {
        return Err(err(BAD_EXPRESSION, expr));
    }
    let situations = whole[1];
    if situations.list_len().is_none_or(|n| n == 0) {
        return Err(err(BAD_EXPRESSION, expr));
    }
    let run = situations
        .iter_list()
        .any(|s| matches!(s, Value::Symbol(x) if x.as_str() == "eval" || x.as_str() == "load"));
    if run {
        Ok(Rc::new(Memoized::Begin {
            body: memoize_exprs(expr.list_tail(2), env)?.into_boxed_slice(),
        }))
    } else {
        Ok(Memoized::unspecified())
    }
}

fn m_with_fluids(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    let Some(whole) = expr.list_elements() else {
        return Err(err(BAD_EXPRESSION, expr));
    };
    if whole.len() < 3 {
        return Err(err(BAD_EXPRESSION, expr));
    }
    let binds = whole[1];
    let Some(bindings) = binds.list_elements() else {
        return Err(err_in(BAD_BINDINGS, binds, expr));
    };
    let mut fluids = Vec::with_capacity(bindings.len());
    let mut vals = Vec::with_capacity(bindings.len());
    for binding in bindings {
        let Some(parts) = binding.list_elements().filter(|p| p.len() == 2) else {
            return Err(err_in(BAD_BINDING, binding, expr));
        };
        fluids.push(memoize(parts[0], env)?);
        vals.push(memoize(parts[1], env)?);
    }
    Ok(Rc::new(Memoized::WithFluids {
        fluids: fluids.into_boxed_slice(),
        vals: vals.into_boxed_slice(),
        body: memoize_sequence(expr.list_tail(2), env)?,
    }))
}

fn m_at(expr: &Value, _env: &Env) -> MemoResult<Rc<Memoized>> {
    module_ref(expr, true)
}

fn m_atat(expr: &Value, _env: &Env) -> MemoResult<Rc<Memoized>> {
    module_ref(expr, false)
}

fn module_ref(expr: &Value, public: bool) -> MemoResult<Rc<Memoized>> {
    let Some(whole) = expr.list_elements() else {
        return Err(err(BAD_EXPRESSION, expr));
    };
    if whole.len() != 3 {
        return Err(err(BAD_EXPRESSION, expr));
    }
    if whole[1].list_len().is_none_or(|n| n == 0) {
        return Err(err(BAD_EXPRESSION, expr));
    }
    let Some(name) = whole[2].as_symbol() else {
        return Err(err(BAD_EXPRESSION, expr));
    };
    Ok(Rc::new(Memoized::ModuleRef {
        module: whole[1].clone(),
        name: name.clone(),
        public,
        var: OnceCell::new(),
    }))
}

fn m_lambda(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    let tail = expr.list_tail(1);
    let Some(operands) = tail.list_elements() else {
        return Err(err(BAD_EXPRESSION, expr));
    };
    if operands.len() < 2 {
        return Err(err(MISSING_EXPRESSION, expr));
    }
    let formals = operands[0];
    if !formals.is_pair() && !matches!(formals, Value::Symbol(_) | Value::Nil) {
        return Err(err_in(BAD_FORMALS, formals, expr));
    }
    let (vars, nreq, rest) = scan_formals(formals, expr)?;
    let body = memoize_sequence(tail.list_tail(1), &env.extend(&vars))?;
    let arity = if rest {
        Arity::Rest { nreq }
    } else {
        Arity::Fixed { nreq }
    };
    Ok(Rc::new(Memoized::Lambda { body, arity }))
}

/// Validates a formals list — every formal a symbol, no duplicates, the
/// terminal either nil or a rest symbol — and collects the variables in
/// source order (rest last, so it binds at index 0).
fn scan_formals(formals: &Value, expr: &Value) -> MemoResult<(SmallVec<[Symbol; 8]>, usize, bool)> {
    // Cycle check up front; the walks below assume a finite spine.
    if spine_is_cyclic(formals) {
        return Err(err_in(BAD_FORMALS, formals, expr));
    }
    let mut vars = SmallVec::new();
    let mut nreq = 0;
    let mut cursor = formals;
    while let Value::Pair(pair) = cursor {
        let Some(formal) = pair.car.as_symbol() else {
            return Err(err_in(BAD_FORMAL, &pair.car, expr));
        };
        if improper_memq(formal, &pair.cdr) {
            return Err(err_in(DUPLICATE_FORMAL, &pair.car, expr));
        }
        nreq += 1;
        vars.push(formal.clone());
        cursor = &pair.cdr;
    }
    match cursor {
        Value::Nil => Ok((vars, nreq, false)),
        Value::Symbol(rest) => {
            vars.push(rest.clone());
            Ok((vars, nreq, true))
        }
        other => Err(err_in(BAD_FORMAL, other, expr)),
    }
}

fn spine_is_cyclic(list: &Value) -> bool {
    let mut tortoise = list;
    let mut hare = list;
    loop {
        let Value::Pair(step) = hare else { return false };
        hare = &step.cdr;
        let Value::Pair(step) = hare else { return false };
        hare = &step.cdr;
        let Value::Pair(step) = tortoise else { return false };
        tortoise = &step.cdr;
        if let (Value::Pair(a), Value::Pair(b)) = (tortoise, hare)
            && Rc::ptr_eq(a, b)
        {
            return true;
        }
    }
}

/// True if `needle` is one of the elements of `list` or its improper tail —
/// the shapes a formals list can take.
fn improper_memq(needle: &Symbol, list: &Value) -> bool {
    let mut cursor = list;
    while let Value::Pair(pair) = cursor {
        if matches!(&pair.car, Value::Symbol(s) if s == needle) {
            return true;
        }
        cursor = &pair.cdr;
    }
    matches!(cursor, Value::Symbol(s) if s == needle)
}

/* The extended lambda syntax: required, then #:optional, then #:key
 * entries, then #:allow-other-keys, then #:rest (or a dotted rest). The
 * environment is built incrementally so each init expression sees the
 * parameters before it; the rest binding comes before the keywords,
 * matching the evaluator's argument layout. */
fn m_lambda_star(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    let Some(whole) = expr.list_elements() else {
        return Err(err(BAD_EXPRESSION, expr));
    };
    if whole.len() < 3 {
        return Err(err(MISSING_EXPRESSION, expr));
    }
    let formals = whole[1];
    if spine_is_cyclic(formals) {
        return Err(err_in(BAD_FORMALS, formals, expr));
    }

    let mut cursor = formals;
    let mut req: SmallVec<[Symbol; 8]> = SmallVec::new();
    loop {
        let Value::Pair(pair) = cursor else { break };
        let Value::Symbol(formal) = &pair.car else { break };
        req.push(formal.clone());
        cursor = &pair.cdr;
    }

    let mut opt_entries: SmallVec<[&Value; 4]> = SmallVec::new();
    if let Value::Pair(pair) = cursor
        && pair.car.is_keyword_named("optional")
    {
        cursor = &pair.cdr;
        loop {
            let Value::Pair(pair) = cursor else { break };
            if !pair.car.is_pair() && pair.car.as_symbol().is_none() {
                break;
            }
            opt_entries.push(&pair.car);
            cursor = &pair.cdr;
        }
    }

    let mut kw_entries: SmallVec<[&Value; 4]> = SmallVec::new();
    if let Value::Pair(pair) = cursor
        && pair.car.is_keyword_named("key")
    {
        cursor = &pair.cdr;
        loop {
            let Value::Pair(pair) = cursor else { break };
            if !pair.car.is_pair() && pair.car.as_symbol().is_none() {
                break;
            }
            kw_entries.push(&pair.car);
            cursor = &pair.cdr;
        }
    }

    let mut allow_other_keys = false;
    if let Value::Pair(pair) = cursor
        && pair.car.is_keyword_named("allow-other-keys")
    {
        cursor = &pair.cdr;
        allow_other_keys = true;
    }

    let mut rest: Option<Symbol> = None;
    if let Value::Pair(pair) = cursor
        && pair.car.is_keyword_named("rest")
    {
        let Some(parts) = cursor.list_elements().filter(|p| p.len() == 2) else {
            return Err(err_in(BAD_FORMALS, formals, expr));
        };
        let Some(name) = parts[1].as_symbol() else {
            return Err(err_in(BAD_FORMALS, formals, expr));
        };
        rest = Some(name.clone());
    } else if let Value::Symbol(name) = cursor {
        rest = Some(name.clone());
    } else if !cursor.is_nil() {
        return Err(err_in(BAD_FORMALS, formals, expr));
    }

    let nreq = req.len();
    let nopt = opt_entries.len();
    let mut scope = env.extend(&req);
    let mut inits: Vec<Rc<Memoized>> = Vec::with_capacity(nopt + kw_entries.len());

    for entry in &opt_entries {
        if let Some(name) = entry.as_symbol() {
            inits.push(Memoized::quote(Value::Bool(false)));
            scope = scope.extend_one(name);
            continue;
        }
        let Some(parts) = entry.list_elements().filter(|p| p.len() == 2) else {
            return Err(err_in(BAD_FORMALS, formals, expr));
        };
        let Some(name) = parts[0].as_symbol() else {
            return Err(err_in(BAD_FORMALS, formals, expr));
        };
        inits.push(memoize(parts[1], &scope)?);
        scope = scope.extend_one(name);
    }

    if let Some(name) = &rest {
        scope = scope.extend_one(name);
    }

    let kw = if kw_entries.is_empty() {
        None
    } else {
        let mut index = nreq + nopt + usize::from(rest.is_some());
        let mut keywords = Vec::with_capacity(kw_entries.len());
        for entry in &kw_entries {
            let (name, keyword, init) = if let Some(name) = entry.as_symbol() {
                (name, name.clone(), Value::Bool(false))
            } else {
                let Some(parts) = entry.list_elements().filter(|p| p.len() == 2 || p.len() == 3)
                else {
                    return Err(err_in(BAD_FORMALS, formals, expr));
                };
                let Some(name) = parts[0].as_symbol() else {
                    return Err(err_in(BAD_FORMALS, formals, expr));
                };
                let keyword = if parts.len() == 3 {
                    let Value::Keyword(explicit) = parts[2] else {
                        return Err(err_in(BAD_FORMALS, formals, expr));
                    };
                    explicit.clone()
                } else {
                    name.clone()
                };
                (name, keyword, parts[1].clone())
            };
            keywords.push((keyword, index));
            index += 1;
            inits.push(memoize(&init, &scope)?);
            scope = scope.extend_one(name);
        }
        Some(KwSpec {
            allow_other_keys,
            keywords: keywords.into_boxed_slice(),
        })
    };

    let body = memoize_sequence(expr.list_tail(2), &scope)?;
    if kw.is_none() && rest.is_none() && nopt == 0 {
        return Ok(Rc::new(Memoized::Lambda {
            body,
            arity: Arity::Fixed { nreq },
        }));
    }
    if kw.is_none() && nopt == 0 {
        return Ok(Rc::new(Memoized::Lambda {
            body,
            arity: Arity::Rest { nreq },
        }));
    }
    Ok(Rc::new(Memoized::Lambda {
        body,
        arity: Arity::Full {
            nreq,
            rest: rest.is_some(),
            nopt,
            kw,
            inits: inits.into_boxed_slice(),
            alternate: None,
        },
    }))
}

fn m_case_lambda(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    case_lambda_clauses(expr, env, "lambda", m_lambda)
}

fn m_case_lambda_star(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    case_lambda_clauses(expr, env, "lambda*", m_lambda_star)
}

/// Clauses are memoized right to left, each chained as the alternate of
/// the one before it, so runtime dispatch tries them left to right.
fn case_lambda_clauses(
    expr: &Value,
    env: &Env,
    head: &str,
    lower: ExpandFn,
) -> MemoResult<Rc<Memoized>> {
    let Some(whole) = expr.list_elements() else {
        return Err(err(BAD_EXPRESSION, expr));
    };
    if whole.len() < 2 {
        return Err(err(MISSING_EXPRESSION, expr));
    }
    let mut alternate: Option<Rc<Memoized>> = None;
    for clause in whole[1..].iter().rev() {
        let form = Value::cons(Value::Symbol(sym(head)), (*clause).clone());
        alternate = Some(patch_case_lambda(lower(&form, env)?, alternate));
    }
    match alternate {
        Some(node) => Ok(node),
        None => Err(err(MISSING_EXPRESSION, expr)),
    }
}

/// Promotes a clause's arity to the full shape and hangs `alternate` off
/// its last slot.
fn patch_case_lambda(clause: Rc<Memoized>, alternate: Option<Rc<Memoized>>) -> Rc<Memoized> {
    // Clause lowering always yields a lambda node.
    let Memoized::Lambda { body, arity } = &*clause else {
        return clause;
    };
    let arity = match arity {
        Arity::Fixed { nreq } => Arity::Full {
            nreq: *nreq,
            rest: false,
            nopt: 0,
            kw: None,
            inits: Box::default(),
            alternate,
        },
        Arity::Rest { nreq } => Arity::Full {
            nreq: *nreq,
            rest: true,
            nopt: 0,
            kw: None,
            inits: Box::default(),
            alternate,
        },
        Arity::Full {
            nreq,
            rest,
            nopt,
            kw,
            inits,
            ..
        } => Arity::Full {
            nreq: *nreq,
            rest: *rest,
            nopt: *nopt,
            kw: kw.clone(),
            inits: inits.clone(),
            alternate,
        },
    };
    Rc::new(Memoized::Lambda {
        body: Rc::clone(body),
        arity,
    })
}

/// Checks that bindings have the shape `((<symbol> <init>) …)`.
fn check_bindings(bindings: &Value, expr: &Value) -> MemoResult<()> {
    let Some(items) = bindings.list_elements() else {
        return Err(err_in(BAD_BINDINGS, bindings, expr));
    };
    for binding in items {
        let Some(parts) = binding.list_elements().filter(|p| p.len() == 2) else {
            return Err(err_in(BAD_BINDING, binding, expr));
        };
        if parts[0].as_symbol().is_none() {
            return Err(err_in(BAD_VARIABLE, parts[0], expr));
        }
    }
    Ok(())
}

/// Splits validated bindings into variables (source order) and init
/// expressions, rejecting duplicate names.
fn transform_bindings<'a>(
    bindings: &'a Value,
    expr: &Value,
) -> MemoResult<(SmallVec<[Symbol; 8]>, SmallVec<[&'a Value; 8]>)> {
    check_bindings(bindings, expr)?;
    let mut vars = SmallVec::new();
    let mut inits = SmallVec::new();
    for binding in bindings.iter_list() {
        // Shapes were validated by check_bindings.
        let Some(pair) = binding.as_pair() else { continue };
        let Some(name) = pair.car.as_symbol() else { continue };
        if vars.contains(name) {
            return Err(err_in(DUPLICATE_BINDING, &pair.car, expr));
        }
        vars.push(name.clone());
        if let Some(init_pair) = pair.cdr.as_pair() {
            inits.push(&init_pair.car);
        }
    }
    Ok((vars, inits))
}

fn memoize_inits(inits: &[&Value], env: &Env) -> MemoResult<Box<[Rc<Memoized>]>> {
    inits
        .iter()
        .map(|init| memoize(init, env))
        .collect::<MemoResult<Vec<_>>>()
        .map(Vec::into_boxed_slice)
}

fn m_let(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    let tail = expr.list_tail(1);
    let Some(operands) = tail.list_elements() else {
        return Err(err(BAD_EXPRESSION, expr));
    };
    if operands.len() < 2 {
        return Err(err(MISSING_EXPRESSION, expr));
    }
    let bindings = operands[0];
    if let Value::Symbol(name) = bindings {
        if operands.len() < 3 {
            return Err(err(MISSING_EXPRESSION, expr));
        }
        return memoize_named_let(name, operands[1], tail.list_tail(2), expr, env);
    }
    if bindings.is_nil() {
        return memoize_sequence(tail.list_tail(1), env);
    }
    let (vars, inits) = transform_bindings(bindings, expr)?;
    Ok(Rc::new(Memoized::Let {
        inits: memoize_inits(&inits, env)?,
        body: memoize_sequence(tail.list_tail(1), &env.extend(&vars))?,
    }))
}

/// `(let name ((var init) …) body …)` lowers as
/// `((letrec ((name (lambda (var …) body …))) name) init …)` would: a
/// one-slot `Let` holding the loop procedure, set by the first body form
/// and called by the second. The inits see the loop name in scope.
fn memoize_named_let(
    name: &Symbol,
    bindings: &Value,
    body_forms: &Value,
    expr: &Value,
    env: &Env,
) -> MemoResult<Rc<Memoized>> {
    let (vars, inits) = transform_bindings(bindings, expr)?;
    let nreq = vars.len();
    let loop_env = env.extend_one(name);
    let lambda = Rc::new(Memoized::Lambda {
        body: memoize_sequence(body_forms, &loop_env.extend(&vars))?,
        arity: Arity::Fixed { nreq },
    });
    let call = Rc::new(Memoized::Call {
        proc: Memoized::lexical_ref(0),
        args: memoize_inits(&inits, &loop_env)?,
    });
    Ok(Rc::new(Memoized::Let {
        inits: vec![Memoized::quote(Value::Undefined)].into_boxed_slice(),
        body: Rc::new(Memoized::Begin {
            body: vec![
                Rc::new(Memoized::LexicalSet {
                    index: 0,
                    value: lambda,
                }),
                call,
            ]
            .into_boxed_slice(),
        }),
    }))
}

/// `letrec` allocates undefined slots, evaluates the inits into a second
/// frame (they may not observe the values, only the slots), then copies
/// them over before running the body.
fn m_letrec(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    let tail = expr.list_tail(1);
    let Some(operands) = tail.list_elements() else {
        return Err(err(BAD_EXPRESSION, expr));
    };
    if operands.len() < 2 {
        return Err(err(MISSING_EXPRESSION, expr));
    }
    let bindings = operands[0];
    let body_forms = tail.list_tail(1);
    if bindings.is_nil() {
        return memoize_sequence(body_forms, env);
    }
    let (vars, inits) = transform_bindings(bindings, expr)?;
    let n = vars.len();
    let new_env = env.extend(&vars);
    let vals = inits
        .iter()
        .map(|init| memoize(init, &new_env))
        .collect::<MemoResult<Vec<_>>>()?;
    let undefs = (0..n)
        .map(|_| Memoized::quote(Value::Undefined))
        .collect::<Vec<_>>();
    // Inner frame slot k holds the value for outer slot n + k.
    let sets = (0..n)
        .map(|k| {
            Rc::new(Memoized::LexicalSet {
                index: n + k,
                value: Memoized::lexical_ref(k),
            })
        })
        .collect::<Vec<_>>();
    Ok(Rc::new(Memoized::Let {
        inits: undefs.into_boxed_slice(),
        body: Rc::new(Memoized::Begin {
            body: vec![
                Rc::new(Memoized::Let {
                    inits: vals.into_boxed_slice(),
                    body: Rc::new(Memoized::Begin {
                        body: sets.into_boxed_slice(),
                    }),
                }),
                memoize_sequence(body_forms, &new_env)?,
            ]
            .into_boxed_slice(),
        }),
    }))
}

fn m_letstar(expr: &Value, env: &Env) -> MemoResult<Rc<Memoized>> {
    let tail = expr.list_tail(1);
    let Some(operands) = tail.list_elements() else {
        return Err(err(BAD_EXPRESSION, expr));
    };
    if operands.len() < 2 {
        return Err(err(MISSING_EXPRESSION, expr));
    }
    let bindings = operands[0];
    let body_forms = tail.list_tail(1);
    if bindings.is_nil() {
        return memoize_sequence(body_forms, env);
    }
    let (vars, inits) = transform_bindings(bindings, expr)?;
    letstar_chain(&vars, &inits, body_forms, env)
}

/// One nested `Let` per binding; the environment grows a step at a time.
fn letstar_chain(
    vars: &[Symbol],
    inits: &[&Value],
    body_forms: &Value,
    env: &Env,
) -> MemoResult<Rc<Memoized>> {
    let (Some((var, rest_vars)), Some((init, rest_inits))) =
        (vars.split_first(), inits.split_first())
    else {
        return memoize_sequence(body_forms, env);
    };
    let lowered = memoize(init, env)?;
    let inner = env.extend_one(var);
    Ok(Rc::new(Memoized::Let {
        inits: vec![lowered].into_boxed_slice(),
        body: letstar_chain(rest_vars, rest_inits, body_forms, &inner)?,
    }))
}

fn memo_apply(args: &[Rc<Memoized>]) -> Rc<Memoized> {
    Rc::new(Memoized::Apply {
        proc: Rc::clone(&args[0]),
        args: Rc::clone(&args[1]),
    })
}

fn memo_call_cc(args: &[Rc<Memoized>]) -> Rc<Memoized> {
    Rc::new(Memoized::CallCc {
        proc: Rc::clone(&args[0]),
    })
}

fn memo_call_with_values(args: &[Rc<Memoized>]) -> Rc<Memoized> {
    Rc::new(Memoized::CallWithValues {
        producer: Rc::clone(&args[0]),
        consumer: Rc::clone(&args[1]),
    })
}

fn memo_dynamic_wind(args: &[Rc<Memoized>]) -> Rc<Memoized> {
    Rc::new(Memoized::Dynwind {
        pre: Rc::clone(&args[0]),
        expr: Rc::clone(&args[1]),
        post: Rc::clone(&args[2]),
    })
}

fn memo_prompt(args: &[Rc<Memoized>]) -> Rc<Memoized> {
    Rc::new(Memoized::Prompt {
        tag: Rc::clone(&args[0]),
        expr: Rc::clone(&args[1]),
        handler: Rc::clone(&args[2]),
    })
}
