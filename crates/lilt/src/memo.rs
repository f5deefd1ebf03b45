//! The memoized intermediate representation.
//!
//! A memoized expression is a tree of nineteen tagged node kinds — the
//! entire core language the evaluator walks. Nodes are immutable after
//! construction except the four variable-reference kinds, whose cached
//! [`Variable`] cell is published once by the variable cache
//! (see `variable.rs`).
//!
//! [`Typecode`] is the fixed tag vocabulary shared with the evaluator; its
//! integer values and names must not be reordered.

use std::{cell::OnceCell, fmt, rc::Rc};

use strum::{EnumString, FromRepr, IntoStaticStr};

use crate::{intern::Symbol, unmemoize::unmemoize_expression, value::Value, variable::Variable};

/// Integer tags of the nineteen memoized node kinds, in evaluator order.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, FromRepr, IntoStaticStr)]
pub enum Typecode {
    #[strum(serialize = "begin")]
    Begin = 0,
    #[strum(serialize = "if")]
    If = 1,
    #[strum(serialize = "lambda")]
    Lambda = 2,
    #[strum(serialize = "let")]
    Let = 3,
    #[strum(serialize = "quote")]
    Quote = 4,
    #[strum(serialize = "define")]
    Define = 5,
    #[strum(serialize = "dynwind")]
    Dynwind = 6,
    #[strum(serialize = "with-fluids")]
    WithFluids = 7,
    #[strum(serialize = "apply")]
    Apply = 8,
    #[strum(serialize = "call/cc")]
    CallCc = 9,
    #[strum(serialize = "call-with-values")]
    CallWithValues = 10,
    #[strum(serialize = "call")]
    Call = 11,
    #[strum(serialize = "lexical-ref")]
    LexicalRef = 12,
    #[strum(serialize = "lexical-set!")]
    LexicalSet = 13,
    #[strum(serialize = "toplevel-ref")]
    ToplevelRef = 14,
    #[strum(serialize = "toplevel-set!")]
    ToplevelSet = 15,
    #[strum(serialize = "module-ref")]
    ModuleRef = 16,
    #[strum(serialize = "module-set!")]
    ModuleSet = 17,
    #[strum(serialize = "prompt")]
    Prompt = 18,
}

impl Typecode {
    /// The tag as the integer the evaluator dispatches on.
    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// The tag's name in the fixed vocabulary.
    #[inline]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Looks a tag up by name; `None` for names outside the vocabulary.
    pub fn from_name(name: &str) -> Option<Self> {
        name.parse().ok()
    }

    /// Looks a tag up by integer value.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::from_repr(code)
    }
}

impl fmt::Display for Typecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Keyword-argument portion of a [`Arity::Full`] spec: whether unknown
/// keywords are tolerated, and each keyword's binding-slot index.
#[derive(Debug, Clone)]
pub struct KwSpec {
    pub allow_other_keys: bool,
    pub keywords: Box<[(Symbol, usize)]>,
}

/// The parameter shape of a [`Memoized::Lambda`].
///
/// `Full` carries one init expression per optional and keyword parameter
/// (`inits.len() == nopt + keywords`), each evaluated with the earlier
/// parameters in scope, and the next `case-lambda` clause in `alternate`.
#[derive(Debug)]
pub enum Arity {
    Fixed {
        nreq: usize,
    },
    /// Fixed parameters plus a rest list collecting the remainder.
    Rest {
        nreq: usize,
    },
    Full {
        nreq: usize,
        rest: bool,
        nopt: usize,
        kw: Option<KwSpec>,
        inits: Box<[Rc<Memoized>]>,
        alternate: Option<Rc<Memoized>>,
    },
}

/// A memoized expression.
///
/// Binding constructs store no names: lexical references are de Bruijn-style
/// indices into the current frame, most recently bound first.
#[derive(Debug)]
pub enum Memoized {
    Begin {
        body: Box<[Rc<Memoized>]>,
    },
    If {
        test: Rc<Memoized>,
        then: Rc<Memoized>,
        alt: Rc<Memoized>,
    },
    Lambda {
        body: Rc<Memoized>,
        arity: Arity,
    },
    /// Evaluates `inits` in the enclosing scope, pushes them as a new
    /// frame (last init at index 0), then evaluates `body`.
    Let {
        inits: Box<[Rc<Memoized>]>,
        body: Rc<Memoized>,
    },
    Quote {
        datum: Value,
    },
    Define {
        name: Symbol,
        value: Rc<Memoized>,
    },
    Dynwind {
        pre: Rc<Memoized>,
        expr: Rc<Memoized>,
        post: Rc<Memoized>,
    },
    WithFluids {
        fluids: Box<[Rc<Memoized>]>,
        vals: Box<[Rc<Memoized>]>,
        body: Rc<Memoized>,
    },
    Apply {
        proc: Rc<Memoized>,
        args: Rc<Memoized>,
    },
    /// Calls `proc` with the current continuation.
    CallCc {
        proc: Rc<Memoized>,
    },
    CallWithValues {
        producer: Rc<Memoized>,
        consumer: Rc<Memoized>,
    },
    Call {
        proc: Rc<Memoized>,
        args: Box<[Rc<Memoized>]>,
    },
    LexicalRef {
        index: usize,
    },
    LexicalSet {
        index: usize,
        value: Rc<Memoized>,
    },
    /// A top-level reference, resolved to its variable cell on first use.
    ToplevelRef {
        name: Symbol,
        var: OnceCell<Variable>,
    },
    ToplevelSet {
        name: Symbol,
        var: OnceCell<Variable>,
        value: Rc<Memoized>,
    },
    /// A `(@ mod name)` / `(@@ mod name)` reference; `module` is the
    /// module-name list, `public` selects the public interface.
    ModuleRef {
        module: Value,
        name: Symbol,
        public: bool,
        var: OnceCell<Variable>,
    },
    ModuleSet {
        value: Rc<Memoized>,
        module: Value,
        name: Symbol,
        public: bool,
        var: OnceCell<Variable>,
    },
    Prompt {
        tag: Rc<Memoized>,
        expr: Rc<Memoized>,
        handler: Rc<Memoized>,
    },
}

impl Memoized {
    /// A quotation node.
    pub(crate) fn quote(datum: Value) -> Rc<Self> {
        Rc::new(Self::Quote { datum })
    }

    /// The quoted unspecified value, the filler for missing branches.
    pub(crate) fn unspecified() -> Rc<Self> {
        Self::quote(Value::Unspecified)
    }

    pub(crate) fn lexical_ref(index: usize) -> Rc<Self> {
        Rc::new(Self::LexicalRef { index })
    }

    pub(crate) fn toplevel_ref(name: Symbol) -> Rc<Self> {
        Rc::new(Self::ToplevelRef {
            name,
            var: OnceCell::new(),
        })
    }

    /// This node's tag.
    pub fn typecode(&self) -> Typecode {
        match self {
            Self::Begin { .. } => Typecode::Begin,
            Self::If { .. } => Typecode::If,
            Self::Lambda { .. } => Typecode::Lambda,
            Self::Let { .. } => Typecode::Let,
            Self::Quote { .. } => Typecode::Quote,
            Self::Define { .. } => Typecode::Define,
            Self::Dynwind { .. } => Typecode::Dynwind,
            Self::WithFluids { .. } => Typecode::WithFluids,
            Self::Apply { .. } => Typecode::Apply,
            Self::CallCc { .. } => Typecode::CallCc,
            Self::CallWithValues { .. } => Typecode::CallWithValues,
            Self::Call { .. } => Typecode::Call,
            Self::LexicalRef { .. } => Typecode::LexicalRef,
            Self::LexicalSet { .. } => Typecode::LexicalSet,
            Self::ToplevelRef { .. } => Typecode::ToplevelRef,
            Self::ToplevelSet { .. } => Typecode::ToplevelSet,
            Self::ModuleRef { .. } => Typecode::ModuleRef,
            Self::ModuleSet { .. } => Typecode::ModuleSet,
            Self::Prompt { .. } => Typecode::Prompt,
        }
    }

    /// Re-encodes the node's payload in the raw pair layout the bootstrap
    /// evaluator historically consumed. Diagnostic and introspection use
    /// only.
    pub fn data(&self) -> Value {
        match self {
            Self::Begin { body } => memo_list(body),
            Self::If { test, then, alt } => Value::cons(
                memo_value(test),
                Value::cons(memo_value(then), memo_value(alt)),
            ),
            Self::Lambda { body, arity } => Value::cons(memo_value(body), arity_data(arity)),
            Self::Let { inits, body } => Value::cons(memo_list(inits), memo_value(body)),
            Self::Quote { datum } => datum.clone(),
            Self::Define { name, value } => {
                Value::cons(Value::Symbol(name.clone()), memo_value(value))
            }
            Self::Dynwind { pre, expr, post } => Value::cons(
                memo_value(pre),
                Value::cons(memo_value(expr), memo_value(post)),
            ),
            Self::WithFluids { fluids, vals, body } => Value::cons(
                memo_list(fluids),
                Value::cons(memo_list(vals), memo_value(body)),
            ),
            Self::Apply { proc, args } => Value::list(vec![memo_value(proc), memo_value(args)]),
            Self::CallCc { proc } => memo_value(proc),
            Self::CallWithValues { producer, consumer } => {
                Value::cons(memo_value(producer), memo_value(consumer))
            }
            Self::Call { proc, args } => Value::cons(
                memo_value(proc),
                Value::cons(int_value(args.len()), memo_list(args)),
            ),
            Self::LexicalRef { index } => int_value(*index),
            Self::LexicalSet { index, value } => {
                Value::cons(int_value(*index), memo_value(value))
            }
            Self::ToplevelRef { name, var } => match var.get() {
                Some(cell) => Value::Variable(cell.clone()),
                None => Value::Symbol(name.clone()),
            },
            Self::ToplevelSet { name, var, value } => {
                let target = match var.get() {
                    Some(cell) => Value::Variable(cell.clone()),
                    None => Value::Symbol(name.clone()),
                };
                Value::cons(target, memo_value(value))
            }
            Self::ModuleRef {
                module,
                name,
                public,
                var,
            } => match var.get() {
                Some(cell) => Value::Variable(cell.clone()),
                None => Value::cons(
                    module.clone(),
                    Value::cons(Value::Symbol(name.clone()), Value::Bool(*public)),
                ),
            },
            Self::ModuleSet {
                value,
                module,
                name,
                public,
                var,
            } => {
                let target = match var.get() {
                    Some(cell) => Value::Variable(cell.clone()),
                    None => Value::cons(
                        module.clone(),
                        Value::cons(Value::Symbol(name.clone()), Value::Bool(*public)),
                    ),
                };
                Value::cons(memo_value(value), target)
            }
            Self::Prompt { tag, expr, handler } => Value::cons(
                memo_value(tag),
                Value::cons(memo_value(expr), memo_value(handler)),
            ),
        }
    }
}

fn memo_value(node: &Rc<Memoized>) -> Value {
    Value::Memoized(Rc::clone(node))
}

fn memo_list(nodes: &[Rc<Memoized>]) -> Value {
    Value::list(nodes.iter().map(memo_value).collect())
}

fn int_value(n: usize) -> Value {
    Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

/// Keyword spec in raw form: `#f`, or `(allow-other-keys? (kw . index) …)`.
pub(crate) fn kw_spec_data(kw: Option<&KwSpec>) -> Value {
    match kw {
        None => Value::Bool(false),
        Some(spec) => {
            let pairs = spec
                .keywords
                .iter()
                .map(|(sym, index)| {
                    Value::cons(Value::Keyword(sym.clone()), int_value(*index))
                })
                .collect();
            Value::cons(Value::Bool(spec.allow_other_keys), Value::list(pairs))
        }
    }
}

fn arity_data(arity: &Arity) -> Value {
    match arity {
        Arity::Fixed { nreq } => Value::list(vec![int_value(*nreq)]),
        Arity::Rest { nreq } => Value::list(vec![int_value(*nreq), Value::Bool(true)]),
        Arity::Full {
            nreq,
            rest,
            nopt,
            kw,
            inits,
            alternate,
        } => Value::list(vec![
            int_value(*nreq),
            Value::Bool(*rest),
            int_value(*nopt),
            kw_spec_data(kw.as_ref()),
            memo_list(inits),
            match alternate {
                Some(alt) => memo_value(alt),
                None => Value::Bool(false),
            },
        ]),
    }
}

impl fmt::Display for Memoized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<memoized {}>", unmemoize_expression(self))
    }
}
