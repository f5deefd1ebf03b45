//! The Scheme datum type.
//!
//! [`Value`] is the tree the reader produces and the memoizer consumes. It
//! uses a hybrid layout in the interpreter's usual style: small immediate
//! values (booleans, fixnum integers, characters) are stored inline, while
//! shared structures (pairs, strings, big integers, memoized trees) sit
//! behind `Rc`. Pairs optionally carry the source-location properties the
//! reader attaches; these feed error messages and never enter memoized
//! trees.

use std::{fmt, rc::Rc};

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use smallvec::SmallVec;

use crate::{
    intern::Symbol,
    memo::Memoized,
    memoize::{MemoizerPrim, SyntaxTransformer},
    variable::Variable,
};

/// Filename/line annotation attached to a pair by the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Srcloc {
    pub file: Option<Rc<str>>,
    pub line: u32,
}

/// A cons cell. The source property, when present, locates the opening
/// parenthesis of the list this pair begins.
#[derive(Debug)]
pub struct Pair {
    pub car: Value,
    pub cdr: Value,
    src: Option<Srcloc>,
}

/// A Scheme value.
#[derive(Debug, Clone)]
pub enum Value {
    /// The empty list, `()`.
    Nil,
    Bool(bool),
    /// An exact integer within `i64` range.
    Int(i64),
    /// An exact integer outside `i64` range.
    Big(Rc<BigInt>),
    Float(f64),
    Char(char),
    Str(Rc<str>),
    Symbol(Symbol),
    /// A self-evaluating keyword, written `#:name`.
    Keyword(Symbol),
    Pair(Rc<Pair>),
    /// The unspecified value produced by one-armed `if` and friends.
    Unspecified,
    /// The unbound marker filling `letrec` slots before initialisation.
    Undefined,
    /// A mutable variable cell belonging to some module.
    Variable(Variable),
    /// A memoized expression tree.
    Memoized(Rc<Memoized>),
    /// A syntax transformer: lowers a whole source form during memoization.
    Syntax(Rc<SyntaxTransformer>),
    /// A memoizer primitive: emits one node from already-memoized operands.
    Memoizer(Rc<MemoizerPrim>),
}

impl Value {
    /// Conses `car` onto `cdr` with no source property.
    pub fn cons(car: Self, cdr: Self) -> Self {
        Self::Pair(Rc::new(Pair {
            car,
            cdr,
            src: None,
        }))
    }

    /// Conses with a source property attached to the new pair.
    pub fn cons_source(car: Self, cdr: Self, src: Option<Srcloc>) -> Self {
        Self::Pair(Rc::new(Pair { car, cdr, src }))
    }

    /// Builds a proper list from `items`.
    pub fn list(items: Vec<Self>) -> Self {
        let mut out = Self::Nil;
        for item in items.into_iter().rev() {
            out = Self::cons(item, out);
        }
        out
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    #[inline]
    pub fn is_pair(&self) -> bool {
        matches!(self, Self::Pair(_))
    }

    /// Scheme truthiness: everything except `#f` is true.
    #[inline]
    pub fn is_true(&self) -> bool {
        !matches!(self, Self::Bool(false))
    }

    #[inline]
    pub fn is_memoized(&self) -> bool {
        matches!(self, Self::Memoized(_))
    }

    #[inline]
    pub fn is_memoizer(&self) -> bool {
        matches!(self, Self::Memoizer(_))
    }

    #[inline]
    pub fn as_pair(&self) -> Option<&Pair> {
        match self {
            Self::Pair(p) => Some(p),
            _ => None,
        }
    }

    #[inline]
    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Self::Symbol(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_memoized(&self) -> Option<&Rc<Memoized>> {
        match self {
            Self::Memoized(m) => Some(m),
            _ => None,
        }
    }

    #[inline]
    pub fn as_memoizer(&self) -> Option<&Rc<MemoizerPrim>> {
        match self {
            Self::Memoizer(m) => Some(m),
            _ => None,
        }
    }

    /// True for the keyword written `#:name`.
    pub(crate) fn is_keyword_named(&self, name: &str) -> bool {
        matches!(self, Self::Keyword(k) if k.as_str() == name)
    }

    /// The source property of this value, if it is a pair that carries one.
    pub fn source_location(&self) -> Option<&Srcloc> {
        match self {
            Self::Pair(p) => p.src.as_ref(),
            _ => None,
        }
    }

    /// The length of a proper list; `None` for non-lists, improper lists,
    /// and cyclic structures (tortoise-and-hare walk).
    pub fn list_len(&self) -> Option<usize> {
        let mut tortoise = self;
        let mut hare = self;
        let mut len = 0;
        loop {
            match hare {
                Self::Nil => return Some(len),
                Self::Pair(p) => {
                    hare = &p.cdr;
                    len += 1;
                }
                _ => return None,
            }
            match hare {
                Self::Nil => return Some(len),
                Self::Pair(p) => {
                    hare = &p.cdr;
                    len += 1;
                }
                _ => return None,
            }
            // The tortoise advances one pair per two hare steps; they can
            // only meet on a cycle.
            let Self::Pair(t) = tortoise else {
                return None;
            };
            tortoise = &t.cdr;
            if let (Self::Pair(a), Self::Pair(b)) = (tortoise, hare)
                && Rc::ptr_eq(a, b)
            {
                return None;
            }
        }
    }

    /// Collects the elements of a proper list; `None` under the same
    /// conditions as [`Value::list_len`].
    pub(crate) fn list_elements(&self) -> Option<SmallVec<[&Self; 8]>> {
        let len = self.list_len()?;
        let mut out = SmallVec::with_capacity(len);
        let mut cursor = self;
        while let Self::Pair(p) = cursor {
            out.push(&p.car);
            cursor = &p.cdr;
        }
        Some(out)
    }

    /// Follows `cdr` up to `k` times, stopping early at a non-pair.
    pub(crate) fn list_tail(&self, k: usize) -> &Self {
        let mut cursor = self;
        for _ in 0..k {
            match cursor {
                Self::Pair(p) => cursor = &p.cdr,
                _ => break,
            }
        }
        cursor
    }

    /// An iterator over the cars of this value's pair spine.
    pub fn iter_list(&self) -> ListIter<'_> {
        ListIter { cursor: self }
    }

    /// Structural equality in the manner of `equal?`. Exact integers
    /// compare numerically across the fixnum/bignum split; shared objects
    /// (variables, memoized trees, transformers) compare by identity.
    pub fn equal(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil)
            | (Self::Unspecified, Self::Unspecified)
            | (Self::Undefined, Self::Undefined) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Big(a), Self::Big(b)) => a == b,
            (Self::Int(a), Self::Big(b)) | (Self::Big(b), Self::Int(a)) => **b == BigInt::from(*a),
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Char(a), Self::Char(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) | (Self::Keyword(a), Self::Keyword(b)) => a == b,
            (Self::Pair(a), Self::Pair(b)) => {
                Rc::ptr_eq(a, b) || (a.car.equal(&b.car) && a.cdr.equal(&b.cdr))
            }
            (Self::Variable(a), Self::Variable(b)) => a == b,
            (Self::Memoized(a), Self::Memoized(b)) => Rc::ptr_eq(a, b),
            (Self::Syntax(a), Self::Syntax(b)) => Rc::ptr_eq(a, b),
            (Self::Memoizer(a), Self::Memoizer(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// See [`Value::iter_list`]. After exhaustion, [`ListIter::remainder`]
/// exposes the terminal value (nil for proper lists).
pub struct ListIter<'a> {
    cursor: &'a Value,
}

impl<'a> ListIter<'a> {
    pub fn remainder(&self) -> &'a Value {
        self.cursor
    }
}

impl<'a> Iterator for ListIter<'a> {
    type Item = &'a Value;

    fn next(&mut self) -> Option<&'a Value> {
        match self.cursor {
            Value::Pair(p) => {
                self.cursor = &p.cdr;
                Some(&p.car)
            }
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<Symbol> for Value {
    fn from(v: Symbol) -> Self {
        Self::Symbol(v)
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self {
        // Demote to a fixnum when the magnitude permits.
        match v.to_i64() {
            Some(i) => Self::Int(i),
            None => Self::Big(Rc::new(v)),
        }
    }
}

/// Reader sugar recognised by the printer: `(quote x)` prints as `'x`, and
/// likewise for quasiquotation.
fn quote_sugar(pair: &Pair) -> Option<(&'static str, &Value)> {
    let head = pair.car.as_symbol()?;
    let prefix = match head.as_str() {
        "quote" => "'",
        "quasiquote" => "`",
        "unquote" => ",",
        "unquote-splicing" => ",@",
        _ => return None,
    };
    match pair.cdr.as_pair() {
        Some(rest) if rest.cdr.is_nil() => Some((prefix, &rest.car)),
        _ => None,
    }
}

impl fmt::Display for Value {
    /// Prints in `write` notation: strings quoted, characters in `#\`
    /// syntax, quotation sugared.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("()"),
            Self::Bool(true) => f.write_str("#t"),
            Self::Bool(false) => f.write_str("#f"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Big(b) => write!(f, "{b}"),
            Self::Float(x) => {
                if x.is_nan() {
                    f.write_str("+nan.0")
                } else if x.is_infinite() {
                    f.write_str(if *x < 0.0 { "-inf.0" } else { "+inf.0" })
                } else {
                    write!(f, "{x:?}")
                }
            }
            Self::Char(' ') => f.write_str("#\\space"),
            Self::Char('\n') => f.write_str("#\\newline"),
            Self::Char('\t') => f.write_str("#\\tab"),
            Self::Char(c) => write!(f, "#\\{c}"),
            Self::Str(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        '\r' => f.write_str("\\r")?,
                        _ => write!(f, "{c}")?,
                    }
                }
                f.write_str("\"")
            }
            Self::Symbol(s) => write!(f, "{s}"),
            Self::Keyword(k) => write!(f, "#:{k}"),
            Self::Pair(p) => {
                if let Some((prefix, datum)) = quote_sugar(p) {
                    return write!(f, "{prefix}{datum}");
                }
                f.write_str("(")?;
                write!(f, "{}", p.car)?;
                let mut cursor = &p.cdr;
                loop {
                    match cursor {
                        Self::Nil => break,
                        Self::Pair(q) => {
                            write!(f, " {}", q.car)?;
                            cursor = &q.cdr;
                        }
                        other => {
                            write!(f, " . {other}")?;
                            break;
                        }
                    }
                }
                f.write_str(")")
            }
            Self::Unspecified => f.write_str("#<unspecified>"),
            Self::Undefined => f.write_str("#<undefined>"),
            Self::Variable(v) => write!(f, "{v}"),
            Self::Memoized(m) => write!(f, "{m}"),
            Self::Syntax(t) => write!(f, "#<syntax {}>", t.name()),
            Self::Memoizer(m) => write!(f, "#<memoizer {}>", m.name()),
        }
    }
}
