//! Exception kinds and message rendering.
//!
//! The memoizer reports two user-visible failure categories: syntax errors
//! raised while lowering a form, and unbound-variable errors raised when the
//! variable cache resolves a reference. Both carry a pre-rendered message in
//! the interpreter's traditional format; the machine-readable key is the
//! [`ExcKind`].

use std::{error, fmt, fmt::Write};

use strum::{Display, EnumString, IntoStaticStr};

use crate::{intern::Symbol, value::Value};

/// Result type alias for operations that can raise an [`Exception`].
pub type MemoResult<T> = Result<T, Exception>;

/// The exception key, one of the interpreter's fixed error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum ExcKind {
    /// A malformed special form detected during memoization.
    #[strum(serialize = "syntax-error")]
    SyntaxError,
    /// A top-level or module reference that resolves to no bound variable.
    #[strum(serialize = "unbound-variable")]
    UnboundVariable,
    /// An operand of the wrong type handed to an internal operation.
    #[strum(serialize = "wrong-type-arg")]
    WrongTypeArg,
    /// A memoizer primitive applied to the wrong number of operands.
    #[strum(serialize = "wrong-number-of-args")]
    WrongNumberOfArgs,
    /// A failure while reading S-expressions from text.
    #[strum(serialize = "read-error")]
    ReadError,
}

/// An error raised by the reader, the memoizer, or the variable cache.
#[derive(Debug, Clone)]
pub struct Exception {
    kind: ExcKind,
    message: String,
}

impl Exception {
    /// The exception's category key.
    #[inline]
    pub fn kind(&self) -> ExcKind {
        self.kind
    }

    /// The rendered, human-readable message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Builds a syntax error for `form`, optionally naming the enclosing
    /// expression.
    ///
    /// The filename and line are taken from `form`'s source properties,
    /// falling back to the enclosing expression's. The message renders as
    /// `In file "f", line n: <message> <form> in expression <expr>.`, with
    /// the location and expression parts dropped when unavailable.
    pub(crate) fn syntax_error(message: &str, form: &Value, expr: Option<&Value>) -> Self {
        let src = form
            .source_location()
            .or_else(|| expr.and_then(Value::source_location));
        let mut text = String::new();
        if let Some(src) = src {
            match &src.file {
                Some(file) => {
                    let _ = write!(text, "In file \"{file}\", line {}: ", src.line);
                }
                None => {
                    let _ = write!(text, "In line {}: ", src.line);
                }
            }
        }
        let _ = write!(text, "{message} {form}");
        if let Some(expr) = expr {
            let _ = write!(text, " in expression {expr}");
        }
        text.push('.');
        Self {
            kind: ExcKind::SyntaxError,
            message: text,
        }
    }

    pub(crate) fn unbound_variable(symbol: &Symbol) -> Self {
        Self {
            kind: ExcKind::UnboundVariable,
            message: format!("Unbound variable: {symbol}"),
        }
    }

    pub(crate) fn wrong_type_arg(subr: &str, pos: usize, value: &dyn fmt::Display) -> Self {
        Self {
            kind: ExcKind::WrongTypeArg,
            message: format!("{subr}: Wrong type argument in position {pos}: {value}"),
        }
    }

    pub(crate) fn wrong_number_of_args(subr: &str) -> Self {
        Self {
            kind: ExcKind::WrongNumberOfArgs,
            message: format!("Wrong number of arguments to {subr}"),
        }
    }

    pub(crate) fn read_error(file: Option<&str>, line: u32, message: &str) -> Self {
        let text = match file {
            Some(file) => format!("{file}:{line}: {message}"),
            None => format!("line {line}: {message}"),
        };
        Self {
            kind: ExcKind::ReadError,
            message: text,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl error::Error for Exception {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_keys_render_as_scheme_symbols() {
        assert_eq!(ExcKind::SyntaxError.to_string(), "syntax-error");
        assert_eq!(ExcKind::UnboundVariable.to_string(), "unbound-variable");
        assert_eq!(ExcKind::WrongNumberOfArgs.to_string(), "wrong-number-of-args");
    }

    #[test]
    fn kind_keys_parse_back() {
        assert_eq!("read-error".parse::<ExcKind>().unwrap(), ExcKind::ReadError);
        assert!("no-such-key".parse::<ExcKind>().is_err());
    }
}
