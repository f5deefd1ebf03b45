//! A small S-expression reader.
//!
//! Produces [`Value`] trees from text, attaching filename/line source
//! properties to the outermost pair of each list read. The memoizer
//! consults those properties only for error messages.
//!
//! Supported notation: proper and dotted lists with `()` or `[]`,
//! `#t`/`#f` (long forms included), characters (`#\a`, `#\space`,
//! `#\newline`, `#\tab`), strings with the usual escapes, exact integers
//! with bignum overflow, floats, keywords (`#:name`), symbols, the
//! quotation prefixes `'` `` ` `` `,` `,@`, and `;` line comments.

use std::rc::Rc;

use num_bigint::BigInt;

use crate::{
    error::{Exception, MemoResult},
    intern::Symbol,
    value::{Srcloc, Value},
};

pub struct Reader<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    file: Option<Rc<str>>,
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | '"' | ';')
}

impl<'a> Reader<'a> {
    pub fn new(src: &'a str, file: Option<&str>) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            file: file.map(Rc::from),
        }
    }

    /// Reads the next datum, or `None` at end of input.
    pub fn read(&mut self) -> MemoResult<Option<Value>> {
        self.skip_trivia();
        if self.peek().is_none() {
            return Ok(None);
        }
        self.read_datum().map(Some)
    }

    /// Reads every datum up to end of input.
    pub fn read_all(mut self) -> MemoResult<Vec<Value>> {
        let mut out = Vec::new();
        while let Some(datum) = self.read()? {
            out.push(datum);
        }
        Ok(out)
    }

    /// Reads the first datum, requiring at least one.
    pub fn read_one(mut self) -> MemoResult<Value> {
        match self.read()? {
            Some(datum) => Ok(datum),
            None => Err(self.error("no expression found")),
        }
    }

    fn error(&self, message: &str) -> Exception {
        Exception::read_error(self.file.as_deref(), self.line, message)
    }

    fn error_at(&self, line: u32, message: &str) -> Exception {
        Exception::read_error(self.file.as_deref(), line, message)
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.rest().chars();
        chars.next();
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else if c == ';' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn require_datum(&mut self, context: &str) -> MemoResult<Value> {
        self.skip_trivia();
        if self.peek().is_none() {
            return Err(self.error(context));
        }
        self.read_datum()
    }

    fn read_datum(&mut self) -> MemoResult<Value> {
        let line = self.line;
        match self.peek() {
            Some('(') => {
                self.bump();
                self.read_list(')', line)
            }
            Some('[') => {
                self.bump();
                self.read_list(']', line)
            }
            Some(')' | ']') => Err(self.error("unexpected close parenthesis")),
            Some('\'') => {
                self.bump();
                self.read_quoted("quote")
            }
            Some('`') => {
                self.bump();
                self.read_quoted("quasiquote")
            }
            Some(',') => {
                self.bump();
                if self.peek() == Some('@') {
                    self.bump();
                    self.read_quoted("unquote-splicing")
                } else {
                    self.read_quoted("unquote")
                }
            }
            Some('"') => self.read_string(),
            Some('#') => self.read_hash(),
            Some(_) => self.read_atom(),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn read_quoted(&mut self, head: &str) -> MemoResult<Value> {
        let datum = self.require_datum("expected an expression after quote")?;
        Ok(Value::list(vec![
            Value::Symbol(Symbol::intern(head)),
            datum,
        ]))
    }

    fn read_list(&mut self, close: char, open_line: u32) -> MemoResult<Value> {
        let mut items = Vec::new();
        let mut tail = Value::Nil;
        loop {
            self.skip_trivia();
            let Some(c) = self.peek() else {
                return Err(self.error_at(open_line, "unexpected end of input in list"));
            };
            if c == close {
                self.bump();
                break;
            }
            if c == ')' || c == ']' {
                return Err(self.error("mismatched close parenthesis"));
            }
            if c == '.' && self.peek_second().is_none_or(is_delimiter) {
                if items.is_empty() {
                    return Err(self.error("unexpected `.` in list"));
                }
                self.bump();
                tail = self.require_datum("expected an expression after `.`")?;
                self.skip_trivia();
                if self.peek() != Some(close) {
                    return Err(self.error("expected close parenthesis after dotted tail"));
                }
                self.bump();
                break;
            }
            items.push(self.read_datum()?);
        }
        // Fold right, attaching the source property to the outermost pair.
        let mut out = tail;
        let count = items.len();
        for (i, item) in items.into_iter().enumerate().rev() {
            if i == 0 && count > 0 {
                out = Value::cons_source(
                    item,
                    out,
                    Some(Srcloc {
                        file: self.file.clone(),
                        line: open_line,
                    }),
                );
            } else {
                out = Value::cons(item, out);
            }
        }
        Ok(out)
    }

    fn read_string(&mut self) -> MemoResult<Value> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unexpected end of input in string")),
                Some('"') => break,
                Some('\\') => match self.bump() {
                    None => return Err(self.error("unexpected end of input in string")),
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(c @ ('"' | '\\')) => out.push(c),
                    Some(c) => {
                        return Err(self.error(&format!("unknown string escape `\\{c}`")));
                    }
                },
                Some(c) => out.push(c),
            }
        }
        Ok(Value::Str(Rc::from(out)))
    }

    fn read_token(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_delimiter(c) {
                break;
            }
            self.bump();
        }
        &self.src[start..self.pos]
    }

    fn read_hash(&mut self) -> MemoResult<Value> {
        self.bump();
        match self.peek() {
            Some('\\') => {
                self.bump();
                let Some(first) = self.bump() else {
                    return Err(self.error("unexpected end of input in character literal"));
                };
                let mut name = String::from(first);
                if first.is_alphabetic() {
                    while let Some(c) = self.peek() {
                        if !c.is_alphabetic() {
                            break;
                        }
                        name.push(c);
                        self.bump();
                    }
                }
                match name.as_str() {
                    "space" => Ok(Value::Char(' ')),
                    "newline" => Ok(Value::Char('\n')),
                    "tab" => Ok(Value::Char('\t')),
                    _ if name.chars().count() == 1 => Ok(Value::Char(first)),
                    _ => Err(self.error(&format!("unknown character literal `#\\{name}`"))),
                }
            }
            Some(':') => {
                self.bump();
                let token = self.read_token();
                if token.is_empty() {
                    return Err(self.error("expected a keyword name after `#:`"));
                }
                Ok(Value::Keyword(Symbol::intern(token)))
            }
            _ => {
                let token = self.read_token();
                match token {
                    "t" | "true" => Ok(Value::Bool(true)),
                    "f" | "false" => Ok(Value::Bool(false)),
                    _ => Err(self.error(&format!("unsupported `#` syntax: #{token}"))),
                }
            }
        }
    }

    fn read_atom(&mut self) -> MemoResult<Value> {
        let line = self.line;
        let token = self.read_token();
        if token == "." {
            return Err(self.error_at(line, "unexpected `.`"));
        }
        if let Ok(i) = token.parse::<i64>() {
            return Ok(Value::Int(i));
        }
        let body = token.strip_prefix(['+', '-']).unwrap_or(token);
        if !body.is_empty() && body.bytes().all(|b| b.is_ascii_digit()) {
            // An exact integer too large for i64.
            let big = BigInt::parse_bytes(token.as_bytes(), 10)
                .ok_or_else(|| self.error_at(line, "bad number syntax"))?;
            return Ok(Value::from(big));
        }
        if looks_like_float(token)
            && let Ok(x) = token.parse::<f64>()
        {
            return Ok(Value::Float(x));
        }
        Ok(Value::Symbol(Symbol::intern(token)))
    }
}

/// A decimal point or exponent after a digit marks a float candidate;
/// everything else falls through to symbols (so `1+` stays a symbol).
fn looks_like_float(token: &str) -> bool {
    let body = token.strip_prefix(['+', '-']).unwrap_or(token);
    body.starts_with(|c: char| c.is_ascii_digit() || c == '.')
        && body.contains(['.', 'e', 'E'])
        && body.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(src: &str) -> Value {
        Reader::new(src, None).read_one().unwrap()
    }

    #[test]
    fn atoms() {
        assert!(read("42").equal(&Value::Int(42)));
        assert!(read("-7").equal(&Value::Int(-7)));
        assert!(read("#t").equal(&Value::Bool(true)));
        assert!(read("#false").equal(&Value::Bool(false)));
        assert!(read("#\\a").equal(&Value::Char('a')));
        assert!(read("#\\space").equal(&Value::Char(' ')));
        assert!(read("\"hi\\n\"").equal(&Value::Str(Rc::from("hi\n"))));
        assert!(read("foo").equal(&Value::Symbol(Symbol::intern("foo"))));
        assert!(read("1+").equal(&Value::Symbol(Symbol::intern("1+"))));
        assert!(read("#:rest").equal(&Value::Keyword(Symbol::intern("rest"))));
        assert!(matches!(read("1.5"), Value::Float(x) if (x - 1.5).abs() < f64::EPSILON));
    }

    #[test]
    fn bignum_literals_overflow_gracefully() {
        let big = read("123456789012345678901234567890");
        assert!(matches!(big, Value::Big(_)));
        assert_eq!(big.to_string(), "123456789012345678901234567890");
    }

    #[test]
    fn lists_and_dots() {
        assert_eq!(read("(a b c)").to_string(), "(a b c)");
        assert_eq!(read("(a . b)").to_string(), "(a . b)");
        assert_eq!(read("(a b . c)").to_string(), "(a b . c)");
        assert_eq!(read("[x 1]").to_string(), "(x 1)");
        assert_eq!(read("()").to_string(), "()");
    }

    #[test]
    fn quotation_sugar() {
        assert_eq!(read("'x").to_string(), "'x");
        assert_eq!(read("`(a ,b ,@c)").to_string(), "`(a ,b ,@c)");
    }

    #[test]
    fn comments_are_skipped() {
        let all = Reader::new("; leading\n1 ; trailing\n2", None).read_all().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn source_lines_are_attached_to_lists() {
        let datum = Reader::new("\n\n(f x)", Some("test.scm"))
            .read_one()
            .unwrap();
        let src = datum.source_location().unwrap();
        assert_eq!(src.line, 3);
        assert_eq!(src.file.as_deref(), Some("test.scm"));
    }

    #[test]
    fn read_errors() {
        assert!(Reader::new("(a b", None).read_one().is_err());
        assert!(Reader::new(")", None).read_one().is_err());
        assert!(Reader::new("( . x)", None).read_one().is_err());
        assert!(Reader::new("\"abc", None).read_one().is_err());
        assert!(Reader::new("#q", None).read_one().is_err());
        assert!(Reader::new("", None).read_one().is_err());
    }
}
