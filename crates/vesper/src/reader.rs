//! S-expression reader.
//!
//! Turns source text into [`Value`] forms for the CLI and the test suite.
//! The compiler proper consumes `Value`s; nothing in the pipeline depends
//! on this module.
//!
//! Supported syntax: lists and dotted pairs, `#(...)` vectors, exact and
//! inexact numbers (exact integers beyond i64 become bignums), strings with
//! the usual escapes, characters, booleans, keywords (`:name`), line
//! comments, and the quotation sugar `'` `` ` `` `,` `,@`.

use num_bigint::BigInt;

use crate::intern::{StaticSym, intern};
use crate::value::Value;

/// Maximum nesting depth accepted by the reader.
///
/// Deeply nested input would otherwise overflow the stack in the recursive
/// descent; the compiler passes have the same practical bound.
pub const MAX_NESTING_DEPTH: u16 = 200;

/// A reader failure with the byte offset where it was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadError {
    pub message: String,
    pub offset: usize,
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "read error at {}: {}", self.offset, self.message)
    }
}

impl std::error::Error for ReadError {}

/// Reads every form in `src`.
pub fn read_all(src: &str) -> Result<Vec<Value>, ReadError> {
    let mut reader = Reader::new(src);
    let mut forms = Vec::new();
    while let Some(form) = reader.read_form()? {
        forms.push(form);
    }
    Ok(forms)
}

/// Reads exactly one form; fails on trailing input or empty source.
pub fn read_one(src: &str) -> Result<Value, ReadError> {
    let mut reader = Reader::new(src);
    let Some(form) = reader.read_form()? else {
        return Err(reader.error("empty input"));
    };
    reader.skip_atmosphere();
    if !reader.at_eof() {
        return Err(reader.error("trailing input after form"));
    }
    Ok(form)
}

struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
    depth: u16,
}

impl<'a> Reader<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            depth: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ReadError {
        ReadError {
            message: message.into(),
            offset: self.pos,
        }
    }

    fn at_eof(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_atmosphere(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.pos += 1;
                }
                b';' => {
                    while let Some(c) = self.peek() {
                        self.pos += 1;
                        if c == b'\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    /// Reads the next form, or `None` at end of input.
    fn read_form(&mut self) -> Result<Option<Value>, ReadError> {
        self.skip_atmosphere();
        if self.at_eof() {
            return Ok(None);
        }
        self.read_expr().map(Some)
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, ReadError>) -> Result<T, ReadError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(self.error("input too deeply nested"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn read_expr(&mut self) -> Result<Value, ReadError> {
        self.skip_atmosphere();
        let Some(b) = self.peek() else {
            return Err(self.error("unexpected end of input"));
        };
        match b {
            b'(' => {
                self.pos += 1;
                self.nested(|r| r.read_list_tail())
            }
            b')' => Err(self.error("unexpected )")),
            b'\'' => self.read_sugar(StaticSym::Quote),
            b'`' => self.read_sugar(StaticSym::Quasiquote),
            b',' => {
                self.pos += 1;
                let head = if self.peek() == Some(b'@') {
                    self.pos += 1;
                    StaticSym::UnquoteSplicing
                } else {
                    StaticSym::Unquote
                };
                let inner = self.nested(|r| r.read_expr())?;
                Ok(Value::list(&[Value::Sym(head.sym()), inner]))
            }
            b'"' => self.read_string(),
            b'#' => self.read_hash(),
            _ => self.read_atom(),
        }
    }

    fn read_sugar(&mut self, head: StaticSym) -> Result<Value, ReadError> {
        self.pos += 1;
        let inner = self.nested(|r| r.read_expr())?;
        Ok(Value::list(&[Value::Sym(head.sym()), inner]))
    }

    fn read_list_tail(&mut self) -> Result<Value, ReadError> {
        let mut elts = Vec::new();
        loop {
            self.skip_atmosphere();
            match self.peek() {
                None => return Err(self.error("unterminated list")),
                Some(b')') => {
                    self.pos += 1;
                    return Ok(Value::list(&elts));
                }
                Some(b'.') if self.is_lone_dot() => {
                    self.pos += 1;
                    if elts.is_empty() {
                        return Err(self.error("dot in empty list"));
                    }
                    let tail = self.read_expr()?;
                    self.skip_atmosphere();
                    if self.bump() != Some(b')') {
                        return Err(self.error("expected ) after dotted tail"));
                    }
                    return Ok(Value::list_star(&elts, tail));
                }
                Some(_) => elts.push(self.read_expr()?),
            }
        }
    }

    /// True if the `.` at the cursor is a standalone dot rather than the
    /// start of a symbol or number such as `.5` or `...`.
    fn is_lone_dot(&self) -> bool {
        match self.src.get(self.pos + 1) {
            None => true,
            Some(b) => matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b'(' | b')' | b';'),
        }
    }

    fn read_string(&mut self) -> Result<Value, ReadError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(b'"') => return Ok(Value::Str(out.into())),
                Some(b'\\') => match self.bump() {
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'r') => out.push('\r'),
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    _ => return Err(self.error("bad string escape")),
                },
                Some(b) => out.push(b as char),
            }
        }
    }

    fn read_hash(&mut self) -> Result<Value, ReadError> {
        self.pos += 1;
        match self.peek() {
            Some(b't') => {
                self.pos += 1;
                Ok(Value::Bool(true))
            }
            Some(b'f') => {
                self.pos += 1;
                Ok(Value::Bool(false))
            }
            Some(b'(') => {
                self.pos += 1;
                let list = self.nested(|r| r.read_list_tail())?;
                let elts = list.list_to_vec().ok_or_else(|| self.error("dotted vector"))?;
                Ok(Value::Vector(elts.into()))
            }
            Some(b'\\') => {
                self.pos += 1;
                self.read_char()
            }
            _ => Err(self.error("unknown # syntax")),
        }
    }

    fn read_char(&mut self) -> Result<Value, ReadError> {
        let start = self.pos;
        let Some(first) = self.bump() else {
            return Err(self.error("unterminated character literal"));
        };
        // Consume any following symbol constituents to catch named chars.
        while let Some(b) = self.peek() {
            if is_delimiter(b) {
                break;
            }
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).map_err(|_| self.error("invalid utf-8"))?;
        if text.chars().count() == 1 {
            return Ok(Value::Char(first as char));
        }
        match text {
            "space" => Ok(Value::Char(' ')),
            "newline" => Ok(Value::Char('\n')),
            "tab" => Ok(Value::Char('\t')),
            _ => Err(self.error(format!("unknown character name #\\{text}"))),
        }
    }

    fn read_atom(&mut self) -> Result<Value, ReadError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if is_delimiter(b) {
                break;
            }
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).map_err(|_| self.error("invalid utf-8"))?;
        if text.is_empty() {
            return Err(self.error("unexpected character"));
        }
        if let Some(stripped) = text.strip_prefix(':')
            && !stripped.is_empty()
        {
            return Ok(Value::Keyword(intern(stripped)));
        }
        Ok(parse_number(text).unwrap_or_else(|| Value::Sym(intern(text))))
    }
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b'(' | b')' | b'"' | b';')
}

/// Parses an atom as a number if it looks like one.
///
/// Exact integers outside i64 promote to bignums; anything with a decimal
/// point or exponent is inexact.
fn parse_number(text: &str) -> Option<Value> {
    let body = text.strip_prefix(['+', '-']).unwrap_or(text);
    if body.is_empty() || !body.bytes().next().is_some_and(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }
    if let Ok(n) = text.parse::<i64>() {
        return Some(Value::Int(n));
    }
    if body.bytes().all(|b| b.is_ascii_digit())
        && let Ok(n) = text.parse::<BigInt>()
    {
        return Some(Value::from_bigint(n));
    }
    text.parse::<f64>().ok().map(Value::Real)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::intern;

    #[test]
    fn test_read_atoms() {
        assert_eq!(read_one("42").unwrap(), Value::Int(42));
        assert_eq!(read_one("-7").unwrap(), Value::Int(-7));
        assert_eq!(read_one("3.5").unwrap(), Value::Real(3.5));
        assert_eq!(read_one("#t").unwrap(), Value::Bool(true));
        assert_eq!(read_one("foo").unwrap(), Value::Sym(intern("foo")));
        assert_eq!(read_one(":key").unwrap(), Value::Keyword(intern("key")));
        assert_eq!(read_one("\"a\\nb\"").unwrap(), Value::Str("a\nb".into()));
        assert_eq!(read_one("#\\space").unwrap(), Value::Char(' '));
        // `+` and `-` alone are symbols, not numbers
        assert_eq!(read_one("+").unwrap(), Value::Sym(intern("+")));
    }

    #[test]
    fn test_read_bignum() {
        let v = read_one("123456789012345678901234567890").unwrap();
        assert!(matches!(v, Value::Big(_)));
    }

    #[test]
    fn test_read_lists() {
        let v = read_one("(a (b c) . d)").unwrap();
        assert_eq!(v.to_string(), "(a (b c) . d)");
        let v = read_one("#(1 2 3)").unwrap();
        assert_eq!(v.to_string(), "#(1 2 3)");
    }

    #[test]
    fn test_read_sugar() {
        assert_eq!(read_one("'x").unwrap().to_string(), "(quote x)");
        assert_eq!(read_one("`(a ,b ,@c)").unwrap().to_string(), "(quasiquote (a (unquote b) (unquote-splicing c)))");
    }

    #[test]
    fn test_read_all_with_comments() {
        let forms = read_all("; header\n(a) ; trailing\n(b)").unwrap();
        assert_eq!(forms.len(), 2);
    }

    #[test]
    fn test_depth_guard() {
        let mut src = String::new();
        for _ in 0..300 {
            src.push('(');
        }
        src.push('x');
        for _ in 0..300 {
            src.push(')');
        }
        assert!(read_one(&src).is_err());
    }

    #[test]
    fn test_unterminated_list() {
        assert!(read_one("(a b").is_err());
        assert!(read_one("(a . )").is_err());
    }
}
