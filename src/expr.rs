//! Bit-slice expressions
//!
//! The CLI selects mutable bits with python-style slices `l:r:s` whose
//! components are small arithmetic expressions: unary +/-, `+ - * /`,
//! parentheses, decimal and `0x` hex literals, and `byte.bit` dot literals
//! (`4.7` is the most significant bit of byte 4). Negative positions count
//! from the end of the message, and a right bound written `+n` is relative
//! to the resolved left bound.
//!
//! Parsing is a plain recursive descent over the byte string; resolution
//! against a concrete message length happens separately so one parsed slice
//! can be reused.

use thiserror::Error;

/// Expression and slice errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("unexpected character '{0}' in expression")]
    Unexpected(char),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("division by zero")]
    DivByZero,
    #[error("arithmetic overflow")]
    Overflow,
    #[error("bit component of byte.bit must be 0..7")]
    BadBitComponent,
    #[error("slice step must be non-zero")]
    ZeroStep,
    #[error("bit position out of range")]
    OutOfRange,
}

struct Parser<'a> {
    s: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(s: &'a str) -> Parser<'a> {
        Parser { s: s.as_bytes(), pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.s.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    /// expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<i64, ExprError> {
        let mut v = self.term()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'+') => {
                    self.pos += 1;
                    let rhs = self.term()?;
                    v = v.checked_add(rhs).ok_or(ExprError::Overflow)?;
                }
                Some(b'-') => {
                    self.pos += 1;
                    let rhs = self.term()?;
                    v = v.checked_sub(rhs).ok_or(ExprError::Overflow)?;
                }
                _ => return Ok(v),
            }
        }
    }

    /// term := factor (('*' | '/') factor)*
    fn term(&mut self) -> Result<i64, ExprError> {
        let mut v = self.factor()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'*') => {
                    self.pos += 1;
                    let rhs = self.factor()?;
                    v = v.checked_mul(rhs).ok_or(ExprError::Overflow)?;
                }
                Some(b'/') => {
                    self.pos += 1;
                    let rhs = self.factor()?;
                    if rhs == 0 {
                        return Err(ExprError::DivByZero);
                    }
                    v = v.checked_div(rhs).ok_or(ExprError::Overflow)?;
                }
                _ => return Ok(v),
            }
        }
    }

    /// factor := ('+' | '-') factor | primary
    fn factor(&mut self) -> Result<i64, ExprError> {
        self.skip_ws();
        match self.peek() {
            Some(b'+') => {
                self.pos += 1;
                self.factor()
            }
            Some(b'-') => {
                self.pos += 1;
                let v = self.factor()?;
                v.checked_neg().ok_or(ExprError::Overflow)
            }
            _ => self.primary(),
        }
    }

    /// primary := '(' expr ')' | number ['.' number]
    fn primary(&mut self) -> Result<i64, ExprError> {
        self.skip_ws();
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let v = self.expr()?;
                self.skip_ws();
                match self.peek() {
                    Some(b')') => {
                        self.pos += 1;
                        Ok(v)
                    }
                    Some(c) => Err(ExprError::Unexpected(c as char)),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some(c) if c.is_ascii_digit() => {
                let byte = self.number()?;
                if self.peek() == Some(b'.') {
                    self.pos += 1;
                    let bit = self.number()?;
                    if bit > 7 {
                        return Err(ExprError::BadBitComponent);
                    }
                    byte.checked_mul(8)
                        .and_then(|v| v.checked_add(bit))
                        .ok_or(ExprError::Overflow)
                } else {
                    Ok(byte)
                }
            }
            Some(c) => Err(ExprError::Unexpected(c as char)),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    /// number := '0x' [0-9a-f]+ | [0-9]+
    fn number(&mut self) -> Result<i64, ExprError> {
        let radix: u32 = if self.s[self.pos..].starts_with(b"0x") || self.s[self.pos..].starts_with(b"0X") {
            self.pos += 2;
            16
        } else {
            10
        };
        let start = self.pos;
        let mut v: i64 = 0;
        while let Some(c) = self.peek() {
            match (c as char).to_digit(radix) {
                Some(d) => {
                    v = v
                        .checked_mul(radix as i64)
                        .and_then(|v| v.checked_add(d as i64))
                        .ok_or(ExprError::Overflow)?;
                    self.pos += 1;
                }
                None => break,
            }
        }
        if self.pos == start {
            return match self.peek() {
                Some(c) => Err(ExprError::Unexpected(c as char)),
                None => Err(ExprError::UnexpectedEnd),
            };
        }
        Ok(v)
    }
}

/// Evaluate a whole string as one expression
pub fn eval(s: &str) -> Result<i64, ExprError> {
    let mut parser = Parser::new(s);
    let v = parser.expr()?;
    parser.skip_ws();
    match parser.peek() {
        None => Ok(v),
        Some(c) => Err(ExprError::Unexpected(c as char)),
    }
}

/// Right bound of a slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RightBound {
    /// end of message
    End,
    /// absolute, negative counts from the end
    Abs(i64),
    /// relative to the resolved left bound
    Rel(i64),
}

/// A parsed `l:r:s` bit slice, not yet resolved against a message length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    left: i64,
    right: RightBound,
    step: i64,
}

impl Slice {
    /// Parse `l:r:s` with the usual defaults
    ///
    /// A bare `l` selects the single position l. An empty `l` means 0, an
    /// empty `r` means the end of the message, an empty `s` means 1.
    ///
    pub fn parse(s: &str) -> Result<Slice, ExprError> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() > 3 {
            return Err(ExprError::Unexpected(':'));
        }

        let left = if parts.len() > 1 && parts[0].trim().is_empty() {
            0
        } else {
            eval(parts[0])?
        };

        let right = if parts.len() == 1 {
            RightBound::Rel(1)
        } else {
            let part = parts[1].trim();
            if part.is_empty() {
                RightBound::End
            } else if part.starts_with('+') {
                RightBound::Rel(eval(part)?)
            } else {
                RightBound::Abs(eval(part)?)
            }
        };

        let step = if parts.len() < 3 || parts[2].trim().is_empty() {
            1
        } else {
            eval(parts[2])?
        };
        if step == 0 {
            return Err(ExprError::ZeroStep);
        }

        Ok(Slice { left, right, step })
    }

    /// Enumerate the selected bit positions for a message of `len_bits` bits
    pub fn positions(&self, len_bits: usize) -> Result<Vec<usize>, ExprError> {
        let len = len_bits as i64;

        let left = if self.left < 0 { len + self.left } else { self.left };
        if left < 0 {
            return Err(ExprError::OutOfRange);
        }
        let right = match self.right {
            RightBound::End => len,
            RightBound::Abs(v) => {
                if v < 0 {
                    len + v
                } else {
                    v
                }
            }
            RightBound::Rel(v) => left.checked_add(v).ok_or(ExprError::Overflow)?,
        };

        let mut out = Vec::new();
        let mut cur = left;
        while (self.step > 0 && cur < right) || (self.step < 0 && cur > right) {
            if cur < 0 {
                return Err(ExprError::OutOfRange);
            }
            out.push(cur as usize);
            cur = cur.checked_add(self.step).ok_or(ExprError::Overflow)?;
        }
        Ok(out)
    }
}
