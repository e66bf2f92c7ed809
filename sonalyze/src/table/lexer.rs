// Tokenizer for the query language.
//
// Whitespace separates tokens but is otherwise insignificant.  Strings are quoted with any of " ' /
// or ` and extend to the next occurrence of the same quote; there are no escapes.  Numbers and
// durations are returned as string tokens, their interpretation depends on the field they are
// compared to.  A number is an optional sign, digits, an optional fraction and an optional exponent;
// a duration is one or more digit groups each followed by one of W, D, H, M (either case), in that
// order.  Numbers and durations must be followed by something that is not part of an identifier.

use anyhow::{bail, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    And,
    Or,
    Not,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    LParen,
    RParen,
}

pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut lexer = Lexer { text: input, input: input.as_bytes(), i: 0 };
    let mut tokens = vec![];
    while let Some(t) = lexer.next_token()? {
        tokens.push(t);
    }
    Ok(tokens)
}

struct Lexer<'a> {
    text: &'a str,
    input: &'a [u8],
    i: usize,
}

impl<'a> Lexer<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.i).copied()
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        while let Some(b' ' | b'\t' | b'\r' | b'\n') = self.peek() {
            self.i += 1;
        }
        let Some(c) = self.peek() else {
            return Ok(None);
        };
        let start = self.i;
        self.i += 1;
        let tok = match c {
            b'<' => {
                if self.peek() == Some(b'=') {
                    self.i += 1;
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            b'>' => {
                if self.peek() == Some(b'=') {
                    self.i += 1;
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            b'=' => {
                if self.peek() == Some(b'~') {
                    self.i += 1;
                    Token::Match
                } else {
                    Token::Eq
                }
            }
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'"' | b'\'' | b'/' | b'`' => {
                while self.peek().is_some_and(|x| x != c) {
                    self.i += 1;
                }
                if self.i == self.input.len() {
                    bail!("End of input in string at position {}", self.i - 1);
                }
                let s = self.text[start + 1..self.i].to_string();
                self.i += 1;
                Token::Str(s)
            }
            b'-' | b'+' => {
                self.scan_unsigned_number()?;
                Token::Str(self.text[start..self.i].to_string())
            }
            b'0'..=b'9' => {
                self.scan_digits();
                if self.peek().and_then(duration_marker).is_some() {
                    self.i = start;
                    self.scan_duration()?;
                } else {
                    self.scan_unsigned_number_tail()?;
                }
                Token::Str(self.text[start..self.i].to_string())
            }
            _ if is_initial(c) => {
                while self.peek().is_some_and(is_subsequent) {
                    self.i += 1;
                }
                match &self.text[start..self.i] {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    s => Token::Ident(s.to_string()),
                }
            }
            _ => {
                let ch = self.text[start..].chars().next().unwrap_or('?');
                bail!("Unexpected character '{ch}' at position {start}")
            }
        };
        Ok(Some(tok))
    }

    fn scan_unsigned_number(&mut self) -> Result<()> {
        self.scan_nonempty_digits()?;
        self.scan_unsigned_number_tail()
    }

    // Initial digits have been consumed.
    fn scan_unsigned_number_tail(&mut self) -> Result<()> {
        if self.peek() == Some(b'.') {
            self.i += 1;
            self.scan_nonempty_digits()?;
        }
        if let Some(b'e' | b'E') = self.peek() {
            self.i += 1;
            if let Some(b'+' | b'-') = self.peek() {
                self.i += 1;
            }
            self.scan_nonempty_digits()?;
        }
        if self.peek().is_some_and(is_subsequent) {
            bail!("Token separator required after number");
        }
        Ok(())
    }

    fn scan_duration(&mut self) -> Result<()> {
        let mut prev = None;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.scan_digits();
            let Some(c) = self.peek() else {
                bail!("Time interval designator required in duration");
            };
            let m = duration_marker(c);
            if m.is_none() || m <= prev {
                bail!("Time interval designators must appear in WDHM order");
            }
            self.i += 1;
            prev = m;
        }
        if self.peek().is_some_and(is_subsequent) {
            bail!("Token separator required after duration");
        }
        Ok(())
    }

    fn scan_nonempty_digits(&mut self) -> Result<()> {
        if !self.scan_digits() {
            bail!("Non-empty digit string required");
        }
        Ok(())
    }

    fn scan_digits(&mut self) -> bool {
        let here = self.i;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.i += 1;
        }
        self.i > here
    }
}

fn is_initial(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_subsequent(c: u8) -> bool {
    is_initial(c) || c.is_ascii_digit()
}

/// The rank of a duration designator, in WDHM order.

pub fn duration_marker(c: u8) -> Option<u8> {
    match c {
        b'w' | b'W' => Some(0),
        b'd' | b'D' => Some(1),
        b'h' | b'H' => Some(2),
        b'm' | b'M' => Some(3),
        _ => None,
    }
}

#[test]
fn test_lexer() {
    let toks = tokenize(
        " = <= < >= > =~ (and) or not andor \"and\" 'or' /not/ `zappa` hi1 ho2 \n \
         10 10.5\t-10.5e+7\n-10e8 5w 4d 3h 2m 5w2m 3d2m // '' `` \"\" 15w12d17h10m",
    )
    .unwrap();
    let s = |x: &str| Token::Str(x.to_string());
    let id = |x: &str| Token::Ident(x.to_string());
    let expected = vec![
        Token::Eq,
        Token::Le,
        Token::Lt,
        Token::Ge,
        Token::Gt,
        Token::Match,
        Token::LParen,
        Token::And,
        Token::RParen,
        Token::Or,
        Token::Not,
        id("andor"),
        s("and"),
        s("or"),
        s("not"),
        s("zappa"),
        id("hi1"),
        id("ho2"),
        s("10"),
        s("10.5"),
        s("-10.5e+7"),
        s("-10e8"),
        s("5w"),
        s("4d"),
        s("3h"),
        s("2m"),
        s("5w2m"),
        s("3d2m"),
        s(""),
        s(""),
        s(""),
        s(""),
        s("15w12d17h10m"),
    ];
    assert_eq!(toks, expected);
}

#[test]
fn test_lexer_signs() {
    let toks = tokenize("a > +10 and b < -2.5 and c = +1e3").unwrap();
    let strs = toks
        .into_iter()
        .filter_map(|t| match t {
            Token::Str(s) => Some(s),
            _ => None,
        })
        .collect::<Vec<String>>();
    assert_eq!(strs, vec!["+10", "-2.5", "+1e3"]);
    assert!(tokenize("+").is_err());
    assert!(tokenize("+x").is_err());
}

#[test]
fn test_lexer_errors() {
    for (input, expect) in [
        ("!=", "Unexpected character '!' at position 0"),
        ("'hi there", "End of input in string"),
        ("-", "Non-empty digit string required"),
        ("13x", "Token separator required after number"),
        ("12.", "Non-empty digit string required"),
        ("12.1f", "Token separator required after number"),
        ("12e+", "Non-empty digit string required"),
        ("12e", "Non-empty digit string required"),
        ("12d13", "Time interval designator required"),
        ("12h13d", "Time interval designators must appear"),
        ("12d13hh", "Token separator required after duration"),
    ] {
        let err = tokenize(input).unwrap_err().to_string();
        assert!(err.contains(expect), "{input}: {err}");
    }
}
