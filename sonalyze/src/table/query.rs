// Simple query language: parser, printer, and compiler to row predicates.
//
//   expr       ::= disjunct ("or" disjunct)*
//   disjunct   ::= conjunct ("and" conjunct)*
//   conjunct   ::= "not" conjunct | "(" expr ")" | comparison
//   comparison ::= ident relop literal
//   relop      ::= "=" | "<" | "<=" | ">" | ">=" | "=~"
//
// A literal is a string, number or duration token, or an identifier taken as a bare word.  The
// field named by a comparison determines how the literal is interpreted.

use crate::table::format::{Kind, Table, Value};
use crate::table::lexer::{duration_marker, tokenize, Token};

use anyhow::{anyhow, bail, Result};
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use sonarlog::{GpuSet, Timestamp};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
}

impl fmt::Display for RelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelOp::Eq => "=",
            RelOp::Lt => "<",
            RelOp::Le => "<=",
            RelOp::Gt => ">",
            RelOp::Ge => ">=",
            RelOp::Match => "=~",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
    Compare { op: RelOp, field: String, value: String },
}

// The printed form parses back to the same tree: every compound node is parenthesized and the value
// is quoted with a quote character it does not contain.

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::And(a, b) => write!(f, "({a} and {b})"),
            Node::Or(a, b) => write!(f, "({a} or {b})"),
            Node::Not(a) => write!(f, "(not {a})"),
            Node::Compare { op, field, value } => {
                let q = ['"', '\'', '`', '/'].into_iter().find(|q| !value.contains(*q)).unwrap_or('"');
                write!(f, "{field} {op} {q}{value}{q}")
            }
        }
    }
}

pub fn parse_query(input: &str) -> Result<Node> {
    let parsed = tokenize(input).and_then(|tokens| {
        let mut p = Parser { tokens, i: 0 };
        let node = p.expr()?;
        if p.i < p.tokens.len() {
            bail!("syntax error");
        }
        Ok(node)
    });
    parsed.map_err(|e| anyhow!("Can't parse {input}: {e}"))
}

struct Parser {
    tokens: Vec<Token>,
    i: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.i)
    }

    fn next(&mut self) -> Result<Token> {
        match self.tokens.get(self.i) {
            Some(t) => {
                self.i += 1;
                Ok(t.clone())
            }
            None => bail!("syntax error"),
        }
    }

    fn expr(&mut self) -> Result<Node> {
        let mut lhs = self.disjunct()?;
        while self.peek() == Some(&Token::Or) {
            self.i += 1;
            let rhs = self.disjunct()?;
            lhs = Node::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn disjunct(&mut self) -> Result<Node> {
        let mut lhs = self.conjunct()?;
        while self.peek() == Some(&Token::And) {
            self.i += 1;
            let rhs = self.conjunct()?;
            lhs = Node::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn conjunct(&mut self) -> Result<Node> {
        match self.next()? {
            Token::Not => Ok(Node::Not(Box::new(self.conjunct()?))),
            Token::LParen => {
                let e = self.expr()?;
                if self.next()? != Token::RParen {
                    bail!("syntax error");
                }
                Ok(e)
            }
            Token::Ident(field) => {
                let op = match self.next()? {
                    Token::Eq => RelOp::Eq,
                    Token::Lt => RelOp::Lt,
                    Token::Le => RelOp::Le,
                    Token::Gt => RelOp::Gt,
                    Token::Ge => RelOp::Ge,
                    Token::Match => RelOp::Match,
                    _ => bail!("syntax error"),
                };
                let value = match self.next()? {
                    Token::Str(s) | Token::Ident(s) => s,
                    _ => bail!("syntax error"),
                };
                Ok(Node::Compare { op, field, value })
            }
            _ => bail!("syntax error"),
        }
    }
}

/// A compiled query: returns true iff the row passes.

pub type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

pub fn compile_query<T: 'static>(table: &Table<T>, node: &Node) -> Result<Filter<T>> {
    match node {
        Node::And(a, b) => {
            let a = compile_query(table, a)?;
            let b = compile_query(table, b)?;
            Ok(Box::new(move |x| a(x) && b(x)))
        }
        Node::Or(a, b) => {
            let a = compile_query(table, a)?;
            let b = compile_query(table, b)?;
            Ok(Box::new(move |x| a(x) || b(x)))
        }
        Node::Not(a) => {
            let a = compile_query(table, a)?;
            Ok(Box::new(move |x| !a(x)))
        }
        Node::Compare { op, field, value } => {
            let Some(f) = table.lookup(field) else {
                bail!("Field not found: {field}");
            };
            let get = f.value;
            let op = *op;
            if op == RelOp::Match {
                let re = Regex::new(value)?;
                return Ok(Box::new(move |x| re.is_match(&get(x).render(0))));
            }
            let v = convert(f.kind, value)?;
            if let Value::Gpus(g) = v {
                return Ok(Box::new(move |x| match get(x) {
                    Value::Gpus(h) => set_relation(&h, &g, op),
                    _ => false,
                }));
            }
            Ok(Box::new(move |x| match compare(&get(x), &v) {
                Some(o) => match op {
                    RelOp::Eq => o == Ordering::Equal,
                    RelOp::Lt => o == Ordering::Less,
                    RelOp::Le => o != Ordering::Greater,
                    RelOp::Gt => o == Ordering::Greater,
                    RelOp::Ge => o != Ordering::Less,
                    RelOp::Match => false,
                },
                None => false,
            }))
        }
    }
}

fn convert(kind: Kind, s: &str) -> Result<Value> {
    Ok(match kind {
        Kind::Str => Value::Str(s.to_string()),
        Kind::Int => Value::Int(i64::from_str(s).map_err(|_| anyhow!("Invalid integer {s}"))?),
        Kind::UInt => Value::UInt(u64::from_str(s).map_err(|_| anyhow!("Invalid integer {s}"))?),
        Kind::Float => Value::Float(f64::from_str(s).map_err(|_| anyhow!("Invalid number {s}"))?),
        Kind::Time => Value::Time(parse_time_literal(s)?),
        Kind::Duration => Value::Duration(parse_duration_literal(s)?),
        Kind::Gpus => Value::Gpus(GpuSet::from_str(s)?),
        Kind::Bool => Value::Bool(match s {
            "true" | "yes" | "1" => true,
            "false" | "no" | "0" => false,
            _ => bail!("Invalid boolean {s}"),
        }),
    })
}

// RFC 3339, or `YYYY-MM-DD HH:MM`, or `YYYY-MM-DD`, all UTC, or seconds since the epoch.
fn parse_time_literal(s: &str) -> Result<Timestamp> {
    if let Ok(t) = sonarlog::parse_rfc3339(s) {
        return Ok(t);
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M") {
        return Ok(Utc.from_utc_datetime(&t));
    }
    if let Some(t) = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().and_then(|d| d.and_hms_opt(0, 0, 0)) {
        return Ok(Utc.from_utc_datetime(&t));
    }
    if let Some(t) = i64::from_str(s).ok().and_then(|n| Utc.timestamp_opt(n, 0).single()) {
        return Ok(t);
    }
    bail!("Invalid time {s}")
}

// WwDdHhMm with parts in that order, or a plain number of seconds.
fn parse_duration_literal(s: &str) -> Result<i64> {
    if let Ok(n) = i64::from_str(s) {
        return Ok(n);
    }
    const SECONDS: [i64; 4] = [7 * 24 * 3600, 24 * 3600, 3600, 60];
    let mut total = 0i64;
    let mut digits = String::new();
    let mut prev = None;
    for c in s.bytes() {
        if c.is_ascii_digit() {
            digits.push(c as char);
            continue;
        }
        let m = duration_marker(c);
        let (Some(ix), false) = (m, digits.is_empty() || m <= prev) else {
            bail!("Invalid duration {s}");
        };
        let Some(t) = i64::from_str(&digits)
            .ok()
            .and_then(|n| n.checked_mul(SECONDS[ix as usize]))
            .and_then(|v| total.checked_add(v))
        else {
            bail!("Invalid duration {s}");
        };
        total = t;
        digits.clear();
        prev = m;
    }
    if !digits.is_empty() || prev.is_none() {
        bail!("Invalid duration {s}");
    }
    Ok(total)
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::UInt(x), Value::UInt(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Time(x), Value::Time(y)) => Some(x.cmp(y)),
        (Value::Duration(x), Value::Duration(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// `=` is set equality, `<` proper subset, `<=` subset, `>` proper superset, `>=` superset.  An
// unknown set is only equal to another unknown set.
fn set_relation(a: &GpuSet, b: &GpuSet, op: RelOp) -> bool {
    let cards = |g: &GpuSet| match g {
        GpuSet::Empty => Some(BTreeSet::new()),
        GpuSet::Unknown => None,
        GpuSet::Cards(c) => Some(c.clone()),
    };
    match (cards(a), cards(b)) {
        (Some(x), Some(y)) => match op {
            RelOp::Eq => x == y,
            RelOp::Lt => x.is_subset(&y) && x != y,
            RelOp::Le => x.is_subset(&y),
            RelOp::Gt => x.is_superset(&y) && x != y,
            RelOp::Ge => x.is_superset(&y),
            RelOp::Match => false,
        },
        (None, None) => op == RelOp::Eq,
        _ => false,
    }
}

#[cfg(test)]
use crate::table::format::MOD_SEC;

#[cfg(test)]
struct Row {
    user: String,
    cpu: f64,
    job: u64,
    duration: i64,
    gpus: GpuSet,
}

#[cfg(test)]
fn test_table() -> Table<Row> {
    Table::new()
        .field("User", Kind::Str, "", |r: &Row| Value::Str(r.user.clone()))
        .field("Cpu", Kind::Float, "", |r: &Row| Value::Float(r.cpu))
        .field("Job", Kind::UInt, "", |r: &Row| Value::UInt(r.job))
        .field("Duration", Kind::Duration, "", |r: &Row| Value::Duration(r.duration))
        .field("Gpus", Kind::Gpus, "", |r: &Row| Value::Gpus(r.gpus.clone()))
        .alias("user", &["User"])
}

#[cfg(test)]
fn test_rows() -> Vec<Row> {
    let row = |user: &str, cpu, job, duration, gpus: &str| Row {
        user: user.to_string(),
        cpu,
        job,
        duration,
        gpus: GpuSet::from_str(gpus).unwrap(),
    };
    vec![
        row("ann", 10.5, 1, 3600, "none"),
        row("bob", 200.0, 2, 2 * 86400, "1,2"),
        row("ann", 0.0, 3, 60, "1"),
        row("carl", 50.0, 4, 7200, "unknown"),
    ]
}

#[cfg(test)]
fn select(q: &str) -> Vec<u64> {
    let table = test_table();
    let f = compile_query(&table, &parse_query(q).unwrap()).unwrap();
    test_rows().iter().filter(|r| f(r)).map(|r| r.job).collect()
}

#[test]
fn test_parse_and_print() {
    let n = parse_query("a = 1 and not b < 'x y' or (c =~ /^z/ and d >= 3d2h)").unwrap();
    assert_eq!(
        n.to_string(),
        "((a = \"1\" and (not b < \"x y\")) or (c =~ \"^z\" and d >= \"3d2h\"))"
    );
    assert_eq!(parse_query(&n.to_string()).unwrap(), n);

    // Quote selection avoids the quote characters in the value
    let n = Node::Compare { op: RelOp::Eq, field: "x".to_string(), value: "a\"b'c".to_string() };
    assert_eq!(n.to_string(), "x = `a\"b'c`");
    assert_eq!(parse_query(&n.to_string()).unwrap(), n);

    // Bare words are literals
    let n = parse_query("user=ann").unwrap();
    assert_eq!(n, Node::Compare { op: RelOp::Eq, field: "user".to_string(), value: "ann".to_string() });
}

#[test]
fn test_parse_errors() {
    for q in ["", "a =", "a = 1 b", "(a = 1", "a and", "1 = a", "a = 1)", "not"] {
        let e = parse_query(q).unwrap_err().to_string();
        assert!(e.starts_with(&format!("Can't parse {q}: ")), "{e}");
        assert!(e.ends_with("syntax error"), "{e}");
    }
    let e = parse_query("a != 1").unwrap_err().to_string();
    assert!(e.contains("Unexpected character '!'"));
}

#[test]
fn test_compile_query() {
    assert_eq!(select("user = ann"), vec![1, 3]);
    assert_eq!(select("User = ann and Cpu > 5"), vec![1]);
    assert_eq!(select("not user = ann"), vec![2, 4]);
    assert_eq!(select("Cpu >= 50 or Job <= 1"), vec![1, 2, 4]);
    assert_eq!(select("Duration > 1h"), vec![2, 4]);
    assert_eq!(select("Duration = 3600"), vec![1]);
    assert_eq!(select("User =~ /^[bc]/"), vec![2, 4]);
    assert_eq!(select("Job =~ 3"), vec![3]);
    assert_eq!(select("Gpus = 1"), vec![3]);
    assert_eq!(select("Gpus < '1,2'"), vec![1, 3]);
    assert_eq!(select("Gpus <= '1,2'"), vec![1, 2, 3]);
    assert_eq!(select("Gpus > none"), vec![2, 3]);
    assert_eq!(select("Gpus >= 2"), vec![2]);
    assert_eq!(select("Gpus = unknown"), vec![4]);
    assert_eq!(select("Cpu > +50 or Job <= +1"), vec![1, 2]);
}

#[test]
fn test_compile_errors() {
    let table = test_table();
    let e = compile_query(&table, &parse_query("Zappa = 1").unwrap()).err().unwrap();
    assert_eq!(e.to_string(), "Field not found: Zappa");
    assert!(compile_query(&table, &parse_query("Job = abc").unwrap()).is_err());
    assert!(compile_query(&table, &parse_query("Duration < '3h2d'").unwrap()).is_err());
    assert!(compile_query(&table, &parse_query("User =~ '('").unwrap()).is_err());
}

#[test]
fn test_duration_literal() {
    assert!(parse_duration_literal("1w2d3h4m").unwrap() == ((7 + 2) * 24 * 3600) + 3 * 3600 + 4 * 60);
    assert!(parse_duration_literal("90").unwrap() == 90);
    assert!(Value::Duration(90).render(MOD_SEC) == "90");
    assert!(parse_duration_literal("h").is_err());

    // Too large to represent in seconds
    let e = parse_duration_literal("99999999999999999w").unwrap_err();
    assert!(e.to_string() == "Invalid duration 99999999999999999w");
    assert!(parse_duration_literal("15250284452471w4d").is_err());
    let table = test_table();
    let q = parse_query("Duration > 99999999999999999w").unwrap();
    assert!(compile_query(&table, &q).is_err());
}
