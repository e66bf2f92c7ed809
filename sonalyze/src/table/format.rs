// Generic formatting code for a set of data extracted from a data structure to be presented
// columnar, as csv, as json, or for awk, with or without a header.
//
// A `Table<T>` is a registry of the printable fields of some row type T.  Each field has a name, a
// kind, a help text, and a function that extracts a `Value` from a row.  Aliases are first-class
// entries that expand to one or more fields.  A `--fmt` spec is a comma-separated list of field
// names, alias names, and control words; field names can carry modifiers `/sec`, `/iso` and `/m30`.

use anyhow::{bail, Result};
use sonarlog::{GpuSet, Timestamp};
use std::collections::BTreeSet;
use std::io;

/// Print modifiers for individual fields.

pub const MOD_SEC: u32 = 1; // Times and durations as integer seconds
pub const MOD_ISO: u32 = 2; // Times as RFC 3339
pub const MOD_M30: u32 = 4; // Strings truncated to 30 characters

/// No more than this many fields can be selected, after alias expansion.

pub const MAX_FIELDS: usize = 200;

/// The type of a field, used to interpret literals in queries.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Str,
    Int,
    UInt,
    Float,
    Time,
    Duration,
    Gpus,
    Bool,
}

/// A field value extracted from a row.  A Duration is in seconds.

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Time(Timestamp),
    Duration(i64),
    Gpus(GpuSet),
    Bool(bool),
}

impl Value {
    /// True for the values that `nodefaults` elides.

    pub fn is_zero(&self) -> bool {
        match self {
            Value::Str(s) => s.is_empty(),
            Value::Int(n) => *n == 0,
            Value::UInt(n) => *n == 0,
            Value::Float(f) => *f == 0.0,
            Value::Time(t) => t.timestamp() == 0,
            Value::Duration(d) => *d == 0,
            Value::Gpus(g) => g.is_empty(),
            Value::Bool(b) => !*b,
        }
    }

    pub fn render(&self, mods: u32) -> String {
        match self {
            Value::Str(s) => {
                if mods & MOD_M30 != 0 && s.chars().count() > 30 {
                    s.chars().take(30).collect()
                } else {
                    s.clone()
                }
            }
            Value::Int(n) => n.to_string(),
            Value::UInt(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Time(t) => {
                if mods & MOD_SEC != 0 {
                    t.timestamp().to_string()
                } else if mods & MOD_ISO != 0 {
                    t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                } else {
                    t.format("%Y-%m-%d %H:%M").to_string()
                }
            }
            Value::Duration(d) => {
                if mods & MOD_SEC != 0 {
                    d.to_string()
                } else {
                    format_duration(*d)
                }
            }
            Value::Gpus(g) => g.to_string(),
            Value::Bool(b) => b.to_string(),
        }
    }
}

/// Days, hours and minutes, with the seconds rounded to the nearest minute.

pub fn format_duration(seconds: i64) -> String {
    let minutes = (seconds + 30) / 60;
    format!("{}d{:2}h{:2}m", minutes / (60 * 24), (minutes / 60) % 24, minutes % 60)
}

pub struct Field<T> {
    pub name: &'static str,
    pub kind: Kind,
    pub help: &'static str,
    pub value: fn(&T) -> Value,
}

/// The field registry for rows of type T.

pub struct Table<T> {
    fields: Vec<Field<T>>,
    aliases: Vec<(&'static str, Vec<&'static str>)>,
}

/// A selected field: the index of the field in the table, the name to print in the header, and the
/// print modifiers.

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub index: usize,
    pub name: String,
    pub mods: u32,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Table<T> {
    pub fn new() -> Table<T> {
        Table { fields: vec![], aliases: vec![] }
    }

    pub fn field(
        mut self,
        name: &'static str,
        kind: Kind,
        help: &'static str,
        value: fn(&T) -> Value,
    ) -> Table<T> {
        self.fields.push(Field { name, kind, help, value });
        self
    }

    /// An alias names one or more fields.  A target can itself be a single-field alias but not a
    /// multi-field one.

    pub fn alias(mut self, name: &'static str, targets: &[&'static str]) -> Table<T> {
        self.aliases.push((name, targets.to_vec()));
        self
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    // A field name, or the name of an alias for exactly one field name.
    fn resolve(&self, name: &str) -> Option<usize> {
        if let Some(ix) = self.index_of(name) {
            return Some(ix);
        }
        match self.aliases.iter().find(|(a, _)| *a == name) {
            Some((_, targets)) if targets.len() == 1 => self.index_of(targets[0]),
            _ => None,
        }
    }

    /// Find a field by its name or by the name of an alias for exactly that field.

    pub fn lookup(&self, name: &str) -> Option<&Field<T>> {
        self.resolve(name).map(|ix| &self.fields[ix])
    }

    pub fn get(&self, spec: &FieldSpec) -> &Field<T> {
        &self.fields[spec.index]
    }

    /// Parse a `--fmt` spec into the list of selected fields and the set of other words.  A
    /// single-field alias prints under its own name, a multi-field alias prints its fields under
    /// theirs.

    pub fn parse_spec(&self, spec: &str) -> Result<(Vec<FieldSpec>, BTreeSet<String>)> {
        let mut fields = vec![];
        let mut others = BTreeSet::new();
        for word in spec.split(',') {
            if word.is_empty() {
                continue;
            }
            let (name, mods) = match word.split_once('/') {
                Some((name, modifiers)) => {
                    let mut mods = 0;
                    for m in modifiers.split('/') {
                        mods |= match m {
                            "sec" => MOD_SEC,
                            "iso" => MOD_ISO,
                            "m30" => MOD_M30,
                            _ => bail!("Unknown modifier /{m} in {word}"),
                        }
                    }
                    (name, mods)
                }
                None => (word, 0),
            };
            if let Some(index) = self.index_of(name) {
                fields.push(FieldSpec { index, name: word.to_string(), mods });
            } else if let Some((_, targets)) = self.aliases.iter().find(|(a, _)| *a == name) {
                for &t in targets {
                    let Some(index) = self.resolve(t) else {
                        bail!("Alias {name} names unknown field {t}");
                    };
                    let header = if targets.len() == 1 { name } else { t };
                    let header = if mods != 0 {
                        format!("{header}{}", &word[name.len()..])
                    } else {
                        header.to_string()
                    };
                    fields.push(FieldSpec { index, name: header, mods });
                }
            } else if mods != 0 {
                bail!("Unknown field {name}");
            } else {
                others.insert(word.to_string());
            }
            if fields.len() > MAX_FIELDS {
                bail!("Too many fields in format spec");
            }
        }
        Ok((fields, others))
    }

    /// Print a description of the fields, aliases and control words, along with the default
    /// spec.

    pub fn help(&self, output: &mut dyn io::Write, defaults: &str) -> Result<()> {
        writeln!(output, "Syntax:\n  --fmt=(field|alias|control)[/modifier...],...\n")?;
        writeln!(output, "Fields:")?;
        let w = self.fields.iter().map(|f| f.name.len()).max().unwrap_or(0);
        for f in &self.fields {
            writeln!(output, "  {:w$}  {}", f.name, f.help)?;
        }
        if !self.aliases.is_empty() {
            writeln!(output, "\nAliases:")?;
            let w = self.aliases.iter().map(|(a, _)| a.len()).max().unwrap_or(0);
            for (a, targets) in &self.aliases {
                writeln!(output, "  {:w$}  {}", a, targets.join(","))?;
            }
        }
        writeln!(output, "\nDefaults:\n  {defaults}\n")?;
        writeln!(
            output,
            "Modifiers:\n  \
             sec       times and durations as integer seconds\n  \
             iso       times as RFC 3339\n  \
             m30       strings truncated to 30 characters\n"
        )?;
        writeln!(
            output,
            "Control:\n  \
             fixed     fixed-width columns\n  \
             csv       comma-separated values\n  \
             csvnamed  comma-separated name=value pairs\n  \
             json      an array of objects\n  \
             awk       space-separated values, spaces in values replaced by _\n  \
             header    print a header (fixed, csv)\n  \
             noheader  do not print a header\n  \
             nodefaults  omit zero, empty and false values (csv, json, awk)\n  \
             tag:X     add a final column `tag` with the value X"
        )?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FormatOptions {
    pub fixed: bool,
    pub csv: bool,
    pub json: bool,
    pub awk: bool,
    pub header: bool,
    pub named: bool,
    pub nodefaults: bool,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultFormat {
    None,
    Fixed,
    Csv,
}

/// Interpret the other words of a format spec.  Of the output formats csv beats json beats awk
/// beats fixed; `csvnamed` implies csv.  If none is requested the default applies.  The header is
/// on by default for fixed output and off by default for csv, and never printed for json and awk.

pub fn standard_options(others: &BTreeSet<String>, def: DefaultFormat) -> FormatOptions {
    let has = |s: &str| others.contains(s);
    let named = has("csvnamed");
    let mut csv = has("csv") || named;
    let json = has("json") && !csv;
    let awk = has("awk") && !csv && !json;
    let mut fixed = has("fixed") && !csv && !json && !awk;
    if !csv && !json && !awk && !fixed {
        match def {
            DefaultFormat::Fixed => fixed = true,
            DefaultFormat::Csv => csv = true,
            DefaultFormat::None => {}
        }
    }
    FormatOptions {
        fixed,
        csv,
        json,
        awk,
        header: (fixed && !has("noheader")) || (csv && has("header")),
        named,
        nodefaults: has("nodefaults"),
        tag: others.iter().find_map(|x| x.strip_prefix("tag:").map(|t| t.to_string())),
    }
}

/// Format the `data` by the `fields` and print them on `output`.  Absent an output format in the
/// options the output is fixed-format.

pub fn format_data<T>(
    output: &mut dyn io::Write,
    fields: &[FieldSpec],
    table: &Table<T>,
    opts: &FormatOptions,
    data: &[T],
) -> Result<()> {
    // Row-major matrix of cells, None for cells elided by nodefaults.
    let rows = data
        .iter()
        .map(|x| {
            fields
                .iter()
                .map(|f| {
                    let v = (table.get(f).value)(x);
                    if opts.nodefaults && v.is_zero() {
                        None
                    } else {
                        Some(v.render(f.mods))
                    }
                })
                .collect::<Vec<Option<String>>>()
        })
        .collect::<Vec<Vec<Option<String>>>>();
    let names = fields.iter().map(|f| f.name.as_str()).collect::<Vec<&str>>();

    if opts.csv {
        format_csv(output, &names, opts, &rows)
    } else if opts.json {
        format_json(output, &names, opts, &rows)
    } else if opts.awk {
        format_awk(output, opts, &rows)
    } else {
        format_fixed(output, &names, opts, &rows)
    }
}

fn format_fixed(
    output: &mut dyn io::Write,
    names: &[&str],
    opts: &FormatOptions,
    rows: &[Vec<Option<String>>],
) -> Result<()> {
    let mut header = names.iter().map(|s| s.to_string()).collect::<Vec<String>>();
    let mut body = rows
        .iter()
        .map(|r| r.iter().map(|c| c.clone().unwrap_or_default()).collect::<Vec<String>>())
        .collect::<Vec<Vec<String>>>();
    if let Some(ref tag) = opts.tag {
        header.push("tag".to_string());
        body.iter_mut().for_each(|r| r.push(tag.clone()));
    }

    // The column width is the max across all the entries in the column (including header, if
    // present).
    let mut widths = vec![0; header.len()];
    if opts.header {
        for (w, h) in widths.iter_mut().zip(header.iter()) {
            *w = h.chars().count();
        }
    }
    for r in &body {
        for (w, c) in widths.iter_mut().zip(r.iter()) {
            *w = usize::max(*w, c.chars().count());
        }
    }

    let line = |cells: &[String]| {
        let mut s = String::new();
        for (c, w) in cells.iter().zip(widths.iter()) {
            s += c;
            s += &" ".repeat(w - c.chars().count() + 2);
        }
        s.trim_end().to_string()
    };
    if opts.header {
        writeln!(output, "{}", line(&header))?;
    }
    for r in &body {
        writeln!(output, "{}", line(r))?;
    }
    Ok(())
}

fn format_csv(
    output: &mut dyn io::Write,
    names: &[&str],
    opts: &FormatOptions,
    rows: &[Vec<Option<String>>],
) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(output);
    if opts.header {
        let mut h = names.iter().map(|s| s.to_string()).collect::<Vec<String>>();
        if opts.tag.is_some() {
            h.push("tag".to_string());
        }
        writer.write_record(&h)?;
    }
    for r in rows {
        let mut out = vec![];
        for (name, cell) in names.iter().zip(r.iter()) {
            match cell {
                None => {}
                Some(v) if opts.named => out.push(format!("{name}={v}")),
                Some(v) => out.push(v.clone()),
            }
        }
        if let Some(ref tag) = opts.tag {
            out.push(if opts.named { format!("tag={tag}") } else { tag.clone() });
        }
        writer.write_record(&out)?;
    }
    writer.flush()?;
    Ok(())
}

fn format_json(
    output: &mut dyn io::Write,
    names: &[&str],
    opts: &FormatOptions,
    rows: &[Vec<Option<String>>],
) -> Result<()> {
    let mut s = String::from("[");
    for (i, r) in rows.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        s.push('{');
        let mut sep = "";
        for (name, cell) in names.iter().zip(r.iter()) {
            if let Some(v) = cell {
                s += &format!("{sep}{}:{}", serde_json::to_string(name)?, serde_json::to_string(v)?);
                sep = ",";
            }
        }
        if let Some(ref tag) = opts.tag {
            s += &format!("{sep}\"tag\":{}", serde_json::to_string(tag)?);
        }
        s.push('}');
    }
    s.push(']');
    output.write_all(s.as_bytes())?;
    Ok(())
}

fn format_awk(
    output: &mut dyn io::Write,
    opts: &FormatOptions,
    rows: &[Vec<Option<String>>],
) -> Result<()> {
    for r in rows {
        let mut cells = r.iter().flatten().map(|v| v.replace(' ', "_")).collect::<Vec<String>>();
        if let Some(ref tag) = opts.tag {
            cells.push(tag.clone());
        }
        writeln!(output, "{}", cells.join(" "))?;
    }
    Ok(())
}

#[cfg(test)]
struct Row {
    name: String,
    n: i64,
    t: Timestamp,
    d: i64,
}

#[cfg(test)]
fn test_table() -> Table<Row> {
    Table::new()
        .field("Name", Kind::Str, "The name", |r: &Row| Value::Str(r.name.clone()))
        .field("N", Kind::Int, "The count", |r: &Row| Value::Int(r.n))
        .field("Time", Kind::Time, "The time", |r: &Row| Value::Time(r.t))
        .field("Duration", Kind::Duration, "The duration", |r: &Row| Value::Duration(r.d))
        .alias("name", &["Name"])
        .alias("all", &["name", "N"])
}

#[cfg(test)]
fn test_rows() -> Vec<Row> {
    let t = sonarlog::timestamp_from_ymdhms(2023, 11, 14, 22, 13, 20).unwrap();
    vec![
        Row { name: "first row".to_string(), n: 0, t, d: 90 },
        Row { name: "x".to_string(), n: 12345, t, d: 86400 + 3600 + 29 },
    ]
}

#[cfg(test)]
fn run_format(spec: &str) -> String {
    let table = test_table();
    let (fields, others) = table.parse_spec(spec).unwrap();
    let opts = standard_options(&others, DefaultFormat::Fixed);
    let mut out = vec![];
    format_data(&mut out, &fields, &table, &opts, &test_rows()).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn test_parse_spec() {
    let table = test_table();
    let (fields, others) = table.parse_spec("name,all,Time/sec,csv,tag:zappa,,help").unwrap();
    let names = fields.iter().map(|f| f.name.as_str()).collect::<Vec<&str>>();
    assert_eq!(names, vec!["name", "name", "N", "Time/sec"]);
    assert!(fields[3].mods == MOD_SEC);
    assert!(others.contains("csv") && others.contains("tag:zappa") && others.contains("help"));
    assert!(table.parse_spec("Time/bogus").is_err());

    let long = vec!["all"; 101].join(",");
    assert!(table.parse_spec(&long).is_err());

    assert!(table.lookup("name").unwrap().name == "Name");
    assert!(table.lookup("all").is_none());
}

#[test]
fn test_standard_options() {
    let set = |xs: &[&str]| xs.iter().map(|x| x.to_string()).collect::<BTreeSet<String>>();
    let o = standard_options(&set(&["json", "csv", "header"]), DefaultFormat::Fixed);
    assert!(o.csv && !o.json && !o.fixed && o.header);
    let o = standard_options(&set(&["awk", "json"]), DefaultFormat::Fixed);
    assert!(o.json && !o.awk && !o.header);
    let o = standard_options(&set(&[]), DefaultFormat::Fixed);
    assert!(o.fixed && o.header);
    let o = standard_options(&set(&["noheader"]), DefaultFormat::Fixed);
    assert!(o.fixed && !o.header);
    let o = standard_options(&set(&["csvnamed"]), DefaultFormat::None);
    assert!(o.csv && o.named && !o.header);
    let o = standard_options(&set(&[]), DefaultFormat::None);
    assert!(!o.csv && !o.json && !o.awk && !o.fixed);
}

#[test]
fn test_format_fixed() {
    let s = run_format("Name,N,Time,Duration");
    assert_eq!(
        s,
        "Name       N      Time              Duration\n\
         first row  0      2023-11-14 22:13  0d 0h 2m\n\
         x          12345  2023-11-14 22:13  1d 1h 0m\n"
    );
    // Determinism
    assert_eq!(s, run_format("Name,N,Time,Duration"));
}

#[test]
fn test_format_csv_json_awk() {
    assert_eq!(
        run_format("Name,N,Time/iso,csv,header"),
        "Name,N,Time/iso\nfirst row,0,2023-11-14T22:13:20Z\nx,12345,2023-11-14T22:13:20Z\n"
    );
    assert_eq!(
        run_format("name,N,csvnamed,nodefaults"),
        "name=first row\nname=x,N=12345\n"
    );
    assert_eq!(
        run_format("name,N,Duration/sec,json,nodefaults,tag:t"),
        "[{\"name\":\"first row\",\"Duration\":\"90\",\"tag\":\"t\"},\
         {\"name\":\"x\",\"N\":\"12345\",\"Duration\":\"90029\",\"tag\":\"t\"}]"
    );
    assert_eq!(run_format("Name,N,awk"), "first_row 0\nx 12345\n");
}

#[test]
fn test_format_duration() {
    assert!(format_duration(0) == "0d 0h 0m");
    assert!(format_duration(29) == "0d 0h 0m");
    assert!(format_duration(30) == "0d 0h 1m");
    assert!(format_duration(2 * 86400 + 4 * 3600 + 7 * 60) == "2d 4h 7m");
}
