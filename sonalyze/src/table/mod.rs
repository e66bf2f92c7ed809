// Field registries, output formatting, and the query language for the analysis verbs.

mod format;
mod lexer;
mod query;

pub use format::{
    format_data, format_duration, standard_options, DefaultFormat, Field, FieldSpec,
    FormatOptions, Kind, Table, Value, MOD_ISO, MOD_M30, MOD_SEC,
};
pub use query::{compile_query, parse_query, Filter, Node, RelOp};
