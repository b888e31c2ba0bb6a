//! SQL parameter-style adaptation.
//!
//! Query templates throughout the crate use ordinal placeholders (`{0}`,
//! `{1}`, ...). Before execution each template is rendered into the marker
//! syntax the active driver expects, and the positional argument list is
//! bound accordingly (kept positional, or converted into a mapping with
//! synthetic `n0`, `n1`, ... keys for the named families).

use std::str::FromStr;

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use super::driver::{BoundArgs, SqlValue};
use crate::error::{ArchiveError, ArchiveResult};

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r"\{(\d+)\}").unwrap();
}

/// Marker prefix used by a named-style driver.
///
/// `At` covers one legacy engine whose driver wants `@name` markers and
/// `@`-prefixed binding keys; everything else sensible uses `:name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedMarker {
    Colon,
    At,
}

/// The parameter style a driver expects.
///
/// Each variant carries its own marker generation and argument binding, so
/// supporting a new style is one new variant rather than string comparisons
/// scattered across the query path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    /// Question marks: `WHERE name=?`
    Qmark,
    /// Numeric, positional: `WHERE name=:1`
    Numeric,
    /// Named: `WHERE name=:n0` (or `@n0`, see [`NamedMarker`])
    Named(NamedMarker),
    /// ANSI C printf codes: `WHERE name=%s`
    Format,
    /// Python extended format codes: `WHERE name=%(n0)s`
    Pyformat,
}

impl ParamStyle {
    /// Renders the marker for the `i`-th argument.
    fn marker(&self, i: usize) -> String {
        match self {
            Self::Qmark => "?".to_string(),
            Self::Numeric => format!(":{}", i + 1),
            Self::Named(NamedMarker::Colon) => format!(":n{}", i),
            Self::Named(NamedMarker::At) => format!("@n{}", i),
            Self::Format => "%s".to_string(),
            Self::Pyformat => format!("%(n{})s", i),
        }
    }

    /// The binding key for the `i`-th argument of a named family.
    fn named_key(&self, i: usize) -> String {
        match self {
            Self::Named(NamedMarker::At) => format!("@n{}", i),
            _ => format!("n{}", i),
        }
    }

    /// Binds a positional argument tuple the way this style requires.
    fn bind(&self, args: &[SqlValue]) -> BoundArgs {
        if args.is_empty() {
            return BoundArgs::None;
        }
        match self {
            Self::Named(_) | Self::Pyformat => BoundArgs::Named(
                args.iter()
                    .enumerate()
                    .map(|(i, v)| (self.named_key(i), v.clone()))
                    .collect(),
            ),
            _ => BoundArgs::Positional(args.to_vec()),
        }
    }

    /// Renders a query template into driver-ready SQL and bound arguments.
    ///
    /// With `prepared` disabled no placeholders are used at all: every
    /// argument is rendered directly into the SQL text, single-quoted if it
    /// is a string and bare otherwise. Embedded quotes are not escaped in
    /// that mode, so it must never be used with untrusted input; it exists
    /// for drivers and tests that cannot bind parameters.
    pub fn prepare(
        &self,
        sql: &str,
        args: &[SqlValue],
        prepared: bool,
    ) -> ArchiveResult<(String, BoundArgs)> {
        if !prepared {
            let literals: Vec<String> = args.iter().map(render_literal).collect();
            return Ok((render_template(sql, &literals)?, BoundArgs::None));
        }

        // Drivers of the format families interpret every '%' as the start
        // of a parameter marker, so literal percents in the template must
        // be escaped before the markers are substituted in.
        let sql = if matches!(self, Self::Format | Self::Pyformat) && sql.contains('%') {
            sql.replace('%', "%%")
        } else {
            sql.to_string()
        };

        if args.is_empty() {
            return Ok((sql, BoundArgs::None));
        }

        let markers: Vec<String> = (0..args.len()).map(|i| self.marker(i)).collect();
        Ok((render_template(&sql, &markers)?, self.bind(args)))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qmark => "qmark",
            Self::Numeric => "numeric",
            Self::Named(_) => "named",
            Self::Format => "format",
            Self::Pyformat => "pyformat",
        }
    }
}

impl FromStr for ParamStyle {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qmark" => Ok(Self::Qmark),
            "numeric" => Ok(Self::Numeric),
            "named" => Ok(Self::Named(NamedMarker::Colon)),
            "named-at" => Ok(Self::Named(NamedMarker::At)),
            "format" => Ok(Self::Format),
            "pyformat" => Ok(Self::Pyformat),
            other => Err(ArchiveError::UnsupportedParamStyle {
                name: other.to_string(),
            }),
        }
    }
}

/// Substitutes `{N}` placeholders with the given replacement strings.
///
/// A placeholder referencing a replacement that does not exist is a
/// programming error in the template and is never recovered.
fn render_template(sql: &str, replacements: &[String]) -> ArchiveResult<String> {
    let mut out_of_range = None;
    let rendered = PLACEHOLDER_RE.replace_all(sql, |caps: &Captures| {
        let idx: usize = caps[1].parse().unwrap_or(usize::MAX);
        match replacements.get(idx) {
            Some(replacement) => replacement.clone(),
            None => {
                out_of_range = Some(idx);
                String::new()
            }
        }
    });

    if let Some(idx) = out_of_range {
        return Err(ArchiveError::ParamError {
            reason: format!(
                "placeholder {{{}}} out of range ({} arguments given)",
                idx,
                replacements.len()
            ),
        });
    }

    Ok(rendered.into_owned())
}

/// Renders one value as a raw SQL literal (non-prepared mode only).
pub(crate) fn render_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Int(v) => v.to_string(),
        SqlValue::Float(v) => v.to_string(),
        SqlValue::Text(v) => format!("'{}'", v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<SqlValue> {
        values
            .iter()
            .map(|v| SqlValue::Text(v.to_string()))
            .collect()
    }

    #[test]
    fn test_markers_per_style() {
        let sql = "SELECT x FROM t WHERE a={0} AND b={1}";
        let args = args(&["one", "two"]);

        let cases = [
            (ParamStyle::Qmark, "SELECT x FROM t WHERE a=? AND b=?"),
            (ParamStyle::Numeric, "SELECT x FROM t WHERE a=:1 AND b=:2"),
            (
                ParamStyle::Named(NamedMarker::Colon),
                "SELECT x FROM t WHERE a=:n0 AND b=:n1",
            ),
            (
                ParamStyle::Named(NamedMarker::At),
                "SELECT x FROM t WHERE a=@n0 AND b=@n1",
            ),
            (ParamStyle::Format, "SELECT x FROM t WHERE a=%s AND b=%s"),
            (
                ParamStyle::Pyformat,
                "SELECT x FROM t WHERE a=%(n0)s AND b=%(n1)s",
            ),
        ];

        for (style, expected) in cases {
            let (rendered, _) = style.prepare(sql, &args, true).unwrap();
            assert_eq!(rendered, expected, "style {:?}", style);
        }
    }

    #[test]
    fn test_positional_binding_preserved() {
        let sql = "INSERT INTO t VALUES ({0}, {1})";
        let args = args(&["alpha", "beta"]);

        for style in [ParamStyle::Qmark, ParamStyle::Numeric, ParamStyle::Format] {
            let (_, bound) = style.prepare(sql, &args, true).unwrap();
            assert_eq!(bound, BoundArgs::Positional(args.clone()));
        }
    }

    #[test]
    fn test_named_binding_keys() {
        let sql = "INSERT INTO t VALUES ({0}, {1})";
        let args = args(&["alpha", "beta"]);

        let (_, bound) = ParamStyle::Pyformat.prepare(sql, &args, true).unwrap();
        assert_eq!(
            bound,
            BoundArgs::Named(vec![
                ("n0".to_string(), SqlValue::Text("alpha".to_string())),
                ("n1".to_string(), SqlValue::Text("beta".to_string())),
            ])
        );

        let (_, bound) = ParamStyle::Named(NamedMarker::At)
            .prepare(sql, &args, true)
            .unwrap();
        assert_eq!(
            bound,
            BoundArgs::Named(vec![
                ("@n0".to_string(), SqlValue::Text("alpha".to_string())),
                ("@n1".to_string(), SqlValue::Text("beta".to_string())),
            ])
        );
    }

    #[test]
    fn test_percent_literal_escaped() {
        let sql = "SELECT x FROM t WHERE a LIKE 'f%' AND b={0}";
        let args = args(&["one"]);

        let (rendered, _) = ParamStyle::Pyformat.prepare(sql, &args, true).unwrap();
        assert_eq!(
            rendered,
            "SELECT x FROM t WHERE a LIKE 'f%%' AND b=%(n0)s"
        );

        let (rendered, _) = ParamStyle::Format.prepare(sql, &args, true).unwrap();
        assert_eq!(rendered, "SELECT x FROM t WHERE a LIKE 'f%%' AND b=%s");

        // Styles that don't treat '%' as a marker leave the literal alone.
        let (rendered, _) = ParamStyle::Qmark.prepare(sql, &args, true).unwrap();
        assert_eq!(rendered, "SELECT x FROM t WHERE a LIKE 'f%' AND b=?");
    }

    #[test]
    fn test_non_prepared_renders_literals() {
        let sql = "INSERT INTO t VALUES ({0}, {1}, {2})";
        let args = vec![
            SqlValue::Text("abc".to_string()),
            SqlValue::Int(42),
            SqlValue::Null,
        ];

        let (rendered, bound) = ParamStyle::Qmark.prepare(sql, &args, false).unwrap();
        assert_eq!(rendered, "INSERT INTO t VALUES ('abc', 42, NULL)");
        assert_eq!(bound, BoundArgs::None);
    }

    #[test]
    fn test_unknown_style_rejected() {
        let err = "sqlesque".parse::<ParamStyle>().unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::UnsupportedParamStyle { name } if name == "sqlesque"
        ));
    }

    #[test]
    fn test_out_of_range_placeholder_rejected() {
        let err = ParamStyle::Qmark
            .prepare("SELECT {0}, {3}", &args(&["a"]), true)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::ParamError { .. }));
    }

    #[test]
    fn test_empty_args_passthrough() {
        let (rendered, bound) = ParamStyle::Pyformat
            .prepare("SELECT 1 FROM t", &[], true)
            .unwrap();
        assert_eq!(rendered, "SELECT 1 FROM t");
        assert_eq!(bound, BoundArgs::None);
    }
}
