//! Row construction and composite key binding.

use rusqlite::types::{FromSql, ToSql, Value};
use rusqlite::Row;

use crate::error::{DbError, Result};

/// A record built from one result row by positional column mapping.
///
/// Column `i` of the `SELECT` list maps to field `i` of the record.
/// Implemented for tuples of up to eight [`FromSql`] values.
///
/// ```
/// use keystone_db::FromRow;
///
/// struct Account {
///     id: i64,
///     name: String,
/// }
///
/// impl FromRow for Account {
///     fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
///         Ok(Self {
///             id: row.get(0)?,
///             name: row.get(1)?,
///         })
///     }
/// }
/// ```
pub trait FromRow: Sized {
    /// Builds the record from `row`.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

macro_rules! tuple_from_row {
    ($($idx:tt => $ty:ident),+) => {
        impl<$($ty: FromSql),+> FromRow for ($($ty,)+) {
            fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
                Ok(($(row.get::<usize, $ty>($idx)?,)+))
            }
        }
    };
}

tuple_from_row!(0 => A);
tuple_from_row!(0 => A, 1 => B);
tuple_from_row!(0 => A, 1 => B, 2 => C);
tuple_from_row!(0 => A, 1 => B, 2 => C, 3 => D);
tuple_from_row!(0 => A, 1 => B, 2 => C, 3 => D, 4 => E);
tuple_from_row!(0 => A, 1 => B, 2 => C, 3 => D, 4 => E, 5 => F);
tuple_from_row!(0 => A, 1 => B, 2 => C, 3 => D, 4 => E, 5 => F, 6 => G);
tuple_from_row!(0 => A, 1 => B, 2 => C, 3 => D, 4 => E, 5 => F, 6 => G, 7 => H);

/// An ordered tuple of values matched against a per-key filter.
///
/// The number of values must equal the number of `?` placeholders in the
/// filter the key is used with.
pub trait CompositeKey {
    /// Number of values in the key.
    fn arity(&self) -> usize;

    /// Appends the key's values to `out` in tuple order.
    fn bind_values<'a>(&'a self, out: &mut Vec<&'a dyn ToSql>);
}

macro_rules! tuple_key {
    ($arity:expr; $($idx:tt => $ty:ident),+) => {
        impl<$($ty: ToSql),+> CompositeKey for ($($ty,)+) {
            fn arity(&self) -> usize {
                $arity
            }

            fn bind_values<'a>(&'a self, out: &mut Vec<&'a dyn ToSql>) {
                $(out.push(&self.$idx);)+
            }
        }
    };
}

tuple_key!(1; 0 => A);
tuple_key!(2; 0 => A, 1 => B);
tuple_key!(3; 0 => A, 1 => B, 2 => C);
tuple_key!(4; 0 => A, 1 => B, 2 => C, 3 => D);
tuple_key!(5; 0 => A, 1 => B, 2 => C, 3 => D, 4 => E);
tuple_key!(6; 0 => A, 1 => B, 2 => C, 3 => D, 4 => E, 5 => F);

impl<T: ToSql, const N: usize> CompositeKey for [T; N] {
    fn arity(&self) -> usize {
        N
    }

    fn bind_values<'a>(&'a self, out: &mut Vec<&'a dyn ToSql>) {
        out.extend(self.iter().map(|v| v as &dyn ToSql));
    }
}

impl CompositeKey for Vec<Value> {
    fn arity(&self) -> usize {
        self.len()
    }

    fn bind_values<'a>(&'a self, out: &mut Vec<&'a dyn ToSql>) {
        out.extend(self.iter().map(|v| v as &dyn ToSql));
    }
}

/// Counts anonymous `?` placeholders in `sql`, skipping quoted literals,
/// identifiers and comments.
///
/// # Errors
///
/// Returns `DbError::MalformedFilter` for numbered placeholders (`?NNN`),
/// which would bind the same parameter in every repeated `OR` term.
pub fn count_placeholders(sql: &str) -> Result<usize> {
    let mut count = 0;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' | '[' => {
                let close = if c == '[' { ']' } else { c };
                for inner in chars.by_ref() {
                    if inner == close {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            '?' => {
                if chars.peek().is_some_and(char::is_ascii_digit) {
                    return Err(DbError::MalformedFilter(format!(
                        "numbered placeholders are not supported in `{sql}`"
                    )));
                }
                count += 1;
            }
            _ => {}
        }
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(sql: &str) -> usize {
        count_placeholders(sql).expect("anonymous placeholders")
    }

    #[test]
    fn placeholders_inside_literals_are_ignored() {
        assert_eq!(count("field1=? AND field2=?"), 2);
        assert_eq!(count("name = '?' AND id = ?"), 1);
        assert_eq!(count("\"odd?col\" = ?"), 1);
        assert_eq!(count("[what?] = ? OR x = ?"), 2);
        assert_eq!(count("x = 1"), 0);
    }

    #[test]
    fn placeholders_inside_comments_are_ignored() {
        assert_eq!(count("a = ? -- or b = ?\n AND c = ?"), 2);
        assert_eq!(count("a = ? /* b = ? */ AND c = ?"), 2);
        assert_eq!(count("a = ? -- trailing ?"), 1);
        assert_eq!(count("a = ? /* unterminated ?"), 1);
        assert_eq!(count("a - ? = 1"), 1);
        assert_eq!(count("a / ? = 1"), 1);
    }

    #[test]
    fn numbered_placeholders_are_rejected() {
        let err = count_placeholders("a=?1 AND b=?2").expect_err("numbered");
        assert!(matches!(err, DbError::MalformedFilter(_)));
        assert_eq!(count("a = '?1' AND b = ?"), 1);
    }

    #[test]
    fn tuple_keys_bind_in_order() {
        let key = (20_i64, "eleven", 3.5_f64);
        let mut out = Vec::new();
        key.bind_values(&mut out);

        assert_eq!(key.arity(), 3);
        assert_eq!(out.len(), 3);
        assert_eq!(
            out[1].to_sql().expect("bind"),
            rusqlite::types::ToSqlOutput::from("eleven")
        );
    }

    #[test]
    fn array_and_value_keys_report_arity() {
        assert_eq!([1_i64, 2].arity(), 2);
        let dynamic = vec![Value::Integer(1), Value::Text("a".into()), Value::Null];
        assert_eq!(dynamic.arity(), 3);
    }

    #[test]
    fn tuple_rows_map_positionally() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        let row: (i64, String, Option<i64>) = conn
            .query_row("SELECT 7, 'seven', NULL", [], |row| FromRow::from_row(row))
            .expect("query");
        assert_eq!(row, (7, "seven".to_string(), None));
    }
}
