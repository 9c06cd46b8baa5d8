//! Result rows returned by a store cursor.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::sync::Arc;

/// A single row read from a result set.
///
/// The batch consumer reads columns by ordinal only: the shape of a
/// read-back row is fixed by the command that produced it. Names are
/// optional and shared by every row of one result set.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    names: Option<Arc<[String]>>,
}

impl Row {
    /// A row whose columns carry names.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        Self::with_names(column_names.into(), values)
    }

    /// A row sharing the names of its result set.
    pub fn with_names(names: Arc<[String]>, values: Vec<Value>) -> Self {
        Self {
            values,
            names: Some(names),
        }
    }

    /// A row of unnamed columns, as returned by `SELECT <expr>`.
    pub fn from_values(values: Vec<Value>) -> Self {
        Self {
            values,
            names: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at `index`, if the row is that wide.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let index = self.names.as_ref()?.iter().position(|n| n == name)?;
        self.values.get(index)
    }

    /// Typed value at `index`.
    #[allow(clippy::result_large_err)]
    pub fn get_as<T: FromValue>(&self, index: usize) -> Result<T> {
        match self.get(index) {
            Some(value) => T::from_value(value),
            None => Err(Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("column {index} of a {}-column row", self.len()),
                column: None,
            })),
        }
    }

    /// Column names, empty for unnamed rows.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().flat_map(|n| n.iter().map(String::as_str))
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Trait for converting from a `Value` to a typed value.
pub trait FromValue: Sized {
    /// Convert from a Value, returning an error if the conversion fails.
    #[allow(clippy::result_large_err)]
    fn from_value(value: &Value) -> Result<Self>;
}

fn type_error(expected: &'static str, value: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: value.type_name().to_string(),
        column: None,
    })
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| type_error("bool", value))
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| type_error("i64", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| type_error("String", value))
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_and_name_access() {
        let row = Row::new(
            vec!["id".to_string(), "name".to_string()],
            vec![Value::BigInt(7), Value::Text("Ann".to_string())],
        );
        assert_eq!(row.get(0), Some(&Value::BigInt(7)));
        assert_eq!(row.get_by_name("name"), Some(&Value::Text("Ann".into())));
        assert_eq!(row.get(2), None);
        assert_eq!(row.column_names().collect::<Vec<_>>(), ["id", "name"]);
    }

    #[test]
    fn typed_access_reports_out_of_bounds() {
        let row = Row::from_values(vec![Value::Int(3)]);
        assert_eq!(row.get_as::<i64>(0).unwrap(), 3);
        let err = row.get_as::<i64>(1).unwrap_err();
        assert!(err.to_string().contains("column 1 of a 1-column row"));
    }

    #[test]
    fn unnamed_rows_have_no_names() {
        let row = Row::from_values(vec![Value::BigInt(1)]);
        assert_eq!(row.column_names().count(), 0);
        assert_eq!(row.get_by_name("column0"), None);
    }

    #[test]
    fn typed_access_rejects_wrong_type() {
        let row = Row::from_values(vec![Value::Text("x".into())]);
        assert!(matches!(row.get_as::<i64>(0), Err(Error::Type(_))));
    }
}
