//! Cursors and rows.
//!
//! A cursor is the server-side position of one execution. Rows arrive in
//! batches, are checked against the column descriptors returned at execute
//! time, and are handed out as [`Row`] values sharing those descriptors.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::NaiveDateTime;

use super::connection::Connection;
use super::error::{RelayError, RelayResult};
use super::handles::{CursorHandle, StatementHandle};
use super::protocol::{ColumnDescriptor, RowValues};
use super::types::{TypeTag, Value};

/// Column descriptors shared by every row of a result.
pub type SharedColumns = Arc<Vec<ColumnDescriptor>>;

// ============================================================================
// Cursor entries
// ============================================================================

/// Session-side state of one open cursor.
#[derive(Debug, Clone)]
pub(crate) struct CursorEntry {
    /// `None` for a result set reattached by id
    pub statement: Option<StatementHandle>,
    pub server_id: u64,
    /// Link epoch the cursor was opened on
    pub epoch: u64,
    pub columns: SharedColumns,
    pub affected_rows: Option<u64>,
    pub exhausted: bool,
}

/// Check that a row matches its result's column descriptors.
pub(crate) fn validate_row(columns: &[ColumnDescriptor], values: &RowValues) -> RelayResult<()> {
    if values.len() != columns.len() {
        return Err(RelayError::protocol(format!(
            "row has {} value(s) for {} column(s)",
            values.len(),
            columns.len()
        )));
    }
    for (index, (column, value)) in columns.iter().zip(values.iter()).enumerate() {
        let ok = match value {
            Value::Null => column.nullable,
            other => other.type_tag() == column.type_tag,
        };
        if !ok {
            return Err(RelayError::TypeMismatch {
                column: index,
                expected: column.type_tag,
                actual: value.describe(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// Rows
// ============================================================================

/// One result row.
#[derive(Debug, Clone)]
pub struct Row {
    columns: SharedColumns,
    values: RowValues,
}

impl Row {
    pub(crate) fn new(columns: SharedColumns, values: RowValues) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> RowValues {
        self.values
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Position of the column called `name`.
    pub fn index_of(&self, name: &str) -> RelayResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| RelayError::NoSuchColumn(name.to_string()))
    }

    /// Raw value at `index`.
    pub fn value(&self, index: usize) -> RelayResult<&Value> {
        self.values
            .get(index)
            .ok_or_else(|| RelayError::NoSuchColumn(index.to_string()))
    }

    /// Typed value at `index`. Never coerces between types.
    pub fn get<T: FromValue>(&self, index: usize) -> RelayResult<T> {
        let value = self.value(index)?;
        T::from_value(value).ok_or_else(|| RelayError::TypeMismatch {
            column: index,
            expected: T::TAG,
            actual: value.describe(),
        })
    }

    /// Typed value of the column called `name`.
    pub fn get_by_name<T: FromValue>(&self, name: &str) -> RelayResult<T> {
        self.get(self.index_of(name)?)
    }

    pub fn get_i64(&self, index: usize) -> RelayResult<i64> {
        self.get(index)
    }

    pub fn get_f64(&self, index: usize) -> RelayResult<f64> {
        self.get(index)
    }

    pub fn get_str(&self, index: usize) -> RelayResult<&str> {
        match self.value(index)? {
            Value::String(s) => Ok(s),
            other => Err(RelayError::TypeMismatch {
                column: index,
                expected: TypeTag::String,
                actual: other.describe(),
            }),
        }
    }

    pub fn get_bytes(&self, index: usize) -> RelayResult<&[u8]> {
        match self.value(index)? {
            Value::Bytes(b) => Ok(b),
            other => Err(RelayError::TypeMismatch {
                column: index,
                expected: TypeTag::Bytes,
                actual: other.describe(),
            }),
        }
    }

    pub fn get_datetime(&self, index: usize) -> RelayResult<NaiveDateTime> {
        self.get(index)
    }

    pub fn get_bool(&self, index: usize) -> RelayResult<bool> {
        self.get(index)
    }

    pub fn is_null(&self, index: usize) -> RelayResult<bool> {
        Ok(self.value(index)?.is_null())
    }
}

/// Types a [`Value`] can be read as without conversion.
pub trait FromValue: Sized {
    /// Tag reported in mismatch errors.
    const TAG: TypeTag;

    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! impl_from_value {
    ($ty:ty, $tag:ident, $pat:pat => $out:expr) => {
        impl FromValue for $ty {
            const TAG: TypeTag = TypeTag::$tag;

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    $pat => Some($out),
                    _ => None,
                }
            }
        }
    };
}

impl_from_value!(i64, Integer, Value::Integer(v) => *v);
impl_from_value!(f64, Float, Value::Float(v) => *v);
impl_from_value!(String, String, Value::String(v) => v.clone());
impl_from_value!(Vec<u8>, Bytes, Value::Bytes(v) => v.clone());
impl_from_value!(NaiveDateTime, DateTime, Value::DateTime(v) => *v);
impl_from_value!(bool, Bool, Value::Bool(v) => *v);

impl<T: FromValue> FromValue for Option<T> {
    const TAG: TypeTag = T::TAG;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Fully materialized result of a one-shot execution.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: SharedColumns,
    pub affected_rows: Option<u64>,
    pub rows: Vec<Row>,
}

// ============================================================================
// Row streams
// ============================================================================

/// Lazy, forward-only iteration over a cursor.
///
/// Fetches one batch at a time; dropping the stream early leaves the rest of
/// the result on the proxy until the cursor is closed.
pub struct RowStream {
    connection: Connection,
    cursor: CursorHandle,
    batch: u32,
    buffer: VecDeque<Row>,
    done: bool,
}

impl RowStream {
    pub(crate) fn new(connection: Connection, cursor: CursorHandle, batch: u32) -> Self {
        Self {
            connection,
            cursor,
            batch,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    pub fn cursor(&self) -> CursorHandle {
        self.cursor
    }

    /// Next row, or `None` once the cursor is exhausted.
    pub async fn next(&mut self) -> RelayResult<Option<Row>> {
        if let Some(row) = self.buffer.pop_front() {
            return Ok(Some(row));
        }
        if self.done {
            return Ok(None);
        }

        let rows = self.connection.fetch(self.cursor, self.batch).await?;
        if self.batch == 0 || rows.len() < self.batch as usize {
            self.done = true;
        }
        self.buffer.extend(rows);
        Ok(self.buffer.pop_front())
    }

    /// Drain the remaining rows.
    pub async fn try_collect(mut self) -> RelayResult<Vec<Row>> {
        let mut out = Vec::new();
        while let Some(row) = self.next().await? {
            out.push(row);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn columns() -> SharedColumns {
        Arc::new(vec![
            ColumnDescriptor::new("id", TypeTag::Integer, false),
            ColumnDescriptor::new("name", TypeTag::String, true),
        ])
    }

    #[test]
    fn test_validate_row() {
        let cols = columns();
        assert!(validate_row(&cols, &smallvec![Value::Integer(1), Value::Null]).is_ok());

        let err = validate_row(&cols, &smallvec![Value::Null, Value::Null]).unwrap_err();
        assert!(matches!(err, RelayError::TypeMismatch { column: 0, .. }));

        let err =
            validate_row(&cols, &smallvec![Value::Integer(1), Value::Integer(2)]).unwrap_err();
        assert!(matches!(
            err,
            RelayError::TypeMismatch {
                column: 1,
                expected: TypeTag::String,
                ..
            }
        ));

        let err = validate_row(&cols, &smallvec![Value::Integer(1)]).unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[test]
    fn test_typed_getters_do_not_coerce() {
        let row = Row::new(columns(), smallvec![Value::Integer(7), Value::from("x")]);
        assert_eq!(row.get_i64(0).unwrap(), 7);
        assert_eq!(row.get_str(1).unwrap(), "x");
        assert_eq!(row.get_by_name::<String>("name").unwrap(), "x");

        assert!(matches!(
            row.get_f64(0),
            Err(RelayError::TypeMismatch {
                expected: TypeTag::Float,
                ..
            })
        ));
        assert!(matches!(row.get_str(0), Err(RelayError::TypeMismatch { .. })));
        assert!(matches!(row.get_i64(5), Err(RelayError::NoSuchColumn(_))));
        assert!(matches!(
            row.get_by_name::<i64>("missing"),
            Err(RelayError::NoSuchColumn(_))
        ));
    }

    #[test]
    fn test_null_reads() {
        let row = Row::new(columns(), smallvec![Value::Integer(7), Value::Null]);
        assert_eq!(row.get::<Option<String>>(1).unwrap(), None);
        assert!(row.is_null(1).unwrap());
        assert!(matches!(row.get::<String>(1), Err(RelayError::TypeMismatch { .. })));
    }
}
