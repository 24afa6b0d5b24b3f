//! Python interface over the relay engine.
//!
//! Every network operation returns an awaitable driven by the shared tokio
//! runtime. Handles stay in Rust; Python objects only carry them.

use std::sync::Arc;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use pyo3::exceptions::PyTypeError;
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyBytes, PyDict, PyFloat, PyInt, PyList, PyString, PyTuple};
use pyo3::IntoPyObjectExt;

use crate::error::ProgrammingError;
use crate::relay::connection::complete_binds;
use crate::relay::{
    Connection, CursorHandle, Endpoint, RelayConfig, RelayError, Row, StatementHandle, SuspendedSession,
    Value,
};

/// Open a session from a `sqlrelay://` URL or a dict of options.
#[pyfunction]
pub(crate) fn connect<'py>(py: Python<'py>, target: &Bound<'py, PyAny>) -> PyResult<Bound<'py, PyAny>> {
    let config = if let Ok(url) = target.extract::<String>() {
        RelayConfig::from_url(&url)?
    } else if target.is_instance_of::<PyDict>() {
        pythonize::depythonize::<RelayConfig>(target)
            .map_err(|e| RelayError::config(format!("invalid options: {}", e)))?
    } else {
        return Err(PyTypeError::new_err("connect() expects a URL string or a dict"));
    };

    pyo3_async_runtimes::tokio::future_into_py(py, async move {
        let inner = Connection::connect(config).await?;
        Ok(PyConnection { inner })
    })
}

// ============================================================================
// Connection
// ============================================================================

#[pyclass(name = "Connection")]
pub(crate) struct PyConnection {
    inner: Connection,
}

#[pymethods]
impl PyConnection {
    #[getter]
    fn id(&self) -> String {
        self.inner.id().to_string()
    }

    #[getter]
    fn autocommit(&self) -> bool {
        self.inner.autocommit()
    }

    #[getter]
    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    #[getter]
    fn in_transaction(&self) -> bool {
        self.inner.is_dirty()
    }

    fn set_autocommit<'py>(&self, py: Python<'py>, on: bool) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            conn.set_autocommit(on).await?;
            Ok(())
        })
    }

    fn commit<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            conn.commit().await?;
            Ok(())
        })
    }

    fn rollback<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            conn.rollback().await?;
            Ok(())
        })
    }

    fn savepoint<'py>(&self, py: Python<'py>, name: String) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            conn.savepoint(&name).await?;
            Ok(())
        })
    }

    fn rollback_to_savepoint<'py>(&self, py: Python<'py>, name: String) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            conn.rollback_to_savepoint(&name).await?;
            Ok(())
        })
    }

    fn release_savepoint<'py>(&self, py: Python<'py>, name: String) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            conn.release_savepoint(&name).await?;
            Ok(())
        })
    }

    fn close<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            conn.close().await;
            Ok(())
        })
    }

    fn ping<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            conn.ping().await?;
            Ok(())
        })
    }

    /// Prepare a statement locally. The proxy sees it on first execution.
    fn prepare(&self, sql: &str) -> PyResult<PyPreparedStatement> {
        let handle = self.inner.prepare(sql)?;
        let count = self.inner.param_count(handle)?;
        Ok(PyPreparedStatement {
            conn: self.inner.clone(),
            handle,
            binds: Arc::new(Mutex::new(vec![None; count])),
        })
    }

    /// Prepare and execute `sql`; the statement closes with the cursor.
    #[pyo3(signature = (sql, params=None))]
    fn execute<'py>(
        &self,
        py: Python<'py>,
        sql: String,
        params: Option<Vec<PyObject>>,
    ) -> PyResult<Bound<'py, PyAny>> {
        let binds = convert_py_params(py, params.unwrap_or_default())?;
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            let statement = conn.prepare(&sql)?;
            let handle = match conn.execute(statement, binds).await {
                Ok(handle) => handle,
                Err(e) => {
                    conn.close_statement(statement).await;
                    return Err(e.into());
                }
            };
            Ok(PyCursor {
                conn,
                handle,
                owned_statement: Some(statement),
            })
        })
    }

    fn identify<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move { Ok(conn.identify().await?) })
    }

    fn db_version<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move { Ok(conn.db_version().await?) })
    }

    fn server_version<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move { Ok(conn.server_version().await?) })
    }

    fn current_database<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move { Ok(conn.current_database().await?) })
    }

    fn select_database<'py>(&self, py: Python<'py>, name: String) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            conn.select_database(&name).await?;
            Ok(())
        })
    }

    fn last_insert_id<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move { Ok(conn.last_insert_id().await?) })
    }

    /// Detach from the backend, leaving it suspended on the proxy.
    fn suspend_session<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            let inner = conn.suspend_session().await?;
            Ok(PySuspendedSession { inner })
        })
    }

    fn resume_session<'py>(&self, py: Python<'py>, session: PyRef<'_, PySuspendedSession>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        let session = session.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            conn.resume_session(&session).await?;
            Ok(())
        })
    }

    fn connection_port<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move { Ok(conn.connection_port().await) })
    }

    fn connection_socket<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move { Ok(conn.connection_socket().await) })
    }

    /// Reattach to a result set suspended with `Cursor.suspend()`.
    fn resume_result_set<'py>(&self, py: Python<'py>, id: u64) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.inner.clone();
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            let handle = conn.resume_result_set(id).await?;
            Ok(PyCursor {
                conn,
                handle,
                owned_statement: None,
            })
        })
    }

    // The relay protocol has no request for these.

    fn set_read_only(&self, _read_only: bool) -> PyResult<()> {
        Err(RelayError::Unsupported("read-only sessions").into())
    }

    fn set_isolation_level(&self, _level: &str) -> PyResult<()> {
        Err(RelayError::Unsupported("isolation levels").into())
    }

    #[pyo3(signature = (_name, _args=None))]
    fn callproc(&self, _name: &str, _args: Option<Vec<PyObject>>) -> PyResult<()> {
        Err(RelayError::Unsupported("stored procedure calls").into())
    }

    fn create_blob(&self) -> PyResult<()> {
        Err(RelayError::Unsupported("large objects").into())
    }

    fn __repr__(&self) -> String {
        format!("<relaykit.Connection {}>", self.inner.id())
    }
}

// ============================================================================
// Prepared statement
// ============================================================================

#[pyclass(name = "PreparedStatement")]
pub(crate) struct PyPreparedStatement {
    conn: Connection,
    handle: StatementHandle,
    /// Bound values by position; `None` until bound
    binds: Arc<Mutex<Vec<Option<Value>>>>,
}

impl PyPreparedStatement {
    /// Zero-based slot for a 1-based position or a placeholder name.
    fn slot(&self, key: &Bound<'_, PyAny>) -> PyResult<usize> {
        if let Ok(name) = key.extract::<String>() {
            return Ok(self.conn.bind_index(self.handle, &name)?);
        }
        let position: usize = key.extract()?;
        let count = self.binds.lock().len();
        position
            .checked_sub(1)
            .filter(|i| *i < count)
            .ok_or_else(|| {
                ProgrammingError::new_err(format!(
                    "placeholder {} out of range (statement has {})",
                    position, count
                ))
            })
    }
}

#[pymethods]
impl PyPreparedStatement {
    #[getter]
    fn param_count(&self) -> usize {
        self.binds.lock().len()
    }

    /// Bind `value` to a 1-based position or a placeholder name.
    fn bind(&self, key: &Bound<'_, PyAny>, value: &Bound<'_, PyAny>) -> PyResult<()> {
        let index = self.slot(key)?;
        let value = py_to_value(value)?;
        if let Some(slot) = self.binds.lock().get_mut(index) {
            *slot = Some(value);
        }
        Ok(())
    }

    fn clear_binds(&self) {
        self.binds.lock().fill(None);
    }

    /// Raise `ProgrammingError` unless every placeholder is bound.
    fn validate_binds(&self) -> PyResult<()> {
        complete_binds(self.binds.lock().clone())?;
        Ok(())
    }

    /// Execute with `params` if given (a sequence, or a dict keyed by
    /// placeholder name), otherwise with the bound values.
    #[pyo3(signature = (params=None))]
    fn execute<'py>(&self, py: Python<'py>, params: Option<Bound<'py, PyAny>>) -> PyResult<Bound<'py, PyAny>> {
        let binds = match params {
            Some(params) if params.is_instance_of::<PyDict>() => {
                let mut slots = vec![None; self.param_count()];
                for (key, value) in params.downcast::<PyDict>()?.iter() {
                    let index = self.slot(&key)?;
                    slots[index] = Some(py_to_value(&value)?);
                }
                complete_binds(slots)?
            }
            Some(params) => convert_py_params(py, params.extract()?)?,
            None => complete_binds(self.binds.lock().clone())?,
        };
        let conn = self.conn.clone();
        let statement = self.handle;
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            let handle = conn.execute(statement, binds).await?;
            Ok(PyCursor {
                conn,
                handle,
                owned_statement: None,
            })
        })
    }

    fn close<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.conn.clone();
        let statement = self.handle;
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            conn.close_statement(statement).await;
            Ok(())
        })
    }
}

// ============================================================================
// Cursor
// ============================================================================

#[pyclass(name = "Cursor")]
pub(crate) struct PyCursor {
    conn: Connection,
    handle: CursorHandle,
    /// Statement created by `Connection.execute`, closed with the cursor
    owned_statement: Option<StatementHandle>,
}

#[pymethods]
impl PyCursor {
    #[getter]
    fn columns(&self) -> PyResult<Vec<String>> {
        let columns = self.conn.columns(self.handle)?;
        Ok(columns.iter().map(|c| c.name.clone()).collect())
    }

    /// Affected row count for DML, `None` for queries.
    #[getter]
    fn rowcount(&self) -> PyResult<Option<u64>> {
        Ok(self.conn.affected_rows(self.handle)?)
    }

    /// Fetch up to `size` rows as tuples; `0` fetches everything left.
    #[pyo3(signature = (size=0))]
    fn fetch<'py>(&self, py: Python<'py>, size: u32) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.conn.clone();
        let cursor = self.handle;
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            let rows = conn.fetch(cursor, size).await?;
            Python::with_gil(|py| rows_to_py(py, &rows))
        })
    }

    /// Fetch everything left, `fetch_size` rows per request.
    fn fetchall<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.conn.clone();
        let cursor = self.handle;
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            let rows = conn.rows(cursor).try_collect().await?;
            Python::with_gil(|py| rows_to_py(py, &rows))
        })
    }

    #[getter]
    fn result_set_id(&self) -> PyResult<u64> {
        Ok(self.conn.result_set_id(self.handle)?)
    }

    /// Keep the result set on the proxy and release this cursor. Returns the
    /// id for `Connection.resume_result_set`.
    fn suspend<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.conn.clone();
        let cursor = self.handle;
        pyo3_async_runtimes::tokio::future_into_py(py, async move { Ok(conn.suspend_result_set(cursor).await?) })
    }

    fn close<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let conn = self.conn.clone();
        let cursor = self.handle;
        let statement = self.owned_statement;
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            match statement {
                Some(statement) => conn.close_statement(statement).await,
                None => conn.close_cursor(cursor).await,
            }
            Ok(())
        })
    }
}

// ============================================================================
// Suspended session
// ============================================================================

#[pyclass(name = "SuspendedSession")]
pub(crate) struct PySuspendedSession {
    inner: SuspendedSession,
}

#[pymethods]
impl PySuspendedSession {
    /// Rebuild a handover received from another process; `endpoint` is
    /// `host:port` or `unix:/path`.
    #[new]
    fn new(token: u64, endpoint: &str) -> PyResult<Self> {
        Ok(Self {
            inner: SuspendedSession::new(token, Endpoint::parse(endpoint)?),
        })
    }

    #[getter]
    fn token(&self) -> u64 {
        self.inner.token()
    }

    #[getter]
    fn endpoint(&self) -> String {
        self.inner.endpoint().to_string()
    }

    #[getter]
    fn port(&self) -> Option<u16> {
        self.inner.port()
    }

    #[getter]
    fn socket(&self) -> Option<String> {
        self.inner.socket()
    }

    fn __repr__(&self) -> String {
        format!("<relaykit.SuspendedSession {} at {}>", self.inner.token(), self.inner.endpoint())
    }
}

// ============================================================================
// Value conversion
// ============================================================================

fn rows_to_py(py: Python<'_>, rows: &[Row]) -> PyResult<PyObject> {
    let tuples = rows
        .iter()
        .map(|row| {
            let values = row
                .values()
                .iter()
                .map(|v| value_to_py(py, v))
                .collect::<PyResult<Vec<_>>>()?;
            Ok(PyTuple::new(py, values)?.into_any().unbind())
        })
        .collect::<PyResult<Vec<PyObject>>>()?;
    Ok(PyList::new(py, tuples)?.into_any().unbind())
}

fn value_to_py(py: Python<'_>, value: &Value) -> PyResult<PyObject> {
    match value {
        Value::Null => Ok(py.None()),
        Value::Integer(i) => i.into_py_any(py),
        Value::Float(f) => f.into_py_any(py),
        Value::String(s) => s.into_py_any(py),
        Value::Bytes(b) => Ok(PyBytes::new(py, b).into_any().unbind()),
        Value::DateTime(dt) => dt.into_py_any(py),
        Value::Bool(b) => b.into_py_any(py),
    }
}

fn convert_py_params(py: Python<'_>, params: Vec<PyObject>) -> PyResult<Vec<Value>> {
    params.iter().map(|p| py_to_value(p.bind(py))).collect()
}

/// Type-dispatched conversion; `bool` is checked before `int` since it is a
/// subclass.
fn py_to_value(value: &Bound<'_, PyAny>) -> PyResult<Value> {
    if value.is_none() {
        return Ok(Value::Null);
    }
    if value.is_instance_of::<PyBool>() {
        return Ok(Value::Bool(value.extract()?));
    }
    if value.is_instance_of::<PyInt>() {
        return Ok(Value::Integer(value.extract()?));
    }
    if value.is_instance_of::<PyFloat>() {
        return Ok(Value::Float(value.extract()?));
    }
    if value.is_instance_of::<PyString>() {
        return Ok(Value::String(value.extract()?));
    }
    if value.is_instance_of::<PyBytes>() {
        return Ok(Value::Bytes(value.extract()?));
    }
    if let Ok(dt) = value.extract::<NaiveDateTime>() {
        return Ok(Value::DateTime(dt));
    }
    if value.is_instance_of::<PyDict>() || value.is_instance_of::<PyList>() {
        // Containers travel as JSON text
        let json: serde_json::Value = pythonize::depythonize(value)
            .map_err(|e| ProgrammingError::new_err(format!("cannot serialize parameter: {}", e)))?;
        return Ok(Value::String(json.to_string()));
    }
    Ok(Value::String(value.str()?.to_string()))
}
