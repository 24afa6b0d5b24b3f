//! Python exception hierarchy for the relay engine.
//!
//! Follows the DB-API 2.0 layout so callers can catch `DatabaseError`
//! broadly or a specific subclass.

use pyo3::create_exception;
use pyo3::exceptions::PyException;
use pyo3::prelude::*;
use pyo3::PyErr;

use crate::relay::{ErrorKind, RelayError};

create_exception!(_relaykit, Error, PyException);
create_exception!(_relaykit, InterfaceError, Error);
create_exception!(_relaykit, DatabaseError, Error);
create_exception!(_relaykit, OperationalError, DatabaseError);
create_exception!(_relaykit, ProgrammingError, DatabaseError);
create_exception!(_relaykit, DataError, DatabaseError);
create_exception!(_relaykit, NotSupportedError, DatabaseError);
// Commit or rollback may or may not have happened
create_exception!(_relaykit, AmbiguousCommitError, OperationalError);

impl From<RelayError> for PyErr {
    fn from(err: RelayError) -> PyErr {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::Connect
            | ErrorKind::AuthFailed
            | ErrorKind::Io
            | ErrorKind::Protocol
            | ErrorKind::TransactionLost => OperationalError::new_err(message),
            ErrorKind::AmbiguousOutcome => AmbiguousCommitError::new_err(message),
            ErrorKind::BindArity
            | ErrorKind::NoSuchColumn
            | ErrorKind::NoSuchBind
            | ErrorKind::LimitExceeded
            | ErrorKind::NotInTransaction => ProgrammingError::new_err(message),
            ErrorKind::TypeMismatch => DataError::new_err(message),
            ErrorKind::Exec | ErrorKind::AutoCommitSwitch => DatabaseError::new_err(message),
            ErrorKind::StaleHandle | ErrorKind::SessionClosed | ErrorKind::Config => {
                InterfaceError::new_err(message)
            }
            ErrorKind::Unsupported => NotSupportedError::new_err(message),
        }
    }
}

pub(crate) fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = m.py();
    m.add("Error", py.get_type::<Error>())?;
    m.add("InterfaceError", py.get_type::<InterfaceError>())?;
    m.add("DatabaseError", py.get_type::<DatabaseError>())?;
    m.add("OperationalError", py.get_type::<OperationalError>())?;
    m.add("ProgrammingError", py.get_type::<ProgrammingError>())?;
    m.add("DataError", py.get_type::<DataError>())?;
    m.add("NotSupportedError", py.get_type::<NotSupportedError>())?;
    m.add("AmbiguousCommitError", py.get_type::<AmbiguousCommitError>())?;
    Ok(())
}
