//! RelayKit - client engine for SQL relay proxies.
//!
//! The engine lives in [`relay`]. With the `python` feature the crate also
//! builds the `_relaykit` extension module on top of it.

pub mod relay;

#[cfg(feature = "python")]
mod client;
#[cfg(feature = "python")]
mod error;

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn _relaykit(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(client::connect, m)?)?;
    m.add_class::<client::PyConnection>()?;
    m.add_class::<client::PyPreparedStatement>()?;
    m.add_class::<client::PyCursor>()?;
    m.add_class::<client::PySuspendedSession>()?;
    error::register(m)?;
    Ok(())
}
