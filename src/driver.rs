use std::path::Path;
use thiserror::Error;

use crate::cli::Backend;
use crate::kms::KmsDriver;
use crate::ramp::GammaTable;
use crate::wayland::WaylandDriver;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("cannot reach display backend: {0}")]
    Connect(String),
    #[error("display backend unsupported: {0}")]
    Unsupported(&'static str),
    #[error("no usable output: {0}")]
    NoOutput(String),
    #[error("output {0} rejected the gamma ramp")]
    OutputLost(String),
    #[error("invalid hardware ramp size {0}")]
    RampSize(usize),
    #[error("display protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Access to one display's hardware gamma ramp.
///
/// Implementations are not assumed to be thread-safe; all calls go through
/// the owning session.
pub trait DisplayDriver {
    /// Human readable output label for logs and status.
    fn name(&self) -> &str;

    fn read(&mut self) -> Result<GammaTable, DriverError>;

    fn write(&mut self, table: &GammaTable) -> Result<(), DriverError>;
}

impl<D: DisplayDriver + ?Sized> DisplayDriver for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read(&mut self) -> Result<GammaTable, DriverError> {
        (**self).read()
    }

    fn write(&mut self, table: &GammaTable) -> Result<(), DriverError> {
        (**self).write(table)
    }
}

pub type BoxedDriver = Box<dyn DisplayDriver + Send>;

/// Opens the requested backend. `Auto` prefers Wayland when a compositor
/// socket is advertised.
pub fn open_driver(
    backend: Backend,
    output: Option<&str>,
    card: &Path,
) -> Result<BoxedDriver, DriverError> {
    let backend = match backend {
        Backend::Auto if std::env::var_os("WAYLAND_DISPLAY").is_some() => Backend::Wayland,
        Backend::Auto => Backend::Drm,
        other => other,
    };
    tracing::debug!(?backend, "opening display driver");
    match backend {
        Backend::Wayland => Ok(Box::new(WaylandDriver::connect(output)?)),
        Backend::Drm | Backend::Auto => Ok(Box::new(KmsDriver::open(card)?)),
    }
}
