use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::driver::{DisplayDriver, DriverError};
use crate::ramp::{self, GammaTable, RampParams};

/// The exit path that asked for the original ramp back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    Quit,
    Error,
    Panic,
    Signal(&'static str),
    Exit,
}

impl fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitTrigger::Quit => f.write_str("quit"),
            ExitTrigger::Error => f.write_str("error"),
            ExitTrigger::Panic => f.write_str("panic"),
            ExitTrigger::Signal(name) => write!(f, "signal {name}"),
            ExitTrigger::Exit => f.write_str("exit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Restored,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Active => "active",
            SessionState::Restored => "restored",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session already started")]
    AlreadyStarted,
    #[error("session not started, no original ramp captured")]
    NotStarted,
    #[error("session already restored")]
    Restored,
    #[error("failed to capture original gamma ramp: {0}")]
    Driver(#[from] DriverError),
}

/// Outcome of a live update. A rejected ramp leaves the display as it was
/// and the session usable.
#[derive(Debug)]
pub enum ApplyStatus {
    Applied,
    Rejected(DriverError),
}

impl ApplyStatus {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyStatus::Applied)
    }
}

/// Owns the display for the lifetime of the process and guarantees the ramp
/// captured by [`start`](Self::start) is written back exactly once.
pub struct GammaSession<D> {
    driver: D,
    original: Option<GammaTable>,
    state: SessionState,
}

pub type SharedSession<D> = Arc<Mutex<GammaSession<D>>>;

/// Locks the session even if a previous holder panicked; restore must still
/// be reachable on the unwinding path.
pub fn lock<D>(session: &SharedSession<D>) -> MutexGuard<'_, GammaSession<D>> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<D: DisplayDriver> GammaSession<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            original: None,
            state: SessionState::Uninitialized,
        }
    }

    pub fn into_shared(self) -> SharedSession<D> {
        Arc::new(Mutex::new(self))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn output_name(&self) -> &str {
        self.driver.name()
    }

    pub fn original(&self) -> Option<&GammaTable> {
        self.original.as_ref()
    }

    /// Captures the hardware ramp. Any driver failure is returned as is:
    /// without a true snapshot the restore guarantee cannot hold.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Uninitialized {
            return Err(SessionError::AlreadyStarted);
        }
        let original = self.driver.read()?;
        tracing::info!(output = self.driver.name(), "captured original gamma ramp");
        self.original = Some(original);
        self.state = SessionState::Active;
        Ok(())
    }

    pub fn apply(&mut self, params: RampParams) -> Result<ApplyStatus, SessionError> {
        match self.state {
            SessionState::Uninitialized => return Err(SessionError::NotStarted),
            SessionState::Restored => return Err(SessionError::Restored),
            SessionState::Active => {}
        }
        let table = ramp::compute(params);
        match self.driver.write(&table) {
            Ok(()) => {
                tracing::debug!(
                    gamma = params.gamma,
                    brightness = params.brightness,
                    contrast = params.contrast,
                    "applied gamma ramp"
                );
                Ok(ApplyStatus::Applied)
            }
            Err(err) => {
                tracing::warn!(output = self.driver.name(), "gamma update rejected: {err}");
                Ok(ApplyStatus::Rejected(err))
            }
        }
    }

    /// Writes the original ramp back. Returns `true` only for the call that
    /// performed the write; later calls, and calls before `start`, do no I/O.
    ///
    /// A driver failure is logged and swallowed, the session is `Restored`
    /// either way.
    pub fn restore(&mut self, trigger: ExitTrigger) -> bool {
        if self.state != SessionState::Active {
            tracing::trace!(%trigger, state = self.state.as_str(), "restore skipped");
            return false;
        }
        self.state = SessionState::Restored;
        let Some(original) = self.original.as_ref() else {
            return false;
        };
        match self.driver.write(original) {
            Ok(()) => tracing::info!(
                %trigger,
                output = self.driver.name(),
                "restored original gamma ramp"
            ),
            Err(err) => tracing::error!(
                %trigger,
                output = self.driver.name(),
                "failed to restore original gamma ramp: {err}"
            ),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{FakeDriver, original_ramp};

    fn started() -> (GammaSession<FakeDriver>, FakeDriver) {
        let driver = FakeDriver::new(original_ramp());
        let mut session = GammaSession::new(driver.clone());
        session.start().unwrap();
        (session, driver)
    }

    #[test]
    fn apply_before_start_is_rejected_without_io() {
        let driver = FakeDriver::new(original_ramp());
        let mut session = GammaSession::new(driver.clone());
        assert!(matches!(
            session.apply(RampParams::default()),
            Err(SessionError::NotStarted)
        ));
        assert_eq!(driver.attempts(), 0);
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn start_failure_is_fatal_and_leaves_session_uninitialized() {
        let driver = FakeDriver::new(original_ramp());
        driver.set_fail_read(true);
        let mut session = GammaSession::new(driver.clone());
        assert!(matches!(session.start(), Err(SessionError::Driver(_))));
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(session.original().is_none());
        assert!(!session.restore(ExitTrigger::Exit));
        assert_eq!(driver.attempts(), 0);
    }

    #[test]
    fn start_twice_is_rejected() {
        let (mut session, driver) = started();
        assert!(matches!(session.start(), Err(SessionError::AlreadyStarted)));
        assert_eq!(driver.log.lock().unwrap().reads, 1);
    }

    #[test]
    fn apply_writes_computed_table_and_keeps_original() {
        let (mut session, driver) = started();
        let params = RampParams::new(2.2, 0.0, 1.0);
        assert!(session.apply(params).unwrap().is_applied());
        assert_eq!(driver.writes(), vec![ramp::compute(params)]);
        assert_eq!(session.original(), Some(&original_ramp()));
    }

    #[test]
    fn rejected_write_keeps_session_active() {
        let (mut session, driver) = started();
        driver.set_fail_writes(true);
        let status = session.apply(RampParams::new(1.5, 0.0, 1.0)).unwrap();
        assert!(matches!(status, ApplyStatus::Rejected(DriverError::OutputLost(_))));
        assert_eq!(session.state(), SessionState::Active);

        driver.set_fail_writes(false);
        assert!(session.apply(RampParams::default()).unwrap().is_applied());
        assert_eq!(driver.writes().len(), 1);
    }

    #[test]
    fn restore_writes_once() {
        let (mut session, driver) = started();
        session.apply(RampParams::new(3.0, 0.5, 2.0)).unwrap();

        assert!(session.restore(ExitTrigger::Quit));
        assert!(!session.restore(ExitTrigger::Exit));
        assert_eq!(driver.attempts(), 2);
        assert_eq!(driver.writes().last(), Some(&original_ramp()));
        assert_eq!(session.state(), SessionState::Restored);
    }

    #[test]
    fn restore_failure_is_swallowed_and_not_retried() {
        let (mut session, driver) = started();
        driver.set_fail_writes(true);
        assert!(session.restore(ExitTrigger::Signal("SIGTERM")));
        assert_eq!(session.state(), SessionState::Restored);

        driver.set_fail_writes(false);
        assert!(!session.restore(ExitTrigger::Exit));
        assert_eq!(driver.attempts(), 1);
        assert!(driver.writes().is_empty());
    }

    #[test]
    fn apply_after_restore_is_rejected() {
        let (mut session, driver) = started();
        session.restore(ExitTrigger::Quit);
        assert!(matches!(
            session.apply(RampParams::default()),
            Err(SessionError::Restored)
        ));
        assert_eq!(driver.attempts(), 1);
    }

    #[test]
    fn trigger_names() {
        assert_eq!(ExitTrigger::Signal("SIGINT").to_string(), "signal SIGINT");
        assert_eq!(ExitTrigger::Panic.to_string(), "panic");
    }
}
