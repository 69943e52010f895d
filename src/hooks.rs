use nix::sys::signal::Signal;
use std::future::poll_fn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, PoisonError, TryLockError, Weak};
use std::task::Poll;
use std::thread::{self, ThreadId};
use tokio::signal::unix::{SignalKind, signal};

use crate::driver::DisplayDriver;
use crate::session::{self, ExitTrigger, GammaSession, SharedSession};

struct Registration {
    id: u64,
    owner: ThreadId,
    restore: Box<dyn Fn(ExitTrigger) + Send>,
}

/// Sessions to restore when their owning thread panics. The panic hook that
/// drains it is installed once per process.
static REGISTRY: Mutex<Vec<Registration>> = Mutex::new(Vec::new());
static PANIC_HOOK: Once = Once::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Process-wide restore hooks for one started session.
///
/// Installing registers the session with the panic hook; dropping the value
/// restores with [`ExitTrigger::Exit`] and unregisters, which also covers
/// unwinding out of `main`. Every path ends in the same idempotent
/// [`GammaSession::restore`].
pub struct ExitHooks<D: DisplayDriver + Send + 'static> {
    session: SharedSession<D>,
    id: u64,
}

impl<D: DisplayDriver + Send + 'static> ExitHooks<D> {
    pub fn install(session: &SharedSession<D>) -> Self {
        PANIC_HOOK.call_once(install_panic_hook);

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(session);
        REGISTRY
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                owner: thread::current().id(),
                restore: Box::new(move |trigger| restore_weak(&weak, trigger)),
            });
        tracing::debug!(id, "exit hooks installed");
        Self {
            session: Arc::clone(session),
            id,
        }
    }

    pub fn restore(&self, trigger: ExitTrigger) -> bool {
        session::lock(&self.session).restore(trigger)
    }
}

impl<D: DisplayDriver + Send + 'static> Drop for ExitHooks<D> {
    fn drop(&mut self) {
        self.restore(ExitTrigger::Exit);
        REGISTRY
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| r.id != self.id);
    }
}

/// `try_lock` keeps a panic raised while the session is locked from
/// deadlocking; the guard's drop covers that case during unwinding.
fn restore_weak<D: DisplayDriver>(weak: &Weak<Mutex<GammaSession<D>>>, trigger: ExitTrigger) {
    let Some(session) = weak.upgrade() else {
        return;
    };
    let mut guard = match session.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        Err(TryLockError::WouldBlock) => return,
    };
    guard.restore(trigger);
}

/// Restores sessions owned by the panicking thread, then hands the panic to
/// the previously installed hook so it is still reported.
fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let current = thread::current().id();
        let registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
        for registration in registry.iter().filter(|r| r.owner == current) {
            (registration.restore)(ExitTrigger::Panic);
        }
        drop(registry);
        previous(info);
    }));
}

/// Termination signals that ask for a graceful shutdown.
pub struct ShutdownSignals {
    streams: Vec<(Signal, tokio::signal::unix::Signal)>,
}

impl ShutdownSignals {
    pub const HANDLED: [Signal; 4] = [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGQUIT,
    ];

    /// Must be called from within a tokio runtime.
    pub fn register() -> std::io::Result<Self> {
        Self::listen(&Self::HANDLED)
    }

    pub fn listen(signals: &[Signal]) -> std::io::Result<Self> {
        let streams = signals
            .iter()
            .map(|&sig| Ok((sig, signal(SignalKind::from_raw(sig as i32))?)))
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self { streams })
    }

    /// Resolves with the first handled signal delivered to the process.
    pub async fn recv(&mut self) -> Signal {
        poll_fn(|cx| {
            for (sig, stream) in self.streams.iter_mut() {
                if stream.poll_recv(cx).is_ready() {
                    return Poll::Ready(*sig);
                }
            }
            Poll::Pending
        })
        .await
    }
}

pub fn signal_trigger(sig: Signal) -> ExitTrigger {
    ExitTrigger::Signal(sig.as_str())
}

/// Conventional shell exit status for a process ended by `sig`.
pub fn signal_exit_code(sig: Signal) -> u8 {
    128u8.saturating_add(sig as i32 as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{FakeDriver, original_ramp};
    use crate::ramp::{self, RampParams};
    use crate::session::SessionState;

    fn shared() -> (SharedSession<FakeDriver>, FakeDriver) {
        let driver = FakeDriver::new(original_ramp());
        let mut session = GammaSession::new(driver.clone());
        session.start().unwrap();
        (session.into_shared(), driver)
    }

    #[test]
    fn dropping_hooks_restores_once() {
        let (session, driver) = shared();
        let hooks = ExitHooks::install(&session);
        assert!(hooks.restore(ExitTrigger::Quit));
        drop(hooks);
        assert_eq!(driver.attempts(), 1);
        assert_eq!(session::lock(&session).state(), SessionState::Restored);
    }

    #[test]
    fn drop_restores_when_nothing_else_did() {
        let (session, driver) = shared();
        session::lock(&session)
            .apply(RampParams::new(0.8, 0.1, 1.2))
            .unwrap();
        drop(ExitHooks::install(&session));
        assert_eq!(driver.writes().last(), Some(&original_ramp()));
        assert_eq!(driver.attempts(), 2);
    }

    #[test]
    fn panic_on_owner_thread_restores() {
        let (session, driver) = shared();
        let hooks = ExitHooks::install(&session);
        session::lock(&session)
            .apply(RampParams::new(2.0, 0.0, 1.0))
            .unwrap();

        let result = std::panic::catch_unwind(|| -> u8 { panic!("main loop blew up") });
        assert!(result.is_err());
        assert_eq!(session::lock(&session).state(), SessionState::Restored);
        assert_eq!(driver.writes().last(), Some(&original_ramp()));

        drop(hooks);
        assert_eq!(driver.attempts(), 2);
    }

    #[test]
    fn panic_on_other_thread_is_ignored() {
        let (session, driver) = shared();
        let _hooks = ExitHooks::install(&session);
        let joined = thread::spawn(|| -> u8 { panic!("worker failure") }).join();
        assert!(joined.is_err());
        assert_eq!(session::lock(&session).state(), SessionState::Active);
        assert_eq!(driver.attempts(), 0);
    }

    #[tokio::test]
    async fn termination_signal_restores_original() {
        let (session, driver) = shared();
        let hooks = ExitHooks::install(&session);
        let mut signals = ShutdownSignals::register().unwrap();

        let params = RampParams::new(2.2, 0.0, 1.0);
        session::lock(&session).apply(params).unwrap();

        nix::sys::signal::raise(Signal::SIGTERM).unwrap();
        let sig = signals.recv().await;
        assert_eq!(sig, Signal::SIGTERM);
        assert!(hooks.restore(signal_trigger(sig)));

        assert_eq!(driver.writes(), vec![ramp::compute(params), original_ramp()]);
        assert_eq!(session::lock(&session).state(), SessionState::Restored);

        assert!(!hooks.restore(ExitTrigger::Exit));
        drop(hooks);
        assert_eq!(driver.attempts(), 2);
    }

    #[test]
    fn exit_codes_follow_shell_convention() {
        assert_eq!(signal_exit_code(Signal::SIGINT), 130);
        assert_eq!(signal_exit_code(Signal::SIGTERM), 143);
        assert_eq!(signal_trigger(Signal::SIGHUP), ExitTrigger::Signal("SIGHUP"));
    }
}
