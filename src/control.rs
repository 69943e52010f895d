use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ConfigStore};
use crate::driver::DisplayDriver;
use crate::ramp::{Param, RampParams};
use crate::session::{self, ApplyStatus, ExitTrigger, SharedSession};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Set {
        #[serde(default)]
        gamma: Option<f64>,
        #[serde(default)]
        brightness: Option<f64>,
        #[serde(default)]
        contrast: Option<f64>,
    },
    /// Nudge one parameter; `delta` defaults to its button step.
    Adjust {
        param: Param,
        #[serde(default)]
        delta: Option<f64>,
    },
    Reset,
    Save,
    Load,
    Status,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Status {
        gamma: f64,
        brightness: f64,
        contrast: f64,
        output: String,
        state: String,
        level: StatusLevel,
        message: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Live,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub level: StatusLevel,
    pub text: String,
}

impl Status {
    pub fn new(level: StatusLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }
}

/// Where status lines go. Always present, so reporting never depends on
/// whether a frontend is attached yet.
pub trait StatusSink {
    fn show(&mut self, status: &Status);
}

pub struct LogStatus;

impl StatusSink for LogStatus {
    fn show(&mut self, status: &Status) {
        match status.level {
            StatusLevel::Live => tracing::debug!("{}", status.text),
            StatusLevel::Info => tracing::info!("{}", status.text),
            StatusLevel::Warning => tracing::warn!("{}", status.text),
            StatusLevel::Error => tracing::error!("{}", status.text),
        }
    }
}

pub struct NullStatus;

impl StatusSink for NullStatus {
    fn show(&mut self, _: &Status) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Turns commands into parameter changes on the session. Only the main loop
/// owns one, which keeps driver access on a single thread.
pub struct Controller<D> {
    session: SharedSession<D>,
    store: ConfigStore,
    params: RampParams,
    saved: RampParams,
    sink: Box<dyn StatusSink>,
    last: Status,
}

impl<D: DisplayDriver> Controller<D> {
    pub fn new(
        session: SharedSession<D>,
        store: ConfigStore,
        saved: RampParams,
        initial: RampParams,
        sink: Box<dyn StatusSink>,
    ) -> Self {
        Self {
            session,
            store,
            params: initial.clamped(),
            saved: saved.clamped(),
            sink,
            last: Status::new(StatusLevel::Info, "Ready"),
        }
    }

    pub fn params(&self) -> RampParams {
        self.params
    }

    pub fn last_status(&self) -> &Status {
        &self.last
    }

    fn report(&mut self, status: Status) {
        self.sink.show(&status);
        self.last = status;
    }

    /// Reports a failed config load. A missing file is expected on first run.
    pub fn config_notice(&mut self, err: &ConfigError) {
        if err.is_missing() {
            self.report(Status::new(
                StatusLevel::Info,
                format!("{err}, using defaults"),
            ));
        } else {
            self.report(Status::new(
                StatusLevel::Warning,
                format!("Failed to load configuration: {err}, using defaults"),
            ));
        }
    }

    /// Pushes the current parameters to the display.
    pub fn refresh(&mut self) -> bool {
        let params = self.params;
        let result = session::lock(&self.session).apply(params);
        let status = match result {
            Ok(ApplyStatus::Applied) => Status::new(
                StatusLevel::Live,
                format!(
                    "Live: G={:.1} B={:.1} C={:.1}",
                    params.gamma, params.brightness, params.contrast
                ),
            ),
            Ok(ApplyStatus::Rejected(err)) => {
                Status::new(StatusLevel::Error, format!("Update failed: {err}"))
            }
            Err(err) => Status::new(StatusLevel::Error, format!("Update failed: {err}")),
        };
        let applied = status.level == StatusLevel::Live;
        self.report(status);
        applied
    }

    fn save(&mut self) -> bool {
        self.saved = self.params;
        match self.store.save(&self.params) {
            Ok(()) => {
                self.report(Status::new(StatusLevel::Info, "Configuration saved"));
                true
            }
            Err(err) => {
                self.report(Status::new(
                    StatusLevel::Warning,
                    format!("Failed to save configuration: {err}"),
                ));
                false
            }
        }
    }

    fn load(&mut self) {
        let loaded = self.store.load();
        if let Ok(params) = &loaded {
            self.saved = params.clamped();
        }
        // a failed load falls back to the last saved parameters from this run
        self.params = self.saved;
        let applied = self.refresh();
        match loaded {
            Ok(_) if applied => {
                self.report(Status::new(StatusLevel::Info, "Configuration loaded"));
            }
            Ok(_) => {}
            Err(err) => self.report(Status::new(
                StatusLevel::Warning,
                format!("Failed to load configuration: {err}"),
            )),
        }
    }

    pub fn shutdown(&mut self, trigger: ExitTrigger) -> bool {
        session::lock(&self.session).restore(trigger)
    }

    pub fn handle(&mut self, command: Command) -> (Response, Flow) {
        tracing::debug!(?command, "command");
        let mut flow = Flow::Continue;
        match command {
            Command::Set {
                gamma,
                brightness,
                contrast,
            } => {
                for (param, value) in [
                    (Param::Gamma, gamma),
                    (Param::Brightness, brightness),
                    (Param::Contrast, contrast),
                ] {
                    if let Some(value) = value {
                        self.params.set(param, value);
                    }
                }
                self.refresh();
            }
            Command::Adjust { param, delta } => {
                let delta = delta.unwrap_or(param.range().step);
                if !delta.is_finite() {
                    return (
                        Response::Error {
                            message: format!("delta must be finite, got {delta}"),
                        },
                        flow,
                    );
                }
                self.params.adjust(param, delta);
                self.refresh();
            }
            Command::Reset => {
                self.params = RampParams::default();
                if self.refresh() {
                    self.report(Status::new(StatusLevel::Info, "Reset to default"));
                }
            }
            Command::Save => {
                self.save();
            }
            Command::Load => self.load(),
            Command::Status => {}
            Command::Quit => {
                self.save();
                self.shutdown(ExitTrigger::Quit);
                self.report(Status::new(StatusLevel::Info, "Original gamma restored"));
                flow = Flow::Quit;
            }
        }
        (self.status_response(), flow)
    }

    pub fn status_response(&self) -> Response {
        let session = session::lock(&self.session);
        Response::Status {
            gamma: self.params.gamma,
            brightness: self.params.brightness,
            contrast: self.params.contrast,
            output: session.output_name().to_string(),
            state: session.state().as_str().to_string(),
            level: self.last.level,
            message: self.last.text.clone(),
        }
    }
}
