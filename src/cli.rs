use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;

use crate::ramp::{Param, RampParams};

#[derive(Copy, Clone, Debug, ValueEnum, PartialEq, Eq)]
pub enum Backend {
    Auto,
    Wayland,
    Drm,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "gammatune",
    version,
    about = "Live gamma, brightness and contrast tuning that restores the display on exit",
    allow_negative_numbers = true
)]
pub struct Opts {
    /// Display backend. Auto uses Wayland when WAYLAND_DISPLAY is set, else DRM.
    #[arg(short = 'b', long = "backend", value_enum, default_value_t = Backend::Auto)]
    pub backend: Backend,

    /// Name or description of the Wayland output to drive. If omitted, the first.
    #[arg(short = 'o', long = "output")]
    pub output: Option<String>,

    /// DRM device used by the drm backend
    #[arg(long = "card", default_value = "/dev/dri/card0")]
    pub card: PathBuf,

    /// Configuration file (default: $XDG_CONFIG_HOME/gammatune/config.json)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Enable IPC socket server for external control (specify socket path)
    #[arg(long = "socket")]
    pub socket: Option<PathBuf>,

    /// Do not read commands from stdin
    #[arg(long = "no-stdin")]
    pub no_stdin: bool,

    /// Startup gamma, overriding the saved value (0.3-4.0)
    #[arg(short = 'g', long = "gamma")]
    pub gamma: Option<f64>,

    /// Startup brightness, overriding the saved value (-1.0-1.0)
    #[arg(short = 'B', long = "brightness")]
    pub brightness: Option<f64>,

    /// Startup contrast, overriding the saved value (0.1-3.0)
    #[arg(short = 'C', long = "contrast")]
    pub contrast: Option<f64>,

    /// More log output (repeat for trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Opts {
    /// Saved parameters with any command line overrides applied.
    pub fn startup_params(&self, saved: RampParams) -> RampParams {
        let mut params = saved.clamped();
        for (param, value) in [
            (Param::Gamma, self.gamma),
            (Param::Brightness, self.brightness),
            (Param::Contrast, self.contrast),
        ] {
            if let Some(value) = value {
                params.set(param, value);
            }
        }
        params
    }
}
