use serde::{Deserialize, Serialize};

pub const RAMP_SIZE: usize = 256;

/// Brightness moves the curve by at most this share of the full range.
const BRIGHTNESS_SCALE: f64 = 0.3;
const GAMMA_FLOOR: f64 = 0.1;

/// One 16-bit lookup table per channel, index 0 is the darkest input level.
#[derive(Clone, PartialEq, Eq)]
pub struct GammaTable {
    pub red: [u16; RAMP_SIZE],
    pub green: [u16; RAMP_SIZE],
    pub blue: [u16; RAMP_SIZE],
}

impl GammaTable {
    pub fn from_fn(mut f: impl FnMut(usize) -> u16) -> Self {
        let mut red = [0u16; RAMP_SIZE];
        for (i, v) in red.iter_mut().enumerate() {
            *v = f(i);
        }
        Self {
            red,
            green: red,
            blue: red,
        }
    }

    /// The identity ramp: what a display shows with no correction applied.
    pub fn linear() -> Self {
        Self::from_fn(|i| to_u16(i as f64 / (RAMP_SIZE as f64 - 1.0)))
    }

    pub fn is_monochrome(&self) -> bool {
        self.red == self.green && self.green == self.blue
    }

    /// Samples a hardware ramp of any length down to 256 entries.
    ///
    /// Returns `None` when the channels are empty or of unequal length.
    pub fn from_hardware(red: &[u16], green: &[u16], blue: &[u16]) -> Option<Self> {
        let len = red.len();
        if len == 0 || green.len() != len || blue.len() != len {
            return None;
        }
        let pick = |channel: &[u16]| {
            let mut out = [0u16; RAMP_SIZE];
            for (i, v) in out.iter_mut().enumerate() {
                let pos = i as f64 * (len as f64 - 1.0) / (RAMP_SIZE as f64 - 1.0);
                *v = lerp_at(channel, pos);
            }
            out
        };
        Some(Self {
            red: pick(red),
            green: pick(green),
            blue: pick(blue),
        })
    }

    /// Stretches the table onto a hardware ramp of `size` entries, laid out
    /// red, then green, then blue in one buffer.
    pub fn fill_hardware(&self, buf: &mut [u16], size: usize) {
        debug_assert!(buf.len() >= size * 3);
        let channels = [&self.red, &self.green, &self.blue];
        for (c, channel) in channels.into_iter().enumerate() {
            let out = &mut buf[c * size..(c + 1) * size];
            for (j, v) in out.iter_mut().enumerate() {
                let pos = if size > 1 {
                    j as f64 * (RAMP_SIZE as f64 - 1.0) / (size as f64 - 1.0)
                } else {
                    0.0
                };
                *v = lerp_at(channel, pos);
            }
        }
    }
}

impl std::fmt::Debug for GammaTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GammaTable")
            .field("red", &[self.red[0], self.red[128], self.red[255]])
            .field("green", &[self.green[0], self.green[128], self.green[255]])
            .field("blue", &[self.blue[0], self.blue[128], self.blue[255]])
            .finish_non_exhaustive()
    }
}

fn lerp_at(channel: &[u16], pos: f64) -> u16 {
    let last = channel.len() - 1;
    let lo = (pos.floor() as usize).min(last);
    let hi = (lo + 1).min(last);
    let t = pos - lo as f64;
    let v = channel[lo] as f64 + (channel[hi] as f64 - channel[lo] as f64) * t;
    v.round().clamp(0.0, u16::MAX as f64) as u16
}

fn to_u16(v: f64) -> u16 {
    (v.clamp(0.0, 1.0) * u16::MAX as f64).round() as u16
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Param {
    Gamma,
    Brightness,
    Contrast,
}

/// Inclusive bounds and button step for one parameter.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ParamRange {
    pub fn clamp(&self, v: f64) -> f64 {
        if v.is_nan() {
            return self.min;
        }
        v.clamp(self.min, self.max)
    }
}

impl Param {
    pub const fn range(self) -> ParamRange {
        match self {
            Param::Gamma => ParamRange {
                min: 0.3,
                max: 4.0,
                step: 0.1,
            },
            Param::Brightness => ParamRange {
                min: -1.0,
                max: 1.0,
                step: 0.1,
            },
            Param::Contrast => ParamRange {
                min: 0.1,
                max: 3.0,
                step: 0.1,
            },
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampParams {
    pub gamma: f64,
    pub brightness: f64,
    pub contrast: f64,
}

impl Default for RampParams {
    fn default() -> Self {
        Self {
            gamma: 1.0,
            brightness: 0.0,
            contrast: 1.0,
        }
    }
}

impl RampParams {
    pub fn new(gamma: f64, brightness: f64, contrast: f64) -> Self {
        Self {
            gamma,
            brightness,
            contrast,
        }
    }

    pub fn get(&self, param: Param) -> f64 {
        match param {
            Param::Gamma => self.gamma,
            Param::Brightness => self.brightness,
            Param::Contrast => self.contrast,
        }
    }

    pub fn set(&mut self, param: Param, value: f64) {
        let value = param.range().clamp(value);
        match param {
            Param::Gamma => self.gamma = value,
            Param::Brightness => self.brightness = value,
            Param::Contrast => self.contrast = value,
        }
    }

    /// Clamps every field into its control range.
    pub fn clamped(mut self) -> Self {
        for param in [Param::Gamma, Param::Brightness, Param::Contrast] {
            self.set(param, self.get(param));
        }
        self
    }

    /// Nudges one field by `delta`, snapping to the 0.1 grid so repeated
    /// steps land on the same values the sliders show.
    pub fn adjust(&mut self, param: Param, delta: f64) {
        let stepped = ((self.get(param) + delta) * 10.0).round() / 10.0;
        self.set(param, stepped);
    }
}

/// Builds the monochrome lookup table for `params`.
///
/// Out-of-range inputs are absorbed: gamma is floored at 0.1 and every
/// intermediate value is clamped to [0, 1], so the result is always valid.
pub fn compute(params: RampParams) -> GammaTable {
    let exponent = 1.0 / params.gamma.max(GAMMA_FLOOR);
    GammaTable::from_fn(|i| {
        let normalized = i as f64 / (RAMP_SIZE as f64 - 1.0);
        let corrected = normalized.powf(exponent);
        let shifted = (corrected + params.brightness * BRIGHTNESS_SCALE).clamp(0.0, 1.0);
        let contrasted = (shifted - 0.5) * params.contrast + 0.5;
        to_u16(contrasted)
    })
}
