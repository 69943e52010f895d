use drm::control::{Device as ControlDevice, crtc};
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;

use crate::driver::{DisplayDriver, DriverError};
use crate::ramp::GammaTable;

pub struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for Card {}
impl ControlDevice for Card {}

impl Card {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let mut options = std::fs::OpenOptions::new();
        options.read(true);
        options.write(true);
        Ok(Card(options.open(path)?))
    }
}

/// The ramp as `read` found it, next to the 256-entry table handed out for it.
struct Snapshot {
    table: GammaTable,
    raw: Vec<u16>,
}

/// Converts between 256-entry tables and one CRTC's ramp length. Writing the
/// table that came out of [`HardwareRamp::capture`] puts the captured
/// channels back untouched, so resampling never alters the original.
struct HardwareRamp {
    size: usize,
    snapshot: Option<Snapshot>,
}

impl HardwareRamp {
    fn new(size: usize) -> Self {
        Self {
            size,
            snapshot: None,
        }
    }

    /// `raw` holds red, then green, then blue, `size` entries each.
    fn capture(&mut self, raw: Vec<u16>) -> Option<GammaTable> {
        if raw.len() != self.size * 3 {
            return None;
        }
        let (red, rest) = raw.split_at(self.size);
        let (green, blue) = rest.split_at(self.size);
        let table = GammaTable::from_hardware(red, green, blue)?;
        self.snapshot = Some(Snapshot {
            table: table.clone(),
            raw,
        });
        Some(table)
    }

    fn encode(&self, table: &GammaTable) -> Vec<u16> {
        match &self.snapshot {
            Some(snapshot) if snapshot.table == *table => snapshot.raw.clone(),
            _ => {
                let mut buf = vec![0u16; self.size * 3];
                table.fill_hardware(&mut buf, self.size);
                buf
            }
        }
    }
}

/// Legacy KMS gamma on the first CRTC that is driving a mode.
///
/// Writing requires DRM master, so this backend is for bare consoles rather
/// than sessions running under a compositor.
pub struct KmsDriver {
    card: Card,
    crtc: crtc::Handle,
    ramp: HardwareRamp,
    label: String,
}

impl KmsDriver {
    pub fn open(path: &Path) -> Result<Self, DriverError> {
        let card = Card::open(path)?;
        let resources = card.resource_handles()?;
        let mut active = None;
        for &handle in resources.crtcs() {
            let info = card.get_crtc(handle)?;
            if info.mode().is_some() {
                active = Some(info);
                break;
            }
        }
        let info = active
            .ok_or_else(|| DriverError::NoOutput(format!("no active CRTC on {}", path.display())))?;
        let size = info.gamma_length() as usize;
        if size == 0 {
            return Err(DriverError::RampSize(size));
        }
        let label = format!("{} {:?}", path.display(), info.handle());
        tracing::info!(output = %label, ramp_size = size, "opened KMS gamma");
        Ok(Self {
            card,
            crtc: info.handle(),
            ramp: HardwareRamp::new(size),
            label,
        })
    }
}

impl DisplayDriver for KmsDriver {
    fn name(&self) -> &str {
        &self.label
    }

    fn read(&mut self) -> Result<GammaTable, DriverError> {
        let size = self.ramp.size;
        let mut raw = vec![0u16; size * 3];
        let (red, rest) = raw.split_at_mut(size);
        let (green, blue) = rest.split_at_mut(size);
        self.card.get_gamma(self.crtc, red, green, blue)?;
        self.ramp.capture(raw).ok_or(DriverError::RampSize(size))
    }

    fn write(&mut self, table: &GammaTable) -> Result<(), DriverError> {
        let size = self.ramp.size;
        let buf = self.ramp.encode(table);
        let (red, rest) = buf.split_at(size);
        let (green, blue) = rest.split_at(size);
        self.card.set_gamma(self.crtc, red, green, blue)?;
        Ok(())
    }
}
