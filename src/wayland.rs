use memmap2::MmapMut;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use wayland_client::{
    Connection, Dispatch, EventQueue, Proxy, QueueHandle, delegate_noop,
    protocol::{wl_output, wl_registry},
};
use wayland_protocols_wlr::gamma_control::v1::client::{
    zwlr_gamma_control_manager_v1, zwlr_gamma_control_v1,
};

use crate::driver::{DisplayDriver, DriverError};
use crate::ramp::GammaTable;

#[derive(Clone, Copy)]
pub struct OutputData {
    pub id: u32,
}

#[derive(Clone, Copy)]
pub struct GammaData {
    pub id: u32,
}

pub struct OutputState {
    pub name: Option<String>,
    pub description: Option<String>,
    pub wl_output: wl_output::WlOutput,
    pub gamma: Option<zwlr_gamma_control_v1::ZwlrGammaControlV1>,
    pub ramp_size: u32,
    pub table: Option<(File, MmapMut)>,
    pub failed: bool,
}

impl OutputState {
    fn label(&self, id: u32) -> String {
        self.name
            .clone()
            .or_else(|| self.description.clone())
            .unwrap_or_else(|| format!("wl_output#{id}"))
    }
}

pub struct WaylandState {
    pub outputs: HashMap<u32, OutputState>,
    pub gamma_mgr: Option<zwlr_gamma_control_manager_v1::ZwlrGammaControlManagerV1>,
    pub gamma_mgr_name: Option<u32>,
}

impl WaylandState {
    pub fn new() -> Self {
        Self {
            outputs: HashMap::new(),
            gamma_mgr: None,
            gamma_mgr_name: None,
        }
    }

    /// Picks the output matching `target` by name or description, or the
    /// lowest registry id when no target is given.
    fn select_output(&self, target: Option<&str>) -> Option<u32> {
        match target {
            Some(target) => self
                .outputs
                .iter()
                .filter(|(_, o)| {
                    o.name.as_deref() == Some(target) || o.description.as_deref() == Some(target)
                })
                .map(|(id, _)| *id)
                .min(),
            None => self.outputs.keys().copied().min(),
        }
    }

    fn acquire_gamma(&mut self, qh: &QueueHandle<Self>, id: u32) -> bool {
        let Some(mgr) = self.gamma_mgr.clone() else {
            return false;
        };
        let Some(output) = self.outputs.get_mut(&id) else {
            return false;
        };
        if output.gamma.is_none() {
            output.gamma = Some(mgr.get_gamma_control(&output.wl_output, qh, GammaData { id }));
        }
        true
    }
}

impl Dispatch<wl_registry::WlRegistry, ()> for WaylandState {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => {
                if interface == wl_output::WlOutput::interface().name {
                    let wl_output = registry.bind::<wl_output::WlOutput, _, _>(
                        name,
                        version.min(4),
                        qh,
                        OutputData { id: name },
                    );
                    state.outputs.insert(
                        name,
                        OutputState {
                            name: None,
                            description: None,
                            wl_output,
                            gamma: None,
                            ramp_size: 0,
                            table: None,
                            failed: false,
                        },
                    );
                } else if interface
                    == zwlr_gamma_control_manager_v1::ZwlrGammaControlManagerV1::interface().name
                {
                    let mgr = registry
                        .bind::<zwlr_gamma_control_manager_v1::ZwlrGammaControlManagerV1, _, _>(
                            name,
                            1,
                            qh,
                            (),
                        );
                    state.gamma_mgr = Some(mgr);
                    state.gamma_mgr_name = Some(name);
                }
            }
            wl_registry::Event::GlobalRemove { name } => {
                if state.gamma_mgr_name == Some(name) {
                    state.gamma_mgr = None;
                    state.gamma_mgr_name = None;
                }
                if let Some(output) = state.outputs.remove(&name) {
                    tracing::warn!(output = %output.label(name), "output removed");
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_output::WlOutput, OutputData> for WaylandState {
    fn event(
        state: &mut Self,
        _: &wl_output::WlOutput,
        event: wl_output::Event,
        data: &OutputData,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(output) = state.outputs.get_mut(&data.id) else {
            return;
        };
        match event {
            wl_output::Event::Name { name } => output.name = Some(name),
            wl_output::Event::Description { description } => {
                output.description = Some(description)
            }
            _ => {}
        }
    }
}

impl Dispatch<zwlr_gamma_control_v1::ZwlrGammaControlV1, GammaData> for WaylandState {
    fn event(
        state: &mut Self,
        _: &zwlr_gamma_control_v1::ZwlrGammaControlV1,
        event: zwlr_gamma_control_v1::Event,
        data: &GammaData,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(output) = state.outputs.get_mut(&data.id) else {
            return;
        };
        match event {
            zwlr_gamma_control_v1::Event::GammaSize { size } => {
                output.ramp_size = size;
                let table_bytes = size as usize * 3 * std::mem::size_of::<u16>();
                output.table = match create_anonymous_file(table_bytes) {
                    Ok(file) => match unsafe { MmapMut::map_mut(&file) } {
                        Ok(mmap) => Some((file, mmap)),
                        Err(err) => {
                            tracing::error!(output = %output.label(data.id), "mmap failed: {err}");
                            None
                        }
                    },
                    Err(err) => {
                        tracing::error!(
                            output = %output.label(data.id),
                            "failed to allocate gamma table: {err}"
                        );
                        None
                    }
                };
            }
            zwlr_gamma_control_v1::Event::Failed => {
                tracing::warn!(output = %output.label(data.id), "gamma control failed");
                if let Some(gamma) = output.gamma.take() {
                    gamma.destroy();
                }
                output.failed = true;
                output.table = None;
                output.ramp_size = 0;
            }
            _ => {}
        }
    }
}

delegate_noop!(WaylandState: ignore zwlr_gamma_control_manager_v1::ZwlrGammaControlManagerV1);

pub fn create_anonymous_file(size: usize) -> std::io::Result<File> {
    let mut path = PathBuf::from("/tmp");
    path.push(format!("gammatune-{}", std::process::id()));
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o600)
        .open(&path)?;
    f.set_len(size as u64)?;
    let _ = std::fs::remove_file(&path);
    Ok(f)
}

/// One output driven through wlr-gamma-control-unstable-v1.
///
/// The protocol has no way to query the ramp in effect. While no client
/// holds the gamma control the compositor shows its own identity ramp, and
/// it reinstates that ramp when the control is destroyed, so `read` reports
/// the linear table once the control was acquired.
pub struct WaylandDriver {
    conn: Connection,
    queue: EventQueue<WaylandState>,
    state: WaylandState,
    id: u32,
    label: String,
}

impl WaylandDriver {
    pub fn connect(target: Option<&str>) -> Result<Self, DriverError> {
        let conn = Connection::connect_to_env().map_err(|e| DriverError::Connect(e.to_string()))?;
        let mut queue = conn.new_event_queue();
        let qh = queue.handle();
        conn.display().get_registry(&qh, ());

        let mut state = WaylandState::new();
        // Globals first, then the output name/description events they trigger.
        for _ in 0..2 {
            queue
                .roundtrip(&mut state)
                .map_err(|e| DriverError::Protocol(e.to_string()))?;
        }
        if state.gamma_mgr.is_none() {
            return Err(DriverError::Unsupported(
                "compositor lacks wlr-gamma-control-unstable-v1",
            ));
        }

        let id = state.select_output(target).ok_or_else(|| {
            DriverError::NoOutput(target.unwrap_or("no outputs advertised").to_string())
        })?;
        if !state.acquire_gamma(&qh, id) {
            return Err(DriverError::NoOutput(format!("wl_output#{id}")));
        }
        queue
            .roundtrip(&mut state)
            .map_err(|e| DriverError::Protocol(e.to_string()))?;

        let label = state
            .outputs
            .get(&id)
            .map(|o| o.label(id))
            .ok_or_else(|| DriverError::NoOutput(format!("wl_output#{id}")))?;
        let driver = Self {
            conn,
            queue,
            state,
            id,
            label,
        };
        let ramp_size = driver.output()?.ramp_size;
        tracing::info!(output = %driver.label, ramp_size, "acquired gamma control");
        Ok(driver)
    }

    fn output(&self) -> Result<&OutputState, DriverError> {
        match self.state.outputs.get(&self.id) {
            Some(o) if o.gamma.is_some() && o.ramp_size > 0 && o.table.is_some() => Ok(o),
            Some(o) if o.failed => Err(DriverError::OutputLost(self.label.clone())),
            Some(o) if o.ramp_size == 0 => Err(DriverError::RampSize(0)),
            Some(_) => Err(DriverError::OutputLost(self.label.clone())),
            None => Err(DriverError::NoOutput(self.label.clone())),
        }
    }
}

impl DisplayDriver for WaylandDriver {
    fn name(&self) -> &str {
        &self.label
    }

    fn read(&mut self) -> Result<GammaTable, DriverError> {
        self.output()?;
        Ok(GammaTable::linear())
    }

    fn write(&mut self, table: &GammaTable) -> Result<(), DriverError> {
        self.output()?;
        let label = self.label.clone();
        let output = self
            .state
            .outputs
            .get_mut(&self.id)
            .ok_or_else(|| DriverError::NoOutput(label.clone()))?;
        let ramp = output.ramp_size as usize;
        let (Some(gamma_obj), Some((file, mmap))) = (output.gamma.as_ref(), output.table.as_mut())
        else {
            return Err(DriverError::OutputLost(label));
        };
        let u16_slice = bytemuck::cast_slice_mut::<u8, u16>(mmap);
        table.fill_hardware(u16_slice, ramp);
        file.seek(SeekFrom::Start(0))?;
        tracing::trace!(output = %label, ramp_size = ramp, "setting gamma");
        gamma_obj.set_gamma(file.as_fd());
        self.conn
            .flush()
            .map_err(|e| DriverError::Protocol(e.to_string()))?;

        // A rejected ramp arrives as a `failed` event.
        self.queue
            .roundtrip(&mut self.state)
            .map_err(|e| DriverError::Protocol(e.to_string()))?;
        self.output().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_file_has_requested_size_and_is_unlinked() {
        let file = create_anonymous_file(256 * 3 * 2).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 1536);
        let mut path = PathBuf::from("/tmp");
        path.push(format!("gammatune-{}", std::process::id()));
        assert!(!path.exists());
    }
}
