// SPDX-License-Identifier: GPL-3.0-only

//! Synchronous per-frame compute dispatch
//!
//! A dispatch blocks the calling thread until every unit finishes or the
//! deadline passes. This is the pipeline's backpressure point: there is a
//! single program image, so only one dispatch may be in flight and the
//! program mutex serializes callers.

use super::program::{ComputeProgram, MailboxEntry};
use super::uniforms::{UniformParams, UnitIndex, build_uniforms};
use super::ComputeDevice;
use crate::constants::timing::FRAME_LOG_INTERVAL;
use crate::errors::PipelineResult;
use crate::geometry::FrameGeometry;
use crate::memory::SharedBuffer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct Dispatcher {
    program: Mutex<ComputeProgram>,
    device: Arc<dyn ComputeDevice>,
    timeout: Duration,
    dispatches: AtomicU64,
}

impl Dispatcher {
    pub fn new(program: ComputeProgram, device: Arc<dyn ComputeDevice>, timeout: Duration) -> Self {
        debug!(
            device = device.name(),
            units = program.unit_count(),
            timeout_ms = timeout.as_millis() as u64,
            "Created compute dispatcher"
        );
        Self {
            program: Mutex::new(program),
            device,
            timeout,
            dispatches: AtomicU64::new(0),
        }
    }

    pub fn device_name(&self) -> &'static str {
        self.device.name()
    }

    /// Remap `input` into `output` through `map`.
    ///
    /// Enable/disable failures are logged and ignored. A timeout is returned
    /// as [`crate::errors::PipelineError::DispatchTimeout`].
    pub fn dispatch(
        &self,
        input: &SharedBuffer,
        output: &SharedBuffer,
        map: &SharedBuffer,
        geometry: &FrameGeometry,
    ) -> PipelineResult<()> {
        let started = Instant::now();

        // Frames stay mapped for the whole run
        let _input = input.lock()?;
        let _output = output.lock()?;
        let _map = map.lock()?;

        let mut program = self.program.lock().unwrap_or_else(|p| p.into_inner());
        let units = program.unit_count();
        let code_address = program.code_address();
        let first_unit = UnitIndex::new(0, units)?;
        let params = UniformParams::new(
            program.uniform_address(first_unit),
            input.device_address(),
            output.device_address(),
            map.device_address(),
            *geometry,
        );

        program.with_image(|image| {
            for unit in UnitIndex::all(units) {
                let block = build_uniforms(&params, unit);
                image.mailbox[unit.get()] = MailboxEntry {
                    uniform_address: block.0[0],
                    code_address,
                };
                image.uniforms[unit.get()] = block;
            }
        })?;

        let _pinned = program.pin()?;
        if let Err(e) = self.device.set_enabled(true) {
            warn!(device = self.device.name(), error = %e, "Failed to enable compute mode");
        }
        let result = self
            .device
            .execute(units, program.mailbox_address(), self.timeout);
        if let Err(e) = self.device.set_enabled(false) {
            warn!(device = self.device.name(), error = %e, "Failed to disable compute mode");
        }

        let count = self.dispatches.fetch_add(1, Ordering::Relaxed);
        if count % FRAME_LOG_INTERVAL == 0 {
            debug!(
                dispatch = count,
                elapsed_us = started.elapsed().as_micros() as u64,
                "Remap dispatch"
            );
        }
        result
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("device", &self.device.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineError;
    use crate::memory::{HostMemory, SharedMemory};
    use std::sync::atomic::AtomicUsize;

    /// Records calls and checks the mailbox table it is handed
    struct RecordingDevice {
        memory: Arc<HostMemory>,
        enables: AtomicUsize,
        disables: AtomicUsize,
        fail_enable: bool,
        time_out: bool,
        seen: Mutex<Vec<u32>>,
    }

    impl RecordingDevice {
        fn new(memory: Arc<HostMemory>) -> Self {
            Self {
                memory,
                enables: AtomicUsize::new(0),
                disables: AtomicUsize::new(0),
                fail_enable: false,
                time_out: false,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ComputeDevice for RecordingDevice {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn set_enabled(&self, enabled: bool) -> PipelineResult<()> {
            if enabled {
                self.enables.fetch_add(1, Ordering::SeqCst);
                if self.fail_enable {
                    return Err(PipelineError::setup(crate::errors::Stage::Remap, "busy"));
                }
            } else {
                self.disables.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn execute(&self, units: usize, mailbox_address: u32, timeout: Duration) -> PipelineResult<()> {
            let table = self.memory.read_words(mailbox_address, units * 2)?;
            self.seen.lock().unwrap().extend(table);
            if self.time_out {
                return Err(PipelineError::DispatchTimeout { timeout });
            }
            Ok(())
        }
    }

    struct Fixture {
        host: Arc<HostMemory>,
        device: Arc<RecordingDevice>,
        dispatcher: Dispatcher,
        input: SharedBuffer,
        output: SharedBuffer,
        map: SharedBuffer,
        geometry: FrameGeometry,
    }

    fn fixture(units: usize, configure: impl FnOnce(&mut RecordingDevice)) -> Fixture {
        let host = Arc::new(HostMemory::new());
        let domain: Arc<dyn SharedMemory> = host.clone();
        let geometry = FrameGeometry::new(128, 12, 128, 12).unwrap();
        let mut device = RecordingDevice::new(host.clone());
        configure(&mut device);
        let device = Arc::new(device);
        let mut program = ComputeProgram::create(&domain, units).unwrap();
        program.load_kernel(&[0; 16]).unwrap();
        let dispatcher = Dispatcher::new(program, device.clone(), Duration::from_millis(2000));
        Fixture {
            input: SharedBuffer::create(&domain, geometry.camera_frame_size()).unwrap(),
            output: SharedBuffer::create(&domain, geometry.video_frame_size()).unwrap(),
            map: SharedBuffer::create(&domain, geometry.map_entries() * 4).unwrap(),
            host,
            device,
            dispatcher,
            geometry,
        }
    }

    #[test]
    fn test_dispatch_writes_mailbox_and_uniforms() {
        let f = fixture(3, |_| {});
        f.dispatcher
            .dispatch(&f.input, &f.output, &f.map, &f.geometry)
            .unwrap();

        let table = f.device.seen.lock().unwrap().clone();
        assert_eq!(table.len(), 6);
        for unit in 0..3 {
            let uniform_address = table[unit * 2];
            let block = f.host.read_words(uniform_address, 16).unwrap();
            assert_eq!(block[0], uniform_address, "block is self-referencing");
            assert_eq!(block[5], unit as u32);
            assert_eq!(block[6], f.map.device_address());
            assert_eq!(block[7], f.output.device_address());
        }
        assert_eq!(table[1], table[3], "all units run the same code");
        assert_eq!(f.device.enables.load(Ordering::SeqCst), 1);
        assert_eq!(f.device.disables.load(Ordering::SeqCst), 1);
        assert_eq!(f.host.outstanding_locks(), 0);
    }

    #[test]
    fn test_enable_failure_is_not_fatal() {
        let f = fixture(12, |d| d.fail_enable = true);
        assert!(f
            .dispatcher
            .dispatch(&f.input, &f.output, &f.map, &f.geometry)
            .is_ok());
        assert_eq!(f.device.disables.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_still_disables_compute() {
        let f = fixture(12, |d| d.time_out = true);
        let err = f
            .dispatcher
            .dispatch(&f.input, &f.output, &f.map, &f.geometry)
            .unwrap_err();
        assert!(matches!(err, PipelineError::DispatchTimeout { .. }));
        assert_eq!(f.device.disables.load(Ordering::SeqCst), 1);
        assert_eq!(f.host.outstanding_locks(), 0);
    }
}
