use std::slice::from_raw_parts;

use anyhow::{bail, Result};
use log::{error, warn};

use crate::nic::{NicContext, TransferError};
use crate::{
    Capabilities, Direction, DmaWindow, EngineConfig, FifoFrame, Fragment, NicHardware,
    PacketSink,
};

// General FFI interface

type DmaReadCallback = unsafe extern "C" fn(address: u32, buffer: *mut u8, len: usize);
type DmaWriteCallback = unsafe extern "C" fn(address: u32, buffer: *const u8, len: usize);
type ProgramRingCallback = unsafe extern "C" fn(ring: Direction, base_address: u32, capacity: u16);
type KickCallback = unsafe extern "C" fn(ring: Direction);
type FifoWriteCallback = unsafe extern "C" fn(frame: *const u8, len: usize) -> bool;
// Returns false if the FIFO is empty, otherwise fills length and error code
type FifoReadCallback = unsafe extern "C" fn(
    buffer: *mut u8,
    capacity: usize,
    length: *mut u16,
    error_code: *mut u8,
) -> bool;
type ActionCallback = unsafe extern "C" fn() -> bool;
type NotifyCallback = unsafe extern "C" fn();
type ClockCallback = unsafe extern "C" fn() -> u64;
type ReceiveCallback = unsafe extern "C" fn(payload: *const u8, len: usize);
type ReleasedCallback = unsafe extern "C" fn(address: u32, len: u16);

#[repr(C)]
pub struct FfiCallbacks {
    capabilities: Capabilities,
    window: DmaWindow,
    dma_read_cb: DmaReadCallback,
    dma_write_cb: DmaWriteCallback,
    program_ring_cb: ProgramRingCallback,
    kick_cb: KickCallback,
    fifo_write_cb: FifoWriteCallback,
    fifo_read_cb: FifoReadCallback,
    acknowledge_interrupt_cb: NotifyCallback,
    rearm_cb: ActionCallback,
    reset_cb: ActionCallback,
    switch_to_standby_cb: ActionCallback,
    is_ready_cb: ActionCallback,
    self_test_cb: ActionCallback,
    now_ms_cb: ClockCallback,
}

fn action(callback: ActionCallback, name: &str) -> Result<()> {
    if unsafe { callback() } {
        Ok(())
    } else {
        bail!("{} failed", name)
    }
}

impl NicHardware for FfiCallbacks {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn dma_window(&self) -> DmaWindow {
        self.window
    }

    fn dma_read(&self, address: u32, buffer: &mut [u8]) {
        unsafe {
            (self.dma_read_cb)(address, buffer.as_mut_ptr(), buffer.len());
        }
    }

    fn dma_write(&self, address: u32, buffer: &[u8]) {
        unsafe {
            (self.dma_write_cb)(address, buffer.as_ptr(), buffer.len());
        }
    }

    fn program_ring(&self, ring: Direction, base_address: u32, capacity: u16) {
        unsafe { (self.program_ring_cb)(ring, base_address, capacity) }
    }

    fn kick(&self, ring: Direction) {
        unsafe { (self.kick_cb)(ring) }
    }

    fn fifo_write(&self, frame: &[u8]) -> Result<()> {
        if unsafe { (self.fifo_write_cb)(frame.as_ptr(), frame.len()) } {
            Ok(())
        } else {
            bail!("FIFO write of {} bytes failed", frame.len())
        }
    }

    fn fifo_read(&self, buffer: &mut [u8]) -> Option<FifoFrame> {
        let mut length = 0u16;
        let mut error_code = 0u8;
        let available = unsafe {
            (self.fifo_read_cb)(buffer.as_mut_ptr(), buffer.len(), &mut length, &mut error_code)
        };
        available.then(|| FifoFrame {
            length: length.min(buffer.len() as u16),
            error_code,
        })
    }

    fn acknowledge_interrupt(&self) {
        unsafe { (self.acknowledge_interrupt_cb)() }
    }

    fn rearm(&self) -> Result<()> {
        action(self.rearm_cb, "Rearm")
    }

    fn reset(&self) -> Result<()> {
        action(self.reset_cb, "Reset")
    }

    fn switch_to_standby(&self) -> Result<()> {
        action(self.switch_to_standby_cb, "Standby switch")
    }

    fn is_ready(&self) -> bool {
        unsafe { (self.is_ready_cb)() }
    }

    fn self_test(&self) -> Result<()> {
        action(self.self_test_cb, "Self test")
    }

    fn now_ms(&self) -> u64 {
        unsafe { (self.now_ms_cb)() }
    }
}

#[repr(C)]
pub struct FfiSink {
    receive_cb: ReceiveCallback,
    released_cb: ReleasedCallback,
}

impl PacketSink for FfiSink {
    fn receive(&mut self, payload: &[u8]) {
        unsafe { (self.receive_cb)(payload.as_ptr(), payload.len()) }
    }

    fn released(&mut self, fragment: Fragment) {
        unsafe { (self.released_cb)(fragment.address, fragment.length) }
    }
}

/// Tunables a C caller may override, zero keeps the default
#[repr(C)]
pub struct FfiConfig {
    consecutive_threshold: u32,
    rate_threshold_percent: u32,
    max_recovery_attempts: u32,
    work_limit: u16,
    standby_adapter: bool,
}

impl From<&FfiConfig> for EngineConfig {
    fn from(ffi: &FfiConfig) -> Self {
        let defaults = EngineConfig::default();
        let pick = |value: u32, default: u32| if value == 0 { default } else { value };
        EngineConfig {
            consecutive_threshold: pick(ffi.consecutive_threshold, defaults.consecutive_threshold),
            rate_threshold_percent: pick(ffi.rate_threshold_percent, defaults.rate_threshold_percent),
            max_recovery_attempts: pick(ffi.max_recovery_attempts, defaults.max_recovery_attempts),
            work_limit_override: (ffi.work_limit != 0).then_some(ffi.work_limit),
            standby_adapter: ffi.standby_adapter,
            ..defaults
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicStatus {
    Ok = 0,
    Busy,
    ErrorHardware,
    ErrorNoMemory,
    ErrorFatal,
    ErrorInvalid,
}

impl From<Result<(), TransferError>> for NicStatus {
    fn from(result: Result<(), TransferError>) -> Self {
        match result {
            Ok(()) => NicStatus::Ok,
            Err(TransferError::Busy) => NicStatus::Busy,
            Err(TransferError::Hardware) => NicStatus::ErrorHardware,
            Err(TransferError::NoMemory) => NicStatus::ErrorNoMemory,
            Err(TransferError::Fatal) => NicStatus::ErrorFatal,
            Err(TransferError::InvalidPacket) => NicStatus::ErrorInvalid,
        }
    }
}

/// Flat counter copy for C callers
#[repr(C)]
pub struct FfiStats {
    tx_occupancy: u16,
    rx_occupancy: u16,
    buffers_outstanding: u32,
    buffers_peak: u32,
    total_interrupts: u64,
    events_processed: u64,
    work_limit_hits: u64,
    emergency_breaks: u64,
    errors: u64,
    recovery_attempts: u32,
    disabled: bool,
}

// NIC engine FFI Interface

pub struct NicEngineFfi {
    nic: NicContext<FfiCallbacks>,
}

impl NicEngineFfi {
    /// Returns null if the adapter description is unusable
    #[no_mangle]
    pub extern "C" fn nic_engine_new(
        callbacks: FfiCallbacks, sink: FfiSink, config: &FfiConfig,
    ) -> *mut NicEngineFfi {
        match NicContext::new(callbacks, EngineConfig::from(config), Box::new(sink)) {
            Ok(nic) => Box::into_raw(Box::new(NicEngineFfi { nic })),
            Err(e) => {
                error!("Failed to create NIC engine: {}", e);
                std::ptr::null_mut()
            }
        }
    }

    /// Returns the number of buffers that were still outstanding
    #[no_mangle]
    pub extern "C" fn nic_engine_drop(engine: *mut NicEngineFfi) -> u32 {
        if engine.is_null() {
            return 0;
        }
        // Box will free on drop
        let engine = unsafe { Box::from_raw(engine) };
        engine.nic.shutdown().outstanding
    }

    #[no_mangle]
    pub extern "C" fn nic_engine_send(
        &self, fragments: *const Fragment, count: usize,
    ) -> NicStatus {
        if fragments.is_null() || count == 0 {
            return NicStatus::ErrorInvalid;
        }
        let fragments = unsafe { from_raw_parts(fragments, count) };
        NicStatus::from(self.nic.send(fragments))
    }

    #[no_mangle]
    pub extern "C" fn nic_engine_post_receive(
        &self, fragments: *const Fragment, count: usize,
    ) -> NicStatus {
        if fragments.is_null() || count == 0 {
            return NicStatus::ErrorInvalid;
        }
        let fragments = unsafe { from_raw_parts(fragments, count) };
        NicStatus::from(self.nic.submit(Direction::Receive, fragments))
    }

    #[no_mangle]
    pub extern "C" fn nic_engine_on_interrupt(&self) -> u32 {
        self.nic.on_interrupt()
    }

    #[no_mangle]
    pub extern "C" fn nic_engine_poll(&self) -> u32 {
        self.nic.poll_and_drain()
    }

    #[no_mangle]
    pub extern "C" fn nic_engine_set_work_limit(&self, limit: u16) -> u16 {
        self.nic.set_work_limit(limit)
    }

    #[no_mangle]
    pub extern "C" fn nic_engine_configure_thresholds(
        &self, consecutive_threshold: u32, rate_threshold_percent: u32,
    ) -> bool {
        match self
            .nic
            .configure_thresholds(consecutive_threshold, rate_threshold_percent)
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Rejected thresholds: {}", e);
                false
            }
        }
    }

    #[no_mangle]
    pub extern "C" fn nic_engine_reenable(&self) -> bool {
        match self.nic.reenable() {
            Ok(()) => true,
            Err(e) => {
                error!("Re-enabling adapter failed: {}", e);
                false
            }
        }
    }

    #[no_mangle]
    pub extern "C" fn nic_engine_stats(&self, out: *mut FfiStats) -> bool {
        if out.is_null() {
            return false;
        }
        let stats = self.nic.get_stats();
        let flat = FfiStats {
            tx_occupancy: stats.tx_ring.occupancy,
            rx_occupancy: stats.rx_ring.occupancy,
            buffers_outstanding: stats.pool.outstanding,
            buffers_peak: stats.pool.peak_outstanding,
            total_interrupts: stats.interrupts.total_interrupts,
            events_processed: stats.interrupts.events_processed,
            work_limit_hits: stats.interrupts.work_limit_hits,
            emergency_breaks: stats.interrupts.emergency_breaks,
            errors: stats.recovery.errors.total(),
            recovery_attempts: stats.recovery.status.attempt_count,
            disabled: stats.disabled,
        };
        unsafe { out.write(flat) };
        true
    }

    /// Set up logging for C callers, RUST_LOG controls the level
    #[no_mangle]
    pub extern "C" fn nic_engine_init_logging() {
        if pretty_env_logger::try_init().is_err() {
            warn!("Logger already initialized");
        }
    }
}
