//! Software model of an adapter, for tests and the simulator binary.
//!
//! Host memory is a flat byte array starting at physical address 0. The DMA window sits
//! at [`SIM_WINDOW_BASE`], caller buffers can be placed below it. A bus-master adapter
//! walks the descriptor rings whenever it is kicked, a programmed I/O adapter only moves
//! frames through its FIFO.

use std::collections::VecDeque;

use anyhow::{anyhow, bail, Result};
use log::{error, trace};
use packed_struct::PackedStruct;
use spin::Mutex;

use crate::nic::descriptors::{ControlFlags, Descriptor, ErrorCode, DESCRIPTOR_LENGTH};
use crate::util::align_up;
use crate::{Capabilities, Direction, DmaWindow, FifoFrame, Fragment, NicHardware};

pub const SIM_HOST_BASE: u32 = 0x1000;
pub const SIM_WINDOW_BASE: u32 = 0x1_0000;
pub const SIM_WINDOW_LENGTH: u32 = 0x3_0000;

#[derive(Debug, Clone, Copy)]
struct DeviceRing {
    base: u32,
    capacity: u16,
    // Next descriptor the adapter will look at
    cursor: u16,
}

#[derive(Debug, Default)]
struct Faults {
    rx_errors: VecDeque<ErrorCode>,
    tx_errors: VecDeque<ErrorCode>,
    fail_rearm: bool,
    fail_reset: bool,
    fail_self_test: bool,
    never_ready: bool,
    fail_fifo_write: bool,
    has_standby: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimCounters {
    pub kicks: u64,
    pub acknowledged: u64,
    pub rearms: u64,
    pub resets: u64,
    pub self_tests: u64,
    pub standby_switches: u64,
}

#[derive(Debug)]
struct SimState {
    capabilities: Capabilities,
    window: DmaWindow,
    memory: Vec<u8>,
    rings: [Option<DeviceRing>; 2],
    loopback: bool,
    // Frames on the wire waiting to be received, doubles as receive FIFO
    backlog: VecDeque<Vec<u8>>,
    transmitted: Vec<Vec<u8>>,
    faults: Faults,
    clock_ms: u64,
    interrupt_pending: bool,
    // Error bits latched by the last FIFO transmit
    tx_status: u8,
    next_host_address: u32,
    counters: SimCounters,
}

pub struct SimulatedAdapter {
    state: Mutex<SimState>,
}

fn ring_index(direction: Direction) -> usize {
    match direction {
        Direction::Transmit => 0,
        Direction::Receive => 1,
    }
}

impl SimState {
    fn read(&self, address: u32, buffer: &mut [u8]) {
        let start = address as usize;
        match self.memory.get(start..start + buffer.len()) {
            Some(source) => buffer.copy_from_slice(source),
            None => {
                error!("Simulated DMA read out of bounds at {:#x}", address);
                buffer.fill(0);
            }
        }
    }

    fn write(&mut self, address: u32, buffer: &[u8]) {
        let start = address as usize;
        match self.memory.get_mut(start..start + buffer.len()) {
            Some(target) => target.copy_from_slice(buffer),
            None => error!("Simulated DMA write out of bounds at {:#x}", address),
        }
    }

    fn descriptor(&self, ring: &DeviceRing) -> (u32, Option<Descriptor>) {
        let address = ring.base + ring.cursor as u32 * DESCRIPTOR_LENGTH as u32;
        let mut data = [0u8; DESCRIPTOR_LENGTH];
        self.read(address, &mut data);
        let descriptor = Descriptor::unpack(&data).ok();
        (address, descriptor)
    }

    fn write_descriptor(&mut self, address: u32, descriptor: &Descriptor) {
        if let Ok(data) = descriptor.pack() {
            self.write(address, &data);
        }
    }

    fn advance(&mut self, direction: Direction, descriptor: &Descriptor) {
        if let Some(ring) = self.rings[ring_index(direction)].as_mut() {
            ring.cursor = (ring.cursor + 1) % ring.capacity;
        }
        if descriptor
            .control_flags()
            .contains(ControlFlags::INTERRUPT_REQUESTED)
        {
            self.interrupt_pending = true;
        }
    }

    // Posted and not yet written back
    fn owned_by_adapter(descriptor: &Descriptor) -> bool {
        !descriptor.is_complete() && descriptor.buffer_length() != 0
    }

    fn process_transmit(&mut self) {
        while let Some(ring) = self.rings[ring_index(Direction::Transmit)] {
            let (address, descriptor) = self.descriptor(&ring);
            let mut descriptor = match descriptor {
                Some(d) if Self::owned_by_adapter(&d) => d,
                _ => break,
            };

            let length = descriptor.buffer_length();
            let mut frame = vec![0u8; length as usize];
            self.read(descriptor.buffer_address, &mut frame);

            let error = self.faults.tx_errors.pop_front().unwrap_or_default();
            if error.is_empty() {
                trace!("Simulated adapter sent {} bytes", length);
                if self.loopback {
                    self.backlog.push_back(frame.clone());
                }
                self.transmitted.push(frame);
            }

            descriptor.complete(length, error);
            self.write_descriptor(address, &descriptor);
            self.advance(Direction::Transmit, &descriptor);
        }
    }

    fn deliver_receive(&mut self) {
        if !self.capabilities.has_busmaster_dma {
            return;
        }
        while !self.backlog.is_empty() {
            let ring = match self.rings[ring_index(Direction::Receive)] {
                Some(ring) => ring,
                None => break,
            };
            let (address, descriptor) = self.descriptor(&ring);
            let mut descriptor = match descriptor {
                Some(d) if Self::owned_by_adapter(&d) => d,
                _ => break,
            };

            let frame = match self.backlog.pop_front() {
                Some(frame) => frame,
                None => break,
            };
            let length = frame.len().min(descriptor.buffer_length() as usize);
            self.write(descriptor.buffer_address, &frame[..length]);

            let error = self.faults.rx_errors.pop_front().unwrap_or_default();
            descriptor.complete(length as u16, error);
            self.write_descriptor(address, &descriptor);
            self.advance(Direction::Receive, &descriptor);
        }
    }
}

impl SimulatedAdapter {
    pub fn new(capabilities: Capabilities) -> Self {
        let window = DmaWindow {
            base: SIM_WINDOW_BASE,
            length: SIM_WINDOW_LENGTH,
        };
        SimulatedAdapter::with_window(capabilities, window)
    }

    pub fn with_window(capabilities: Capabilities, window: DmaWindow) -> Self {
        SimulatedAdapter {
            state: Mutex::new(SimState {
                capabilities,
                window,
                memory: vec![0u8; window.end() as usize],
                rings: [None, None],
                loopback: false,
                backlog: VecDeque::new(),
                transmitted: Vec::new(),
                faults: Faults::default(),
                clock_ms: 0,
                interrupt_pending: false,
                tx_status: 0,
                next_host_address: SIM_HOST_BASE,
                counters: SimCounters::default(),
            }),
        }
    }

    /// 16 descriptors per ring, 4 byte aligned buffers
    pub fn busmaster() -> Self {
        SimulatedAdapter::new(Capabilities {
            has_busmaster_dma: true,
            ring_depth: 16,
            buffer_alignment: 4,
        })
    }

    pub fn programmed_io() -> Self {
        SimulatedAdapter::new(Capabilities {
            has_busmaster_dma: false,
            ring_depth: 16,
            buffer_alignment: 1,
        })
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        self.state.lock().capabilities = capabilities;
    }

    /// Feed every transmitted frame straight back into the receive path
    pub fn set_loopback(&self, enabled: bool) {
        self.state.lock().loopback = enabled;
    }

    /// A frame arrives from the wire
    pub fn inject_rx(&self, frame: &[u8]) {
        let mut state = self.state.lock();
        state.backlog.push_back(frame.to_vec());
        if !state.capabilities.has_busmaster_dma {
            state.interrupt_pending = true;
        }
        state.deliver_receive();
    }

    /// Frames not yet picked up by the receive side
    pub fn pending_rx(&self) -> usize {
        self.state.lock().backlog.len()
    }

    pub fn take_transmitted(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().transmitted)
    }

    /// The next `count` receive completions carry `code`
    pub fn queue_rx_errors(&self, code: ErrorCode, count: usize) {
        let mut state = self.state.lock();
        state.faults.rx_errors.extend(std::iter::repeat(code).take(count));
    }

    pub fn queue_tx_errors(&self, code: ErrorCode, count: usize) {
        let mut state = self.state.lock();
        state.faults.tx_errors.extend(std::iter::repeat(code).take(count));
    }

    pub fn fail_rearm(&self, fail: bool) {
        self.state.lock().faults.fail_rearm = fail;
    }

    pub fn fail_reset(&self, fail: bool) {
        self.state.lock().faults.fail_reset = fail;
    }

    pub fn fail_self_test(&self, fail: bool) {
        self.state.lock().faults.fail_self_test = fail;
    }

    pub fn never_ready(&self, never: bool) {
        self.state.lock().faults.never_ready = never;
    }

    pub fn fail_fifo_write(&self, fail: bool) {
        self.state.lock().faults.fail_fifo_write = fail;
    }

    pub fn install_standby(&self, present: bool) {
        self.state.lock().faults.has_standby = present;
    }

    pub fn advance_ms(&self, ms: u64) {
        self.state.lock().clock_ms += ms;
    }

    /// Interrupt line state, cleared by reading it
    pub fn take_interrupt(&self) -> bool {
        std::mem::take(&mut self.state.lock().interrupt_pending)
    }

    pub fn counters(&self) -> SimCounters {
        self.state.lock().counters
    }

    pub fn read_memory(&self, address: u32, length: usize) -> Vec<u8> {
        let mut data = vec![0u8; length];
        self.state.lock().read(address, &mut data);
        data
    }

    pub fn write_memory(&self, address: u32, data: &[u8]) {
        self.state.lock().write(address, data);
    }

    /// Copy data into host memory below the DMA window, aligned to `alignment` plus `skew`
    pub fn host_buffer_skewed(&self, data: &[u8], alignment: u32, skew: u32) -> Result<Fragment> {
        let mut state = self.state.lock();
        let address = align_up(state.next_host_address as u64, alignment.max(1) as u64) as u32 + skew;
        let end = address as u64 + data.len() as u64;
        if end > state.window.base as u64 {
            bail!("Simulated host memory exhausted");
        }
        let length = u16::try_from(data.len()).map_err(|_| anyhow!("Buffer too large"))?;

        state.write(address, data);
        state.next_host_address = end as u32;
        Ok(Fragment::new(address, length))
    }

    pub fn host_buffer(&self, data: &[u8]) -> Result<Fragment> {
        self.host_buffer_skewed(data, 16, 0)
    }

    /// Forget all host buffers, their memory gets reused
    pub fn reset_host_buffers(&self) {
        self.state.lock().next_host_address = SIM_HOST_BASE;
    }
}

impl NicHardware for SimulatedAdapter {
    fn capabilities(&self) -> Capabilities {
        self.state.lock().capabilities
    }

    fn dma_window(&self) -> DmaWindow {
        self.state.lock().window
    }

    fn dma_read(&self, address: u32, buffer: &mut [u8]) {
        self.state.lock().read(address, buffer);
    }

    fn dma_write(&self, address: u32, buffer: &[u8]) {
        self.state.lock().write(address, buffer);
    }

    fn program_ring(&self, ring: Direction, base_address: u32, capacity: u16) {
        self.state.lock().rings[ring_index(ring)] = Some(DeviceRing {
            base: base_address,
            capacity,
            cursor: 0,
        });
    }

    fn kick(&self, ring: Direction) {
        let mut state = self.state.lock();
        state.counters.kicks += 1;
        if !state.capabilities.has_busmaster_dma {
            return;
        }
        match ring {
            Direction::Transmit => {
                state.process_transmit();
                state.deliver_receive();
            }
            Direction::Receive => state.deliver_receive(),
        }
    }

    fn fifo_write(&self, frame: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.faults.fail_fifo_write {
            bail!("Transmit FIFO not accepting data");
        }

        // Wire errors are latched in the status register, the frame is gone
        let error = state.faults.tx_errors.pop_front().unwrap_or_default();
        state.tx_status = error.bits();
        if !error.is_empty() {
            state.interrupt_pending = true;
            return Ok(());
        }

        if state.loopback {
            state.backlog.push_back(frame.to_vec());
        }
        state.transmitted.push(frame.to_vec());
        state.interrupt_pending = true;
        Ok(())
    }

    fn fifo_tx_status(&self) -> u8 {
        std::mem::take(&mut self.state.lock().tx_status)
    }

    fn fifo_read(&self, buffer: &mut [u8]) -> Option<FifoFrame> {
        let mut state = self.state.lock();
        let frame = state.backlog.pop_front()?;
        let length = frame.len().min(buffer.len());
        buffer[..length].copy_from_slice(&frame[..length]);
        let error = state.faults.rx_errors.pop_front().unwrap_or_default();
        Some(FifoFrame {
            length: length as u16,
            error_code: error.bits(),
        })
    }

    fn acknowledge_interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupt_pending = false;
        state.counters.acknowledged += 1;
    }

    fn rearm(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.counters.rearms += 1;
        if state.faults.fail_rearm {
            bail!("Adapter did not accept rearm");
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.counters.resets += 1;
        if state.faults.fail_reset {
            bail!("Adapter reset timed out");
        }
        // Ring programming is lost, the engine has to program the rings again
        state.rings = [None, None];
        Ok(())
    }

    fn switch_to_standby(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.faults.has_standby {
            bail!("No standby adapter present");
        }
        state.counters.standby_switches += 1;
        state.rings = [None, None];
        Ok(())
    }

    fn is_ready(&self) -> bool {
        !self.state.lock().faults.never_ready
    }

    fn self_test(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.counters.self_tests += 1;
        if state.faults.fail_self_test {
            bail!("Self test failed");
        }
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.state.lock().clock_ms
    }
}
