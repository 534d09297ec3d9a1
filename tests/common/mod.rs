#![allow(dead_code)]

use std::sync::Arc;

use spin::Mutex;

use nic_engine::sim::SimulatedAdapter;
use nic_engine::{EngineConfig, Fragment, NicContext, PacketSink};

#[derive(Debug, Default)]
pub struct Delivered {
    pub frames: Vec<Vec<u8>>,
    pub released: Vec<Fragment>,
}

// Records everything the engine hands to the upper layer
#[derive(Clone, Default)]
pub struct SharedSink(pub Arc<Mutex<Delivered>>);

impl PacketSink for SharedSink {
    fn receive(&mut self, payload: &[u8]) {
        self.0.lock().frames.push(payload.to_vec());
    }

    fn released(&mut self, fragment: Fragment) {
        self.0.lock().released.push(fragment);
    }
}

pub fn build(
    adapter: SimulatedAdapter, config: EngineConfig, sink: Box<dyn PacketSink + Send>,
) -> NicContext<SimulatedAdapter> {
    match NicContext::new(adapter, config, sink) {
        Ok(nic) => nic,
        Err(e) => panic!("engine setup failed: {}", e),
    }
}

pub fn engine(
    adapter: SimulatedAdapter, config: EngineConfig,
) -> (NicContext<SimulatedAdapter>, Arc<Mutex<Delivered>>) {
    let sink = SharedSink::default();
    let delivered = sink.0.clone();
    (build(adapter, config, Box::new(sink)), delivered)
}

pub fn frame(length: usize, seed: u8) -> Vec<u8> {
    (0..length)
        .map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed))
        .collect()
}
