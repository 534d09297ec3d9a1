mod common;

use std::sync::{Arc, Weak};

use spin::Mutex;

use nic_engine::sim::SimulatedAdapter;
use nic_engine::{Capabilities, ConfigError, EngineConfig, NicContext, PacketSink};

use common::{build, engine, frame};

#[test]
fn busmaster_drain_stops_at_work_limit() {
    let (nic, delivered) = engine(SimulatedAdapter::busmaster(), EngineConfig::default());
    for i in 0..40 {
        nic.hw.inject_rx(&frame(100, i));
    }
    assert!(nic.hw.take_interrupt());

    assert_eq!(nic.on_interrupt(), 32);
    let stats = nic.get_stats().interrupts;
    assert_eq!(stats.work_limit_hits, 1);
    assert_eq!(stats.events_by_type.rx_complete, 32);

    assert_eq!(nic.on_interrupt(), 8);
    let stats = nic.get_stats().interrupts;
    assert_eq!(stats.work_limit_hits, 1);
    assert_eq!(stats.total_interrupts, 2);
    assert_eq!(stats.batched_interrupts, 2);
    assert_eq!(stats.max_events_per_interrupt, 32);
    assert_eq!(stats.emergency_breaks, 0);

    assert_eq!(nic.poll_and_drain(), 0);
    assert_eq!(nic.get_stats().interrupts.spurious_interrupts, 1);

    let delivered = delivered.lock();
    assert_eq!(delivered.frames.len(), 40);
    for (i, received) in delivered.frames.iter().enumerate() {
        assert_eq!(received, &frame(100, i as u8));
    }
}

#[test]
fn pio_drain_moves_eight_frames_per_batch() {
    let (nic, delivered) = engine(SimulatedAdapter::programmed_io(), EngineConfig::default());
    for i in 0..20 {
        nic.hw.inject_rx(&frame(64, i));
    }
    assert!(nic.hw.take_interrupt());

    let batches: Vec<u32> = (0..4).map(|_| nic.on_interrupt()).collect();
    assert_eq!(batches, vec![8, 8, 4, 0]);
    assert_eq!(nic.hw.pending_rx(), 0);
    assert_eq!(nic.get_stats().interrupts.work_limit_hits, 2);

    let delivered = delivered.lock();
    assert_eq!(delivered.frames.len(), 20);
    assert_eq!(delivered.frames[19], frame(64, 19));
}

#[test]
fn work_limit_can_only_be_lowered() {
    let (nic, _) = engine(SimulatedAdapter::busmaster(), EngineConfig::default());
    assert_eq!(nic.work_limit(), 32);
    assert_eq!(nic.set_work_limit(100), 32);
    assert_eq!(nic.set_work_limit(4), 4);
    assert_eq!(nic.set_work_limit(0), 4);

    for i in 0..10 {
        nic.hw.inject_rx(&frame(60, i));
    }
    assert_eq!(nic.poll_and_drain(), 4);
    assert_eq!(nic.poll_and_drain(), 4);
    assert_eq!(nic.poll_and_drain(), 2);
    assert_eq!(nic.get_stats().interrupts.work_limit_hits, 2);

    let (pio, _) = engine(SimulatedAdapter::programmed_io(), EngineConfig::default());
    assert_eq!(pio.set_work_limit(32), 8);

    let config = EngineConfig {
        work_limit_override: Some(16),
        ..Default::default()
    };
    let (nic, _) = engine(SimulatedAdapter::busmaster(), config.clone());
    assert_eq!(nic.work_limit(), 16);
    let (pio, _) = engine(SimulatedAdapter::programmed_io(), config);
    assert_eq!(pio.work_limit(), 8);
}

#[test]
fn emergency_cap_bounds_a_drain() {
    let config = EngineConfig {
        emergency_event_cap: 8,
        ..Default::default()
    };
    let (nic, delivered) = engine(SimulatedAdapter::busmaster(), config);
    for i in 0..12 {
        nic.hw.inject_rx(&frame(80, i));
    }

    assert_eq!(nic.on_interrupt(), 8);
    let stats = nic.get_stats().interrupts;
    assert_eq!(stats.emergency_breaks, 1);
    assert_eq!(stats.work_limit_hits, 0);

    assert_eq!(nic.on_interrupt(), 4);
    assert_eq!(delivered.lock().frames.len(), 12);
}

#[test]
fn invalid_configuration_is_rejected() {
    let odd_depth = SimulatedAdapter::new(Capabilities {
        has_busmaster_dma: true,
        ring_depth: 12,
        buffer_alignment: 4,
    });
    let result = NicContext::new(odd_depth, EngineConfig::default(), Box::new(nic_engine::DiscardSink));
    assert!(matches!(result.err(), Some(ConfigError::RingDepth(12))));

    let config = EngineConfig {
        work_limit_override: Some(0),
        ..Default::default()
    };
    let result = NicContext::new(SimulatedAdapter::busmaster(), config, Box::new(nic_engine::DiscardSink));
    assert!(matches!(result.err(), Some(ConfigError::WorkLimit(0))));

    let config = EngineConfig {
        rate_threshold_percent: 150,
        ..Default::default()
    };
    let result = NicContext::new(SimulatedAdapter::busmaster(), config, Box::new(nic_engine::DiscardSink));
    assert!(matches!(result.err(), Some(ConfigError::RateThreshold(150))));
}

// Calls back into the engine while a drain is delivering a frame
struct ReentrantSink {
    nic: Arc<Mutex<Weak<NicContext<SimulatedAdapter>>>>,
    nested: Arc<Mutex<Vec<u32>>>,
}

impl PacketSink for ReentrantSink {
    fn receive(&mut self, _payload: &[u8]) {
        let nic = self.nic.lock().upgrade();
        if let Some(nic) = nic {
            let processed = nic.on_interrupt();
            self.nested.lock().push(processed);
        }
    }
}

#[test]
fn nested_interrupt_returns_immediately() {
    let slot: Arc<Mutex<Weak<NicContext<SimulatedAdapter>>>> = Arc::new(Mutex::new(Weak::new()));
    let nested = Arc::new(Mutex::new(Vec::new()));
    let sink = ReentrantSink {
        nic: slot.clone(),
        nested: nested.clone(),
    };
    let nic = Arc::new(build(
        SimulatedAdapter::busmaster(),
        EngineConfig::default(),
        Box::new(sink),
    ));
    *slot.lock() = Arc::downgrade(&nic);

    for i in 0..3 {
        nic.hw.inject_rx(&frame(90, i));
    }
    assert_eq!(nic.on_interrupt(), 3);
    assert_eq!(*nested.lock(), vec![0, 0, 0]);

    let stats = nic.get_stats().interrupts;
    assert_eq!(stats.reentrant_calls, 3);
    assert_eq!(stats.total_interrupts, 4);
    assert_eq!(stats.events_processed, 3);

    let nic = match Arc::try_unwrap(nic) {
        Ok(nic) => nic,
        Err(_) => panic!("engine still shared"),
    };
    assert_eq!(nic.shutdown().outstanding, 0);
}
