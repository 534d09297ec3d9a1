mod common;

use nic_engine::sim::SimulatedAdapter;
use nic_engine::{EngineConfig, ErrorCode, RecoveryState, TransferError};

use common::{engine, frame};

fn escalating_config(max_recovery_attempts: u32) -> EngineConfig {
    EngineConfig {
        consecutive_threshold: 5,
        max_recovery_attempts,
        ..Default::default()
    }
}

fn inject_bad_frames(adapter: &SimulatedAdapter, count: usize) {
    adapter.queue_rx_errors(ErrorCode::CRC, count);
    for i in 0..count {
        adapter.inject_rx(&frame(64, i as u8));
    }
}

#[test]
fn failed_recovery_escalates_until_disabled() {
    let (nic, delivered) = engine(SimulatedAdapter::busmaster(), escalating_config(4));
    nic.hw.fail_self_test(true);
    let fragment = nic.hw.host_buffer(&frame(100, 0)).unwrap();

    inject_bad_frames(&nic.hw, 5);
    assert_eq!(nic.on_interrupt(), 5);
    assert!(delivered.lock().frames.is_empty());

    // The fifth error triggered the soft reset right away, it failed its self-test
    let recovery = nic.get_stats().recovery;
    assert_eq!(recovery.errors.crc, 5);
    assert_eq!(recovery.counters.actions.rearms, 1);
    assert_eq!(recovery.status.attempt_count, 1);
    assert_eq!(recovery.status.state, RecoveryState::HardReset);
    assert_eq!(nic.hw.counters().rearms, 1);
    assert_eq!(nic.recent_errors().len(), 5);

    for expected in [
        RecoveryState::Reinit,
        RecoveryState::Failover,
        RecoveryState::Disabled,
    ] {
        nic.hw.advance_ms(1000);
        nic.poll_and_drain();
        assert_eq!(nic.get_stats().recovery.status.state, expected);
    }

    assert!(nic.is_disabled());
    let stats = nic.get_stats();
    assert!(stats.disabled);
    assert_eq!(stats.recovery.status.attempt_count, 4);
    assert_eq!(stats.recovery.counters.failures, 4);
    assert_eq!(stats.recovery.counters.disabled, 1);
    // No standby configured, failover never reached its self-test
    let counters = nic.hw.counters();
    assert_eq!(counters.resets, 2);
    assert_eq!(counters.self_tests, 3);

    assert_eq!(nic.send(&[fragment]), Err(TransferError::Fatal));
    assert_eq!(nic.poll_and_drain(), 0);
    assert_eq!(nic.shutdown().outstanding, 0);
}

#[test]
fn recovery_attempts_are_rate_limited() {
    let (nic, _) = engine(SimulatedAdapter::busmaster(), escalating_config(4));
    nic.hw.fail_self_test(true);
    inject_bad_frames(&nic.hw, 5);
    nic.on_interrupt();
    assert_eq!(nic.get_stats().recovery.status.state, RecoveryState::HardReset);

    nic.poll_and_drain();
    nic.hw.advance_ms(999);
    nic.poll_and_drain();
    let recovery = nic.get_stats().recovery;
    assert_eq!(recovery.status.state, RecoveryState::HardReset);
    assert_eq!(recovery.counters.rate_limited, 2);
    assert_eq!(nic.hw.counters().resets, 0);

    nic.hw.advance_ms(1);
    nic.poll_and_drain();
    assert_eq!(nic.get_stats().recovery.status.state, RecoveryState::Reinit);
    assert_eq!(nic.hw.counters().resets, 1);
}

#[test]
fn successful_soft_reset_returns_to_healthy() {
    let (nic, delivered) = engine(SimulatedAdapter::busmaster(), escalating_config(3));
    inject_bad_frames(&nic.hw, 5);
    assert_eq!(nic.on_interrupt(), 5);

    let recovery = nic.get_stats().recovery;
    assert_eq!(recovery.status.state, RecoveryState::Healthy);
    assert_eq!(recovery.status.attempt_count, 0);
    assert_eq!(recovery.status.consecutive_errors, 0);
    assert_eq!(recovery.counters.successes, 1);
    assert_eq!(nic.hw.counters().self_tests, 1);

    for i in 0..3 {
        nic.hw.inject_rx(&frame(128, i));
    }
    assert_eq!(nic.on_interrupt(), 3);
    assert_eq!(delivered.lock().frames.len(), 3);
    // Refilled up to the slots kept free for caller buffers
    assert_eq!(nic.get_stats().rx_ring.occupancy, 12);
}

#[test]
fn error_rate_triggers_recovery() {
    let (nic, _) = engine(SimulatedAdapter::busmaster(), EngineConfig::default());
    assert!(nic.configure_thresholds(0, 10).is_err());
    assert!(nic.configure_thresholds(100, 101).is_err());
    assert!(nic.configure_thresholds(100, 10).is_ok());

    for i in 0..18 {
        nic.hw.inject_rx(&frame(70, i));
    }
    assert_eq!(nic.on_interrupt(), 18);

    // 2 errors in 20 frames is exactly 10%
    inject_bad_frames(&nic.hw, 2);
    assert_eq!(nic.on_interrupt(), 2);
    let recovery = nic.get_stats().recovery;
    assert_eq!(recovery.counters.actions.rearms, 1);
    assert_eq!(recovery.status.state, RecoveryState::Healthy);
}

#[test]
fn adapter_that_never_becomes_ready_fails_the_attempt() {
    let (nic, _) = engine(SimulatedAdapter::busmaster(), escalating_config(4));
    nic.hw.never_ready(true);
    inject_bad_frames(&nic.hw, 5);
    nic.on_interrupt();

    let recovery = nic.get_stats().recovery;
    assert_eq!(recovery.status.state, RecoveryState::HardReset);
    assert_eq!(recovery.counters.failures, 1);
    assert_eq!(nic.hw.counters().self_tests, 0);
}

#[test]
fn failover_to_standby_recovers() {
    let config = EngineConfig {
        standby_adapter: true,
        ..escalating_config(4)
    };
    let (nic, _) = engine(SimulatedAdapter::busmaster(), config);
    nic.hw.install_standby(true);
    nic.hw.fail_self_test(true);

    inject_bad_frames(&nic.hw, 5);
    nic.on_interrupt();
    for _ in 0..2 {
        nic.hw.advance_ms(1000);
        nic.poll_and_drain();
    }
    assert_eq!(nic.get_stats().recovery.status.state, RecoveryState::Failover);

    nic.hw.fail_self_test(false);
    nic.hw.advance_ms(1000);
    nic.poll_and_drain();

    let stats = nic.get_stats();
    assert_eq!(stats.recovery.status.state, RecoveryState::Healthy);
    assert_eq!(stats.recovery.counters.actions.failovers, 1);
    assert!(!stats.disabled);
    assert_eq!(nic.hw.counters().standby_switches, 1);

    let data = frame(100, 1);
    let fragment = nic.hw.host_buffer(&data).unwrap();
    assert_eq!(nic.send(&[fragment]), Ok(()));
    assert_eq!(nic.hw.take_transmitted(), vec![data]);
}

#[test]
fn reenable_requires_a_passing_self_test() {
    let (nic, _) = engine(SimulatedAdapter::busmaster(), escalating_config(1));
    nic.hw.fail_self_test(true);
    inject_bad_frames(&nic.hw, 5);
    nic.on_interrupt();
    assert!(nic.is_disabled());
    assert_eq!(nic.get_stats().rx_ring.occupancy, 0);

    assert!(nic.reenable().is_err());
    assert!(nic.is_disabled());

    nic.hw.fail_self_test(false);
    assert!(nic.reenable().is_ok());
    assert!(!nic.is_disabled());

    let stats = nic.get_stats();
    assert_eq!(stats.recovery.status.state, RecoveryState::Healthy);
    assert_eq!(stats.recovery.status.attempt_count, 0);
    assert_eq!(stats.rx_ring.occupancy, 12);

    let data = frame(90, 2);
    let fragment = nic.hw.host_buffer(&data).unwrap();
    assert_eq!(nic.send(&[fragment]), Ok(()));
    assert_eq!(nic.hw.take_transmitted(), vec![data]);
}
