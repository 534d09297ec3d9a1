use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use anyhow::{anyhow, bail, Result};
use log::{debug, error, info, trace, warn};

use crate::nic::config::{EngineConfig, MemoryLayout};
use crate::nic::descriptors::ErrorCode;
use crate::nic::NicContext;
use crate::util::category_counters;
use crate::{Direction, NicHardware, PacketSink};

// Classified errors kept for diagnostics
const ERROR_LOG_CAPACITY: usize = 32;
// Upper bound on readiness polls, in case the timer does not advance
const MAX_READY_POLLS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Healthy,
    SoftReset,
    HardReset,
    Reinit,
    Failover,
    Disabled,
}

impl RecoveryState {
    /// Next stage when the recovery action of this stage failed
    pub fn escalate(self) -> RecoveryState {
        match self {
            RecoveryState::Healthy => RecoveryState::SoftReset,
            RecoveryState::SoftReset => RecoveryState::HardReset,
            RecoveryState::HardReset => RecoveryState::Reinit,
            RecoveryState::Reinit => RecoveryState::Failover,
            RecoveryState::Failover | RecoveryState::Disabled => RecoveryState::Disabled,
        }
    }

    pub fn action(self) -> Option<RecoveryAction> {
        match self {
            RecoveryState::SoftReset => Some(RecoveryAction::Rearm),
            RecoveryState::HardReset => Some(RecoveryAction::HardReset),
            RecoveryState::Reinit => Some(RecoveryAction::Reinitialize),
            RecoveryState::Failover => Some(RecoveryAction::Failover),
            RecoveryState::Healthy | RecoveryState::Disabled => None,
        }
    }

    /// State after an attempt. `attempts` already includes the attempt that just finished.
    pub fn after_attempt(self, success: bool, attempts: u32, max_attempts: u32) -> RecoveryState {
        if success {
            RecoveryState::Healthy
        } else if attempts >= max_attempts {
            RecoveryState::Disabled
        } else {
            self.escalate()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    // Clear error conditions, re-enable interrupts
    Rearm,
    HardReset,
    // Reset, re-read capabilities and rebuild all rings
    Reinitialize,
    Failover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    RxOverrun,
    Crc,
    Frame,
    Timeout,
    TxUnderrun,
    Collision,
    AdapterFailure,
}

impl ErrorCategory {
    /// First matching bit wins, adapter failure trumps everything else
    pub fn classify(code: ErrorCode) -> ErrorCategory {
        const ORDER: [(ErrorCode, ErrorCategory); 6] = [
            (ErrorCode::OVERRUN, ErrorCategory::RxOverrun),
            (ErrorCode::CRC, ErrorCategory::Crc),
            (ErrorCode::FRAME, ErrorCategory::Frame),
            (ErrorCode::TIMEOUT, ErrorCategory::Timeout),
            (ErrorCode::UNDERRUN, ErrorCategory::TxUnderrun),
            (ErrorCode::COLLISION, ErrorCategory::Collision),
        ];

        if code.contains(ErrorCode::ADAPTER_FAILURE) {
            return ErrorCategory::AdapterFailure;
        }
        ORDER
            .iter()
            .find(|(bit, _)| code.contains(*bit))
            .map(|(_, category)| *category)
            .unwrap_or(ErrorCategory::AdapterFailure)
    }

    /// Worth a single retransmission
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorCategory::Collision | ErrorCategory::TxUnderrun)
    }
}

category_counters! {
    /// Errors seen per category since bring-up
    pub struct ErrorCounters for ErrorCategory {
        RxOverrun => rx_overrun,
        Crc => crc,
        Frame => frame,
        Timeout => timeout,
        TxUnderrun => tx_underrun,
        Collision => collision,
        AdapterFailure => adapter_failure,
    }
}

category_counters! {
    /// Recovery attempts per action
    pub struct ActionCounters for RecoveryAction {
        Rearm => rearms,
        HardReset => hard_resets,
        Reinitialize => reinitializations,
        Failover => failovers,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorRecoveryState {
    pub state: RecoveryState,
    pub attempt_count: u32,
    pub consecutive_errors: u32,
    pub error_rate_percent: u32,
    pub last_attempt_time: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryCounters {
    pub actions: ActionCounters,
    pub successes: u64,
    pub failures: u64,
    pub rate_limited: u64,
    pub disabled: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorLogEntry {
    pub timestamp_ms: u64,
    pub direction: Direction,
    pub category: ErrorCategory,
    pub slot: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverySnapshot {
    pub status: ErrorRecoveryState,
    pub errors: ErrorCounters,
    pub counters: RecoveryCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryThresholds {
    pub consecutive_errors: u32,
    pub rate_percent: u32,
    pub rate_window_ms: u64,
    pub rate_min_samples: u32,
    pub max_attempts: u32,
    pub min_attempt_interval_ms: u64,
}

impl From<&EngineConfig> for RecoveryThresholds {
    fn from(config: &EngineConfig) -> Self {
        RecoveryThresholds {
            consecutive_errors: config.consecutive_threshold,
            rate_percent: config.rate_threshold_percent,
            rate_window_ms: config.rate_window_ms,
            rate_min_samples: config.rate_min_samples,
            max_attempts: config.max_recovery_attempts,
            min_attempt_interval_ms: config.min_attempt_interval_ms,
        }
    }
}

/// What the controller wants done right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    Idle,
    RateLimited,
    Attempt(RecoveryAction),
}

/// Error accounting and the escalation state machine. Pure bookkeeping, the actions
/// themselves are run by the engine.
#[derive(Debug)]
pub struct RecoveryController {
    thresholds: RecoveryThresholds,
    status: ErrorRecoveryState,
    errors: ErrorCounters,
    counters: RecoveryCounters,

    // Sliding window for the error rate, restarted every rate_window_ms
    window_start: Option<u64>,
    window_events: u32,
    window_errors: u32,

    log: VecDeque<ErrorLogEntry>,
}

impl RecoveryController {
    pub fn new(thresholds: RecoveryThresholds) -> Self {
        RecoveryController {
            thresholds,
            status: ErrorRecoveryState {
                state: RecoveryState::Healthy,
                attempt_count: 0,
                consecutive_errors: 0,
                error_rate_percent: 0,
                last_attempt_time: None,
            },
            errors: ErrorCounters::default(),
            counters: RecoveryCounters::default(),
            window_start: None,
            window_events: 0,
            window_errors: 0,
            log: VecDeque::with_capacity(ERROR_LOG_CAPACITY),
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.status.state
    }

    pub fn status(&self) -> ErrorRecoveryState {
        self.status
    }

    pub fn set_thresholds(&mut self, consecutive_errors: u32, rate_percent: u32) {
        self.thresholds.consecutive_errors = consecutive_errors;
        self.thresholds.rate_percent = rate_percent;
        debug!(
            "Recovery thresholds: {} consecutive, {}% rate",
            consecutive_errors, rate_percent
        );
    }

    fn account(&mut self, now: u64, error: bool) {
        let start = *self.window_start.get_or_insert(now);
        if now.saturating_sub(start) >= self.thresholds.rate_window_ms {
            self.window_start = Some(now);
            self.window_events = 0;
            self.window_errors = 0;
        }

        self.window_events += 1;
        if error {
            self.window_errors += 1;
        }
        if self.window_events >= self.thresholds.rate_min_samples {
            self.status.error_rate_percent = self.window_errors * 100 / self.window_events;
        }
    }

    pub fn record_success(&mut self, now: u64) {
        self.status.consecutive_errors = 0;
        self.account(now, false);
    }

    /// Count a classified error. Returns true when it pushed a healthy adapter into recovery.
    pub fn record_error(
        &mut self, now: u64, direction: Direction, category: ErrorCategory, slot: u16,
    ) -> bool {
        self.errors.increment(category);
        self.status.consecutive_errors += 1;
        self.account(now, true);

        if self.log.len() == ERROR_LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(ErrorLogEntry {
            timestamp_ms: now,
            direction,
            category,
            slot,
        });

        if self.status.state != RecoveryState::Healthy {
            return false;
        }

        let consecutive = self.status.consecutive_errors >= self.thresholds.consecutive_errors;
        let rate = self.window_events >= self.thresholds.rate_min_samples
            && self.status.error_rate_percent >= self.thresholds.rate_percent;
        if consecutive || rate {
            warn!(
                "Escalating to soft reset: {} consecutive errors, {}% error rate",
                self.status.consecutive_errors, self.status.error_rate_percent
            );
            self.status.state = RecoveryState::SoftReset;
            return true;
        }
        false
    }

    pub fn next_step(&mut self, now: u64) -> RecoveryStep {
        let action = match self.status.state.action() {
            Some(action) => action,
            None => return RecoveryStep::Idle,
        };

        if let Some(last) = self.status.last_attempt_time {
            if now.saturating_sub(last) < self.thresholds.min_attempt_interval_ms {
                self.counters.rate_limited += 1;
                return RecoveryStep::RateLimited;
            }
        }
        RecoveryStep::Attempt(action)
    }

    pub fn begin_attempt(&mut self, now: u64, action: RecoveryAction) {
        self.status.attempt_count += 1;
        self.status.last_attempt_time = Some(now);
        self.counters.actions.increment(action);
    }

    pub fn finish_attempt(&mut self, success: bool) -> RecoveryState {
        let previous = self.status.state;
        let next = previous.after_attempt(
            success,
            self.status.attempt_count,
            self.thresholds.max_attempts,
        );
        self.status.state = next;

        if success {
            self.counters.successes += 1;
            self.status.attempt_count = 0;
            self.status.consecutive_errors = 0;
            self.window_start = None;
            self.window_events = 0;
            self.window_errors = 0;
            self.status.error_rate_percent = 0;
        } else {
            self.counters.failures += 1;
        }
        if next == RecoveryState::Disabled {
            self.counters.disabled += 1;
        }
        next
    }

    pub fn force_disable(&mut self) {
        if self.status.state != RecoveryState::Disabled {
            self.status.state = RecoveryState::Disabled;
            self.counters.disabled += 1;
        }
    }

    /// Only way out of the disabled state
    pub fn reenable(&mut self) {
        self.status.state = RecoveryState::Healthy;
        self.status.attempt_count = 0;
        self.status.consecutive_errors = 0;
        self.status.error_rate_percent = 0;
        self.status.last_attempt_time = None;
        self.window_start = None;
        self.window_events = 0;
        self.window_errors = 0;
    }

    pub fn recent_errors(&self) -> Vec<ErrorLogEntry> {
        self.log.iter().copied().collect()
    }

    pub fn snapshot(&self) -> RecoverySnapshot {
        RecoverySnapshot {
            status: self.status,
            errors: self.errors,
            counters: self.counters,
        }
    }
}

impl<H: NicHardware> NicContext<H> {
    /// Run at most one pending recovery attempt. Returns true when the rings were torn down,
    /// so whatever the caller was reaping is gone.
    pub(crate) fn service_recovery(&self, sink: &mut dyn PacketSink) -> bool {
        let now = self.hw.now_ms();
        let step = self.recovery.lock().next_step(now);
        let action = match step {
            RecoveryStep::Idle => return false,
            RecoveryStep::RateLimited => {
                trace!("Recovery attempt rate limited");
                return false;
            }
            RecoveryStep::Attempt(action) => action,
        };

        self.recovery.lock().begin_attempt(now, action);
        info!("Recovery attempt: {:?}", action);

        let result = self
            .perform_recovery(action, sink)
            .and_then(|_| self.wait_until_ready())
            .and_then(|_| self.hw.self_test());
        if let Err(e) = &result {
            warn!("Recovery action {:?} failed: {}", action, e);
        }

        let next = self.recovery.lock().finish_attempt(result.is_ok());
        match next {
            RecoveryState::Healthy => {
                info!("Adapter recovered after {:?}", action);
                self.refill_rx_ring();
            }
            RecoveryState::Disabled => self.disable(sink),
            state => debug!("Recovery escalated to {:?}", state),
        }
        true
    }

    fn perform_recovery(&self, action: RecoveryAction, sink: &mut dyn PacketSink) -> Result<()> {
        match action {
            RecoveryAction::Rearm => self.hw.rearm(),
            RecoveryAction::HardReset => {
                self.hw.reset()?;
                self.rebuild_rings(Some(sink))
            }
            RecoveryAction::Reinitialize => {
                self.hw.reset()?;
                self.rebuild_rings(Some(sink))?;
                self.reload_capabilities()
            }
            RecoveryAction::Failover => {
                if !self.config.standby_adapter {
                    bail!("No standby adapter configured");
                }
                self.hw.switch_to_standby()?;
                self.rebuild_rings(Some(sink))
            }
        }
    }

    /// Re-read capabilities after a reset. The memory layout is fixed at bring-up, so the
    /// adapter has to come back with the same ring geometry.
    fn reload_capabilities(&self) -> Result<()> {
        let capabilities = self.hw.capabilities();
        capabilities
            .validate()
            .map_err(|e| anyhow!("Adapter reports invalid capabilities: {}", e))?;

        let layout = MemoryLayout::compute(self.hw.dma_window(), capabilities.ring_depth)
            .map_err(|e| anyhow!("{}", e))?;
        if layout != self.layout {
            bail!("Ring geometry changed across reinitialization");
        }

        let previous = std::mem::replace(&mut *self.capabilities.lock(), capabilities);
        if previous.adapter_class() != capabilities.adapter_class() {
            let limit = self.config.work_limit(capabilities.adapter_class());
            warn!(
                "Adapter class changed to {:?}, work limit {}",
                capabilities.adapter_class(),
                limit
            );
            self.work_limit.store(limit, Ordering::Relaxed);
        }

        let counts = (self.config.small_buffers, self.config.large_buffers);
        if let Err(e) = self.pool.lock().resize(counts.0, counts.1) {
            debug!("Keeping current pool layout: {}", e);
        }
        Ok(())
    }

    fn wait_until_ready(&self) -> Result<()> {
        let start = self.hw.now_ms();
        let mut polls = 0;
        while !self.hw.is_ready() {
            polls += 1;
            if polls >= MAX_READY_POLLS
                || self.hw.now_ms().saturating_sub(start) >= self.config.ready_timeout_ms
            {
                bail!("Adapter not ready after {} polls", polls);
            }
            std::hint::spin_loop();
        }
        Ok(())
    }

    /// Clear the disabled state after the platform fixed the adapter. Only a full
    /// reinitialization followed by a passing self-test brings it back.
    pub fn reenable(&self) -> Result<()> {
        if !self.is_disabled() {
            return Ok(());
        }

        self.hw.reset()?;
        self.wait_until_ready()?;
        self.rebuild_rings(None)?;
        self.reload_capabilities()?;
        self.hw.self_test()?;

        self.recovery.lock().reenable();
        self.disabled.store(false, Ordering::Release);
        let posted = self.refill_rx_ring();
        info!("Adapter re-enabled, {} receive buffers posted", posted);
        Ok(())
    }

    /// Quiesce everything and fail fast from now on
    pub(crate) fn disable(&self, sink: &mut dyn PacketSink) {
        self.disabled.store(true, Ordering::Release);
        self.recovery.lock().force_disable();
        if let Err(e) = self.rebuild_rings(Some(sink)) {
            error!("Failed to quiesce rings: {}", e);
        }
        error!("Adapter disabled, recovery exhausted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(consecutive: u32, rate: u32, max_attempts: u32) -> RecoveryThresholds {
        RecoveryThresholds {
            consecutive_errors: consecutive,
            rate_percent: rate,
            rate_window_ms: 5000,
            rate_min_samples: 20,
            max_attempts,
            min_attempt_interval_ms: 1000,
        }
    }

    #[test]
    fn escalation_order() {
        let mut state = RecoveryState::Healthy;
        let mut seen = vec![state];
        while state != RecoveryState::Disabled {
            state = state.escalate();
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                RecoveryState::Healthy,
                RecoveryState::SoftReset,
                RecoveryState::HardReset,
                RecoveryState::Reinit,
                RecoveryState::Failover,
                RecoveryState::Disabled,
            ]
        );
        assert_eq!(RecoveryState::Disabled.action(), None);
    }

    #[test]
    fn attempt_budget_forces_disabled() {
        assert_eq!(
            RecoveryState::HardReset.after_attempt(false, 3, 3),
            RecoveryState::Disabled
        );
        assert_eq!(
            RecoveryState::HardReset.after_attempt(false, 2, 3),
            RecoveryState::Reinit
        );
        assert_eq!(
            RecoveryState::Failover.after_attempt(true, 3, 3),
            RecoveryState::Healthy
        );
    }

    #[test]
    fn consecutive_errors_trigger_soft_reset() {
        for threshold in [1, 3, 5, 8] {
            let mut controller = RecoveryController::new(thresholds(threshold, 100, 4));
            for i in 1..threshold {
                assert!(!controller.record_error(0, Direction::Receive, ErrorCategory::Crc, 0));
                assert_eq!(controller.state(), RecoveryState::Healthy, "after {} errors", i);
            }
            assert!(controller.record_error(0, Direction::Receive, ErrorCategory::Crc, 0));
            assert_eq!(controller.state(), RecoveryState::SoftReset);
        }
    }

    #[test]
    fn success_breaks_consecutive_run() {
        let mut controller = RecoveryController::new(thresholds(3, 100, 4));
        controller.record_error(0, Direction::Receive, ErrorCategory::Crc, 0);
        controller.record_error(0, Direction::Receive, ErrorCategory::Crc, 1);
        controller.record_success(0);
        assert!(!controller.record_error(0, Direction::Receive, ErrorCategory::Crc, 2));
        assert_eq!(controller.status().consecutive_errors, 1);
    }

    #[test]
    fn error_rate_needs_minimum_samples() {
        for (rate, expect_trigger_at) in [(10u32, 20u32), (20, 20), (25, 20)] {
            let mut controller = RecoveryController::new(thresholds(100, rate, 4));
            let mut triggered_at = None;
            // Every fourth event is an error, 25% once enough samples are in
            for event in 1..=40u32 {
                if event % 4 == 0 {
                    if controller.record_error(event as u64, Direction::Transmit, ErrorCategory::Collision, 0) {
                        triggered_at.get_or_insert(event);
                    }
                } else {
                    controller.record_success(event as u64);
                }
            }
            assert_eq!(triggered_at, Some(expect_trigger_at), "rate {}%", rate);
        }

        let mut controller = RecoveryController::new(thresholds(100, 30, 4));
        for event in 1..=40u32 {
            if event % 4 == 0 {
                assert!(!controller.record_error(event as u64, Direction::Receive, ErrorCategory::Crc, 0));
            } else {
                controller.record_success(event as u64);
            }
        }
    }

    #[test]
    fn attempts_are_rate_limited() {
        let mut controller = RecoveryController::new(thresholds(1, 100, 4));
        controller.record_error(100, Direction::Receive, ErrorCategory::Frame, 0);
        assert_eq!(
            controller.next_step(100),
            RecoveryStep::Attempt(RecoveryAction::Rearm)
        );
        controller.begin_attempt(100, RecoveryAction::Rearm);
        assert_eq!(controller.finish_attempt(false), RecoveryState::HardReset);

        assert_eq!(controller.next_step(600), RecoveryStep::RateLimited);
        assert_eq!(controller.next_step(1099), RecoveryStep::RateLimited);
        assert_eq!(
            controller.next_step(1100),
            RecoveryStep::Attempt(RecoveryAction::HardReset)
        );
        assert_eq!(controller.snapshot().counters.rate_limited, 2);
    }

    #[test]
    fn successful_attempt_resets_counters() {
        let mut controller = RecoveryController::new(thresholds(2, 100, 4));
        controller.record_error(0, Direction::Receive, ErrorCategory::Crc, 0);
        controller.record_error(0, Direction::Receive, ErrorCategory::Crc, 1);
        controller.begin_attempt(0, RecoveryAction::Rearm);
        assert_eq!(controller.finish_attempt(true), RecoveryState::Healthy);

        let status = controller.status();
        assert_eq!(status.attempt_count, 0);
        assert_eq!(status.consecutive_errors, 0);
        assert_eq!(controller.snapshot().errors.crc, 2);
    }

    #[test]
    fn classification_priority() {
        assert_eq!(ErrorCategory::classify(ErrorCode::CRC), ErrorCategory::Crc);
        assert_eq!(
            ErrorCategory::classify(ErrorCode::CRC | ErrorCode::FRAME),
            ErrorCategory::Crc
        );
        assert_eq!(
            ErrorCategory::classify(ErrorCode::COLLISION | ErrorCode::ADAPTER_FAILURE),
            ErrorCategory::AdapterFailure
        );
        assert_eq!(
            ErrorCategory::classify(ErrorCode::empty()),
            ErrorCategory::AdapterFailure
        );
    }

    #[test]
    fn error_log_keeps_latest_entries() {
        let mut controller = RecoveryController::new(thresholds(1000, 100, 4));
        for slot in 0..40u16 {
            controller.record_error(slot as u64, Direction::Receive, ErrorCategory::Crc, slot);
        }
        let log = controller.recent_errors();
        assert_eq!(log.len(), ERROR_LOG_CAPACITY);
        assert_eq!(log.first().map(|e| e.slot), Some(8));
        assert_eq!(log.last().map(|e| e.slot), Some(39));
    }
}
