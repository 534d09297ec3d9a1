use std::sync::atomic::Ordering;

use log::{debug, trace, warn};

use crate::nic::config::DmaCapability;
use crate::nic::recovery::ErrorCategory;
use crate::nic::ring::{Completion, PostedBuffer};
use crate::nic::NicContext;
use crate::util::category_counters;
use crate::{Direction, NicHardware, PacketSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    RxComplete,
    TxComplete,
    RxError,
    TxError,
    TxRetry,
}

category_counters! {
    pub struct EventCounts for EventType {
        RxComplete => rx_complete,
        TxComplete => tx_complete,
        RxError => rx_error,
        TxError => tx_error,
        TxRetry => tx_retry,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterruptStats {
    pub total_interrupts: u64,
    pub polls: u64,
    pub events_processed: u64,
    pub events_by_type: EventCounts,
    // Drains that stopped at the work limit with work possibly left
    pub work_limit_hits: u64,
    // Drains cut short by the event cap or the time budget
    pub emergency_breaks: u64,
    pub spurious_interrupts: u64,
    pub single_event_interrupts: u64,
    pub batched_interrupts: u64,
    pub max_events_per_interrupt: u32,
    pub consecutive_full_batches: u32,
    // Drain requests that found another drain running
    pub reentrant_calls: u64,
    pub rx_refill_failures: u64,
    pub rx_delivered_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct Event {
    kind: EventType,
    // This event pushed the adapter into recovery
    escalate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainEnd {
    Idle,
    WorkLimit,
    Emergency,
    Recovery,
}

impl<H: NicHardware> NicContext<H> {
    /// Interrupt handler entry point: acknowledge, then drain one bounded batch
    pub fn on_interrupt(&self) -> u32 {
        self.hw.acknowledge_interrupt();
        self.interrupt_stats.lock().total_interrupts += 1;
        self.drain()
    }

    /// Same batch without an interrupt, for polled operation
    pub fn poll_and_drain(&self) -> u32 {
        self.interrupt_stats.lock().polls += 1;
        self.drain()
    }

    /// Process completed descriptors until the rings are idle, the work limit is reached or
    /// the emergency bounds trip. Returns the number of events handled.
    pub fn drain(&self) -> u32 {
        if self.draining.swap(true, Ordering::Acquire) {
            trace!("Drain already running, skipping");
            self.interrupt_stats.lock().reentrant_calls += 1;
            return 0;
        }

        let processed = self.drain_exclusive();
        self.draining.store(false, Ordering::Release);
        processed
    }

    fn drain_exclusive(&self) -> u32 {
        let mut sink = self.sink.lock();
        let sink: &mut dyn PacketSink = &mut **sink;
        let mut scratch = self.scratch.lock();

        if self.is_disabled() {
            return 0;
        }

        // A recovery that was rate limited last time may be due now
        if self.service_recovery(sink) && self.is_disabled() {
            return 0;
        }

        let limit = self.work_limit() as u32;
        let cap = self.config.emergency_event_cap as u32;
        let start = self.hw.now_ms();

        let mut processed = 0u32;
        let mut counts = EventCounts::default();
        let mut prefer_rx = true;
        let end = loop {
            if processed >= limit {
                break DrainEnd::WorkLimit;
            }
            if processed >= cap
                || self.hw.now_ms().saturating_sub(start) >= self.config.drain_time_budget_ms
            {
                break DrainEnd::Emergency;
            }

            let event = match self.next_event(sink, &mut scratch, prefer_rx) {
                Some(event) => event,
                None => break DrainEnd::Idle,
            };
            prefer_rx = !prefer_rx;
            processed += 1;
            counts.increment(event.kind);

            if event.escalate && self.service_recovery(sink) {
                break DrainEnd::Recovery;
            }
        };

        if !self.is_disabled() {
            self.refill_rx_ring();
        }

        let mut stats = self.interrupt_stats.lock();
        stats.events_processed += processed as u64;
        stats.events_by_type.merge(&counts);
        stats.max_events_per_interrupt = stats.max_events_per_interrupt.max(processed);
        match processed {
            0 => stats.spurious_interrupts += 1,
            1 => stats.single_event_interrupts += 1,
            _ => stats.batched_interrupts += 1,
        }
        match end {
            DrainEnd::WorkLimit => {
                stats.work_limit_hits += 1;
                stats.consecutive_full_batches += 1;
                trace!("Work limit {} reached", limit);
            }
            DrainEnd::Emergency => {
                stats.emergency_breaks += 1;
                stats.consecutive_full_batches += 1;
                warn!("Emergency break after {} events", processed);
            }
            DrainEnd::Idle | DrainEnd::Recovery => stats.consecutive_full_batches = 0,
        }
        processed
    }

    /// Next completion, alternating between receive and transmit so neither starves
    fn next_event(&self, sink: &mut dyn PacketSink, scratch: &mut [u8], prefer_rx: bool) -> Option<Event> {
        let order = if prefer_rx {
            [Direction::Receive, Direction::Transmit]
        } else {
            [Direction::Transmit, Direction::Receive]
        };

        for direction in order {
            let event = match direction {
                Direction::Receive => self.next_rx_event(sink, scratch),
                Direction::Transmit => self.next_tx_event(sink),
            };
            if event.is_some() {
                return event;
            }
        }
        None
    }

    fn next_rx_event(&self, sink: &mut dyn PacketSink, scratch: &mut [u8]) -> Option<Event> {
        if self.dma_capability() == DmaCapability::None {
            self.pio_receive(1);
        }
        let completion = self.rx_ring.lock().reap_completed(&self.hw).next()?;
        Some(self.complete_rx(completion, sink, scratch))
    }

    fn next_tx_event(&self, sink: &mut dyn PacketSink) -> Option<Event> {
        let completion = self.tx_ring.lock().reap_completed(&self.hw).next()?;
        Some(self.complete_tx(completion, sink))
    }

    fn complete_rx(&self, completion: Completion, sink: &mut dyn PacketSink, scratch: &mut [u8]) -> Event {
        let now = self.hw.now_ms();
        let capacity = completion.buffer.capacity().min(scratch.len() as u16);

        let error = if completion.is_error() {
            Some(ErrorCategory::classify(completion.error))
        } else if completion.length == 0 || completion.length > capacity {
            // Adapter claims more than fits into the buffer
            Some(ErrorCategory::Frame)
        } else {
            None
        };

        // Classified before the buffer is released
        if let Some(category) = error {
            let escalate = self.recovery.lock().record_error(
                now,
                Direction::Receive,
                category,
                completion.slot,
            );
            debug!("Receive error in slot {}: {:?}", completion.slot, category);
            self.release_buffer(completion.buffer, Some(&mut *sink));
            return Event {
                kind: EventType::RxError,
                escalate,
            };
        }

        self.recovery.lock().record_success(now);
        let payload = &mut scratch[..completion.length as usize];
        self.hw.dma_read(completion.buffer.address(), payload);
        self.interrupt_stats.lock().rx_delivered_bytes += payload.len() as u64;

        // Pool buffer is back before the upper layer runs, caller memory after
        match completion.buffer {
            pooled @ PostedBuffer::Pooled(_) => {
                self.release_buffer(pooled, Some(&mut *sink));
                sink.receive(payload);
            }
            borrowed @ PostedBuffer::Borrowed(_) => {
                sink.receive(payload);
                self.release_buffer(borrowed, Some(&mut *sink));
            }
        }
        self.refill_rx_ring();

        Event {
            kind: EventType::RxComplete,
            escalate: false,
        }
    }

    fn complete_tx(&self, completion: Completion, sink: &mut dyn PacketSink) -> Event {
        let now = self.hw.now_ms();
        if !completion.is_error() {
            self.recovery.lock().record_success(now);
            self.release_buffer(completion.buffer, Some(&mut *sink));
            return Event {
                kind: EventType::TxComplete,
                escalate: false,
            };
        }

        let category = ErrorCategory::classify(completion.error);
        let escalate = self.recovery.lock().record_error(
            now,
            Direction::Transmit,
            category,
            completion.slot,
        );
        debug!("Transmit error in slot {}: {:?}", completion.slot, category);

        if category.is_transient() && !completion.retried && !escalate {
            let reposted = self
                .tx_ring
                .lock()
                .post_retry(&self.hw, completion.buffer, completion.length);
            match reposted {
                Ok(slot) => {
                    trace!("Retrying transmit in slot {}", slot);
                    // A failed programmed I/O retry is completed with an error and reaped later
                    if let Err(e) = self.start_transmit(slot) {
                        debug!("Retry in slot {} failed: {}", slot, e);
                    }
                    return Event {
                        kind: EventType::TxRetry,
                        escalate,
                    };
                }
                Err(rejected) => self.release_buffer(rejected.buffer, Some(&mut *sink)),
            }
        } else {
            self.release_buffer(completion.buffer, Some(&mut *sink));
        }

        Event {
            kind: EventType::TxError,
            escalate,
        }
    }
}
