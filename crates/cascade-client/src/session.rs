//! Session lifecycle bookkeeping: current status, the session entity,
//! liveness timestamps, and the policy timers derived from them.
//!
//! Transitions are only ever applied by the engine task; this type keeps
//! the bookkeeping honest and computes which timer fires next.
use cascade_wire::{ClientStatus, TransportKind};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

use crate::config::{ConnectionOptions, MAX_RETRY_DELAY_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timer {
    /// Streaming probe stayed silent: fall back to polling.
    StreamSense,
    /// Streaming went quiet past the stalled budget.
    Stalled,
    /// Stall persisted: move to recovery.
    Reconnect,
    /// Backoff elapsed: start the next connection attempt.
    Retry,
    /// Recovery took too long: abandon the session.
    RecoveryLimit,
    /// Reverse heartbeat on an otherwise idle session.
    Heartbeat,
}

pub(crate) struct SessionMachine {
    pub(crate) status: ClientStatus,
    pub(crate) session_id: Option<String>,
    pub(crate) bound_kind: Option<TransportKind>,
    // Streaming state to restore when a stall resolves.
    pub(crate) pre_stall_kind: Option<TransportKind>,
    pub(crate) last_rx: Instant,
    pub(crate) last_tx: Instant,
    pub(crate) retry_attempt: u32,
    pub(crate) retry_at: Option<Instant>,
    pub(crate) recovery_started: Option<Instant>,
    // Data events consumed on the current session, reported on recovery
    // so the server can resume from the right point.
    pub(crate) data_counter: u64,
}

impl SessionMachine {
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        Self {
            status: ClientStatus::Disconnected,
            session_id: None,
            bound_kind: None,
            pre_stall_kind: None,
            last_rx: now,
            last_tx: now,
            retry_attempt: 0,
            retry_at: None,
            recovery_started: None,
            data_counter: 0,
        }
    }

    pub(crate) fn record_rx(&mut self) {
        self.last_rx = Instant::now();
    }

    pub(crate) fn record_tx(&mut self) {
        self.last_tx = Instant::now();
    }

    /// Reset the per-session counters when a session is established or
    /// abandoned.
    pub(crate) fn clear_session(&mut self) {
        self.session_id = None;
        self.bound_kind = None;
        self.pre_stall_kind = None;
        self.recovery_started = None;
        self.data_counter = 0;
    }

    /// Delay before the next connection attempt. The very first retry is
    /// randomized inside a small window to avoid reconnection storms;
    /// consecutive failures double the base delay up to a cap.
    pub(crate) fn retry_delay(&self, options: &ConnectionOptions) -> Duration {
        let millis = if self.retry_attempt == 0 {
            pseudo_random(options.first_retry_max_delay.max(1))
        } else {
            let factor = 1u64 << (self.retry_attempt - 1).min(16);
            options
                .retry_delay
                .saturating_mul(factor)
                .min(MAX_RETRY_DELAY_MS)
        };
        Duration::from_millis(millis)
    }

    pub(crate) fn schedule_retry(&mut self, options: &ConnectionOptions) {
        self.retry_at = Some(Instant::now() + self.retry_delay(options));
        self.retry_attempt = self.retry_attempt.saturating_add(1);
    }

    /// The earliest pending timer for the current state, if any.
    pub(crate) fn next_deadline(&self, options: &ConnectionOptions) -> Option<(Instant, Timer)> {
        let mut earliest: Option<(Instant, Timer)> = None;
        let mut consider = |deadline: Instant, timer: Timer| match earliest {
            Some((current, _)) if current <= deadline => {}
            _ => earliest = Some((deadline, timer)),
        };

        match self.status {
            ClientStatus::StreamSensing => {
                consider(
                    self.last_rx + Duration::from_millis(options.stream_sense_timeout),
                    Timer::StreamSense,
                );
            }
            ClientStatus::Connected(kind) if kind.is_streaming() => {
                consider(
                    self.last_rx + Duration::from_millis(options.stalled_timeout),
                    Timer::Stalled,
                );
            }
            ClientStatus::Stalled => {
                consider(
                    self.last_rx + Duration::from_millis(options.reconnect_timeout),
                    Timer::Reconnect,
                );
            }
            ClientStatus::WillRetry => {
                if let Some(retry_at) = self.retry_at {
                    consider(retry_at, Timer::Retry);
                }
            }
            ClientStatus::TryingRecovery => {
                if let Some(started) = self.recovery_started {
                    consider(
                        started + Duration::from_millis(options.session_recovery_timeout),
                        Timer::RecoveryLimit,
                    );
                }
                if let Some(retry_at) = self.retry_at {
                    consider(retry_at, Timer::Retry);
                }
            }
            _ => {}
        }

        if matches!(
            self.status,
            ClientStatus::Connected(_) | ClientStatus::StreamSensing
        ) && options.reverse_heartbeat_interval > 0
        {
            consider(
                self.last_tx + Duration::from_millis(options.reverse_heartbeat_interval),
                Timer::Heartbeat,
            );
        }

        earliest
    }
}

// Deterministic jitter without a randomness dependency: hash the clock.
fn pseudo_random(bound: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
        .hash(&mut hasher);
    hasher.finish() % bound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_is_inside_the_randomized_window() {
        let machine = SessionMachine::new();
        let options = ConnectionOptions::default();
        for _ in 0..16 {
            let delay = machine.retry_delay(&options);
            assert!(delay < Duration::from_millis(options.first_retry_max_delay));
        }
    }

    #[test]
    fn retry_delay_doubles_up_to_the_cap() {
        let mut machine = SessionMachine::new();
        let options = ConnectionOptions::default();
        machine.retry_attempt = 1;
        assert_eq!(machine.retry_delay(&options), Duration::from_millis(4_000));
        machine.retry_attempt = 2;
        assert_eq!(machine.retry_delay(&options), Duration::from_millis(8_000));
        machine.retry_attempt = 12;
        assert_eq!(
            machine.retry_delay(&options),
            Duration::from_millis(MAX_RETRY_DELAY_MS)
        );
    }

    #[test]
    fn deadlines_follow_the_status() {
        let mut machine = SessionMachine::new();
        let options = ConnectionOptions::default();

        assert!(machine.next_deadline(&options).is_none());

        machine.status = ClientStatus::StreamSensing;
        assert_eq!(
            machine.next_deadline(&options).map(|(_, timer)| timer),
            Some(Timer::StreamSense)
        );

        machine.status = ClientStatus::Connected(TransportKind::WsStreaming);
        assert_eq!(
            machine.next_deadline(&options).map(|(_, timer)| timer),
            Some(Timer::Stalled)
        );

        // Polling transports have no stall machinery.
        machine.status = ClientStatus::Connected(TransportKind::WsPolling);
        assert!(machine.next_deadline(&options).is_none());

        machine.status = ClientStatus::Stalled;
        assert_eq!(
            machine.next_deadline(&options).map(|(_, timer)| timer),
            Some(Timer::Reconnect)
        );

        machine.status = ClientStatus::TryingRecovery;
        machine.recovery_started = Some(Instant::now());
        assert_eq!(
            machine.next_deadline(&options).map(|(_, timer)| timer),
            Some(Timer::RecoveryLimit)
        );
    }

    #[test]
    fn heartbeat_timer_requires_opt_in() {
        let mut machine = SessionMachine::new();
        let mut options = ConnectionOptions::default();
        machine.status = ClientStatus::Connected(TransportKind::WsPolling);
        assert!(machine.next_deadline(&options).is_none());

        options.reverse_heartbeat_interval = 1_000;
        assert_eq!(
            machine.next_deadline(&options).map(|(_, timer)| timer),
            Some(Timer::Heartbeat)
        );
    }
}
