//! Trickle retransmission state.
//!
//! A retained message is resent once per interval at a random point `backoff` inside
//! `[1, interval)`, unless at least `rebroadcast_threshold` copies of it were heard from
//! other nodes during the current interval.

use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;

use crate::system::TimerHandle;

/// Message kept for Trickle retransmission.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub dest: SocketAddr,
    pub encoded: Vec<u8>,
    pub source_node_id: u64,
    pub message_id: u32,
}

#[derive(Debug, Default)]
pub struct TrickleState {
    pub retrans_interval: Duration,
    pub rebroadcast_threshold: u8,
    pub backoff: Duration,
    pub msgs_received: u8,
    pub msg: Option<RetainedMessage>,
    pub tau_timer: Option<TimerHandle>,
    pub t_timer: Option<TimerHandle>,
    pub cancel_timer: Option<TimerHandle>,
}

impl TrickleState {
    pub fn is_enabled(&self) -> bool {
        !self.retrans_interval.is_zero()
    }

    /// Pick backoff for a new interval and reset the duplicate counter.
    pub fn new_interval(&mut self) -> Duration {
        self.backoff = pick_backoff(self.retrans_interval);
        self.msgs_received = 0;
        self.backoff
    }

    pub fn should_resend(&self) -> bool {
        self.msgs_received < self.rebroadcast_threshold
    }

    /// Time from the resend point to the end of the interval, None when nothing is left.
    pub fn remaining_interval(&self) -> Option<Duration> {
        if !self.is_enabled() || self.retrans_interval <= self.backoff {
            return None;
        }
        Some(self.retrans_interval - self.backoff)
    }

    /// Count a copy of the retained message heard from the network.
    pub fn record_duplicate(&mut self, source_node_id: u64, message_id: u32) -> bool {
        match &self.msg {
            Some(m) if m.source_node_id == source_node_id && m.message_id == message_id => {
                self.msgs_received = self.msgs_received.saturating_add(1);
                true
            }
            _ => false,
        }
    }

    /// Forget everything, returning the timers that still have to be canceled.
    pub fn reset(&mut self) -> Vec<TimerHandle> {
        let timers = [self.tau_timer.take(), self.t_timer.take(), self.cancel_timer.take()]
            .into_iter()
            .flatten()
            .collect();
        self.msg = None;
        self.retrans_interval = Duration::ZERO;
        self.backoff = Duration::ZERO;
        self.msgs_received = 0;
        self.rebroadcast_threshold = 0;
        timers
    }
}

/// Random backoff in `[1ms, interval)`.
pub fn pick_backoff(interval: Duration) -> Duration {
    let ms = interval.as_millis() as u64;
    if ms <= 1 {
        return Duration::from_millis(1);
    }
    Duration::from_millis(rand::thread_rng().gen_range(1..ms))
}
