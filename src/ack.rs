//! Per exchange acknowledgment tracker.
//!
//! Only one peer message id may wait for acknowledgment at a time. A second message
//! needing an ack forces the first one out as a standalone ack before it is recorded.

/// Ack waiting to be sent to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    pub message_id: u32,
    /// Ticks left until the ack must go out standalone.
    pub next_ack_time: u32,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    pending: Option<PendingAck>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self { pending: None }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<PendingAck> {
        self.pending
    }

    pub fn pending_ack_id(&self) -> Option<u32> {
        self.pending.map(|p| p.message_id)
    }

    /// Pending ack that has to be flushed before `message_id` can be tracked.
    pub fn conflicting(&self, message_id: u32) -> Option<u32> {
        self.pending
            .filter(|p| p.message_id != message_id)
            .map(|p| p.message_id)
    }

    pub fn set_pending(&mut self, message_id: u32, next_ack_time: u32) {
        self.pending = Some(PendingAck {
            message_id,
            next_ack_time,
        });
    }

    /// Remove pending ack, used when it is piggybacked or flushed.
    pub fn take(&mut self) -> Option<PendingAck> {
        self.pending.take()
    }

    /// Put back an ack taken for a send that failed, unless a newer one arrived meanwhile.
    pub fn restore(&mut self, ack: PendingAck) {
        if self.pending.is_none() {
            self.pending = Some(ack);
        }
    }

    pub fn expire_ticks(&mut self, ticks: u32) {
        if let Some(p) = self.pending.as_mut() {
            p.next_ack_time = p.next_ack_time.saturating_sub(ticks);
        }
    }

    pub fn is_due(&self) -> bool {
        self.pending.is_some_and(|p| p.next_ack_time == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_then_piggybacked() {
        let mut t = AckTracker::new();
        assert!(!t.is_pending());
        t.set_pending(10, 3);
        assert_eq!(t.pending_ack_id(), Some(10));
        let a = t.take().unwrap();
        assert_eq!(a.message_id, 10);
        assert!(!t.is_pending());
        t.restore(a);
        assert_eq!(t.pending_ack_id(), Some(10));
    }

    #[test]
    fn second_arrival_conflicts() {
        let mut t = AckTracker::new();
        assert_eq!(t.conflicting(5), None);
        t.set_pending(5, 3);
        assert_eq!(t.conflicting(5), None);
        assert_eq!(t.conflicting(6), Some(5));
    }

    #[test]
    fn becomes_due_after_ticks() {
        let mut t = AckTracker::new();
        t.set_pending(1, 3);
        t.expire_ticks(2);
        assert!(!t.is_due());
        t.expire_ticks(5);
        assert!(t.is_due());
        assert_eq!(t.pending().unwrap().next_ack_time, 0);
    }

    #[test]
    fn restore_keeps_newer_ack() {
        let mut t = AckTracker::new();
        t.set_pending(1, 3);
        let old = t.take().unwrap();
        t.set_pending(2, 3);
        t.restore(old);
        assert_eq!(t.pending_ack_id(), Some(2));
    }
}
