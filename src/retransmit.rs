use std::net::SocketAddr;

use crate::{
    error::{ExchangeError, Result},
    exchange::{ExchangeKey, MessageContext},
};

pub struct RetransEntry<C> {
    pub exchange: ExchangeKey,
    /// Owner reference keeping the exchange alive while the message is in flight.
    pub context: C,
    pub message_id: u32,
    pub dest: SocketAddr,
    pub encoded: Vec<u8>,
    pub msg_ctxt: Option<MessageContext>,
    pub next_retrans_time: u32,
    pub send_count: u8,
}

impl<C> std::fmt::Debug for RetransEntry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetransEntry")
            .field("exchange", &self.exchange)
            .field("message_id", &self.message_id)
            .field("dest", &self.dest)
            .field("encoded", &hex::encode(&self.encoded))
            .field("next_retrans_time", &self.next_retrans_time)
            .field("send_count", &self.send_count)
            .finish()
    }
}

/// Sent messages awaiting acknowledgment. Times are ticks relative to the manager tick base.
pub struct RetransTable<C> {
    entries: Vec<RetransEntry<C>>,
    capacity: usize,
}

impl<C> RetransTable<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn add(&mut self, entry: RetransEntry<C>) -> Result<()> {
        if self.get(entry.exchange, entry.message_id).is_some() {
            return Err(ExchangeError::IncorrectState);
        }
        if self.entries.len() >= self.capacity {
            log::error!("retransmit table full, dropping message {}", entry.message_id);
            return Err(ExchangeError::NoMemory);
        }
        log::trace!("tracking sent message counter:{}", entry.message_id);
        self.entries.push(entry);
        Ok(())
    }

    pub fn get(&self, exchange: ExchangeKey, message_id: u32) -> Option<&RetransEntry<C>> {
        self.entries
            .iter()
            .find(|e| e.exchange == exchange && e.message_id == message_id)
    }

    pub fn get_mut(
        &mut self,
        exchange: ExchangeKey,
        message_id: u32,
    ) -> Option<&mut RetransEntry<C>> {
        self.entries
            .iter_mut()
            .find(|e| e.exchange == exchange && e.message_id == message_id)
    }

    /// Remove entry matching a received ack.
    pub fn remove(&mut self, exchange: ExchangeKey, message_id: u32) -> Option<RetransEntry<C>> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.exchange == exchange && e.message_id == message_id)?;
        Some(self.entries.swap_remove(pos))
    }

    /// Remove every entry of an exchange.
    pub fn remove_exchange(&mut self, exchange: ExchangeKey) -> Vec<RetransEntry<C>> {
        let (removed, kept) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.exchange == exchange);
        self.entries = kept;
        removed
    }

    pub fn drain(&mut self) -> Vec<RetransEntry<C>> {
        std::mem::take(&mut self.entries)
    }

    pub fn count_for(&self, exchange: ExchangeKey) -> usize {
        self.entries.iter().filter(|e| e.exchange == exchange).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetransEntry<C>> {
        self.entries.iter()
    }

    pub fn expire_ticks(&mut self, ticks: u32) {
        for e in self.entries.iter_mut() {
            e.next_retrans_time = e.next_retrans_time.saturating_sub(ticks);
        }
    }

    /// Entries whose retransmit time has come.
    pub fn due(&self) -> Vec<(ExchangeKey, u32)> {
        self.entries
            .iter()
            .filter(|e| e.next_retrans_time == 0)
            .map(|e| (e.exchange, e.message_id))
            .collect()
    }

    pub fn min_next_retrans_time(&self) -> Option<u32> {
        self.entries.iter().map(|e| e.next_retrans_time).min()
    }

    /// Push back deadlines of entries selected by `pred`.
    pub fn adjust_where(&mut self, ticks: u32, pred: impl Fn(&RetransEntry<C>) -> bool) {
        for e in self.entries.iter_mut().filter(|e| pred(e)) {
            e.next_retrans_time = e.next_retrans_time.saturating_add(ticks);
        }
    }

    pub fn adjust_exchange(&mut self, exchange: ExchangeKey, ticks: u32) {
        self.adjust_where(ticks, |e| e.exchange == exchange);
    }

    /// Make all entries of exchange due immediately.
    pub fn reset_exchange(&mut self, exchange: ExchangeKey) {
        for e in self.entries.iter_mut().filter(|e| e.exchange == exchange) {
            e.next_retrans_time = 0;
        }
    }
}
