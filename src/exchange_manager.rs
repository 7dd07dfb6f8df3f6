//! Exchange manager - owns the context pool, the retransmit table and the tick engine,
//! and routes inbound messages to exchanges or unsolicited message handlers.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    rc::{Rc, Weak},
    time::Duration,
};

use crate::{
    config::ManagerConfig,
    error::{ExchangeError, Result},
    exchange::{
        ExchangeContext, ExchangeDelegate, ExchangeFlags, ExchangeHandle, ExchangeKey,
        ExchangeState, MessageContext,
    },
    messages::{ExchangeHeader, MessageFlags, MessageInfo, MessageVersion},
    retransmit::{RetransEntry, RetransTable},
    system::{SystemLayer, TimerEvent, TimerHandle},
    transport::{Connection, MessageLayer},
};

/// Bounded set of recently received message ids of one peer.
struct ReceivedCounters {
    set: HashSet<u32>,
    order: VecDeque<u32>,
    max_size: usize,
}

impl ReceivedCounters {
    fn new(max_size: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            max_size,
        }
    }

    /// Returns true if counter was new (not a duplicate)
    fn insert(&mut self, counter: u32) -> bool {
        if !self.set.insert(counter) {
            return false;
        }
        self.order.push_back(counter);
        while self.order.len() > self.max_size {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

struct PoolSlot {
    generation: u32,
    in_use: bool,
    context: Weak<ExchangeContext>,
}

/// Fixed size pool of exchange contexts.
struct ContextPool {
    slots: Vec<PoolSlot>,
    next_exchange_id: u16,
}

impl ContextPool {
    fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| PoolSlot {
                generation: 0,
                in_use: false,
                context: Weak::new(),
            })
            .collect();
        Self {
            slots,
            next_exchange_id: rand::random(),
        }
    }

    fn reserve(&mut self) -> Result<ExchangeKey> {
        let (slot, s) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| !s.in_use)
            .ok_or(ExchangeError::NoMemory)?;
        s.generation = s.generation.wrapping_add(1);
        s.in_use = true;
        s.context = Weak::new();
        Ok(ExchangeKey::new(slot, s.generation))
    }

    fn slot_mut(&mut self, key: ExchangeKey) -> Option<&mut PoolSlot> {
        self.slots
            .get_mut(key.slot())
            .filter(|s| s.in_use && s.generation == key.generation())
    }

    fn attach(&mut self, key: ExchangeKey, context: Weak<ExchangeContext>) {
        if let Some(s) = self.slot_mut(key) {
            s.context = context;
        }
    }

    fn free(&mut self, key: ExchangeKey) {
        if let Some(s) = self.slot_mut(key) {
            s.in_use = false;
            s.context = Weak::new();
        }
    }

    fn get(&self, key: ExchangeKey) -> Option<ExchangeHandle> {
        let s = self.slots.get(key.slot())?;
        if !s.in_use || s.generation != key.generation() {
            return None;
        }
        ExchangeHandle::upgrade(&s.context)
    }

    fn live(&self) -> Vec<ExchangeHandle> {
        self.slots
            .iter()
            .filter(|s| s.in_use)
            .filter_map(|s| ExchangeHandle::upgrade(&s.context))
            .collect()
    }

    fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    fn allocate_exchange_id(&mut self) -> u16 {
        let id = self.next_exchange_id;
        self.next_exchange_id = id.wrapping_add(1);
        id
    }
}

#[derive(Clone)]
struct UnsolicitedHandler {
    delegate: Rc<dyn ExchangeDelegate>,
    allow_duplicates: bool,
}

pub(crate) struct ManagerInner {
    pub(crate) config: ManagerConfig,
    pub(crate) system: Rc<dyn SystemLayer>,
    pub(crate) message_layer: Rc<dyn MessageLayer>,
    pub(crate) retrans: RefCell<RetransTable<ExchangeHandle>>,
    pool: RefCell<ContextPool>,
    rmp_timer: Cell<Option<TimerHandle>>,
    tick_base: Cell<std::time::Instant>,
    received: RefCell<HashMap<u64, ReceivedCounters>>,
    handlers: RefCell<HashMap<(u32, Option<u8>), UnsolicitedHandler>>,
}

impl ManagerInner {
    fn tick_ms(&self) -> u128 {
        self.config.timer_interval().as_millis()
    }

    pub(crate) fn live_contexts(&self) -> Vec<ExchangeHandle> {
        self.pool.borrow().live()
    }

    fn context(&self, key: ExchangeKey) -> Option<ExchangeHandle> {
        self.pool.borrow().get(key)
    }

    pub(crate) fn free_context(&self, key: ExchangeKey) {
        self.pool.borrow_mut().free(key);
    }

    fn alloc_context(
        self: &Rc<Self>,
        exchange_id: u16,
        peer_node_id: u64,
        peer_addr: Option<SocketAddr>,
        con: Option<Rc<dyn Connection>>,
        initiator: bool,
        msg_version: MessageVersion,
    ) -> Result<ExchangeHandle> {
        let key = self.pool.borrow_mut().reserve()?;
        let mut flags = ExchangeFlags::empty();
        flags.set(ExchangeFlags::INITIATOR, initiator);
        flags.set(
            ExchangeFlags::AUTO_REQUEST_ACK,
            self.config.auto_request_ack && con.is_none(),
        );
        let state = ExchangeState::new(
            flags,
            msg_version,
            self.config.rmp.clone(),
            self.config.response_timeout(),
            con,
            peer_addr,
        );
        let ec = ExchangeHandle::new(ExchangeContext::new(
            Rc::downgrade(self),
            key,
            exchange_id,
            peer_node_id,
            state,
        ));
        self.pool.borrow_mut().attach(key, ec.downgrade());
        log::trace!(
            "new exchange {} peer:{:x} initiator:{} slot:{:?}",
            exchange_id,
            peer_node_id,
            initiator,
            key
        );
        Ok(ec)
    }

    /// Advance the tick base to now, counting down every tick based deadline.
    pub(crate) fn expire_ticks(&self) {
        let now = self.system.now();
        let base = self.tick_base.get();
        let delta = (now.saturating_duration_since(base).as_millis() / self.tick_ms()) as u32;
        if delta == 0 {
            return;
        }
        for ec in self.live_contexts() {
            let mut st = ec.state.borrow_mut();
            st.ack.expire_ticks(delta);
            st.throttle_timeout = st.throttle_timeout.saturating_sub(delta);
        }
        self.retrans.borrow_mut().expire_ticks(delta);
        self.tick_base
            .set(base + self.config.timer_interval() * delta);
    }

    /// Ticks between the current tick base and `now + d`.
    pub(crate) fn ticks_from_now(&self, d: Duration) -> u32 {
        let since_base = self
            .system
            .now()
            .saturating_duration_since(self.tick_base.get());
        ((since_base + d).as_millis() / self.tick_ms()) as u32
    }

    /// Flush due acks and retransmit due messages.
    fn execute_actions(&self) {
        for ec in self.live_contexts() {
            let due = ec.state.borrow().ack.is_due();
            if due {
                if let Err(e) = ec.flush_acks_with(self) {
                    log::error!("exchange {} can't send ack: {}", ec.exchange_id(), e);
                }
            }
        }

        let due = self.retrans.borrow().due();
        for (key, message_id) in due {
            let found = self
                .retrans
                .borrow()
                .get(key, message_id)
                .map(|e| (e.context.clone(), e.send_count));
            let Some((ec, send_count)) = found else {
                continue;
            };
            let max_retrans = ec.state.borrow().rmp.max_retrans;
            if send_count > max_retrans {
                let entry = self.retrans.borrow_mut().remove(key, message_id);
                log::debug!(
                    "exchange {} giving up on counter {} after {} transmissions",
                    ec.exchange_id(),
                    message_id,
                    send_count
                );
                if let Some(entry) = entry {
                    ec.handle_send_error(&ExchangeError::MessageNotAcknowledged, entry.msg_ctxt.as_ref());
                }
                continue;
            }
            // delayed sends go out here for the first time
            if send_count > 0 {
                ec.handle_retransmission_timeout();
            }
            if let Err(e) = self.send_from_retrans_table(key, message_id) {
                log::debug!("exchange {} retransmit failed: {}", ec.exchange_id(), e);
                ec.handle_send_error(&e, None);
            }
        }
    }

    /// Arm the single physical timer for the earliest tick based deadline.
    pub(crate) fn start_timer(&self) {
        let mut next: Option<u32> = None;
        for ec in self.live_contexts() {
            let st = ec.state.borrow();
            if let Some(a) = st.ack.pending() {
                next = min_ticks(next, a.next_ack_time);
            }
            if st.throttle_timeout > 0 {
                next = min_ticks(next, st.throttle_timeout);
            }
        }
        if let Some(t) = self.retrans.borrow().min_next_retrans_time() {
            next = min_ticks(next, t);
        }
        if let Some(h) = self.rmp_timer.take() {
            self.system.cancel_timer(h);
        }
        if let Some(ticks) = next {
            let elapsed = self
                .system
                .now()
                .saturating_duration_since(self.tick_base.get());
            let delay = (self.config.timer_interval() * ticks).saturating_sub(elapsed);
            log::trace!("rmp timer armed in {:?} ({} ticks)", delay, ticks);
            self.rmp_timer
                .set(Some(self.system.start_timer(delay, TimerEvent::RmpTick)));
        }
    }

    pub(crate) fn add_to_retrans_table(
        &self,
        ec: ExchangeHandle,
        dest: SocketAddr,
        message_id: u32,
        encoded: Vec<u8>,
        msg_ctxt: Option<MessageContext>,
    ) -> Result<()> {
        let entry = RetransEntry {
            exchange: ec.key(),
            context: ec,
            message_id,
            dest,
            encoded,
            msg_ctxt,
            next_retrans_time: 0,
            send_count: 0,
        };
        self.retrans.borrow_mut().add(entry)
    }

    /// Transmit a retransmit table entry and schedule its next attempt.
    ///
    /// Non critical transport errors keep the entry for the next attempt, other errors
    /// drop it and are returned.
    pub(crate) fn send_from_retrans_table(&self, key: ExchangeKey, message_id: u32) -> Result<()> {
        let found = self
            .retrans
            .borrow()
            .get(key, message_id)
            .map(|e| (e.context.clone(), e.dest, e.encoded.clone()));
        let Some((ec, dest, encoded)) = found else {
            return Ok(());
        };
        let res = self.message_layer.resend_message(dest, &encoded);
        let next = self.ticks_from_now(ec.current_retransmit_timeout());
        if let Some(e) = self.retrans.borrow_mut().get_mut(key, message_id) {
            e.send_count = e.send_count.saturating_add(1);
            e.next_retrans_time = next;
        }
        match res {
            Ok(()) => {
                log::trace!("sent exchange:{} counter:{}", ec.exchange_id(), message_id);
                Ok(())
            }
            Err(e) if e.is_non_critical_send() => {
                log::debug!(
                    "exchange {} counter {} not sent, will retry: {}",
                    ec.exchange_id(),
                    message_id,
                    e
                );
                Ok(())
            }
            Err(e) => {
                let removed = self.retrans.borrow_mut().remove(key, message_id);
                drop(removed);
                Err(e)
            }
        }
    }

    /// Push back retransmissions to a node whose delivery is delayed.
    pub(crate) fn process_delayed_delivery(&self, pause_time_ms: u32, delayed_node_id: u64) {
        let ticks = pause_time_ms / self.tick_ms() as u32;
        self.retrans
            .borrow_mut()
            .adjust_where(ticks, |e| e.context.peer_node_id() == delayed_node_id);
    }

    /// Remember message id of a connectionless message, false for a repeat.
    fn mark_received(&self, source_node_id: u64, message_id: u32) -> bool {
        self.received
            .borrow_mut()
            .entry(source_node_id)
            .or_insert_with(|| ReceivedCounters::new(self.config.max_cached_counters))
            .insert(message_id)
    }

    fn find_handler(&self, profile_id: u32, message_type: u8) -> Option<UnsolicitedHandler> {
        let handlers = self.handlers.borrow();
        handlers
            .get(&(profile_id, Some(message_type)))
            .or_else(|| handlers.get(&(profile_id, None)))
            .cloned()
    }

    fn dispatch(
        self: &Rc<Self>,
        con: Option<&Rc<dyn Connection>>,
        mut info: MessageInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        let (header, payload) = ExchangeHeader::decode(&data)?;
        log::trace!(
            "received message counter:{} from:{:x} exchange:{} profile:{} type:{} flags:{:?}",
            info.message_id,
            info.source_node_id,
            header.exchange_id,
            header.profile_id,
            header.message_type,
            header.flags
        );
        if con.is_none() && !self.mark_received(info.source_node_id, info.message_id) {
            info.flags |= MessageFlags::DUPLICATE_MESSAGE;
        }
        for ec in self.live_contexts() {
            ec.record_trickle_copy(info.source_node_id, info.message_id);
        }

        let found = self
            .live_contexts()
            .into_iter()
            .find(|ec| ec.matches(&info, &header, con));
        if let Some(ec) = found {
            return ec.handle_message(&mut info, &header, payload, None);
        }

        let duplicate = info.flags.contains(MessageFlags::DUPLICATE_MESSAGE);
        if header.is_initiator() {
            let handler = self
                .find_handler(header.profile_id, header.message_type)
                .filter(|h| !duplicate || h.allow_duplicates);
            if let Some(h) = handler {
                let ec = self.alloc_context(
                    header.exchange_id,
                    info.source_node_id,
                    info.peer_addr,
                    con.cloned(),
                    false,
                    info.version,
                )?;
                ec.set_allow_duplicate_msgs(h.allow_duplicates);
                log::debug!(
                    "unsolicited message profile:{} type:{} opens exchange {}",
                    header.profile_id,
                    header.message_type,
                    header.exchange_id
                );
                return ec.handle_message(&mut info, &header, payload, Some(h.delegate));
            }
        }

        if header.needs_ack() {
            // nobody takes the message but the peer still needs its ack
            let ec = self.alloc_context(
                header.exchange_id,
                info.source_node_id,
                info.peer_addr,
                con.cloned(),
                !header.is_initiator(),
                info.version,
            )?;
            return ec.send_standalone_ack(self, info.message_id);
        }
        log::debug!(
            "dropping message exchange:{} profile:{} type:{}, no exchange or handler",
            header.exchange_id,
            header.profile_id,
            header.message_type
        );
        Ok(())
    }

    fn handle_timer(&self, event: TimerEvent) {
        match event {
            TimerEvent::RmpTick => {
                self.rmp_timer.set(None);
                self.expire_ticks();
                self.execute_actions();
                self.start_timer();
            }
            TimerEvent::ResponseTimeout(key) => {
                let ec = self.context(key);
                if let Some(ec) = ec {
                    ec.handle_response_timeout();
                }
            }
            TimerEvent::TrickleTau(key) => {
                let ec = self.context(key);
                if let Some(ec) = ec {
                    ec.handle_trickle_tau(self);
                }
            }
            TimerEvent::TrickleT(key) => {
                let ec = self.context(key);
                if let Some(ec) = ec {
                    ec.handle_trickle_t(self);
                }
            }
            TimerEvent::TrickleCancel(key) => {
                let ec = self.context(key);
                if let Some(ec) = ec {
                    ec.handle_trickle_cancel(self);
                }
            }
        }
    }
}

fn min_ticks(current: Option<u32>, t: u32) -> Option<u32> {
    Some(current.map_or(t, |c| c.min(t)))
}

/// Entry point of the exchange layer. Cheap to clone.
#[derive(Clone)]
pub struct ExchangeManager {
    inner: Rc<ManagerInner>,
}

impl ExchangeManager {
    pub fn new(
        config: ManagerConfig,
        system: Rc<dyn SystemLayer>,
        message_layer: Rc<dyn MessageLayer>,
    ) -> Self {
        let inner = ManagerInner {
            pool: RefCell::new(ContextPool::new(config.max_contexts)),
            retrans: RefCell::new(RetransTable::new(config.retrans_table_size)),
            rmp_timer: Cell::new(None),
            tick_base: Cell::new(system.now()),
            received: RefCell::new(HashMap::new()),
            handlers: RefCell::new(HashMap::new()),
            config,
            system,
            message_layer,
        };
        Self {
            inner: Rc::new(inner),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn local_node_id(&self) -> u64 {
        self.inner.config.local_node_id
    }

    /// New initiator exchange with a connectionless peer.
    pub fn new_context(
        &self,
        peer_node_id: u64,
        peer_addr: Option<SocketAddr>,
        delegate: Option<Rc<dyn ExchangeDelegate>>,
    ) -> Result<ExchangeHandle> {
        let exchange_id = self.inner.pool.borrow_mut().allocate_exchange_id();
        let ec = self.inner.alloc_context(
            exchange_id,
            peer_node_id,
            peer_addr,
            None,
            true,
            MessageVersion::Unspecified,
        )?;
        if let Some(d) = delegate {
            ec.set_delegate(d);
        }
        Ok(ec)
    }

    /// New initiator exchange bound to a connection.
    pub fn new_context_on_connection(
        &self,
        con: Rc<dyn Connection>,
        delegate: Option<Rc<dyn ExchangeDelegate>>,
    ) -> Result<ExchangeHandle> {
        let exchange_id = self.inner.pool.borrow_mut().allocate_exchange_id();
        let peer_node_id = con.peer_node_id();
        let ec = self.inner.alloc_context(
            exchange_id,
            peer_node_id,
            None,
            Some(con),
            true,
            MessageVersion::Unspecified,
        )?;
        if let Some(d) = delegate {
            ec.set_delegate(d);
        }
        Ok(ec)
    }

    /// Route initiator messages of `profile_id` without a matching exchange to `delegate`.
    /// `message_type` None catches every type of the profile.
    pub fn register_unsolicited_message_handler(
        &self,
        profile_id: u32,
        message_type: Option<u8>,
        delegate: Rc<dyn ExchangeDelegate>,
        allow_duplicates: bool,
    ) {
        let old = self.inner.handlers.borrow_mut().insert(
            (profile_id, message_type),
            UnsolicitedHandler {
                delegate,
                allow_duplicates,
            },
        );
        drop(old);
    }

    pub fn unregister_unsolicited_message_handler(
        &self,
        profile_id: u32,
        message_type: Option<u8>,
    ) -> bool {
        let old = self
            .inner
            .handlers
            .borrow_mut()
            .remove(&(profile_id, message_type));
        old.is_some()
    }

    /// Inbound connectionless message, `data` starting with the exchange header.
    pub fn dispatch_message(&self, info: MessageInfo, data: Vec<u8>) -> Result<()> {
        self.inner.dispatch(None, info, data)
    }

    /// Inbound message received on `con`.
    pub fn dispatch_connection_message(
        &self,
        con: &Rc<dyn Connection>,
        info: MessageInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        self.inner.dispatch(Some(con), info, data)
    }

    /// Tell every exchange bound to `con` that the connection is gone.
    pub fn handle_connection_closed(&self, con: &Rc<dyn Connection>, err: Option<ExchangeError>) {
        for ec in self.inner.live_contexts() {
            if ec.is_bound_to(con) {
                ec.handle_connection_closed(err.as_ref());
            }
        }
    }

    /// Dispatch expired timers. Called by whoever owns the event loop.
    pub fn service_timers(&self) {
        for event in self.inner.system.take_expired() {
            self.inner.handle_timer(event);
        }
    }

    pub fn next_deadline(&self) -> Option<std::time::Instant> {
        self.inner.system.next_deadline()
    }

    /// Number of allocated exchange contexts.
    pub fn context_count(&self) -> usize {
        self.inner.pool.borrow().in_use()
    }

    pub fn retrans_table_len(&self) -> usize {
        self.inner.retrans.borrow().len()
    }

    /// Messages of an exchange waiting for acknowledgment.
    pub fn retrans_pending(&self, key: ExchangeKey) -> usize {
        self.inner.retrans.borrow().count_for(key)
    }

    /// Remaining ticks of every pending message of an exchange, in send order.
    pub fn retrans_deadlines(&self, key: ExchangeKey) -> Vec<u32> {
        let mut entries: Vec<(u32, u32)> = self
            .inner
            .retrans
            .borrow()
            .iter()
            .filter(|e| e.exchange == key)
            .map(|e| (e.message_id, e.next_retrans_time))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, t)| t).collect()
    }

    /// Drop every pending retransmission and stop the tick engine.
    pub fn shutdown(&self) {
        let entries = self.inner.retrans.borrow_mut().drain();
        log::debug!("shutdown dropping {} unacknowledged messages", entries.len());
        drop(entries);
        if let Some(h) = self.inner.rmp_timer.take() {
            self.inner.system.cancel_timer(h);
        }
    }
}
