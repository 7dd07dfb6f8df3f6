//! Exchange context - one request/response conversation with a peer.
//!
//! [ExchangeHandle] is a reference counted handle to the context. Cloning it takes a
//! reference, dropping it releases one. When the last reference goes away the context
//! flushes a pending ack, cancels its timers, optionally releases key and connection and
//! returns its slot to the manager pool. The retransmit table holds a reference for every
//! message waiting for acknowledgment, so a closed exchange stays alive until its messages
//! are acknowledged or it is aborted.

use bitflags::bitflags;
use std::{
    any::Any,
    cell::RefCell,
    net::SocketAddr,
    ops::Deref,
    rc::{Rc, Weak},
    time::Duration,
};

use crate::{
    ack::AckTracker,
    config::RmpConfig,
    error::{ExchangeError, Result},
    exchange_manager::ManagerInner,
    messages::{
        self, DelayedDelivery, ExchangeHeader, ExchangeHeaderFlags, MessageFlags, MessageInfo,
        MessageVersion, ThrottleFlow, ANY_NODE_ID, MSG_TYPE_NULL, MSG_TYPE_RMP_DELAYED_DELIVERY,
        MSG_TYPE_RMP_THROTTLE_FLOW, PROFILE_COMMON,
    },
    system::{TimerEvent, TimerHandle},
    transport::Connection,
    trickle::{RetainedMessage, TrickleState},
};

/// Opaque application context attached to a sent message and returned with its ack.
pub type MessageContext = Rc<dyn Any>;

/// Identity of a context pool slot. The generation makes keys of freed contexts stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeKey {
    slot: usize,
    generation: u32,
}

impl ExchangeKey {
    pub(crate) fn new(slot: usize, generation: u32) -> Self {
        Self { slot, generation }
    }
    pub(crate) fn slot(&self) -> usize {
        self.slot
    }
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

bitflags! {
    #[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
    pub struct ExchangeFlags: u16 {
        const INITIATOR               = 0x0001;
        const CONNECTION_CLOSED       = 0x0002;
        const AUTO_REQUEST_ACK        = 0x0004;
        /// Debug only: never acknowledge messages received on this exchange.
        const DROP_ACK                = 0x0008;
        const RESPONSE_EXPECTED       = 0x0010;
        const PEER_REQUESTED_ACK      = 0x0020;
        const MSG_RCVD_FROM_PEER      = 0x0040;
        const AUTO_RELEASE_KEY        = 0x0080;
        const AUTO_RELEASE_CONNECTION = 0x0100;
        const USE_EPHEMERAL_PORT      = 0x0200;
    }
}

bitflags! {
    #[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
    pub struct SendFlags: u16 {
        const EXPECT_RESPONSE     = 0x0001;
        const REQUEST_ACK         = 0x0002;
        const NO_AUTO_REQUEST_ACK = 0x0004;
        const RETAIN_BUFFER       = 0x0008;
        /// Keep the message and resend it with Trickle.
        const AUTO_RETRANS        = 0x0010;
        const FROM_INITIATOR      = 0x0020;
        const REUSE_MESSAGE_ID    = 0x0040;
        /// Queue a message requesting an ack in the retransmit table without sending it.
        /// The first transmission happens on the next RMP tick.
        const DELAY_SEND          = 0x0080;
    }
}

/// Application side of an exchange. Every method has a default which only logs,
/// so implementations pick the events they care about.
pub trait ExchangeDelegate {
    fn on_message_received(
        &self,
        ec: &ExchangeHandle,
        _info: &MessageInfo,
        header: &ExchangeHeader,
        _payload: Vec<u8>,
    ) {
        log::debug!(
            "exchange {} message profile:{} type:{} has no handler",
            ec.exchange_id(),
            header.profile_id,
            header.message_type
        );
    }
    fn on_response_timeout(&self, ec: &ExchangeHandle) {
        log::debug!("exchange {} response timeout has no handler", ec.exchange_id());
    }
    fn on_retransmission_timeout(&self, ec: &ExchangeHandle) {
        log::trace!("exchange {} retransmission timeout has no handler", ec.exchange_id());
    }
    fn on_connection_closed(&self, ec: &ExchangeHandle, _err: Option<&ExchangeError>) {
        log::debug!("exchange {} connection closed has no handler", ec.exchange_id());
    }
    fn on_throttle_received(&self, ec: &ExchangeHandle, pause_time_ms: u32) {
        log::debug!("exchange {} throttled for {}ms", ec.exchange_id(), pause_time_ms);
    }
    fn on_delayed_delivery_received(
        &self,
        ec: &ExchangeHandle,
        pause_time_ms: u32,
        delayed_node_id: u64,
    ) {
        log::debug!(
            "exchange {} delivery to {:x} delayed {}ms",
            ec.exchange_id(),
            delayed_node_id,
            pause_time_ms
        );
    }
    fn on_send_error(
        &self,
        ec: &ExchangeHandle,
        err: &ExchangeError,
        _msg_ctxt: Option<&MessageContext>,
    ) {
        log::debug!("exchange {} send error {} has no handler", ec.exchange_id(), err);
    }
    fn on_ack_received(&self, ec: &ExchangeHandle, _msg_ctxt: Option<&MessageContext>) {
        log::trace!("exchange {} ack has no handler", ec.exchange_id());
    }
}

pub(crate) struct ExchangeState {
    pub flags: ExchangeFlags,
    pub msg_version: MessageVersion,
    pub ack: AckTracker,
    /// Ticks until the peer allows sending again.
    pub throttle_timeout: u32,
    pub rmp: RmpConfig,
    pub response_timeout: Duration,
    pub response_timer: Option<TimerHandle>,
    pub trickle: TrickleState,
    pub allow_duplicate_msgs: bool,
    pub key_id: u16,
    pub encryption_type: u8,
    pub con: Option<Rc<dyn Connection>>,
    pub peer_addr: Option<SocketAddr>,
}

impl ExchangeState {
    pub(crate) fn new(
        flags: ExchangeFlags,
        msg_version: MessageVersion,
        rmp: RmpConfig,
        response_timeout: Duration,
        con: Option<Rc<dyn Connection>>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            flags,
            msg_version,
            ack: AckTracker::new(),
            throttle_timeout: 0,
            rmp,
            response_timeout,
            response_timer: None,
            trickle: TrickleState::default(),
            allow_duplicate_msgs: false,
            key_id: 0,
            encryption_type: 0,
            con,
            peer_addr,
        }
    }
}

pub struct ExchangeContext {
    mgr: Weak<ManagerInner>,
    key: ExchangeKey,
    exchange_id: u16,
    peer_node_id: u64,
    pub(crate) state: RefCell<ExchangeState>,
    delegate: RefCell<Option<Rc<dyn ExchangeDelegate>>>,
}

impl std::fmt::Debug for ExchangeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeContext")
            .field("key", &self.key)
            .field("exchange_id", &self.exchange_id)
            .field("peer_node_id", &self.peer_node_id)
            .field("flags", &self.state.try_borrow().map(|st| st.flags).ok())
            .finish()
    }
}

impl ExchangeContext {
    pub(crate) fn new(
        mgr: Weak<ManagerInner>,
        key: ExchangeKey,
        exchange_id: u16,
        peer_node_id: u64,
        state: ExchangeState,
    ) -> Self {
        Self {
            mgr,
            key,
            exchange_id,
            peer_node_id,
            state: RefCell::new(state),
            delegate: RefCell::new(None),
        }
    }

    fn manager(&self) -> Result<Rc<ManagerInner>> {
        self.mgr.upgrade().ok_or(ExchangeError::IncorrectState)
    }

    pub fn key(&self) -> ExchangeKey {
        self.key
    }

    pub fn exchange_id(&self) -> u16 {
        self.exchange_id
    }

    pub fn peer_node_id(&self) -> u64 {
        self.peer_node_id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.state.borrow().peer_addr
    }

    pub fn flags(&self) -> ExchangeFlags {
        self.state.borrow().flags
    }

    fn set_flag(&self, flag: ExchangeFlags, on: bool) {
        self.state.borrow_mut().flags.set(flag, on);
    }

    pub fn is_initiator(&self) -> bool {
        self.flags().contains(ExchangeFlags::INITIATOR)
    }

    pub fn is_response_expected(&self) -> bool {
        self.flags().contains(ExchangeFlags::RESPONSE_EXPECTED)
    }

    pub fn is_connection_closed(&self) -> bool {
        self.flags().contains(ExchangeFlags::CONNECTION_CLOSED)
    }

    pub fn has_rcvd_msg_from_peer(&self) -> bool {
        self.flags().contains(ExchangeFlags::MSG_RCVD_FROM_PEER)
    }

    pub fn has_peer_requested_ack(&self) -> bool {
        self.flags().contains(ExchangeFlags::PEER_REQUESTED_ACK)
    }

    pub fn is_ack_pending(&self) -> bool {
        self.state.borrow().ack.is_pending()
    }

    pub fn pending_ack_id(&self) -> Option<u32> {
        self.state.borrow().ack.pending_ack_id()
    }

    pub fn is_throttled(&self) -> bool {
        self.state.borrow().throttle_timeout != 0
    }

    pub fn message_version(&self) -> MessageVersion {
        self.state.borrow().msg_version
    }

    pub fn connection(&self) -> Option<Rc<dyn Connection>> {
        self.state.borrow().con.clone()
    }

    pub fn set_auto_request_ack(&self, on: bool) {
        self.set_flag(ExchangeFlags::AUTO_REQUEST_ACK, on);
    }

    pub fn set_drop_ack(&self, on: bool) {
        self.set_flag(ExchangeFlags::DROP_ACK, on);
    }

    pub fn set_auto_release_key(&self, on: bool) {
        self.set_flag(ExchangeFlags::AUTO_RELEASE_KEY, on);
    }

    pub fn set_auto_release_connection(&self, on: bool) {
        self.set_flag(ExchangeFlags::AUTO_RELEASE_CONNECTION, on);
    }

    pub fn set_use_ephemeral_port(&self, on: bool) {
        self.set_flag(ExchangeFlags::USE_EPHEMERAL_PORT, on);
    }

    pub fn set_allow_duplicate_msgs(&self, on: bool) {
        self.state.borrow_mut().allow_duplicate_msgs = on;
    }

    pub fn set_key(&self, key_id: u16, encryption_type: u8) {
        let mut st = self.state.borrow_mut();
        st.key_id = key_id;
        st.encryption_type = encryption_type;
    }

    /// Zero disables the response timer.
    pub fn set_response_timeout(&self, timeout: Duration) {
        self.state.borrow_mut().response_timeout = timeout;
    }

    pub fn has_response_timer(&self) -> bool {
        self.state.borrow().response_timer.is_some()
    }

    pub fn rmp_config(&self) -> RmpConfig {
        self.state.borrow().rmp.clone()
    }

    pub fn set_rmp_config(&self, rmp: RmpConfig) {
        self.state.borrow_mut().rmp = rmp;
    }

    /// Peers which already sent something are assumed awake and get the shorter timeout.
    pub fn current_retransmit_timeout(&self) -> Duration {
        let st = self.state.borrow();
        if st.flags.contains(ExchangeFlags::MSG_RCVD_FROM_PEER) {
            st.rmp.active_retrans_timeout()
        } else {
            st.rmp.initial_retrans_timeout()
        }
    }

    pub fn set_delegate(&self, delegate: Rc<dyn ExchangeDelegate>) {
        let old = self.delegate.borrow_mut().replace(delegate);
        drop(old);
    }

    pub fn clear_delegate(&self) {
        let old = self.delegate.borrow_mut().take();
        drop(old);
    }

    fn delegate(&self) -> Option<Rc<dyn ExchangeDelegate>> {
        self.delegate.borrow().clone()
    }

    pub(crate) fn is_bound_to(&self, con: &Rc<dyn Connection>) -> bool {
        same_connection(self.state.borrow().con.as_ref(), Some(con))
    }

    /// Does an inbound message belong to this exchange.
    pub(crate) fn matches(
        &self,
        info: &MessageInfo,
        header: &ExchangeHeader,
        con: Option<&Rc<dyn Connection>>,
    ) -> bool {
        self.exchange_id == header.exchange_id
            && (self.peer_node_id == info.source_node_id || self.peer_node_id == ANY_NODE_ID)
            && same_connection(self.state.borrow().con.as_ref(), con)
            && self.is_initiator() != header.is_initiator()
    }

    /// Count a copy of the retained Trickle message heard from the network.
    pub(crate) fn record_trickle_copy(&self, source_node_id: u64, message_id: u32) {
        let mut st = self.state.borrow_mut();
        if st.trickle.record_duplicate(source_node_id, message_id) {
            log::trace!(
                "exchange {} trickle heard copy {} of counter {}",
                self.exchange_id,
                st.trickle.msgs_received,
                message_id
            );
        }
    }

    /// Send a Common Null message carrying `ack_id`, leaving the tracked pending ack alone.
    pub(crate) fn send_standalone_ack(&self, mgr: &ManagerInner, ack_id: u32) -> Result<()> {
        let (con, peer_addr, mut info) = {
            let st = self.state.borrow();
            let info = MessageInfo {
                source_node_id: mgr.config.local_node_id,
                dest_node_id: self.peer_node_id,
                version: st.msg_version,
                key_id: st.key_id,
                encryption_type: st.encryption_type,
                ..Default::default()
            };
            (st.con.clone(), st.peer_addr, info)
        };
        let buf = messages::standalone_ack(self.exchange_id, self.is_initiator(), ack_id).encode()?;
        let res = match con {
            Some(con) => con.send_message(&mut info, &buf),
            None => mgr
                .message_layer
                .select_dest_node_id_and_address(&mut info.dest_node_id, peer_addr)
                .and_then(|dest| mgr.message_layer.send_message(dest, &mut info, &buf)),
        };
        match res {
            Ok(()) => {
                log::trace!(
                    "sending ack for exchange:{} counter:{}",
                    self.exchange_id,
                    ack_id
                );
                Ok(())
            }
            Err(e) if e.is_non_critical_send() => {
                log::debug!(
                    "exchange {} ack for counter {} not sent: {}",
                    self.exchange_id,
                    ack_id,
                    e
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Send pending ack standalone. The ack is forgotten even if sending fails.
    pub(crate) fn flush_acks_with(&self, mgr: &ManagerInner) -> Result<()> {
        let pending = self.state.borrow_mut().ack.take();
        match pending {
            Some(a) => self.send_standalone_ack(mgr, a.message_id),
            None => Ok(()),
        }
    }

    fn start_response_timer(&self, mgr: &ManagerInner, timeout: Duration) {
        let old = self.state.borrow_mut().response_timer.take();
        if let Some(h) = old {
            mgr.system.cancel_timer(h);
        }
        let h = mgr
            .system
            .start_timer(timeout, TimerEvent::ResponseTimeout(self.key));
        self.state.borrow_mut().response_timer = Some(h);
    }

    fn cancel_response_timer(&self, mgr: &ManagerInner) {
        let old = self.state.borrow_mut().response_timer.take();
        if let Some(h) = old {
            mgr.system.cancel_timer(h);
        }
    }

    fn teardown_trickle(&self, mgr: &ManagerInner) {
        let timers = self.state.borrow_mut().trickle.reset();
        for h in timers {
            mgr.system.cancel_timer(h);
        }
    }

    /// Start a new Trickle interval.
    fn start_trickle_interval(&self, mgr: &ManagerInner) {
        let (backoff, old) = {
            let mut st = self.state.borrow_mut();
            if !st.trickle.is_enabled() {
                return;
            }
            (st.trickle.new_interval(), st.trickle.tau_timer.take())
        };
        if let Some(h) = old {
            mgr.system.cancel_timer(h);
        }
        log::trace!("exchange {} trickle new interval backoff:{:?}", self.exchange_id, backoff);
        let h = mgr.system.start_timer(backoff, TimerEvent::TrickleTau(self.key));
        self.state.borrow_mut().trickle.tau_timer = Some(h);
    }

    fn handle_throttle_flow(&self, mgr: &ManagerInner, pause_time_ms: u32) {
        let tick_ms = mgr.config.timer_interval_ms.max(1);
        if pause_time_ms != 0 {
            let ticks = mgr
                .ticks_from_now(Duration::from_millis(pause_time_ms as u64))
                .max(1);
            self.state.borrow_mut().throttle_timeout = ticks;
            mgr.retrans
                .borrow_mut()
                .adjust_exchange(self.key, pause_time_ms / tick_ms);
        } else {
            self.state.borrow_mut().throttle_timeout = 0;
            mgr.retrans.borrow_mut().reset_exchange(self.key);
        }
        log::debug!(
            "exchange {} throttle flow pause:{}ms",
            self.exchange_id,
            pause_time_ms
        );
    }

    fn handle_needs_ack(&self, mgr: &ManagerInner, info: &MessageInfo) {
        if info.flags.contains(MessageFlags::DUPLICATE_MESSAGE) {
            // ack the duplicate right away; the pending ack stays tracked
            if let Err(e) = self.send_standalone_ack(mgr, info.message_id) {
                log::error!(
                    "exchange {} can't ack duplicate counter {}: {}",
                    self.exchange_id,
                    info.message_id,
                    e
                );
            }
            return;
        }
        let conflicting = {
            let mut st = self.state.borrow_mut();
            let c = st.ack.conflicting(info.message_id);
            if c.is_some() {
                st.ack.take();
            }
            c
        };
        if let Some(prev) = conflicting {
            if let Err(e) = self.send_standalone_ack(mgr, prev) {
                log::error!(
                    "exchange {} can't flush ack for counter {}: {}",
                    self.exchange_id,
                    prev,
                    e
                );
            }
        }
        let timeout = self.state.borrow().rmp.ack_piggyback_timeout();
        let next_ack_time = mgr.ticks_from_now(timeout);
        self.state
            .borrow_mut()
            .ack
            .set_pending(info.message_id, next_ack_time);
    }
}

impl Drop for ExchangeContext {
    fn drop(&mut self) {
        let Some(mgr) = self.mgr.upgrade() else {
            return;
        };
        log::trace!("exchange {} released", self.exchange_id);
        self.delegate.get_mut().take();
        let pending = self.state.get_mut().ack.take();
        if let Some(a) = pending {
            if let Err(e) = self.send_standalone_ack(&mgr, a.message_id) {
                log::debug!(
                    "exchange {} final ack for counter {} failed: {}",
                    self.exchange_id,
                    a.message_id,
                    e
                );
            }
        }
        let st = self.state.get_mut();
        let mut timers = st.trickle.reset();
        timers.extend(st.response_timer.take());
        for h in timers {
            mgr.system.cancel_timer(h);
        }
        if st.flags.contains(ExchangeFlags::AUTO_RELEASE_KEY) {
            mgr.message_layer
                .release_session_key(self.peer_node_id, st.key_id);
        }
        let auto_release_con = st.flags.contains(ExchangeFlags::AUTO_RELEASE_CONNECTION);
        if let Some(con) = st.con.take() {
            if auto_release_con {
                con.release();
            }
        }
        mgr.free_context(self.key);
        mgr.start_timer();
    }
}

fn same_connection(a: Option<&Rc<dyn Connection>>, b: Option<&Rc<dyn Connection>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b)),
        _ => false,
    }
}

/// Reference counted handle to an [ExchangeContext].
#[derive(Clone)]
pub struct ExchangeHandle(Rc<ExchangeContext>);

impl Deref for ExchangeHandle {
    type Target = ExchangeContext;
    fn deref(&self) -> &ExchangeContext {
        &self.0
    }
}

impl std::fmt::Debug for ExchangeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl ExchangeHandle {
    pub(crate) fn new(ec: ExchangeContext) -> Self {
        Self(Rc::new(ec))
    }

    pub(crate) fn downgrade(&self) -> Weak<ExchangeContext> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn upgrade(weak: &Weak<ExchangeContext>) -> Option<Self> {
        weak.upgrade().map(Self)
    }

    /// Number of live references, including those held by the retransmit table.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Send a message on this exchange.
    ///
    /// `msg_info` lets the caller choose message version and flags and read back the
    /// assigned message id. `msg_ctxt` is returned with the ack or a send error.
    pub fn send_message(
        &self,
        profile_id: u32,
        message_type: u8,
        payload: &[u8],
        flags: SendFlags,
        msg_info: Option<&mut MessageInfo>,
        msg_ctxt: Option<MessageContext>,
    ) -> Result<()> {
        // delegates invoked below may drop the caller's reference
        let _hold = self.clone();
        let mgr = self.manager()?;
        let mut local_info = MessageInfo::default();
        let info = msg_info.unwrap_or(&mut local_info);
        mgr.expire_ticks();
        let res = self.send_message_inner(&mgr, profile_id, message_type, payload, flags, info, msg_ctxt);
        mgr.start_timer();
        res
    }

    #[allow(clippy::too_many_arguments)]
    fn send_message_inner(
        &self,
        mgr: &Rc<ManagerInner>,
        profile_id: u32,
        message_type: u8,
        payload: &[u8],
        mut flags: SendFlags,
        info: &mut MessageInfo,
        msg_ctxt: Option<MessageContext>,
    ) -> Result<()> {
        let mut st = self.state.borrow_mut();

        if st.msg_version == MessageVersion::Unspecified {
            st.msg_version = if info.version == MessageVersion::Unspecified {
                mgr.config.message_version
            } else {
                info.version
            };
        } else if info.version != MessageVersion::Unspecified && info.version != st.msg_version {
            return Err(ExchangeError::WrongMessageVersionForExchange);
        }
        info.version = st.msg_version;

        if st.flags.contains(ExchangeFlags::CONNECTION_CLOSED) {
            return Err(ExchangeError::NotConnected);
        }
        if st.flags.contains(ExchangeFlags::AUTO_REQUEST_ACK)
            && st.con.is_none()
            && !flags.contains(SendFlags::NO_AUTO_REQUEST_ACK)
        {
            flags |= SendFlags::REQUEST_ACK;
        }
        if flags.contains(SendFlags::REQUEST_ACK) {
            // reliable messaging runs over connectionless transports only
            if st.con.is_some() {
                return Err(ExchangeError::InvalidArgument);
            }
            if st.msg_version != MessageVersion::V2 {
                return Err(ExchangeError::WrongMessageVersionForExchange);
            }
        }
        if st.throttle_timeout != 0 {
            return Err(ExchangeError::SendThrottled);
        }
        if flags.contains(SendFlags::EXPECT_RESPONSE)
            && st.flags.contains(ExchangeFlags::RESPONSE_EXPECTED)
        {
            return Err(ExchangeError::IncorrectState);
        }

        let mut header = ExchangeHeader::new(self.exchange_id, profile_id, message_type);
        if st.flags.contains(ExchangeFlags::INITIATOR) || flags.contains(SendFlags::FROM_INITIATOR) {
            header.flags |= ExchangeHeaderFlags::INITIATOR;
        }
        let piggybacked = if st.msg_version == MessageVersion::V2 {
            st.ack.take()
        } else {
            None
        };
        if let Some(a) = piggybacked {
            log::trace!(
                "exchange {} piggyback ack for counter {}",
                self.exchange_id,
                a.message_id
            );
            header.ack_id = Some(a.message_id);
        }
        if flags.contains(SendFlags::REQUEST_ACK) {
            header.flags |= ExchangeHeaderFlags::NEEDS_ACK;
        }

        let armed = flags.contains(SendFlags::EXPECT_RESPONSE);
        if armed {
            st.flags |= ExchangeFlags::RESPONSE_EXPECTED;
        }
        let response_timeout = st.response_timeout;
        let con = st.con.clone();
        let peer_addr = st.peer_addr;
        info.key_id = st.key_id;
        info.encryption_type = st.encryption_type;
        info.flags.set(
            MessageFlags::REUSE_MESSAGE_ID,
            flags.contains(SendFlags::REUSE_MESSAGE_ID),
        );
        info.flags.set(
            MessageFlags::RETAIN_BUFFER,
            flags.contains(SendFlags::RETAIN_BUFFER),
        );
        info.flags.set(
            MessageFlags::VIA_EPHEMERAL_PORT,
            st.flags.contains(ExchangeFlags::USE_EPHEMERAL_PORT),
        );
        drop(st);

        if armed && !response_timeout.is_zero() {
            self.start_response_timer(mgr, response_timeout);
        }

        let res = header.encode().and_then(|mut buf| {
            buf.extend_from_slice(payload);
            self.transmit(mgr, con, peer_addr, buf, flags, info, msg_ctxt)
        });

        if let Err(e) = &res {
            log::debug!(
                "exchange {} send profile:{} type:{} failed: {}",
                self.exchange_id,
                profile_id,
                message_type,
                e
            );
            if armed {
                self.cancel_response_timer(mgr);
                self.set_flag(ExchangeFlags::RESPONSE_EXPECTED, false);
            }
            if let Some(a) = piggybacked {
                self.state.borrow_mut().ack.restore(a);
            }
        }
        res
    }

    #[allow(clippy::too_many_arguments)]
    fn transmit(
        &self,
        mgr: &Rc<ManagerInner>,
        con: Option<Rc<dyn Connection>>,
        peer_addr: Option<SocketAddr>,
        buf: Vec<u8>,
        flags: SendFlags,
        info: &mut MessageInfo,
        msg_ctxt: Option<MessageContext>,
    ) -> Result<()> {
        info.source_node_id = mgr.config.local_node_id;
        if let Some(con) = con {
            info.dest_node_id = con.peer_node_id();
            return con.send_message(info, &buf);
        }
        info.dest_node_id = self.peer_node_id;
        let dest = mgr
            .message_layer
            .select_dest_node_id_and_address(&mut info.dest_node_id, peer_addr)?;
        if flags.contains(SendFlags::REQUEST_ACK) {
            let encoded = mgr.message_layer.encode_message(dest, info, &buf)?;
            let message_id = info.message_id;
            mgr.add_to_retrans_table(self.clone(), dest, message_id, encoded, msg_ctxt)?;
            if flags.contains(SendFlags::DELAY_SEND) {
                log::trace!("exchange {} counter {} send delayed", self.exchange_id, message_id);
                return Ok(());
            }
            mgr.send_from_retrans_table(self.key, message_id)
        } else if flags.contains(SendFlags::AUTO_RETRANS) {
            let encoded = mgr.message_layer.encode_message(dest, info, &buf)?;
            mgr.message_layer.resend_message(dest, &encoded)?;
            let old = self.state.borrow_mut().trickle.msg.replace(RetainedMessage {
                dest,
                encoded,
                source_node_id: info.source_node_id,
                message_id: info.message_id,
            });
            drop(old);
            self.start_trickle_interval(mgr);
            Ok(())
        } else {
            mgr.message_layer.send_message(dest, info, &buf)
        }
    }

    /// Process a message addressed to this exchange.
    ///
    /// Acks and RMP control messages are consumed here; everything else goes to
    /// `handler` if given, otherwise to the exchange delegate.
    pub fn handle_message(
        &self,
        info: &mut MessageInfo,
        header: &ExchangeHeader,
        payload: Vec<u8>,
        handler: Option<Rc<dyn ExchangeDelegate>>,
    ) -> Result<()> {
        let _hold = self.clone();
        let mgr = self.manager()?;
        mgr.expire_ticks();
        let res = self.handle_message_inner(&mgr, info, header, payload, handler);
        mgr.start_timer();
        res
    }

    fn handle_message_inner(
        &self,
        mgr: &Rc<ManagerInner>,
        info: &mut MessageInfo,
        header: &ExchangeHeader,
        payload: Vec<u8>,
        handler: Option<Rc<dyn ExchangeDelegate>>,
    ) -> Result<()> {
        let allow_duplicates = {
            let mut st = self.state.borrow_mut();
            st.flags |= ExchangeFlags::MSG_RCVD_FROM_PEER;
            if st.msg_version == MessageVersion::Unspecified {
                st.msg_version = info.version;
            }
            if st.peer_addr.is_none() {
                st.peer_addr = info.peer_addr;
            }
            st.allow_duplicate_msgs
        };

        let mut ack_result = Ok(());
        if let Some(ack_id) = header.ack_id {
            ack_result = self.handle_rcvd_ack(mgr, ack_id);
        }

        if header.needs_ack() {
            info.flags |= MessageFlags::PEER_REQUESTED_ACK;
            let drop_ack = {
                let mut st = self.state.borrow_mut();
                st.flags |= ExchangeFlags::PEER_REQUESTED_ACK;
                st.flags.contains(ExchangeFlags::DROP_ACK)
            };
            if !drop_ack {
                self.handle_needs_ack(mgr, info);
            }
        }

        let finish = |ack_result: Result<()>| match ack_result {
            Err(e) if mgr.config.surface_invalid_ack_id => Err(e),
            _ => Ok(()),
        };

        if info.flags.contains(MessageFlags::DUPLICATE_MESSAGE) && !allow_duplicates {
            log::debug!(
                "dropping duplicate message exchange:{} counter:{}",
                self.exchange_id,
                info.message_id
            );
            return finish(ack_result);
        }

        if messages::is_control_message(header.profile_id, header.message_type) {
            match header.message_type {
                MSG_TYPE_NULL => {
                    log::trace!(
                        "standalone ack exchange:{} ack_counter:{:?}",
                        self.exchange_id,
                        header.ack_id
                    );
                    return finish(ack_result);
                }
                MSG_TYPE_RMP_THROTTLE_FLOW => {
                    let t = ThrottleFlow::parse(&payload)?;
                    self.handle_throttle_flow(mgr, t.pause_time_ms);
                    if let Some(d) = self.delegate() {
                        d.on_throttle_received(self, t.pause_time_ms);
                    }
                    return finish(ack_result);
                }
                MSG_TYPE_RMP_DELAYED_DELIVERY => {
                    let dd = DelayedDelivery::parse(&payload)?;
                    mgr.process_delayed_delivery(dd.pause_time_ms, dd.delayed_node_id);
                    if let Some(d) = self.delegate() {
                        d.on_delayed_delivery_received(self, dd.pause_time_ms, dd.delayed_node_id);
                    }
                    return finish(ack_result);
                }
                _ => {}
            }
        }

        // any message from the peer is the response we were waiting for
        self.cancel_response_timer(mgr);
        self.set_flag(ExchangeFlags::RESPONSE_EXPECTED, false);

        match handler.or_else(|| self.delegate()) {
            Some(d) => d.on_message_received(self, info, header, payload),
            None => log::debug!(
                "no message handler on exchange {} for profile:{} type:{}",
                self.exchange_id,
                header.profile_id,
                header.message_type
            ),
        }
        finish(ack_result)
    }

    fn handle_rcvd_ack(&self, mgr: &ManagerInner, ack_id: u32) -> Result<()> {
        let entry = mgr.retrans.borrow_mut().remove(self.key, ack_id);
        match entry {
            Some(entry) => {
                log::trace!("received ack exchange:{} counter:{}", self.exchange_id, ack_id);
                if let Some(d) = self.delegate() {
                    d.on_ack_received(self, entry.msg_ctxt.as_ref());
                }
                Ok(())
            }
            None => {
                log::debug!("exchange {} received invalid ack id {}", self.exchange_id, ack_id);
                Err(ExchangeError::InvalidAckId(ack_id))
            }
        }
    }

    /// Send pending ack now instead of waiting for a piggyback opportunity.
    pub fn flush_acks(&self) -> Result<()> {
        let _hold = self.clone();
        let mgr = self.manager()?;
        let res = self.flush_acks_with(&mgr);
        mgr.start_timer();
        res
    }

    /// Ask the peer to pause retransmissions for `pause_time_ms`, zero resumes.
    pub fn send_throttle_flow(&self, pause_time_ms: u32) -> Result<()> {
        let payload = ThrottleFlow { pause_time_ms }.encode()?;
        self.send_message(
            PROFILE_COMMON,
            MSG_TYPE_RMP_THROTTLE_FLOW,
            &payload,
            SendFlags::NO_AUTO_REQUEST_ACK,
            None,
            None,
        )
    }

    /// Tell the peer delivery to `delayed_node_id` is delayed by `pause_time_ms`.
    pub fn send_delayed_delivery(&self, pause_time_ms: u32, delayed_node_id: u64) -> Result<()> {
        let payload = DelayedDelivery {
            pause_time_ms,
            delayed_node_id,
        }
        .encode()?;
        self.send_message(
            PROFILE_COMMON,
            MSG_TYPE_RMP_DELAYED_DELIVERY,
            &payload,
            SendFlags::NO_AUTO_REQUEST_ACK,
            None,
            None,
        )
    }

    /// Configure Trickle for messages sent with [SendFlags::AUTO_RETRANS].
    ///
    /// A non zero `timeout` stops Trickle after that time and reports
    /// `on_retransmission_timeout`.
    pub fn setup_trickle_retransmit(
        &self,
        retrans_interval: Duration,
        rebroadcast_threshold: u8,
        timeout: Duration,
    ) -> Result<()> {
        let mgr = self.manager()?;
        let old = {
            let mut st = self.state.borrow_mut();
            st.trickle.retrans_interval = retrans_interval;
            st.trickle.rebroadcast_threshold = rebroadcast_threshold;
            st.trickle.msgs_received = 0;
            st.trickle.cancel_timer.take()
        };
        if let Some(h) = old {
            mgr.system.cancel_timer(h);
        }
        if !timeout.is_zero() {
            let h = mgr
                .system
                .start_timer(timeout, TimerEvent::TrickleCancel(self.key));
            self.state.borrow_mut().trickle.cancel_timer = Some(h);
        }
        Ok(())
    }

    /// Graceful close: application callbacks are dropped, timers are canceled, a pending
    /// ack is sent and the caller's reference is released. Messages still waiting for an
    /// ack keep the exchange alive.
    pub fn close(self) {
        log::trace!("exchange {} close", self.exchange_id);
        self.clear_delegate();
        self.set_flag(ExchangeFlags::RESPONSE_EXPECTED, false);
        let Ok(mgr) = self.manager() else {
            return;
        };
        self.cancel_response_timer(&mgr);
        self.teardown_trickle(&mgr);
        if let Err(e) = self.flush_acks_with(&mgr) {
            log::debug!("exchange {} ack on close failed: {}", self.exchange_id, e);
        }
        mgr.start_timer();
    }

    /// Immediate close: like [ExchangeHandle::close] but also drops every retransmit
    /// table entry of this exchange.
    pub fn abort(self) {
        log::trace!("exchange {} abort", self.exchange_id);
        let key = self.key;
        let mgr = self.manager().ok();
        self.close();
        if let Some(mgr) = mgr {
            let removed = mgr.retrans.borrow_mut().remove_exchange(key);
            drop(removed);
            mgr.start_timer();
        }
    }

    pub(crate) fn handle_response_timeout(&self) {
        {
            let mut st = self.state.borrow_mut();
            st.response_timer = None;
            st.flags.remove(ExchangeFlags::RESPONSE_EXPECTED);
        }
        log::debug!("exchange {} response timeout", self.exchange_id);
        if let Some(d) = self.delegate() {
            d.on_response_timeout(self);
        }
    }

    pub(crate) fn handle_retransmission_timeout(&self) {
        if let Some(d) = self.delegate() {
            d.on_retransmission_timeout(self);
        }
    }

    pub(crate) fn handle_send_error(&self, err: &ExchangeError, msg_ctxt: Option<&MessageContext>) {
        match self.delegate() {
            Some(d) => d.on_send_error(self, err, msg_ctxt),
            None => log::debug!("exchange {} send error {} has no handler", self.exchange_id, err),
        }
    }

    pub(crate) fn handle_connection_closed(&self, err: Option<&ExchangeError>) {
        let (con, release) = {
            let mut st = self.state.borrow_mut();
            st.flags |= ExchangeFlags::CONNECTION_CLOSED;
            let release = st.flags.contains(ExchangeFlags::AUTO_RELEASE_CONNECTION);
            st.flags.remove(ExchangeFlags::AUTO_RELEASE_CONNECTION);
            (st.con.take(), release)
        };
        if release {
            if let Some(con) = &con {
                con.release();
            }
        }
        log::debug!("exchange {} connection closed", self.exchange_id);
        if let Some(d) = self.delegate() {
            d.on_connection_closed(self, err);
        }
    }

    pub(crate) fn handle_trickle_tau(&self, mgr: &ManagerInner) {
        let (resend, heard, remaining) = {
            let mut st = self.state.borrow_mut();
            st.trickle.tau_timer = None;
            let resend = if st.trickle.should_resend() {
                st.trickle.msg.clone()
            } else {
                None
            };
            (resend, st.trickle.msgs_received, st.trickle.remaining_interval())
        };
        match resend {
            Some(m) => {
                log::trace!(
                    "exchange {} trickle re-send with duplicate message counter:{}",
                    self.exchange_id,
                    heard
                );
                if let Err(e) = mgr.message_layer.resend_message(m.dest, &m.encoded) {
                    log::error!("exchange {} trickle re-send failed: {}", self.exchange_id, e);
                }
            }
            None => log::trace!("exchange {} trickle skipping this interval", self.exchange_id),
        }
        if let Some(remaining) = remaining {
            let h = mgr.system.start_timer(remaining, TimerEvent::TrickleT(self.key));
            self.state.borrow_mut().trickle.t_timer = Some(h);
        }
    }

    pub(crate) fn handle_trickle_t(&self, mgr: &ManagerInner) {
        self.state.borrow_mut().trickle.t_timer = None;
        self.start_trickle_interval(mgr);
    }

    pub(crate) fn handle_trickle_cancel(&self, mgr: &ManagerInner) {
        self.state.borrow_mut().trickle.cancel_timer = None;
        self.teardown_trickle(mgr);
        log::debug!("exchange {} trickle retransmission timeout", self.exchange_id);
        self.handle_retransmission_timeout();
    }
}
