use std::{
    cell::{Cell, RefCell},
    net::SocketAddr,
    rc::Rc,
    time::Duration,
};

use crate::{
    config::{ManagerConfig, RmpConfig},
    error::{ExchangeError, Result},
    exchange::{ExchangeDelegate, ExchangeHandle, MessageContext},
    exchange_manager::ExchangeManager,
    messages::{ExchangeHeader, MessageFlags, MessageHeader, MessageInfo, MessageVersion},
    system::TimerQueue,
    transport::{Connection, MessageLayer},
};

pub const LOCAL_NODE: u64 = 0x1111;
pub const PEER_NODE: u64 = 0x2222;
pub const PROFILE_ECHO: u32 = 0x0000_0001;
pub const PEER_ADDR: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
    5540,
);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fast timings: 10ms ticks, 100ms initial and 50ms active retransmit timeout,
/// 20ms ack piggyback window and two retries.
pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        local_node_id: LOCAL_NODE,
        timer_interval_ms: 10,
        rmp: RmpConfig {
            initial_retrans_timeout_ms: 100,
            active_retrans_timeout_ms: 50,
            ack_piggyback_timeout_ms: 20,
            max_retrans: 2,
        },
        ..Default::default()
    }
}

/// Inbound message from `source` as the message layer would hand it over.
pub fn inbound(
    message_id: u32,
    source: u64,
    header: &ExchangeHeader,
    payload: &[u8],
) -> (MessageInfo, Vec<u8>) {
    let info = MessageInfo {
        message_id,
        source_node_id: source,
        dest_node_id: LOCAL_NODE,
        version: MessageVersion::V2,
        peer_addr: Some(PEER_ADDR),
        ..Default::default()
    };
    let mut data = header.encode().unwrap();
    data.extend_from_slice(payload);
    (info, data)
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub dest: Option<SocketAddr>,
    pub info: MessageInfo,
    pub header: ExchangeHeader,
    pub payload: Vec<u8>,
    pub resend: bool,
}

/// Message layer keeping every outgoing message. Encoded messages carry a real
/// message header so resends can be decoded again.
#[derive(Default)]
pub struct RecordingMessageLayer {
    next_message_id: Cell<u32>,
    sent: RefCell<Vec<Sent>>,
    fail: Cell<Option<fn() -> ExchangeError>>,
    released_keys: RefCell<Vec<(u64, u16)>>,
}

impl RecordingMessageLayer {
    pub fn set_next_message_id(&self, id: u32) {
        self.next_message_id.set(id);
    }

    /// Make every following send fail with the produced error.
    pub fn fail_with(&self, f: fn() -> ExchangeError) {
        self.fail.set(Some(f));
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.borrow().clone()
    }

    pub fn last_sent(&self) -> Sent {
        self.sent.borrow().last().cloned().unwrap()
    }

    pub fn released_keys(&self) -> Vec<(u64, u16)> {
        self.released_keys.borrow().clone()
    }

    fn check_fail(&self) -> Result<()> {
        match self.fail.get() {
            Some(f) => Err(f()),
            None => Ok(()),
        }
    }
}

impl MessageLayer for RecordingMessageLayer {
    fn send_message(&self, dest: SocketAddr, info: &mut MessageInfo, payload: &[u8]) -> Result<()> {
        self.check_fail()?;
        let encoded = self.encode_message(dest, info, payload)?;
        let (_, rest) = MessageHeader::decode(&encoded)?;
        let (header, payload) = ExchangeHeader::decode(&rest)?;
        self.sent.borrow_mut().push(Sent {
            dest: Some(dest),
            info: info.clone(),
            header,
            payload,
            resend: false,
        });
        Ok(())
    }

    fn encode_message(
        &self,
        _dest: SocketAddr,
        info: &mut MessageInfo,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        if !info.flags.contains(MessageFlags::REUSE_MESSAGE_ID) {
            info.message_id = self.next_message_id.get();
            self.next_message_id.set(info.message_id.wrapping_add(1));
        }
        if info.version == MessageVersion::Unspecified {
            info.version = MessageVersion::V2;
        }
        let header = MessageHeader {
            version: info.version,
            encryption_type: info.encryption_type,
            key_id: info.key_id,
            message_id: info.message_id,
            source_node_id: Some(info.source_node_id),
            dest_node_id: Some(info.dest_node_id),
        };
        let mut out = header.encode()?;
        out.extend_from_slice(payload);
        Ok(out)
    }

    fn resend_message(&self, dest: SocketAddr, encoded: &[u8]) -> Result<()> {
        self.check_fail()?;
        let (mh, rest) = MessageHeader::decode(encoded)?;
        let (header, payload) = ExchangeHeader::decode(&rest)?;
        self.sent.borrow_mut().push(Sent {
            dest: Some(dest),
            info: mh.to_message_info(None),
            header,
            payload,
            resend: true,
        });
        Ok(())
    }

    fn select_dest_node_id_and_address(
        &self,
        _dest_node_id: &mut u64,
        addr: Option<SocketAddr>,
    ) -> Result<SocketAddr> {
        Ok(addr.unwrap_or(PEER_ADDR))
    }

    fn release_session_key(&self, peer_node_id: u64, key_id: u16) {
        self.released_keys.borrow_mut().push((peer_node_id, key_id));
    }
}

pub struct RecordingConnection {
    peer: u64,
    sent: RefCell<Vec<(MessageInfo, Vec<u8>)>>,
    released: Cell<u32>,
}

impl RecordingConnection {
    pub fn new(peer: u64) -> Self {
        Self {
            peer,
            sent: RefCell::new(Vec::new()),
            released: Cell::new(0),
        }
    }

    pub fn sent(&self) -> Vec<(MessageInfo, Vec<u8>)> {
        self.sent.borrow().clone()
    }

    pub fn released(&self) -> u32 {
        self.released.get()
    }
}

impl Connection for RecordingConnection {
    fn peer_node_id(&self) -> u64 {
        self.peer
    }

    fn send_message(&self, info: &mut MessageInfo, payload: &[u8]) -> Result<()> {
        self.sent.borrow_mut().push((info.clone(), payload.to_vec()));
        Ok(())
    }

    fn release(&self) {
        self.released.set(self.released.get() + 1);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message {
        exchange_id: u16,
        profile_id: u32,
        message_type: u8,
        payload: Vec<u8>,
    },
    ResponseTimeout,
    RetransmissionTimeout,
    ConnectionClosed,
    Throttle(u32),
    DelayedDelivery(u32, u64),
    SendError(String),
    /// Ack with the u32 message context, if one was attached.
    Ack(Option<u32>),
}

#[derive(Default)]
pub struct RecordingDelegate {
    events: RefCell<Vec<Event>>,
    keep: bool,
    kept: RefCell<Vec<ExchangeHandle>>,
}

impl RecordingDelegate {
    /// Delegate holding on to every exchange it receives a message on.
    pub fn keeping() -> Self {
        Self {
            keep: true,
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn kept(&self) -> Vec<ExchangeHandle> {
        self.kept.borrow().clone()
    }

    fn push(&self, e: Event) {
        self.events.borrow_mut().push(e);
    }
}

impl ExchangeDelegate for RecordingDelegate {
    fn on_message_received(
        &self,
        ec: &ExchangeHandle,
        _info: &MessageInfo,
        header: &ExchangeHeader,
        payload: Vec<u8>,
    ) {
        self.push(Event::Message {
            exchange_id: header.exchange_id,
            profile_id: header.profile_id,
            message_type: header.message_type,
            payload,
        });
        if self.keep {
            self.kept.borrow_mut().push(ec.clone());
        }
    }
    fn on_response_timeout(&self, _ec: &ExchangeHandle) {
        self.push(Event::ResponseTimeout);
    }
    fn on_retransmission_timeout(&self, _ec: &ExchangeHandle) {
        self.push(Event::RetransmissionTimeout);
    }
    fn on_connection_closed(&self, _ec: &ExchangeHandle, _err: Option<&ExchangeError>) {
        self.push(Event::ConnectionClosed);
    }
    fn on_throttle_received(&self, _ec: &ExchangeHandle, pause_time_ms: u32) {
        self.push(Event::Throttle(pause_time_ms));
    }
    fn on_delayed_delivery_received(
        &self,
        _ec: &ExchangeHandle,
        pause_time_ms: u32,
        delayed_node_id: u64,
    ) {
        self.push(Event::DelayedDelivery(pause_time_ms, delayed_node_id));
    }
    fn on_send_error(
        &self,
        _ec: &ExchangeHandle,
        err: &ExchangeError,
        _msg_ctxt: Option<&MessageContext>,
    ) {
        self.push(Event::SendError(err.to_string()));
    }
    fn on_ack_received(&self, _ec: &ExchangeHandle, msg_ctxt: Option<&MessageContext>) {
        let ctxt = msg_ctxt.and_then(|c| c.downcast_ref::<u32>()).copied();
        self.push(Event::Ack(ctxt));
    }
}

/// Manager wired to a manual clock and a recording message layer.
pub struct Fixture {
    pub timers: Rc<TimerQueue>,
    pub layer: Rc<RecordingMessageLayer>,
    pub manager: ExchangeManager,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        init_logging();
        let timers = Rc::new(TimerQueue::manual());
        let layer = Rc::new(RecordingMessageLayer::default());
        let manager = ExchangeManager::new(config, timers.clone(), layer.clone());
        Self {
            timers,
            layer,
            manager,
        }
    }

    /// Move the clock and service whatever expired.
    pub fn advance(&self, d: Duration) {
        self.timers.advance(d);
        self.manager.service_timers();
    }
}
