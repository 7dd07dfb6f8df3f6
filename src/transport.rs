use anyhow::{Context, Result};
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    net::SocketAddr,
    rc::Rc,
};
use tokio::net::UdpSocket;

use crate::{
    error::{self, ExchangeError},
    messages::{MessageFlags, MessageHeader, MessageInfo, MessageVersion, ANY_NODE_ID},
};

/// Connection oriented transport bound to a single peer.
pub trait Connection {
    fn peer_node_id(&self) -> u64;
    fn send_message(&self, info: &mut MessageInfo, payload: &[u8]) -> error::Result<()>;
    /// Drop one reference held by an exchange.
    fn release(&self);
}

/// Connectionless transport, encodes the message header and sends datagrams.
pub trait MessageLayer {
    /// Encode and send in one step.
    fn send_message(
        &self,
        dest: SocketAddr,
        info: &mut MessageInfo,
        payload: &[u8],
    ) -> error::Result<()>;
    /// Encode message header, assigning `info.message_id` unless it is reused.
    fn encode_message(
        &self,
        dest: SocketAddr,
        info: &mut MessageInfo,
        payload: &[u8],
    ) -> error::Result<Vec<u8>>;
    /// Send an already encoded message again.
    fn resend_message(&self, dest: SocketAddr, encoded: &[u8]) -> error::Result<()>;
    /// Resolve destination address for a node, filling in the node id when unknown.
    fn select_dest_node_id_and_address(
        &self,
        dest_node_id: &mut u64,
        addr: Option<SocketAddr>,
    ) -> error::Result<SocketAddr>;
    fn release_session_key(&self, _peer_node_id: u64, _key_id: u16) {}
}

const MAX_DATAGRAM: usize = 1280;

pub struct UdpMessageLayer {
    socket: UdpSocket,
    /// Clone of `socket` for sends from synchronous code.
    sender: std::net::UdpSocket,
    local_node_id: u64,
    next_message_id: Cell<u32>,
    peers: RefCell<HashMap<u64, SocketAddr>>,
}

impl UdpMessageLayer {
    /// Bind broadcast capable socket to `local`.
    pub async fn bind(local: &str, local_node_id: u64) -> Result<Rc<Self>> {
        let addr = tokio::net::lookup_host(local)
            .await?
            .next()
            .context(format!("can't resolve {}", local))?;
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&addr.into())
            .context(format!("binding udp socket to {}", addr))?;
        let sender: std::net::UdpSocket = socket.try_clone()?.into();
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Rc::new(Self {
            socket,
            sender,
            local_node_id,
            next_message_id: Cell::new(rand::random()),
            peers: RefCell::new(HashMap::new()),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn local_node_id(&self) -> u64 {
        self.local_node_id
    }

    pub fn add_peer(&self, node_id: u64, addr: SocketAddr) {
        self.peers.borrow_mut().insert(node_id, addr);
    }

    fn allocate_message_id(&self) -> u32 {
        let id = self.next_message_id.get();
        self.next_message_id.set(id.wrapping_add(1));
        id
    }

    /// Wait for next datagram and decode its message header.
    /// Returned payload starts with the exchange header.
    pub async fn receive(&self) -> Result<(MessageInfo, Vec<u8>)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.socket.recv_from(&mut buf).await?;
        buf.resize(n, 0);
        let (header, rest) =
            MessageHeader::decode(&buf).context(format!("decoding message from {}", addr))?;
        log::trace!("received {} bytes from {} header:{:?}", n, addr, header);
        if let Some(src) = header.source_node_id {
            self.peers.borrow_mut().insert(src, addr);
        }
        Ok((header.to_message_info(Some(addr)), rest))
    }
}

impl MessageLayer for UdpMessageLayer {
    fn send_message(
        &self,
        dest: SocketAddr,
        info: &mut MessageInfo,
        payload: &[u8],
    ) -> error::Result<()> {
        let encoded = self.encode_message(dest, info, payload)?;
        self.resend_message(dest, &encoded)
    }

    fn encode_message(
        &self,
        _dest: SocketAddr,
        info: &mut MessageInfo,
        payload: &[u8],
    ) -> error::Result<Vec<u8>> {
        if !info.flags.contains(MessageFlags::REUSE_MESSAGE_ID) {
            info.message_id = self.allocate_message_id();
        }
        if info.version == MessageVersion::Unspecified {
            info.version = MessageVersion::V2;
        }
        let header = MessageHeader {
            version: info.version,
            encryption_type: info.encryption_type,
            key_id: info.key_id,
            message_id: info.message_id,
            source_node_id: Some(self.local_node_id),
            dest_node_id: (info.dest_node_id != ANY_NODE_ID).then_some(info.dest_node_id),
        };
        let mut out = header.encode()?;
        out.extend_from_slice(payload);
        if out.len() > MAX_DATAGRAM {
            return Err(ExchangeError::InvalidArgument);
        }
        Ok(out)
    }

    fn resend_message(&self, dest: SocketAddr, encoded: &[u8]) -> error::Result<()> {
        self.sender
            .send_to(encoded, dest)
            .map_err(ExchangeError::from_io)?;
        Ok(())
    }

    fn select_dest_node_id_and_address(
        &self,
        dest_node_id: &mut u64,
        addr: Option<SocketAddr>,
    ) -> error::Result<SocketAddr> {
        if let Some(addr) = addr {
            return Ok(addr);
        }
        self.peers
            .borrow()
            .get(dest_node_id)
            .copied()
            .ok_or(ExchangeError::InvalidAddress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn udp_roundtrip_between_layers() {
        let a = UdpMessageLayer::bind("127.0.0.1:0", 10).await.unwrap();
        let b = UdpMessageLayer::bind("127.0.0.1:0", 20).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        let mut info = MessageInfo {
            dest_node_id: 20,
            ..Default::default()
        };
        a.send_message(b_addr, &mut info, &[1, 2, 3]).unwrap();
        let (rinfo, payload) = b.receive().await.unwrap();
        assert_eq!(rinfo.message_id, info.message_id);
        assert_eq!(rinfo.source_node_id, 10);
        assert_eq!(rinfo.dest_node_id, 20);
        assert_eq!(rinfo.version, MessageVersion::V2);
        assert_eq!(payload, vec![1, 2, 3]);

        // receiver learned where node 10 lives
        let mut node = 10;
        let addr = b.select_dest_node_id_and_address(&mut node, None).unwrap();
        assert_eq!(addr, a.local_addr().unwrap());
        let mut unknown = 99;
        assert!(matches!(
            b.select_dest_node_id_and_address(&mut unknown, None),
            Err(ExchangeError::InvalidAddress)
        ));
    }

    #[tokio::test]
    async fn fresh_layer_sends_right_away() {
        let a = UdpMessageLayer::bind("127.0.0.1:0", 10).await.unwrap();
        let b = UdpMessageLayer::bind("127.0.0.1:0", 20).await.unwrap();
        let b_addr = b.local_addr().unwrap();
        for n in 0..3u8 {
            let mut info = MessageInfo::default();
            a.send_message(b_addr, &mut info, &[n]).unwrap();
            let received = tokio::time::timeout(Duration::from_millis(500), b.receive()).await;
            let (_, payload) = received.unwrap().unwrap();
            assert_eq!(payload, vec![n]);
        }
    }

    #[tokio::test]
    async fn message_ids_increase_unless_reused() {
        let a = UdpMessageLayer::bind("127.0.0.1:0", 1).await.unwrap();
        let dest = a.local_addr().unwrap();
        let mut i1 = MessageInfo::default();
        let mut i2 = MessageInfo::default();
        a.encode_message(dest, &mut i1, &[]).unwrap();
        a.encode_message(dest, &mut i2, &[]).unwrap();
        assert_eq!(i2.message_id, i1.message_id.wrapping_add(1));

        let mut i3 = MessageInfo {
            message_id: 5,
            flags: MessageFlags::REUSE_MESSAGE_ID,
            ..Default::default()
        };
        a.encode_message(dest, &mut i3, &[]).unwrap();
        assert_eq!(i3.message_id, 5);
    }
}
