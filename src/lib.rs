//! Matter/CHIP exchange layer
//!
//! This library implements exchanges (request/response conversations between two nodes)
//! together with the reliable messaging protocol used over UDP: acknowledgments piggybacked
//! on responses or sent standalone, retransmission with backoff, peer throttling and
//! Trickle rebroadcast. The core is single threaded and driven by timer events, which
//! keeps it usable from any event loop. [Node](node::Node) runs it on tokio.
//!
//! Following are main parts of api:
//! - [ExchangeManager](exchange_manager::ExchangeManager) - owns exchange contexts, retransmit
//!                             table and tick engine. Routes incoming messages to exchanges
//!                             or to unsolicited message handlers.
//! - [ExchangeHandle](exchange::ExchangeHandle) - reference counted exchange. Allows to
//!                             [send](exchange::ExchangeHandle::send_message) messages,
//!                             [close](exchange::ExchangeHandle::close) or
//!                             [abort](exchange::ExchangeHandle::abort) the exchange.
//! - [ExchangeDelegate](exchange::ExchangeDelegate) - application callbacks of an exchange.
//! - [MessageLayer](transport::MessageLayer) / [Connection](transport::Connection) - transports
//!                             used by exchanges. [UdpMessageLayer](transport::UdpMessageLayer)
//!                             is the UDP implementation.
//! - [SystemLayer](system::SystemLayer) - timers. [TimerQueue](system::TimerQueue) is the
//!                             default implementation.
//!
//! Demos directory contains simple echo client and server.
//!
//! Example how to send echo request and wait for response:
//! ```no_run
//! # use matx::{config::ManagerConfig, exchange::{ExchangeDelegate, ExchangeHandle, SendFlags}, messages, node::Node};
//! # use anyhow::Result;
//! # use std::rc::Rc;
//! # use tokio_util::sync::CancellationToken;
//! struct Print(CancellationToken);
//! impl ExchangeDelegate for Print {
//!     fn on_message_received(&self, _ec: &ExchangeHandle, _info: &messages::MessageInfo,
//!                            _header: &messages::ExchangeHeader, payload: Vec<u8>) {
//!         println!("{}", hex::encode(payload));
//!         self.0.cancel();
//!     }
//! }
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<()> {
//! let cancel = CancellationToken::new();
//! let node = Node::bind(ManagerConfig::default(), cancel.clone()).await?;
//! let ec = node.manager().new_context(0x20, Some("192.168.1.10:11095".parse()?),
//!                                     Some(Rc::new(Print(cancel.clone()))))?;
//! ec.send_message(1, 1, b"hello", SendFlags::EXPECT_RESPONSE, None, None)?;
//! node.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//!
#![doc = include_str!("../readme.md")]

mod ack;
pub mod config;
pub mod error;
pub mod exchange;
pub mod exchange_manager;
pub mod messages;
pub mod node;
mod retransmit;
pub mod system;
pub mod transport;
mod trickle;

#[cfg(test)]
mod testutil;
