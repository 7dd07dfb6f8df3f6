//! UDP node - runs an [ExchangeManager] over a [UdpMessageLayer] on the current thread.
//!
//! The exchange layer is single threaded, so [Node::run] must be awaited on a current
//! thread runtime (or inside a `LocalSet`). It returns when the cancellation token fires.

use anyhow::Result;
use std::rc::Rc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ManagerConfig, exchange_manager::ExchangeManager, system::TimerQueue,
    transport::UdpMessageLayer,
};

pub struct Node {
    manager: ExchangeManager,
    layer: Rc<UdpMessageLayer>,
    cancel: CancellationToken,
}

impl Node {
    /// Bind to `config.listen_address`.
    pub async fn bind(config: ManagerConfig, cancel: CancellationToken) -> Result<Self> {
        let layer = UdpMessageLayer::bind(&config.listen_address, config.local_node_id).await?;
        log::debug!(
            "node {:x} listening on {}",
            config.local_node_id,
            layer.local_addr()?
        );
        let timers = Rc::new(TimerQueue::new());
        let manager = ExchangeManager::new(config, timers, layer.clone());
        Ok(Self {
            manager,
            layer,
            cancel,
        })
    }

    pub fn manager(&self) -> &ExchangeManager {
        &self.manager
    }

    pub fn layer(&self) -> &Rc<UdpMessageLayer> {
        &self.layer
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Receive and dispatch messages and service timers until canceled.
    pub async fn run(&self) -> Result<()> {
        loop {
            let deadline = self.manager.next_deadline();
            let wake = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                result = self.layer.receive() => {
                    match result {
                        Ok((info, data)) => {
                            if let Err(e) = self.manager.dispatch_message(info, data) {
                                log::debug!("error processing incoming message: {}", e);
                            }
                        }
                        Err(e) => log::debug!("receive failed: {:?}", e),
                    }
                }

                _ = wake => {}
            }
            self.manager.service_timers();
        }
        log::debug!("node {:x} stopping", self.manager.local_node_id());
        self.manager.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exchange::{ExchangeDelegate, ExchangeHandle, SendFlags},
        messages::{ExchangeHeader, MessageInfo},
        testutil::init_logging,
    };
    use std::{cell::RefCell, time::Duration};

    const PROFILE_ECHO: u32 = 1;
    const ECHO_REQUEST: u8 = 1;
    const ECHO_RESPONSE: u8 = 2;

    struct Responder;

    impl ExchangeDelegate for Responder {
        fn on_message_received(
            &self,
            ec: &ExchangeHandle,
            _info: &MessageInfo,
            _header: &ExchangeHeader,
            payload: Vec<u8>,
        ) {
            ec.send_message(PROFILE_ECHO, ECHO_RESPONSE, &payload, SendFlags::empty(), None, None)
                .unwrap();
        }
    }

    struct Collect {
        got: RefCell<Option<Vec<u8>>>,
        cancel: CancellationToken,
    }

    impl ExchangeDelegate for Collect {
        fn on_message_received(
            &self,
            _ec: &ExchangeHandle,
            _info: &MessageInfo,
            header: &ExchangeHeader,
            payload: Vec<u8>,
        ) {
            assert_eq!(header.message_type, ECHO_RESPONSE);
            *self.got.borrow_mut() = Some(payload);
            self.cancel.cancel();
        }
    }

    fn config(node_id: u64) -> ManagerConfig {
        ManagerConfig {
            local_node_id: node_id,
            listen_address: "127.0.0.1:0".to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn echo_between_nodes() {
        init_logging();
        let cancel = CancellationToken::new();
        let a = Node::bind(config(10), cancel.clone()).await.unwrap();
        let b = Node::bind(config(20), cancel.clone()).await.unwrap();
        b.manager()
            .register_unsolicited_message_handler(PROFILE_ECHO, Some(ECHO_REQUEST), Rc::new(Responder), false);

        let collect = Rc::new(Collect {
            got: RefCell::new(None),
            cancel: cancel.clone(),
        });
        let ec = a
            .manager()
            .new_context(20, Some(b.layer().local_addr().unwrap()), Some(collect.clone()))
            .unwrap();
        ec.set_response_timeout(Duration::from_secs(2));
        ec.send_message(
            PROFILE_ECHO,
            ECHO_REQUEST,
            b"hello",
            SendFlags::EXPECT_RESPONSE,
            None,
            None,
        )
        .unwrap();

        // well below the initial retransmit timeout, so the first datagram must arrive
        let run = async { tokio::join!(a.run(), b.run()) };
        let (ra, rb) = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap();
        ra.unwrap();
        rb.unwrap();
        assert_eq!(collect.got.borrow().as_deref(), Some(&b"hello"[..]));
        // request was acknowledged by the piggybacked ack of the response
        assert_eq!(a.manager().retrans_pending(ec.key()), 0);
    }
}
