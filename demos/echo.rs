use std::{cell::Cell, net::SocketAddr, rc::Rc, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};
use matx::{
    config::{self, ManagerConfig},
    error::ExchangeError,
    exchange::{ExchangeDelegate, ExchangeHandle, MessageContext, SendFlags},
    messages::{ExchangeHeader, MessageInfo},
    node::Node,
};
use tokio_util::sync::CancellationToken;

const PROFILE_ECHO: u32 = 0x0000_0001;
const ECHO_REQUEST: u8 = 1;
const ECHO_RESPONSE: u8 = 2;

const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:11095";

#[derive(Parser, Debug)]
#[command()]
struct Cli {
    #[clap(long)]
    #[arg(global = true, default_value_t = false)]
    verbose: bool,

    /// JSON manager config, command line values override it
    #[clap(long)]
    #[arg(global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer echo requests
    Serve {
        #[clap(long)]
        node_id: u64,

        #[clap(long)]
        #[arg(default_value_t=DEFAULT_LISTEN_ADDRESS.to_string())]
        listen: String,
    },
    /// Send echo requests and wait for responses
    Ping {
        #[clap(long)]
        node_id: u64,

        #[clap(long)]
        peer_node_id: u64,

        #[clap(long)]
        #[arg(default_value_t = String::from("0.0.0.0:0"))]
        listen: String,

        #[clap(long)]
        #[arg(default_value_t = 3)]
        count: u32,

        #[clap(long)]
        #[arg(default_value_t = 2000)]
        timeout_ms: u64,

        peer_address: SocketAddr,
        message: String,
    },
}

struct EchoServer;

impl ExchangeDelegate for EchoServer {
    fn on_message_received(
        &self,
        ec: &ExchangeHandle,
        info: &MessageInfo,
        _header: &ExchangeHeader,
        payload: Vec<u8>,
    ) {
        println!(
            "echo request from {:x} counter:{} {}",
            info.source_node_id,
            info.message_id,
            String::from_utf8_lossy(&payload)
        );
        if let Err(e) = ec.send_message(
            PROFILE_ECHO,
            ECHO_RESPONSE,
            &payload,
            SendFlags::empty(),
            None,
            None,
        ) {
            log::error!("can't send echo response: {}", e);
        }
    }
}

/// Counts finished requests and stops the node after the last one.
struct EchoClient {
    remaining: Cell<u32>,
    cancel: CancellationToken,
}

impl EchoClient {
    fn done(&self) {
        let left = self.remaining.get().saturating_sub(1);
        self.remaining.set(left);
        if left == 0 {
            self.cancel.cancel();
        }
    }
}

impl ExchangeDelegate for EchoClient {
    fn on_message_received(
        &self,
        ec: &ExchangeHandle,
        _info: &MessageInfo,
        _header: &ExchangeHeader,
        payload: Vec<u8>,
    ) {
        println!(
            "echo response on exchange {}: {}",
            ec.exchange_id(),
            String::from_utf8_lossy(&payload)
        );
        if let Err(e) = ec.flush_acks() {
            log::debug!("can't flush ack: {}", e);
        }
        self.done();
    }

    fn on_response_timeout(&self, ec: &ExchangeHandle) {
        println!("exchange {} timed out", ec.exchange_id());
        self.done();
    }

    fn on_send_error(
        &self,
        ec: &ExchangeHandle,
        err: &ExchangeError,
        _msg_ctxt: Option<&MessageContext>,
    ) {
        println!("exchange {} send failed: {}", ec.exchange_id(), err);
    }

    fn on_ack_received(&self, ec: &ExchangeHandle, _msg_ctxt: Option<&MessageContext>) {
        log::debug!("exchange {} request acknowledged", ec.exchange_id());
    }
}

fn load(path: &Option<String>, node_id: u64, listen: String) -> Result<ManagerConfig> {
    let mut cfg = match path {
        Some(p) => config::load_config(p)?,
        None => ManagerConfig::default(),
    };
    cfg.local_node_id = node_id;
    cfg.listen_address = listen;
    Ok(cfg)
}

async fn serve(cfg: ManagerConfig) -> Result<()> {
    let node = Node::bind(cfg, CancellationToken::new()).await?;
    node.manager().register_unsolicited_message_handler(
        PROFILE_ECHO,
        Some(ECHO_REQUEST),
        Rc::new(EchoServer),
        false,
    );
    println!("listening on {}", node.layer().local_addr()?);
    node.run().await
}

async fn ping(
    cfg: ManagerConfig,
    peer_node_id: u64,
    peer_address: SocketAddr,
    count: u32,
    timeout: Duration,
    message: &str,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let node = Node::bind(cfg, cancel.clone()).await?;
    let client = Rc::new(EchoClient {
        remaining: Cell::new(count),
        cancel,
    });
    let mut exchanges = Vec::new();
    for n in 0..count {
        let ec = node
            .manager()
            .new_context(peer_node_id, Some(peer_address), Some(client.clone()))?;
        ec.set_response_timeout(timeout);
        let payload = format!("{} {}", message, n);
        ec.send_message(
            PROFILE_ECHO,
            ECHO_REQUEST,
            payload.as_bytes(),
            SendFlags::EXPECT_RESPONSE,
            None,
            None,
        )?;
        exchanges.push(ec);
    }
    node.run().await?;
    for ec in exchanges {
        ec.close();
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = {
        if cli.verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Error
        }
    };
    env_logger::Builder::new()
        .parse_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(log_level)
        .format_line_number(true)
        .format_file(true)
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Commands::Serve { node_id, listen } => {
            let cfg = load(&cli.config, node_id, listen)?;
            runtime.block_on(serve(cfg))
        }
        Commands::Ping {
            node_id,
            peer_node_id,
            listen,
            count,
            timeout_ms,
            peer_address,
            message,
        } => {
            let cfg = load(&cli.config, node_id, listen)?;
            runtime.block_on(ping(
                cfg,
                peer_node_id,
                peer_address,
                count,
                Duration::from_millis(timeout_ms),
                &message,
            ))
        }
    }
}
