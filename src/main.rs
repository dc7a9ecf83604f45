#[macro_use]
extern crate log;

use std::str::FromStr;
use std::sync::{mpsc, Arc};

use bitcoin::{Address, Network};
use structopt::StructOpt;

use elc::{Agent, Config, Event, MemoryStore, Peer, PeerPorts, Result, Transport};

#[derive(StructOpt, Debug)]
#[structopt(name = "elc", about = "Watch an Electrum peer and print chain events")]
struct Cli {
    #[structopt(
        short = "n",
        long,
        help = "One of 'bitcoin', 'testnet' or 'regtest'",
        default_value = "bitcoin",
        env,
        hide_env_values(true)
    )]
    network: Network,

    #[structopt(
        short = "v",
        long,
        help = "Increase verbosity level (up to 4 times)",
        parse(from_occurrences)
    )]
    verbose: usize,

    #[structopt(short = "t", long, help = "Show timestamps in log messages")]
    timestamp: bool,

    #[structopt(short = "H", long, help = "Peer hostname", env, hide_env_values(true))]
    host: String,

    #[structopt(long, help = "Peer wss port (reached directly)")]
    wss_port: Option<u16>,

    #[structopt(long, help = "Peer ssl port (tunneled, needs --ssl-proxy-url)")]
    ssl_port: Option<u16>,

    #[structopt(long, help = "Peer tcp port (tunneled, needs --tcp-proxy-url)")]
    tcp_port: Option<u16>,

    #[structopt(long, help = "Path component of the peer's wss endpoint")]
    wss_path: Option<String>,

    #[structopt(short = "T", long, help = "Preferred transport ('tcp', 'ssl' or 'wss')")]
    prefer: Option<Transport>,

    #[structopt(
        long,
        help = "WebSocket url of the tcp tunneling proxy",
        env,
        hide_env_values(true)
    )]
    tcp_proxy_url: Option<String>,

    #[structopt(
        long,
        help = "WebSocket url of the ssl tunneling proxy",
        env,
        hide_env_values(true)
    )]
    ssl_proxy_url: Option<String>,

    #[structopt(
        short = "w",
        long = "watch",
        help = "Addresses to watch for history changes",
        use_delimiter(true)
    )]
    watch: Vec<String>,
}

fn main() -> Result<()> {
    dirs::home_dir().map(|home| dotenv::from_path(home.join("elc.env")).ok());
    let cli = Cli::from_args();
    Config::setup_logger(cli.verbose, cli.timestamp);

    let mut config = Config::new(cli.network);
    config.tcp_proxy_url = cli.tcp_proxy_url.clone();
    config.ssl_proxy_url = cli.ssl_proxy_url.clone();

    let mut peer = Peer::new(
        &cli.host,
        PeerPorts {
            tcp: cli.tcp_port,
            ssl: cli.ssl_port,
            wss: cli.wss_port,
        },
    );
    peer.wss_path = cli.wss_path.clone();
    peer.prefer_transport = cli.prefer;

    let addresses = cli
        .watch
        .iter()
        .map(|s| Address::from_str(s))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let store = Arc::new(MemoryStore::new());
    let (events_tx, events_rx) = mpsc::channel();
    let agent = Agent::start_with_listener(
        peer,
        config,
        store.clone(),
        store,
        Some(Box::new(move |event| {
            let _ = events_tx.send(event.clone());
        })),
    )?;

    loop {
        match events_rx.recv() {
            Ok(Event::Syncing) => debug!("syncing with {}", agent.peer()),
            Ok(Event::Synced) => {
                info!("synced; watching {} address(es)", addresses.len());
                if !addresses.is_empty() {
                    agent.subscribe(&addresses)?;
                }
            }
            Ok(Event::Block(header)) => {
                info!("block {} at height {}", header.block_hash, header.block_height)
            }
            Ok(Event::TransactionAdded(tx)) => info!("mempool tx {}", tx.transaction_hash),
            Ok(Event::TransactionMined(tx, block)) => {
                info!("tx {} mined in block {}", tx.transaction_hash, block.block_height)
            }
            Ok(Event::Close(reason)) => {
                warn!("agent closed: {}", reason);
                break;
            }
            Err(_) => break,
        }
    }
    Ok(())
}
