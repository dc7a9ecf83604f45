use std::io;
use std::net::TcpStream;
use std::time::Duration;

use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{Peer, Transport};

/// How long a poll() call blocks waiting for an inbound frame before handing
/// control back to the socket loop.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub enum Frame {
    Message(String),
    /// Nothing arrived within the poll interval.
    Idle,
    /// The peer closed the stream in an orderly fashion.
    Closed,
}

/// A duplex message channel carrying whole JSON frames. The RPC multiplexer
/// only ever sees this seam, which keeps it independent of the wire transport
/// and drivable from tests.
pub trait Duplex: Send {
    fn send(&mut self, frame: &str) -> Result<()>;
    fn poll(&mut self) -> Result<Frame>;
    fn shutdown(&mut self);
}

pub type Connector = Box<dyn Fn() -> Result<Box<dyn Duplex>> + Send>;

/// Pick how to reach a peer: an explicit preference wins when its port is
/// advertised, then direct WSS, then SSL and TCP through the tunneling proxy.
pub fn select_transport(peer: &Peer, config: &Config) -> Result<Transport> {
    if let Some(preferred) = peer.prefer_transport {
        if peer.ports.get(preferred).is_some() {
            return Ok(preferred);
        }
    }
    for &transport in &[Transport::Wss, Transport::Ssl, Transport::Tcp] {
        if peer.ports.get(transport).is_some() && proxy_for(transport, config).is_some() {
            return Ok(transport);
        }
    }
    Err(Error::NoSuitableTransport(peer.host.clone()))
}

/// The proxy url needed for a transport, or `Some("")` when none is needed.
fn proxy_for<'a>(transport: Transport, config: &'a Config) -> Option<&'a str> {
    match transport {
        Transport::Wss => Some(""),
        Transport::Ssl => config.ssl_proxy_url.as_deref(),
        Transport::Tcp => config.tcp_proxy_url.as_deref(),
    }
}

pub fn peer_wss_url(peer: &Peer) -> Result<String> {
    let port = peer
        .ports
        .wss
        .ok_or_else(|| Error::NoSuitableTransport(peer.host.clone()))?;
    let path = match peer.wss_path.as_deref() {
        None | Some("") => String::new(),
        Some(path) if path.starts_with('/') => path.into(),
        Some(path) => format!("/{}", path),
    };
    Ok(format!("wss://{}:{}{}", peer.host, port, path))
}

/// Open a duplex channel to the peer over the chosen transport. Tunneled
/// transports route through the proxy; the first frame carries the token
/// addressing the real peer, all later frames are plain JSON.
pub fn connect_peer(peer: &Peer, transport: Transport, config: &Config) -> Result<Box<dyn Duplex>> {
    match transport {
        Transport::Wss => {
            let duplex = WsDuplex::connect(&peer_wss_url(peer)?)?;
            Ok(Box::new(duplex))
        }
        Transport::Ssl | Transport::Tcp => {
            let proxy_url = proxy_for(transport, config)
                .filter(|url| !url.is_empty())
                .ok_or_else(|| Error::NoSuitableTransport(peer.host.clone()))?
                .to_string();
            let mut duplex = WsDuplex::connect(&proxy_url)?;
            duplex.send(&tunnel_token(peer, config))?;
            Ok(Box::new(duplex))
        }
    }
}

pub fn tunnel_token(peer: &Peer, config: &Config) -> String {
    format!("{}:{}", config.network_token(), peer.host)
}

pub struct WsDuplex {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl WsDuplex {
    pub fn connect(url: &str) -> Result<Self> {
        debug!(target: "elc::transport", "connecting to {}", url);
        let (socket, _response) = tungstenite::connect(url)?;
        // reads are bounded so the socket loop can interleave writes
        match socket.get_ref() {
            MaybeTlsStream::Plain(stream) => stream.set_read_timeout(Some(POLL_INTERVAL))?,
            MaybeTlsStream::NativeTls(stream) => {
                stream.get_ref().set_read_timeout(Some(POLL_INTERVAL))?
            }
            _ => (),
        }
        Ok(WsDuplex { socket })
    }
}

impl Duplex for WsDuplex {
    fn send(&mut self, frame: &str) -> Result<()> {
        self.socket.write_message(Message::Text(frame.into()))?;
        Ok(())
    }

    fn poll(&mut self) -> Result<Frame> {
        match self.socket.read_message() {
            Ok(Message::Text(text)) => Ok(Frame::Message(text)),
            Ok(Message::Close(_)) => Ok(Frame::Closed),
            // ping/pong are handled internally by the socket, binary is not
            // part of this protocol
            Ok(_) => Ok(Frame::Idle),
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(Frame::Idle)
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                Ok(Frame::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn shutdown(&mut self) {
        let _ = self.socket.close(None);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerPorts;
    use bitcoin::Network;

    fn peer(tcp: Option<u16>, ssl: Option<u16>, wss: Option<u16>) -> Peer {
        Peer::new("electrum.example.org", PeerPorts { tcp, ssl, wss })
    }

    fn config(tcp_proxy: bool, ssl_proxy: bool) -> Config {
        let mut config = Config::new(Network::Bitcoin);
        if tcp_proxy {
            config.tcp_proxy_url = Some("wss://proxy.example.org/tcp".into());
        }
        if ssl_proxy {
            config.ssl_proxy_url = Some("wss://proxy.example.org/ssl".into());
        }
        config
    }

    #[test]
    fn test_select_prefers_wss() {
        let peer = peer(Some(50001), Some(50002), Some(50004));
        assert_eq!(select_transport(&peer, &config(true, true)).unwrap(), Transport::Wss);
    }

    #[test]
    fn test_select_falls_back_by_proxy_availability() {
        let peer = peer(Some(50001), Some(50002), None);
        assert_eq!(select_transport(&peer, &config(true, true)).unwrap(), Transport::Ssl);
        assert_eq!(select_transport(&peer, &config(true, false)).unwrap(), Transport::Tcp);
        match select_transport(&peer, &config(false, false)) {
            Err(Error::NoSuitableTransport(host)) => assert_eq!(host, "electrum.example.org"),
            other => panic!("expected NoSuitableTransport, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_select_honors_preference() {
        let mut peer = peer(Some(50001), Some(50002), Some(50004));
        peer.prefer_transport = Some(Transport::Ssl);
        assert_eq!(select_transport(&peer, &config(true, true)).unwrap(), Transport::Ssl);

        // a preference without the matching port falls back to the usual order
        peer.ports.ssl = None;
        assert_eq!(select_transport(&peer, &config(true, true)).unwrap(), Transport::Wss);
    }

    #[test]
    fn test_wss_url() {
        let mut peer = peer(None, None, Some(50004));
        assert_eq!(peer_wss_url(&peer).unwrap(), "wss://electrum.example.org:50004");
        peer.wss_path = Some("electrum".into());
        assert_eq!(peer_wss_url(&peer).unwrap(), "wss://electrum.example.org:50004/electrum");
        peer.wss_path = Some("/ws".into());
        assert_eq!(peer_wss_url(&peer).unwrap(), "wss://electrum.example.org:50004/ws");
    }

    #[test]
    fn test_tunnel_token() {
        let peer = peer(Some(60001), None, None);
        let mut config = Config::new(Network::Testnet);
        config.tcp_proxy_url = Some("wss://proxy.example.org".into());
        assert_eq!(tunnel_token(&peer, &config), "testnet:electrum.example.org");
        config.network = Network::Bitcoin;
        assert_eq!(tunnel_token(&peer, &config), "mainnet:electrum.example.org");
    }
}
