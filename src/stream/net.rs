//! Network transport for RTP packets.
//!
//! Connected UDP or TCP sockets via `std::net`; packets go out in the order
//! they are handed over, no reordering or buffering layer in between.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};

use anyhow::{Context, Result};

/// Transport protocol for the stream server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
}

impl std::str::FromStr for Proto {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "udp" => Ok(Proto::Udp),
            "tcp" => Ok(Proto::Tcp),
            other => anyhow::bail!("unknown protocol: {} (expected udp or tcp)", other),
        }
    }
}

/// Transport contract consumed by the pipeline. A failed send is reported,
/// not escalated; one lost packet must not stop a live stream.
pub trait Transport {
    fn send(&mut self, pkt: &[u8]) -> io::Result<usize>;
}

enum Socket {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

/// Connected socket to the stream server.
pub struct NetSink {
    socket: Socket,
}

impl NetSink {
    pub fn open(proto: Proto, ip: &str, port: u16) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", ip, port)
            .parse()
            .with_context(|| format!("invalid server address {}:{}", ip, port))?;

        let socket = match proto {
            Proto::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").context("Failed to bind UDP socket")?;
                socket
                    .connect(addr)
                    .with_context(|| format!("Failed to connect UDP socket to {}", addr))?;
                Socket::Udp(socket)
            }
            Proto::Tcp => {
                let stream = TcpStream::connect(addr)
                    .with_context(|| format!("Failed to connect to {}", addr))?;
                stream.set_nodelay(true).ok();
                Socket::Tcp(stream)
            }
        };

        tracing::info!("Network opened: {:?} -> {}", proto, addr);
        Ok(Self { socket })
    }
}

impl Transport for NetSink {
    fn send(&mut self, pkt: &[u8]) -> io::Result<usize> {
        match &mut self.socket {
            Socket::Udp(socket) => socket.send(pkt),
            Socket::Tcp(stream) => stream.write(pkt),
        }
    }
}
