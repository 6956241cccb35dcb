//! The byte stream a channel runs over
//!
//! Any non-blocking, mio-registrable duplex stream will do. TCP is what
//! channels use on the network; unix stream pairs connect two channels in
//! the same process.

use std::io;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use log::debug;

/// A non-blocking duplex byte stream
pub trait Transport: io::Read + io::Write + mio::event::Source + Send + 'static {
    /// Close both directions; errors of an already closed stream are ignored by callers
    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for mio::net::TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, Shutdown::Both)
    }
}

impl Transport for mio::net::UnixStream {
    fn shutdown(&self) -> io::Result<()> {
        mio::net::UnixStream::shutdown(self, Shutdown::Both)
    }
}

fn resolve(address: &str) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = address.to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{address} did not resolve to any address"),
        ));
    }
    Ok(addrs)
}

/// Connect to `address` (`host:port`), trying every resolved address in turn
///
/// The connection is established blocking, then switched to non-blocking mode.
pub fn connect_tcp(address: &str, timeout: Duration) -> io::Result<mio::net::TcpStream> {
    let mut last_err = None;
    for addr in resolve(address)? {
        match std::net::TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                debug!("Connected to {addr} for {address}");
                stream.set_nodelay(true)?;
                stream.set_nonblocking(true)?;
                return Ok(mio::net::TcpStream::from_std(stream));
            }
            Err(e) => {
                debug!("Connecting to {addr} failed: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)))
}

/// Take over an accepted blocking stream
pub fn from_accepted(stream: std::net::TcpStream) -> io::Result<mio::net::TcpStream> {
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    Ok(mio::net::TcpStream::from_std(stream))
}
