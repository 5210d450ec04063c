use std::io;
use std::net::{SocketAddr, TcpListener};

use mio::net::TcpStream;

/// Binds a non-blocking listening socket.
pub fn bind(addr: &str) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Gives a shard its own handle on the shared listening socket.
pub fn clone_for_shard(listener: &TcpListener) -> io::Result<mio::net::TcpListener> {
    let clone = listener.try_clone()?;
    clone.set_nonblocking(true)?;
    Ok(mio::net::TcpListener::from_std(clone))
}

/// Accepts one pending connection. `Ok(None)` once the backlog is empty,
/// which includes losing the race to another shard.
pub fn accept(listener: &mio::net::TcpListener) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => return Ok(Some((stream, peer))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
