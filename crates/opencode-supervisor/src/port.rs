//! Free-port allocation.

use std::{
    io,
    net::{Ipv4Addr, TcpListener},
};

/// Host the server is told to bind.
pub const LOOPBACK: &str = "127.0.0.1";

/// Find a free loopback TCP port.
///
/// Binds port 0, reads back the port the OS picked and releases it again.
/// The result is only a hint: another process may claim the port before the
/// server binds it. A server that fails to bind shows up as a failed start or
/// a readiness timeout, and retrying is up to the caller.
///
/// # Errors
/// Returns error if no listener can be bound on the loopback interface.
pub fn allocate_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    tracing::debug!(port, "Allocated free port");
    Ok(port)
}

/// Port component of a `host:port` address.
#[must_use]
pub fn port_of(addr: &str) -> Option<u16> {
    let (_, port) = addr.rsplit_once(':')?;
    port.parse().ok().filter(|p| *p != 0)
}
