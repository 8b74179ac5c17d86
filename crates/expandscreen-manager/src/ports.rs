//! Ephemeral local port allocation.

use anyhow::{Context, Result};
use std::net::TcpListener;

/// Hands out unused loopback TCP ports via one-shot listeners. The port is
/// released as soon as the listener drops, which is before the caller binds
/// it again — good enough for loopback forwards, where the race window is
/// local to this machine.
#[derive(Debug, Default)]
pub struct PortAllocator;

impl PortAllocator {
    pub fn allocate(&self) -> Result<u16> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).context("probing for a free port")?;
        let port = listener.local_addr().context("reading probed port")?.port();
        Ok(port)
    }
}
