use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use tandem::net::{RELIABLE_PORT, TICK_RATE, UNRELIABLE_PORT};
use tandem::ConnectionConfig;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// One-line file holding the server address.
    pub server_file: PathBuf,
    /// Takes precedence over `server_file` when set.
    pub server: Option<IpAddr>,
    pub reliable_port: u16,
    pub unreliable_port: u16,
    pub tick_rate: u32,
    pub frame_rate: u32,
    pub bot: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_file: PathBuf::from("server_ip.txt"),
            server: None,
            reliable_port: RELIABLE_PORT,
            unreliable_port: UNRELIABLE_PORT,
            tick_rate: TICK_RATE,
            frame_rate: 60,
            bot: false,
        }
    }
}

impl ClientConfig {
    pub fn server_address(&self) -> Result<IpAddr> {
        match self.server {
            Some(server) => Ok(server),
            None => read_server_file(&self.server_file),
        }
    }

    pub fn connection(&self) -> Result<ConnectionConfig> {
        Ok(ConnectionConfig {
            server: self.server_address()?,
            reliable_port: self.reliable_port,
            unreliable_port: self.unreliable_port,
            tick_rate: self.tick_rate,
        })
    }
}

/// The first non-empty line of `path`, parsed as an IP address.
pub fn read_server_file(path: &Path) -> Result<IpAddr> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("cannot read server address from {}", path.display()))?;
    let line = contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .with_context(|| format!("{} is empty", path.display()))?;
    line.parse()
        .with_context(|| format!("'{}' in {} is not an IP address", line, path.display()))
}
