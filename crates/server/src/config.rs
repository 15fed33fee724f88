use std::net::{IpAddr, Ipv4Addr};

use tandem::net::{RELIABLE_PORT, TICK_RATE, UNRELIABLE_PORT};
use tandem::NetworkConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub reliable_port: u16,
    pub unreliable_port: u16,
    /// Snapshots per second.
    pub tick_rate: u32,
    /// Physics frames per second on the main thread.
    pub frame_rate: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reliable_port: RELIABLE_PORT,
            unreliable_port: UNRELIABLE_PORT,
            tick_rate: TICK_RATE,
            frame_rate: 60,
        }
    }
}

impl ServerConfig {
    pub fn network(&self) -> NetworkConfig {
        NetworkConfig {
            bind: self.bind,
            reliable_port: self.reliable_port,
            unreliable_port: self.unreliable_port,
            tick_rate: self.tick_rate,
        }
    }
}
