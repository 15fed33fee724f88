mod app;
mod config;
mod input;

use std::io::{self, BufRead};
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::Receiver;

use app::App;
use config::ClientConfig;
use input::InputSource;
use tandem::NetworkClient;

#[derive(Parser)]
#[command(name = "tandem-client")]
#[command(about = "Headless client for a shared physics world")]
struct Args {
    #[arg(long, default_value = "server_ip.txt", help = "File holding the server IP")]
    server_file: PathBuf,

    #[arg(short, long, help = "Server IP, overriding --server-file")]
    server: Option<IpAddr>,

    #[arg(long, default_value_t = tandem::net::RELIABLE_PORT)]
    reliable_port: u16,

    #[arg(long, default_value_t = tandem::net::UNRELIABLE_PORT)]
    unreliable_port: u16,

    #[arg(long, help = "Walk in circles instead of standing still")]
    bot: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ClientConfig {
        server_file: args.server_file,
        server: args.server,
        reliable_port: args.reliable_port,
        unreliable_port: args.unreliable_port,
        bot: args.bot,
        ..Default::default()
    };

    let connection = config.connection()?;
    log::info!(
        "Connecting to {}:{} (datagrams to port {})",
        connection.server,
        connection.reliable_port,
        connection.unreliable_port
    );
    let network = NetworkClient::connect(connection).context("failed to connect")?;

    let input = if config.bot {
        InputSource::bot()
    } else {
        InputSource::Idle
    };
    App::new(network, config.tick_rate, config.frame_rate, input, stdin_lines()).run()
}

/// Chat lines and commands from stdin, read on a helper thread.
fn stdin_lines() -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
