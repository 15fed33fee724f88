mod config;
mod simulation;
mod tui;

use std::io::{self, BufRead};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;

use config::ServerConfig;
use simulation::SimulationLoop;
use tandem::server::ServerEvent;
use tandem::{NetworkServer, RapierBackend, ServerWorld};
use tui::{Dashboard, TuiState};

#[derive(Parser)]
#[command(name = "tandem-server")]
#[command(about = "Authoritative server for a shared physics world")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(long, default_value_t = tandem::net::RELIABLE_PORT)]
    reliable_port: u16,

    #[arg(long, default_value_t = tandem::net::UNRELIABLE_PORT)]
    unreliable_port: u16,

    #[arg(short, long, default_value_t = tandem::net::TICK_RATE, help = "Snapshots per second")]
    tick_rate: u32,

    #[arg(long)]
    headless: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServerConfig {
        bind: args.bind,
        reliable_port: args.reliable_port,
        unreliable_port: args.unreliable_port,
        tick_rate: args.tick_rate,
        ..Default::default()
    };

    if args.headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let world = Arc::new(Mutex::new(ServerWorld::new(RapierBackend::new())));
    let mut server = NetworkServer::start(config.network(), Arc::clone(&world))
        .context("failed to start networking")?;
    let mut simulation = SimulationLoop::new(world, config.frame_rate);

    if args.headless {
        run_headless(&mut server, &mut simulation);
    } else {
        run_with_tui(&mut server, &mut simulation)?;
    }

    server.shutdown();
    Ok(())
}

/// Lines typed on stdin, read on a helper thread so the main loop never
/// blocks on the terminal.
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

fn run_headless(server: &mut NetworkServer, simulation: &mut SimulationLoop<RapierBackend>) {
    log::info!(
        "Server started on {} / {}; type 'quit' to stop",
        server.reliable_addr(),
        server.unreliable_addr()
    );
    let commands = stdin_lines();

    while server.is_running() {
        simulation.poll();

        // The network threads already log every event.
        while server.events().try_recv().is_ok() {}

        if let Ok(command) = commands.try_recv() {
            match command.trim() {
                "quit" => break,
                "" => {}
                other => log::warn!("Unknown command '{}'", other),
            }
        }

        std::thread::sleep(simulation.until_next_frame().min(Duration::from_millis(16)));
    }

    let stats = server.reliable_stats().merged(server.unreliable_stats());
    log::info!(
        "Server shutting down: {} players, {} messages sent, {} received",
        simulation.player_count(),
        stats.messages_sent,
        stats.messages_received
    );
}

fn run_with_tui(
    server: &mut NetworkServer,
    simulation: &mut SimulationLoop<RapierBackend>,
) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut tui_state = TuiState::new();
    tui_state.log_info(format!(
        "Server started on {} (reliable) / {} (unreliable)",
        server.reliable_addr(),
        server.unreliable_addr()
    ));

    let mut running = true;
    while running && server.is_running() {
        simulation.poll();

        for event in server.events().try_iter() {
            tui_state.record(event);
        }

        if event::poll(Duration::from_millis(1))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => running = false,
                        KeyCode::PageUp => tui_state.scroll_up(),
                        KeyCode::PageDown => tui_state.scroll_down(),
                        KeyCode::End => tui_state.scroll_to_bottom(),
                        _ => {}
                    }
                }
            }
        }

        let view = Dashboard {
            server_time: server.server_time(),
            players: server.registry().sessions(),
            reliable: server.reliable_stats(),
            unreliable: server.unreliable_stats(),
        };
        terminal.draw(|frame| {
            tui::render(frame, &tui_state, &view);
        })?;
    }

    tui_state.log_info("Shutting down...");

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    Ok(())
}
