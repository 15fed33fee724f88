use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use crossbeam_channel::Receiver;

use tandem::client::Correction;
use tandem::net::InputUpdate;
use tandem::{ClientEvent, ClientWorld, NetworkClient, RapierBackend};

use crate::input::{InputPacer, InputSource};

pub enum Command {
    Chat(String),
    Ping,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "" => None,
            "/quit" => Some(Command::Quit),
            "/ping" => Some(Command::Ping),
            text => Some(Command::Chat(text.to_string())),
        }
    }
}

/// The client's main thread: network events in, input out, local physics
/// stepped and reconciled against each new snapshot.
pub struct App {
    network: NetworkClient,
    world: ClientWorld<RapierBackend>,
    input: InputSource,
    commands: Receiver<String>,
    frame_period: Duration,
    pacer: InputPacer,
}

impl App {
    pub fn new(
        network: NetworkClient,
        tick_rate: u32,
        frame_rate: u32,
        input: InputSource,
        commands: Receiver<String>,
    ) -> Self {
        Self {
            network,
            world: ClientWorld::new(RapierBackend::new(), tick_rate),
            input,
            commands,
            frame_period: Duration::from_secs(1) / frame_rate.max(1),
            pacer: InputPacer::new(tick_rate),
        }
    }

    pub fn run(mut self) -> Result<()> {
        let mut last_frame = Instant::now();
        let mut next_frame = last_frame + self.frame_period;

        loop {
            while let Ok(event) = self.network.events().try_recv() {
                self.handle_event(event)?;
            }

            while let Ok(line) = self.commands.try_recv() {
                match Command::parse(&line) {
                    Some(Command::Quit) => {
                        log::info!("Leaving");
                        self.network.shutdown();
                        return Ok(());
                    }
                    Some(Command::Ping) => {
                        if let Err(e) = self.network.send_ping() {
                            log::warn!("Ping not sent: {}", e);
                        }
                    }
                    Some(Command::Chat(text)) => {
                        if let Err(e) = self.network.send_chat(text) {
                            log::warn!("Chat line dropped: {}", e);
                        }
                    }
                    None => {}
                }
            }

            let now = Instant::now();
            let dt = (now - last_frame).as_secs_f32();
            last_frame = now;
            self.frame(dt);

            next_frame += self.frame_period;
            if next_frame <= now {
                next_frame = now + self.frame_period;
            }
            std::thread::sleep(next_frame.saturating_duration_since(Instant::now()));
        }
    }

    fn handle_event(&mut self, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::Accepted => log::info!("Accepted by server, joining"),
            ClientEvent::ServerFull => bail!("server is full"),
            ClientEvent::Joined {
                player_id,
                active_players,
            } => {
                log::info!("Joined as player {} with {:?}", player_id, active_players);
                self.world.join(player_id, &active_players);
            }
            ClientEvent::PlayerJoined { player_id } => {
                log::info!("Player {} joined", player_id);
                self.world.add_player(player_id);
            }
            ClientEvent::PlayerLeft { player_id } => {
                log::info!("Player {} left", player_id);
                self.world.remove_player(player_id);
            }
            ClientEvent::Chat { player_id, text } => println!("<{}> {}", player_id, text),
            ClientEvent::Synced { offset, latency } => {
                log::info!("Clock synced (offset {}ms, latency {}ms)", offset, latency);
            }
            ClientEvent::Disconnected { reason } => bail!("disconnected: {}", reason),
        }
        Ok(())
    }

    fn frame(&mut self, dt: f32) {
        let intent = self.input.next(dt);

        // Input timestamps are in server time, so nothing goes out before
        // the clock is synchronized.
        let ready = self.world.local_id().is_some() && self.network.is_synced();
        if let Some(intent) = ready.then(|| self.pacer.offer(intent, dt)).flatten() {
            let input = InputUpdate {
                local_time: self.network.current_time(),
                velocity: intent.velocity,
                rotation: intent.rotation,
                jump: intent.jump,
            };
            self.world.apply_local_input(&input);
            self.network.send_input(input);
        }

        self.world.update(dt);

        if let Some(snapshot) = self.network.take_snapshot() {
            let corrections = self
                .world
                .reconcile(&snapshot, self.network.current_time());
            for (id, correction) in corrections {
                if correction == Correction::Teleport {
                    log::debug!("Player {} snapped to server position", id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        assert!(matches!(Command::parse("/quit"), Some(Command::Quit)));
        assert!(matches!(Command::parse("  /ping "), Some(Command::Ping)));
        assert!(matches!(
            Command::parse("hello there"),
            Some(Command::Chat(text)) if text == "hello there"
        ));
        assert!(Command::parse("   ").is_none());
    }
}
