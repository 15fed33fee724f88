use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::net::{Chat, Message, Outbox, PlayerId, ProtocolError, MAX_PLAYERS};

#[derive(Debug, Clone)]
struct PlayerSession {
    udp_address: Option<SocketAddr>,
    last_input_time: Option<u32>,
    outbox: Outbox,
}

/// Read-only view of one session, for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub player_id: PlayerId,
    pub udp_address: Option<SocketAddr>,
    pub last_input_time: Option<u32>,
    pub queued_messages: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("{0} cannot receive datagrams")]
    Unroutable(SocketAddr),
    #[error("no session for player {0}")]
    UnknownPlayer(PlayerId),
    #[error("{address} is already bound to player {owner}")]
    AddressInUse {
        address: SocketAddr,
        owner: PlayerId,
    },
}

#[derive(Debug, Default)]
struct Sessions {
    slots: [Option<PlayerSession>; MAX_PLAYERS],
    by_address: HashMap<SocketAddr, PlayerId>,
}

impl Sessions {
    fn get(&self, id: PlayerId) -> Option<&PlayerSession> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: PlayerId) -> Option<&mut PlayerSession> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    fn joined(&self) -> impl Iterator<Item = (PlayerId, &PlayerSession)> {
        self.slots.iter().enumerate().filter_map(|(id, slot)| {
            slot.as_ref()
                .filter(|session| session.udp_address.is_some())
                .map(|session| (id as PlayerId, session))
        })
    }
}

/// The player-id namespace and the datagram address table. Every method
/// takes the internal lock for its whole duration; callers never see the
/// tables directly.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<Sessions>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the lowest free id for a new connection, or `None` when every
    /// slot is taken.
    pub fn allocate(&self, outbox: Outbox) -> Option<PlayerId> {
        let mut sessions = self.lock();
        let free = sessions.slots.iter().position(Option::is_none)?;
        sessions.slots[free] = Some(PlayerSession {
            udp_address: None,
            last_input_time: None,
            outbox,
        });
        Some(free as PlayerId)
    }

    /// Frees the id and drops its address binding. Returns whether the player
    /// had completed the handshake.
    pub fn release(&self, id: PlayerId) -> Option<bool> {
        let mut sessions = self.lock();
        let session = sessions.slots.get_mut(id as usize)?.take()?;
        if let Some(address) = session.udp_address {
            sessions.by_address.remove(&address);
        }
        Some(session.udp_address.is_some())
    }

    /// Records the datagram address for `id`, replacing any earlier one.
    pub fn bind_address(&self, id: PlayerId, address: SocketAddr) -> Result<(), BindError> {
        if address.port() == 0 || address.ip().is_unspecified() {
            return Err(BindError::Unroutable(address));
        }
        let mut sessions = self.lock();
        if let Some(&owner) = sessions.by_address.get(&address) {
            if owner != id {
                return Err(BindError::AddressInUse { address, owner });
            }
        }

        let session = sessions.get_mut(id).ok_or(BindError::UnknownPlayer(id))?;
        let previous = session.udp_address.replace(address);
        if let Some(previous) = previous {
            sessions.by_address.remove(&previous);
        }
        sessions.by_address.insert(address, id);
        Ok(())
    }

    pub fn resolve(&self, address: SocketAddr) -> Option<PlayerId> {
        self.lock().by_address.get(&address).copied()
    }

    pub fn is_full(&self) -> bool {
        self.lock().slots.iter().all(Option::is_some)
    }

    pub fn len(&self) -> usize {
        self.lock().slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of sessions that completed the handshake, ascending.
    pub fn joined_ids(&self) -> Vec<PlayerId> {
        self.lock().joined().map(|(id, _)| id).collect()
    }

    pub fn udp_targets(&self) -> Vec<(PlayerId, SocketAddr)> {
        self.lock()
            .joined()
            .filter_map(|(id, session)| session.udp_address.map(|addr| (id, addr)))
            .collect()
    }

    /// Accepts an input time only if it is newer than the last one accepted
    /// for that player.
    pub fn accept_input(&self, id: PlayerId, time: u32) -> bool {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        if session.last_input_time.is_some_and(|last| time <= last) {
            return false;
        }
        session.last_input_time = Some(time);
        true
    }

    /// Queues `message` for one player over the reliable channel.
    pub fn send(&self, id: PlayerId, message: &Message) -> Result<bool, ProtocolError> {
        let frame = message.encode()?;
        let sessions = self.lock();
        match sessions.get(id) {
            Some(session) => {
                session.outbox.enqueue_frame(frame);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Queues `message` for every joined player except `except`. Returns how
    /// many players it was queued for.
    pub fn broadcast(
        &self,
        message: &Message,
        except: Option<PlayerId>,
    ) -> Result<usize, ProtocolError> {
        let frame = message.encode()?;
        let sessions = self.lock();
        let mut count = 0;
        for (id, session) in sessions.joined() {
            if Some(id) == except {
                continue;
            }
            session.outbox.enqueue_frame(frame.clone());
            count += 1;
        }
        Ok(count)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.lock()
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| {
                slot.as_ref().map(|session| SessionInfo {
                    player_id: id as PlayerId,
                    udp_address: session.udp_address,
                    last_input_time: session.last_input_time,
                    queued_messages: session.outbox.len(),
                })
            })
            .collect()
    }
}

/// Replaces whatever sender id a client put in a chat line with the id of
/// the connection it actually arrived on.
pub fn restamp_chat(chat: Chat, sender: PlayerId) -> Chat {
    Chat {
        player_id: sender,
        text: chat.text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::PlayerNotice;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn fill(registry: &SessionRegistry) -> Vec<Outbox> {
        (0..MAX_PLAYERS)
            .map(|_| {
                let outbox = Outbox::new(None);
                registry.allocate(outbox.clone()).unwrap();
                outbox
            })
            .collect()
    }

    #[test]
    fn test_allocates_lowest_free_id() {
        let registry = SessionRegistry::new();
        for expected in 0..MAX_PLAYERS as PlayerId {
            assert_eq!(registry.allocate(Outbox::new(None)), Some(expected));
        }
        assert!(registry.is_full());
        assert_eq!(registry.allocate(Outbox::new(None)), None);

        registry.release(2);
        assert_eq!(registry.allocate(Outbox::new(None)), Some(2));

        registry.release(4);
        registry.release(1);
        assert_eq!(registry.allocate(Outbox::new(None)), Some(1));
        assert_eq!(registry.allocate(Outbox::new(None)), Some(4));
    }

    #[test]
    fn test_rejected_allocation_leaves_no_state() {
        let registry = SessionRegistry::new();
        fill(&registry);
        let before = registry.sessions();

        assert_eq!(registry.allocate(Outbox::new(None)), None);
        assert_eq!(registry.sessions(), before);
    }

    #[test]
    fn test_address_binding_is_one_to_one() {
        let registry = SessionRegistry::new();
        fill(&registry);

        registry.bind_address(0, addr(7000)).unwrap();
        assert_eq!(
            registry.bind_address(1, addr(7000)),
            Err(BindError::AddressInUse {
                address: addr(7000),
                owner: 0
            })
        );

        // Rebinding moves the address instead of adding a second one.
        registry.bind_address(0, addr(7001)).unwrap();
        assert_eq!(registry.resolve(addr(7000)), None);
        assert_eq!(registry.resolve(addr(7001)), Some(0));

        registry.bind_address(1, addr(7000)).unwrap();
        assert_eq!(registry.resolve(addr(7000)), Some(1));

        assert_eq!(registry.release(1), Some(true));
        assert_eq!(registry.resolve(addr(7000)), None);
        assert_eq!(registry.release(1), None);
    }

    #[test]
    fn test_bind_requires_a_session() {
        let registry = SessionRegistry::new();
        assert_eq!(
            registry.bind_address(3, addr(7000)),
            Err(BindError::UnknownPlayer(3))
        );
    }

    #[test]
    fn test_unroutable_address_is_refused() {
        let registry = SessionRegistry::new();
        fill(&registry);

        assert_eq!(
            registry.bind_address(0, addr(0)),
            Err(BindError::Unroutable(addr(0)))
        );
        let unspecified: SocketAddr = "0.0.0.0:7000".parse().unwrap();
        assert_eq!(
            registry.bind_address(0, unspecified),
            Err(BindError::Unroutable(unspecified))
        );
        assert!(registry.joined_ids().is_empty());
    }

    #[test]
    fn test_stale_inputs_are_refused() {
        let registry = SessionRegistry::new();
        registry.allocate(Outbox::new(None));

        assert!(registry.accept_input(0, 100));
        assert!(!registry.accept_input(0, 100));
        assert!(!registry.accept_input(0, 99));
        assert!(registry.accept_input(0, 101));
        assert!(!registry.accept_input(3, 500));
    }

    #[test]
    fn test_broadcast_reaches_joined_players_only() {
        let registry = SessionRegistry::new();
        let outboxes = fill(&registry);
        registry.bind_address(0, addr(7000)).unwrap();
        registry.bind_address(2, addr(7002)).unwrap();
        registry.bind_address(3, addr(7003)).unwrap();

        let notice = Message::NewPlayer(PlayerNotice { player_id: 3 });
        assert_eq!(registry.broadcast(&notice, Some(3)).unwrap(), 2);

        let queued: Vec<usize> = outboxes.iter().map(Outbox::len).collect();
        assert_eq!(queued, vec![1, 0, 1, 0, 0]);
        assert_eq!(registry.joined_ids(), vec![0, 2, 3]);
        assert_eq!(
            registry.udp_targets(),
            vec![(0, addr(7000)), (2, addr(7002)), (3, addr(7003))]
        );
    }

    #[test]
    fn test_send_to_missing_player_is_a_no_op() {
        let registry = SessionRegistry::new();
        assert!(!registry.send(1, &Message::Ping).unwrap());

        let outbox = Outbox::new(None);
        registry.allocate(outbox.clone());
        assert!(registry.send(0, &Message::ServerAccept).unwrap());
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_chat_is_restamped_with_sender() {
        let forged = Chat {
            player_id: 4,
            text: "i am player four".to_string(),
        };
        let chat = restamp_chat(forged, 1);
        assert_eq!(chat.player_id, 1);
        assert_eq!(chat.text, "i am player four");
    }
}
