//! The registry of live peer sessions of a torrent.
//!
//! Sessions register themselves by their remote address and receive the
//! swarm wide notifications (have and cancel broadcasts, shutdown) over
//! their command channels. Broadcasts are best effort per session: a session
//! whose channel is gone is simply dropped from the registry.

use std::{collections::HashMap, sync::Mutex};

use crate::{
    peer::{Command, Sender},
    BlockInfo, PieceIndex,
};

#[derive(Default)]
pub struct Swarm {
    peers: Mutex<HashMap<String, Sender>>,
}

impl Swarm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: String, chan: Sender) {
        self.peers.lock().unwrap().insert(key, chan);
    }

    pub fn remove(&self, key: &str) {
        self.peers.lock().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().unwrap().is_empty()
    }

    /// Tells every session except the one that completed the piece to send a
    /// have message for it.
    pub fn broadcast_have(&self, index: PieceIndex, except: &str) {
        self.broadcast(Command::Have(index), except);
    }

    /// Tells every session except the one that received the block to
    /// withdraw any outstanding request it has for it. Only sessions that
    /// picked the block under endgame have one.
    pub fn broadcast_cancel(&self, block: BlockInfo, except: &str) {
        self.broadcast(Command::Cancel(block), except);
    }

    fn broadcast(&self, cmd: Command, except: &str) {
        let mut peers = self.peers.lock().unwrap();
        peers.retain(|key, chan| {
            if key == except {
                return true;
            }
            if chan.send(cmd).is_err() {
                log::debug!("Dropping dead session {} from swarm", key);
                return false;
            }
            true
        });
    }

    /// Tells every registered session to stop.
    pub fn shutdown(&self) {
        log::info!("Shutting down swarm");
        let peers = self.peers.lock().unwrap();
        for chan in peers.values() {
            // sessions deregister themselves as they wind down
            let _ = chan.send(Command::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn test_broadcast_skips_the_completing_session() {
        let swarm = Swarm::new();
        let (first_chan, mut first_port) = mpsc::unbounded_channel();
        let (second_chan, mut second_port) = mpsc::unbounded_channel();
        swarm.add("peer1".into(), first_chan);
        swarm.add("peer2".into(), second_chan);

        swarm.broadcast_have(3, "peer1");

        assert!(first_port.try_recv().is_err());
        assert!(matches!(
            second_port.try_recv().unwrap(),
            Command::Have(3)
        ));
    }

    #[test]
    fn test_broadcast_drops_dead_sessions() {
        let swarm = Swarm::new();
        let (first_chan, first_port) = mpsc::unbounded_channel();
        let (second_chan, mut second_port) = mpsc::unbounded_channel();
        swarm.add("peer1".into(), first_chan);
        swarm.add("peer2".into(), second_chan);
        drop(first_port);

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 0x4000,
        };
        swarm.broadcast_cancel(block, "peer3");

        assert_eq!(swarm.len(), 1);
        assert!(matches!(
            second_port.try_recv().unwrap(),
            Command::Cancel(b) if b == block
        ));
    }

    #[test]
    fn test_shutdown_reaches_every_session() {
        let swarm = Swarm::new();
        let (first_chan, mut first_port) = mpsc::unbounded_channel();
        let (second_chan, mut second_port) = mpsc::unbounded_channel();
        swarm.add("peer1".into(), first_chan);
        swarm.add("peer2".into(), second_chan);

        swarm.shutdown();

        assert!(matches!(first_port.try_recv().unwrap(), Command::Shutdown));
        assert!(matches!(second_port.try_recv().unwrap(), Command::Shutdown));
    }
}
