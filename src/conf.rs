//! This module defines the tunables of the client and its parts.

use std::time::Duration;

use rand::Rng;

use crate::PeerId;

/// The Azureus style prefix of every peer id this client generates.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-LT0010-";

/// The port reported to the tracker in the announce request.
pub const DEFAULT_PORT: u16 = 6881;

/// The number of requests a session keeps outstanding to a peer to saturate
/// the link.
pub const MAX_PIPELINED_REQUESTS: usize = 5;

/// How long to wait for a TCP connection to a peer to be established.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// A peer that doesn't send anything for this long is considered dead and its
/// session is torn down.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(130);

/// A keep-alive frame is written whenever this much time passes without any
/// other write on the connection.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// The number of pieces failing hash verification after which a session gives
/// up on its peer.
pub const MAX_HASH_FAILURES: usize = 15;

/// Until this many pieces have been started, the picker chooses pieces at
/// random to diversify the early swarm instead of going rarest first.
pub const WARMUP_PIECE_COUNT: usize = 5;

/// Generates a peer id consisting of the client prefix and a random
/// alphanumeric suffix.
pub fn generate_peer_id() -> PeerId {
    let mut id = [0; 20];
    id[..CLIENT_ID_PREFIX.len()].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id.iter_mut().skip(CLIENT_ID_PREFIX.len()) {
        *b = rng.sample(rand::distributions::Alphanumeric);
    }
    id
}
