//! The tracker announce: one HTTP GET that reports our download state and
//! returns the swarm's peers.

use std::net::{SocketAddr, ToSocketAddrs};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_derive::Deserialize;
use url::Url;

use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// Everything that goes into the announce request's query string.
pub struct AnnounceParams {
    /// The tracker's announce URL from the metainfo.
    pub url: String,
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port we would accept connections on. We never do, but the key is
    /// mandatory.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// The number of bytes still missing from the download.
    pub left: u64,
}

#[derive(Debug)]
pub struct AnnounceResponse {
    /// How long the tracker wants us to wait before announcing again, in
    /// seconds.
    pub interval: u64,
    /// The resolved addresses of the swarm's peers.
    pub peers: Vec<SocketAddr>,
}

/// The raw bencoded response; peers come as a list of dictionaries.
#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default, rename = "failure reason", alias = "failure")]
    failure: Option<String>,
    interval: Option<u64>,
    peers: Option<Vec<RawPeer>>,
}

#[derive(Debug, Deserialize)]
struct RawPeer {
    /// The peer's self-reported id. Present in the non-compact format but
    /// nothing here needs it.
    #[serde(default, rename = "peer id")]
    #[allow(dead_code)]
    peer_id: Option<serde_bytes::ByteBuf>,
    ip: String,
    port: u16,
}

/// Announces to the tracker and returns the peers it knows about.
///
/// A tracker that answers with a failure reason surfaces as
/// [`Error::TrackerFailure`]; unresolvable peer addresses are skipped.
pub async fn announce(params: &AnnounceParams) -> Result<AnnounceResponse> {
    let url = announce_url(params)?;
    log::info!("Announcing to tracker {}", params.url);
    log::debug!("Announce URL: {}", url);

    let response = reqwest::get(url).await?;
    let body = response.bytes().await?;
    let raw: RawResponse = serde_bencode::from_bytes(&body)?;

    if let Some(reason) = raw.failure {
        return Err(Error::TrackerFailure(reason));
    }

    let mut peers = Vec::new();
    for peer in raw.peers.unwrap_or_default() {
        // the ip key may hold a host name, so go through the resolver
        match (peer.ip.as_str(), peer.port).to_socket_addrs() {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    peers.push(addr);
                }
            }
            Err(e) => log::warn!(
                "Skipping unresolvable peer {}:{}: {}",
                peer.ip,
                peer.port,
                e
            ),
        }
    }
    log::info!("Tracker returned {} peer(s)", peers.len());

    Ok(AnnounceResponse {
        interval: raw.interval.unwrap_or_default(),
        peers,
    })
}

/// Builds the announce URL by hand: the info hash and peer id are raw 20
/// byte strings that must be percent encoded, which typed query APIs don't
/// do for arbitrary bytes.
fn announce_url(params: &AnnounceParams) -> Result<String> {
    // validate early so a bad metainfo doesn't surface as an http error
    Url::parse(&params.url)
        .map_err(|_| Error::InvalidMetainfo("announce url is invalid"))?;
    let separator = if params.url.contains('?') { '&' } else { '?' };
    Ok(format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}",
        params.url,
        separator,
        percent_encode(&params.info_hash, NON_ALPHANUMERIC),
        percent_encode(&params.peer_id, NON_ALPHANUMERIC),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
    ))
}
