use core::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Error, Result};
use serde_bencode::value::Value;
use urlencoding::encode_binary;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
}

impl fmt::Display for TrackerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        })
    }
}

#[derive(Clone, Debug)]
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<TrackerEvent>,
}

impl AnnounceParams {
    fn to_query(&self) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            encode_binary(&self.info_hash),
            encode_binary(&self.peer_id),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
        );
        if let Some(event) = self.event {
            query.push_str(&format!("&event={event}"));
        }
        query
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackerResponse {
    pub peers: Vec<SocketAddr>,
    pub interval: Option<i64>,
}

/// Announce to the first tracker in `urls` that answers.
pub async fn announce(urls: &[String], params: &AnnounceParams) -> Result<TrackerResponse> {
    let mut last_err = Error::msg("no tracker urls");
    for url in urls {
        match announce_one(url, params).await {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                debug!("tracker {url}: {e:#}");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

async fn announce_one(url: &str, params: &AnnounceParams) -> Result<TrackerResponse> {
    let sep = if url.contains('?') { '&' } else { '?' };
    let url = format!("{url}{sep}{}", params.to_query());
    trace!("announce url: {url}");
    let resp = reqwest::get(&url).await.context("announce request error")?;
    let body = resp.bytes().await.context("announce body error")?;
    parse_response(&body)
}

fn parse_response(bytes: &[u8]) -> Result<TrackerResponse> {
    let dict = match serde_bencode::from_bytes(bytes).context("announce decode error")? {
        Value::Dict(d) => d,
        _ => return Err(Error::msg("announce response is not a dict")),
    };
    if let Some(Value::Bytes(reason)) = dict.get(b"failure reason".as_slice()) {
        return Err(Error::msg(format!(
            "tracker failure: {}",
            String::from_utf8_lossy(reason)
        )));
    }

    let mut peers = vec![];
    match dict.get(b"peers".as_slice()) {
        Some(Value::Bytes(compact)) => {
            for c in compact.chunks_exact(6) {
                let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
                let port = u16::from_be_bytes([c[4], c[5]]);
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
        }
        Some(Value::List(list)) => {
            for item in list {
                match peer_from_dict(item) {
                    Ok(peer) => peers.push(peer),
                    Err(e) => debug!("skipping tracker peer: {e:#}"),
                }
            }
        }
        _ => {}
    }
    if let Some(Value::Bytes(compact)) = dict.get(b"peers6".as_slice()) {
        for c in compact.chunks_exact(18) {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&c[..16]);
            let port = u16::from_be_bytes([c[16], c[17]]);
            peers.push(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port));
        }
    }

    let interval = match dict.get(b"interval".as_slice()) {
        Some(Value::Int(i)) => Some(*i),
        _ => None,
    };
    Ok(TrackerResponse { peers, interval })
}

fn peer_from_dict(value: &Value) -> Result<SocketAddr> {
    let dict = match value {
        Value::Dict(d) => d,
        _ => return Err(Error::msg("peer entry is not a dict")),
    };
    let ip = match dict.get(b"ip".as_slice()) {
        Some(Value::Bytes(ip)) => String::from_utf8_lossy(ip)
            .parse::<IpAddr>()
            .context("bad peer ip")?,
        _ => return Err(Error::msg("'ip' missing")),
    };
    let port = match dict.get(b"port".as_slice()) {
        Some(Value::Int(p)) => u16::try_from(*p).context("bad peer port")?,
        _ => return Err(Error::msg("'port' missing")),
    };
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn should_parse_compact_peers() {
        let resp = parse_response(
            b"d8:intervali1800e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x0a\x00\x00\x02\x1a\xe2e",
        )
        .unwrap();
        assert_eq!(resp.interval, Some(1800));
        assert_eq!(
            resp.peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.0.0.2:6882".parse().unwrap()
            ]
        );
    }

    #[test]
    fn should_parse_peer_list_form() {
        let resp = parse_response(
            b"d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eeee",
        )
        .unwrap();
        assert_eq!(resp.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn should_parse_ipv6_peers() {
        let mut body = b"d6:peers618:".to_vec();
        body.extend_from_slice(&[0u8; 15]);
        body.push(1);
        body.extend_from_slice(&[0x1a, 0xe1]);
        body.push(b'e');
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.peers, vec!["[::1]:6881".parse().unwrap()]);
        assert_eq!(resp.interval, None);
    }

    #[test]
    fn should_surface_tracker_failure() {
        let err = parse_response(b"d14:failure reason4:nopee").unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn should_escape_binary_query_params() {
        let params = AnnounceParams {
            info_hash: [0xff; 20],
            peer_id: *b"-BS0001-123456abcdef",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 42,
            event: Some(TrackerEvent::Started),
        };
        let query = params.to_query();
        assert!(query.contains(&"%FF".repeat(20)));
        assert!(query.contains("&left=42"));
        assert!(query.ends_with("&event=started"));
    }
}
