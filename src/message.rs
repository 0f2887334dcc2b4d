use std::collections::BTreeMap;

use anyhow::{ensure, Context, Error, Result};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
};

pub const PROTOCOL: &str = "BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;
/// Message-type tag of extension-protocol frames.
pub const MSG_EXTENSION: u8 = 20;
/// Extension sub-identifier of the extension handshake itself.
pub const EXT_HANDSHAKE_ID: u8 = 0;
const MAX_FRAME_LEN: usize = 256 << 10;

/// Reserved-flag bits negotiated in the handshake.
pub enum Feature {
    Dht,
    Extension,
}

impl Feature {
    fn bit(&self) -> (usize, u8) {
        match self {
            Feature::Dht => (7, 0x01),
            Feature::Extension => (5, 0x10),
        }
    }

    pub fn enable(&self, reserved: &mut [u8; 8]) {
        let (i, b) = self.bit();
        reserved[i] |= b;
    }

    pub fn enabled(&self, reserved: &[u8; 8]) -> bool {
        let (i, b) = self.bit();
        reserved[i] & b != 0
    }
}

/// The fixed 68-byte handshake prelude.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Our side of the handshake: DHT and extension protocol advertised,
    /// the share's public identifier in the info-hash field.
    pub fn local(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        let mut reserved = [0u8; 8];
        Feature::Dht.enable(&mut reserved);
        Feature::Extension.enable(&mut reserved);
        Handshake { reserved, info_hash, peer_id }
    }
}

impl From<&Handshake> for Vec<u8> {
    fn from(value: &Handshake) -> Self {
        [
            &[PROTOCOL.len() as u8][..],
            PROTOCOL.as_bytes(),
            &value.reserved,
            &value.info_hash,
            &value.peer_id,
        ]
        .concat()
    }
}

impl TryFrom<&[u8]> for Handshake {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        ensure!(value.len() == HANDSHAKE_LEN, "invalid handshake len: {}", value.len());
        ensure!(value[0] == PROTOCOL.len() as u8, "invalid pstrlen: {}", value[0]);
        ensure!(
            &value[1..20] == PROTOCOL.as_bytes(),
            "invalid protocol string: {}",
            hex::encode(&value[1..20])
        );
        let mut handshake = Handshake {
            reserved: [0u8; 8],
            info_hash: [0u8; 20],
            peer_id: [0u8; 20],
        };
        handshake.reserved.copy_from_slice(&value[20..28]);
        handshake.info_hash.copy_from_slice(&value[28..48]);
        handshake.peer_id.copy_from_slice(&value[48..68]);
        Ok(handshake)
    }
}

/// Read one length-prefixed frame. An empty payload is a keep-alive.
pub async fn read_frame(stream: &mut OwnedReadHalf) -> Result<Vec<u8>> {
    let mut len_p = [0u8; 4];
    stream.read_exact(&mut len_p).await.context("frame length read error")?;
    let len = u32::from_be_bytes(len_p) as usize;
    if len == 0 {
        return Ok(vec![]);
    }
    ensure!(len <= MAX_FRAME_LEN, "frame length {len} over limit");
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.context("frame payload read error")?;
    Ok(payload)
}

pub async fn write_frame(stream: &mut OwnedWriteHalf, payload: &[u8]) -> Result<()> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await.context("frame write error")?;
    Ok(())
}

/// Payload of an extension-protocol frame: tag, sub-identifier, body.
pub fn extension_frame(ext_id: u8, body: &[u8]) -> Vec<u8> {
    [&[MSG_EXTENSION, ext_id][..], body].concat()
}

/// Extension handshake body: `m` maps extension names to the codes the
/// sender assigned them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtensionHandshake {
    pub m: BTreeMap<String, u8>,
}

/// The gossiped "current info-hash" message, also the on-disk form of the
/// `current` marker. The `sig` field is carried but never populated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IhMessage {
    pub info: IhInfo,
    pub port: i64,
    #[serde(default, with = "serde_bytes")]
    pub sig: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IhInfo {
    #[serde(with = "serde_bytes")]
    pub infohash: Vec<u8>,
    pub rev: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn should_build_68_byte_handshake() {
        let handshake = Handshake::local([1u8; 20], [2u8; 20]);
        let packet: Vec<u8> = (&handshake).into();
        assert_eq!(packet.len(), HANDSHAKE_LEN);
        assert_eq!(packet[0], 19);
        assert_eq!(&packet[1..20], PROTOCOL.as_bytes());
        assert_eq!(packet[20 + 7] & 0x01, 0x01);
        assert_eq!(packet[20 + 5] & 0x10, 0x10);
        assert_eq!(&packet[28..48], &[1u8; 20]);
        assert_eq!(&packet[48..68], &[2u8; 20]);
        assert_eq!(Handshake::try_from(packet.as_slice()).unwrap(), handshake);
    }

    #[test]
    fn should_reject_foreign_handshakes() {
        let mut packet: Vec<u8> = (&Handshake::local([1u8; 20], [2u8; 20])).into();
        assert!(Handshake::try_from(&packet[..67]).is_err());
        packet[0] = 18;
        assert!(Handshake::try_from(packet.as_slice()).is_err());
        packet[0] = 19;
        packet[5] ^= 0xff;
        assert!(Handshake::try_from(packet.as_slice()).is_err());
    }

    #[test]
    fn should_frame_extension_payloads() {
        let frame = extension_frame(7, b"body");
        assert_eq!(frame, [&[20u8, 7][..], b"body"].concat());
    }

    #[test]
    fn should_roundtrip_extension_handshake() {
        let handshake = ExtensionHandshake {
            m: BTreeMap::from([("bs_metadata".to_string(), 2), ("ut_pex".to_string(), 1)]),
        };
        let bytes = serde_bencode::to_bytes(&handshake).unwrap();
        assert_eq!(
            bytes,
            b"d1:md11:bs_metadatai2e6:ut_pexi1eee".to_vec()
        );
        let decoded: ExtensionHandshake = serde_bencode::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn should_roundtrip_ih_message() {
        let msg = IhMessage {
            info: IhInfo { infohash: vec![0xab; 20], rev: "3-cafe".into() },
            port: 6881,
            sig: vec![],
        };
        let bytes = serde_bencode::to_bytes(&msg).unwrap();
        let decoded: IhMessage = serde_bencode::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
        // sorted keys: info before port before sig
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("d4:infod8:infohash20:"));
    }
}
