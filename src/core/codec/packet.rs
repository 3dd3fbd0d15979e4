//! AES-CTR framing for the UDP audio channel.
//!
//! Datagram layout, both directions:
//!
//! ```text
//! 0      1      2        4               12        16
//! +------+------+--------+---------------+---------+----------------+
//! | 0x01 | 0x00 | len be | base nonce(8) | seq be  | ciphertext ... |
//! +------+------+--------+---------------+---------+----------------+
//! ```
//!
//! The 16-byte header doubles as the CTR IV. The base nonce is
//! `conn_id(4) || created_at(4)`, so the conn-id sits at bytes `4..8` of every packet.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use aes::Aes128;
use bytes::{BufMut, Bytes, BytesMut};
use ctr::cipher::{KeyIvInit, StreamCipher};

use super::CodecError;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub const NONCE_LEN: usize = 16;
pub const KEY_LEN: usize = 16;
pub const CONN_ID_LEN: usize = 4;
const PACKET_TYPE_AUDIO: u8 = 0x01;

/// Per-session cipher state for one UDP flow.
#[derive(Debug)]
pub struct UdpCipher {
    key: [u8; KEY_LEN],
    base_nonce: [u8; 8],
    local_seq: AtomicU32,
    remote_seq: AtomicU32,
}

impl UdpCipher {
    /// Fresh random key and conn-id, stamped with the current unix time.
    pub fn generate() -> Self {
        let key: [u8; KEY_LEN] = rand::random();
        let conn_id: [u8; CONN_ID_LEN] = rand::random();
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        Self::new(key, conn_id, created_at)
    }

    pub fn new(key: [u8; KEY_LEN], conn_id: [u8; CONN_ID_LEN], created_at: u32) -> Self {
        let mut base_nonce = [0u8; 8];
        base_nonce[..4].copy_from_slice(&conn_id);
        base_nonce[4..].copy_from_slice(&created_at.to_be_bytes());
        Self {
            key,
            base_nonce,
            local_seq: AtomicU32::new(0),
            remote_seq: AtomicU32::new(0),
        }
    }

    pub fn conn_id(&self) -> [u8; CONN_ID_LEN] {
        let mut id = [0u8; CONN_ID_LEN];
        id.copy_from_slice(&self.base_nonce[..CONN_ID_LEN]);
        id
    }

    pub fn conn_id_hex(&self) -> String {
        hex::encode(self.conn_id())
    }

    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }

    /// The nonce template handed to the device in `hello`: `01 00 00 00 || base || 00000000`.
    pub fn full_nonce_hex(&self) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[0] = PACKET_TYPE_AUDIO;
        nonce[4..12].copy_from_slice(&self.base_nonce);
        hex::encode(nonce)
    }

    pub fn local_seq(&self) -> u32 {
        self.local_seq.load(Ordering::Acquire)
    }

    pub fn remote_seq(&self) -> u32 {
        self.remote_seq.load(Ordering::Acquire)
    }

    /// Seal one Opus frame into a datagram. Each call consumes the next sequence number.
    pub fn encrypt(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        let len = u16::try_from(payload.len())
            .map_err(|_| CodecError::UnsupportedFormat(format!("payload of {} bytes", payload.len())))?;
        let seq = self.local_seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1);

        let mut nonce = [0u8; NONCE_LEN];
        nonce[0] = PACKET_TYPE_AUDIO;
        nonce[2..4].copy_from_slice(&len.to_be_bytes());
        nonce[4..12].copy_from_slice(&self.base_nonce);
        nonce[12..16].copy_from_slice(&seq.to_be_bytes());

        let mut body = payload.to_vec();
        let mut cipher = Aes128Ctr::new((&self.key).into(), (&nonce).into());
        cipher.apply_keystream(&mut body);

        let mut out = BytesMut::with_capacity(NONCE_LEN + body.len());
        out.put_slice(&nonce);
        out.put_slice(&body);
        Ok(out.freeze())
    }

    /// Open a datagram. Rejects packets whose length field disagrees with the
    /// ciphertext or whose nonce was not minted for this session.
    pub fn decrypt(&self, datagram: &[u8]) -> Result<Vec<u8>, CodecError> {
        if datagram.len() < NONCE_LEN {
            return Err(CodecError::PacketTooShort(datagram.len()));
        }
        let (nonce, ciphertext) = datagram.split_at(NONCE_LEN);

        let declared = u16::from_be_bytes([nonce[2], nonce[3]]) as usize;
        if declared != ciphertext.len() {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: ciphertext.len(),
            });
        }
        if nonce[4..12] != self.base_nonce {
            return Err(CodecError::NonceMismatch);
        }

        let seq = u32::from_be_bytes([nonce[12], nonce[13], nonce[14], nonce[15]]);
        let previous = self.remote_seq.fetch_max(seq, Ordering::AcqRel);
        if seq <= previous && previous != 0 {
            tracing::debug!(seq, previous, "UDP packet arrived out of order");
        }

        let mut iv = [0u8; NONCE_LEN];
        iv.copy_from_slice(nonce);
        let mut plain = ciphertext.to_vec();
        let mut cipher = Aes128Ctr::new((&self.key).into(), (&iv).into());
        cipher.apply_keystream(&mut plain);
        Ok(plain)
    }
}

/// Conn-id carried at bytes `4..8` of a datagram, used before the remote address is bound.
pub fn conn_id_of(datagram: &[u8]) -> Option<String> {
    if datagram.len() < NONCE_LEN {
        return None;
    }
    Some(hex::encode(&datagram[4..4 + CONN_ID_LEN]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> UdpCipher {
        UdpCipher::new([7u8; KEY_LEN], [0xde, 0xad, 0xbe, 0xef], 0x6500_0000)
    }

    #[test]
    fn test_round_trip_is_bit_exact() {
        let cipher = cipher();
        let frame = b"opus frame bytes \x00\x01\x02".to_vec();

        let packet = cipher.encrypt(&frame).unwrap();
        assert_eq!(packet.len(), NONCE_LEN + frame.len());
        assert_ne!(&packet[NONCE_LEN..], frame.as_slice());
        assert_eq!(cipher.decrypt(&packet).unwrap(), frame);
    }

    #[test]
    fn test_nonce_layout_and_sequence() {
        let cipher = cipher();
        let first = cipher.encrypt(&[1, 2, 3]).unwrap();
        let second = cipher.encrypt(&[4, 5, 6]).unwrap();

        assert_eq!(first[0], 0x01);
        assert_eq!(first[1], 0x00);
        assert_eq!(&first[2..4], &3u16.to_be_bytes());
        assert_eq!(&first[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&first[8..12], &0x6500_0000u32.to_be_bytes());
        assert_eq!(&first[12..16], &1u32.to_be_bytes());
        assert_eq!(&second[12..16], &2u32.to_be_bytes());
        assert_eq!(cipher.local_seq(), 2);
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let cipher = cipher();
        let mut packet = cipher.encrypt(&[9; 10]).unwrap().to_vec();
        packet.push(0);
        assert!(matches!(
            cipher.decrypt(&packet),
            Err(CodecError::LengthMismatch { declared: 10, actual: 11 })
        ));
    }

    #[test]
    fn test_rejects_foreign_nonce() {
        let ours = cipher();
        let theirs = UdpCipher::new([7u8; KEY_LEN], [1, 2, 3, 4], 0x6500_0000);
        let packet = theirs.encrypt(&[1, 2, 3]).unwrap();
        assert!(matches!(ours.decrypt(&packet), Err(CodecError::NonceMismatch)));
    }

    #[test]
    fn test_rejects_short_packet() {
        assert!(matches!(
            cipher().decrypt(&[0u8; 8]),
            Err(CodecError::PacketTooShort(8))
        ));
    }

    #[test]
    fn test_remote_sequence_tracks_maximum() {
        let sender = cipher();
        let receiver = cipher();
        let a = sender.encrypt(&[1]).unwrap();
        let b = sender.encrypt(&[2]).unwrap();

        receiver.decrypt(&b).unwrap();
        receiver.decrypt(&a).unwrap();
        assert_eq!(receiver.remote_seq(), 2);
    }

    #[test]
    fn test_full_nonce_hex_and_conn_id() {
        let cipher = cipher();
        assert_eq!(
            cipher.full_nonce_hex(),
            "01000000deadbeef6500000000000000"
        );
        assert_eq!(cipher.conn_id_hex(), "deadbeef");

        let packet = cipher.encrypt(&[0]).unwrap();
        assert_eq!(conn_id_of(&packet).as_deref(), Some("deadbeef"));
        assert_eq!(cipher.key_hex().len(), 32);
    }

    #[test]
    fn test_generate_is_random() {
        let a = UdpCipher::generate();
        let b = UdpCipher::generate();
        assert_ne!(a.key_hex(), b.key_hex());
    }
}
