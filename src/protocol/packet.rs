use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};

use crate::crypto::identity::{Address, SharedSecret};
use crate::error::OverlayError;
use crate::protocol::Verb;

/// Byte offset of the packet id
pub const IDX_PACKET_ID: usize = 0;

/// Byte offset of the destination address
pub const IDX_DEST: usize = 8;

/// Byte offset of the source address
pub const IDX_SRC: usize = 13;

/// Byte offset of the flags byte
pub const IDX_FLAGS: usize = 18;

/// Byte offset of the authentication tag
pub const IDX_TAG: usize = 19;

/// Byte offset of the verb
pub const IDX_VERB: usize = 35;

/// Byte offset of the first payload byte
pub const IDX_PAYLOAD: usize = 36;

/// Smallest structurally valid packet
pub const HEADER_LENGTH: usize = IDX_PAYLOAD;

/// Flag bit: verb and payload are encrypted
const FLAG_ENCRYPTED: u8 = 0x01;

/// An overlay packet under construction or decode.
///
/// Layout: `packet_id(8) | dest(5) | src(5) | flags(1) | tag(16) | verb(1) |
/// payload`. All integers are big-endian. `armor` authenticates the whole
/// packet and, unless the packet must stay readable before key agreement
/// (HELLO), encrypts everything from the verb onward.
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// Start a new outbound packet
    pub fn new(packet_id: u64, dest: &Address, src: &Address, verb: Verb) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&packet_id.to_be_bytes());
        buf.extend_from_slice(dest.as_bytes());
        buf.extend_from_slice(src.as_bytes());
        buf.push(0); // flags, set by armor()
        buf.extend_from_slice(&[0u8; 16]); // tag, set by armor()
        buf.push(verb as u8);
        Self { buf }
    }

    /// Wrap received bytes for dearmoring
    pub fn from_bytes(data: &[u8]) -> Result<Self, OverlayError> {
        if data.len() < HEADER_LENGTH {
            return Err(OverlayError::InvalidPacket(format!(
                "{} bytes is below the minimum packet size",
                data.len()
            )));
        }
        Ok(Self { buf: data.to_vec() })
    }

    /// Total packet length in bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True only for a buffer below the header size (never for built packets)
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The full packet bytes
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// The payload bytes after the header
    pub fn payload(&self) -> &[u8] {
        &self.buf[IDX_PAYLOAD..]
    }

    /// The packet id
    pub fn packet_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.buf[IDX_PACKET_ID..IDX_PACKET_ID + 8]);
        u64::from_be_bytes(id)
    }

    /// The verb byte, decoded. Meaningless on an encrypted packet until
    /// `dearmor` has run.
    pub fn verb(&self) -> Option<Verb> {
        Verb::from_u8(self.buf[IDX_VERB])
    }

    /// Append a single byte
    pub fn append_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Append a big-endian u16
    pub fn append_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a big-endian u64
    pub fn append_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append raw bytes
    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Overwrite a big-endian u16 written earlier (count back-patching)
    pub fn set_u16_at(&mut self, idx: usize, value: u16) {
        self.buf[idx..idx + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// Authenticate the packet with the shared key, encrypting the verb and
    /// payload unless `encrypt` is false
    pub fn armor(&mut self, key: &SharedSecret, encrypt: bool) {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let nonce_bytes = self.nonce(if encrypt { FLAG_ENCRYPTED } else { 0 });
        let nonce = Nonce::from_slice(&nonce_bytes);
        self.buf[IDX_FLAGS] = if encrypt { FLAG_ENCRYPTED } else { 0 };

        let tag = if encrypt {
            let (head, rest) = self.buf.split_at_mut(IDX_TAG);
            let body = &mut rest[16..];
            // Cannot fail: detached AEAD over an in-memory buffer
            cipher
                .encrypt_in_place_detached(nonce, head, body)
                .expect("AEAD encryption failed")
        } else {
            let aad = self.authenticated_bytes();
            cipher
                .encrypt_in_place_detached(nonce, &aad, &mut [])
                .expect("AEAD authentication failed")
        };
        self.buf[IDX_TAG..IDX_VERB].copy_from_slice(&tag);
    }

    /// Verify the packet with the shared key and decrypt it if needed
    pub fn dearmor(&mut self, key: &SharedSecret) -> Result<(), OverlayError> {
        if self.buf.len() < HEADER_LENGTH {
            return Err(OverlayError::InvalidPacket("truncated header".to_string()));
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let flags = self.buf[IDX_FLAGS];
        let nonce_bytes = self.nonce(flags);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let tag = Tag::clone_from_slice(&self.buf[IDX_TAG..IDX_VERB]);

        if (flags & FLAG_ENCRYPTED) != 0 {
            let (head, rest) = self.buf.split_at_mut(IDX_TAG);
            let body = &mut rest[16..];
            cipher
                .decrypt_in_place_detached(nonce, head, body, &tag)
                .map_err(|_| OverlayError::AuthenticationFailed)
        } else {
            let aad = self.authenticated_bytes();
            cipher
                .decrypt_in_place_detached(nonce, &aad, &mut [], &tag)
                .map_err(|_| OverlayError::AuthenticationFailed)
        }
    }

    /// Everything the cleartext MAC covers: the header minus the tag slot,
    /// then verb and payload
    fn authenticated_bytes(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.buf.len() - 16);
        aad.extend_from_slice(&self.buf[..IDX_TAG]);
        aad.extend_from_slice(&self.buf[IDX_VERB..]);
        aad
    }

    /// Per-packet nonce from the packet id and the cipher flags
    fn nonce(&self, flags: u8) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.buf[IDX_PACKET_ID..IDX_PACKET_ID + 8]);
        nonce[8] = flags;
        nonce
    }
}
