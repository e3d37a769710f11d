// SPDX-FileCopyrightText: Copyright (c) 2026 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte-stream transform stages applied around the DTU socket.
//!
//! Outbound chunks are zero padded to the cipher block size and CBC
//! encrypted; inbound chunks are decrypted and trimmed back to the
//! declared Modbus length. The cipher primitives run without automatic
//! padding, so the DTU only has to strip trailing zeros (or nothing at
//! all, since a well-formed MBAP header declares the real length).
//!
//! Cipher state is owned by one connection and discarded with it; a
//! reconnecting DTU always starts a fresh CBC chain from the
//! configured IV.

use aes::Aes128;
use bytes::BytesMut;
use cbc::cipher::{Block, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use des::TdesEde3;

use crate::{
    config::{Encryption, GatewayConfig},
    frame, Error, Result,
};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Des3CbcEnc = cbc::Encryptor<TdesEde3>;
type Des3CbcDec = cbc::Decryptor<TdesEde3>;

/// Gateway to DTU direction: padding stage followed by the cipher.
pub(crate) enum Outbound {
    Passthrough,
    Aes(Aes128CbcEnc),
    Des3(Des3CbcEnc),
}

/// DTU to gateway direction: decipher followed by the Modbus trim.
pub(crate) enum Inbound {
    Passthrough,
    Aes(Aes128CbcDec),
    Des3(Des3CbcDec),
}

impl Outbound {
    pub(crate) fn new(config: &GatewayConfig) -> Result<Self> {
        Ok(match config.dtu_encryption {
            Encryption::None => Self::Passthrough,
            Encryption::Aes => Self::Aes(new_cipher(config)?),
            Encryption::Des3 => Self::Des3(new_cipher(config)?),
        })
    }

    /// Zero pads `chunk` to the cipher block size, then encrypts it in
    /// place. Passthrough mode forwards the chunk untouched.
    pub(crate) fn transform(&mut self, chunk: &mut BytesMut) {
        match self {
            Self::Passthrough => {}
            Self::Aes(cipher) => {
                pad(chunk, Encryption::Aes.block_size());
                encrypt_in_place(cipher, chunk);
            }
            Self::Des3(cipher) => {
                pad(chunk, Encryption::Des3.block_size());
                encrypt_in_place(cipher, chunk);
            }
        }
    }
}

impl Inbound {
    pub(crate) fn new(config: &GatewayConfig) -> Result<Self> {
        Ok(match config.dtu_encryption {
            Encryption::None => Self::Passthrough,
            Encryption::Aes => Self::Aes(new_cipher(config)?),
            Encryption::Des3 => Self::Des3(new_cipher(config)?),
        })
    }

    /// Decrypts `chunk` in place and drops the zero padding after the
    /// declared Modbus length. Payloads that do not look like Modbus
    /// (the registration code) are left untrimmed.
    pub(crate) fn transform(&mut self, chunk: &mut BytesMut) {
        match self {
            Self::Passthrough => return,
            Self::Aes(cipher) => decrypt_in_place(cipher, chunk),
            Self::Des3(cipher) => decrypt_in_place(cipher, chunk),
        }
        frame::trim_to_declared_len(chunk);
    }
}

fn new_cipher<C: KeyIvInit>(config: &GatewayConfig) -> Result<C> {
    let key = config.cipher_key()?;
    let iv = config.cipher_iv()?;
    C::new_from_slices(key, iv).map_err(|_| Error::InvalidKeyMaterial {
        name: "key",
        expected: config.dtu_encryption.key_size(),
        actual: key.len(),
    })
}

fn pad(chunk: &mut BytesMut, block_size: usize) {
    let rem = chunk.len() % block_size;
    if rem != 0 {
        chunk.resize(chunk.len() + block_size - rem, 0);
    }
}

fn encrypt_in_place<C: BlockEncryptMut>(cipher: &mut C, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(C::block_size()) {
        cipher.encrypt_block_mut(Block::<C>::from_mut_slice(block));
    }
}

// A trailing partial block is passed through as-is; a conforming DTU
// only ever sends whole cipher blocks.
fn decrypt_in_place<C: BlockDecryptMut>(cipher: &mut C, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(C::block_size()) {
        cipher.decrypt_block_mut(Block::<C>::from_mut_slice(block));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: [u8; 12] = [
        0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x20, 0x00, 0x00, 0x01,
    ];

    fn config(mode: Encryption) -> GatewayConfig {
        let (key, iv) = match mode {
            Encryption::None => (None, None),
            Encryption::Aes => (Some("0123456789abcdef"), Some("fedcba9876543210")),
            Encryption::Des3 => (Some("0123456789abcdef01234567"), Some("76543210")),
        };
        GatewayConfig {
            dtu_encryption: mode,
            dtu_encryption_key: key.map(String::from),
            dtu_encryption_iv: iv.map(String::from),
            ..GatewayConfig::default()
        }
    }

    fn round_trip(mode: Encryption, payload: &[u8]) -> BytesMut {
        let config = config(mode);
        let mut outbound = Outbound::new(&config).unwrap();
        let mut inbound = Inbound::new(&config).unwrap();
        let mut chunk = BytesMut::from(payload);
        outbound.transform(&mut chunk);
        if mode != Encryption::None {
            assert_eq!(chunk.len() % mode.block_size(), 0);
            assert_ne!(&chunk[..payload.len().min(chunk.len())], payload);
        }
        inbound.transform(&mut chunk);
        chunk
    }

    #[test]
    fn aes_round_trip_restores_frame() {
        assert_eq!(&round_trip(Encryption::Aes, &REQUEST)[..], &REQUEST);
    }

    #[test]
    fn des3_round_trip_restores_frame() {
        assert_eq!(&round_trip(Encryption::Des3, &REQUEST)[..], &REQUEST);
    }

    #[test]
    fn passthrough_is_identity() {
        assert_eq!(&round_trip(Encryption::None, &REQUEST)[..], &REQUEST);
    }

    #[test]
    fn registration_code_survives_untrimmed() {
        // Not a Modbus frame, so the zero padding must be preserved.
        let code = b"7CA5D4033591 random1";
        let decrypted = round_trip(Encryption::Aes, code);
        assert_eq!(decrypted.len(), 32);
        assert_eq!(&decrypted[..code.len()], code);
        assert!(decrypted[code.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn aligned_chunk_is_not_padded() {
        let config = config(Encryption::Aes);
        let mut outbound = Outbound::new(&config).unwrap();
        let mut chunk = BytesMut::from(&[0x55u8; 32][..]);
        outbound.transform(&mut chunk);
        assert_eq!(chunk.len(), 32);
    }

    #[test]
    fn cbc_state_chains_across_chunks() {
        let config = config(Encryption::Des3);
        let mut outbound = Outbound::new(&config).unwrap();
        let mut inbound = Inbound::new(&config).unwrap();
        for _ in 0..3 {
            let mut chunk = BytesMut::from(&REQUEST[..]);
            outbound.transform(&mut chunk);
            inbound.transform(&mut chunk);
            assert_eq!(&chunk[..], &REQUEST);
        }
    }

    #[test]
    fn missing_key_is_rejected() {
        let config = GatewayConfig {
            dtu_encryption_key: None,
            ..config(Encryption::Aes)
        };
        assert!(matches!(
            Outbound::new(&config),
            Err(Error::MissingKeyMaterial("key"))
        ));
    }
}
