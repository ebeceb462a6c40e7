//! Cryptographic primitives for KNX IP Secure.
//!
//! KNX IP Secure uses a CCM construction on AES-128: a CBC-MAC over a
//! nonce block, the associated data and the payload, with the MAC and
//! payload then encrypted in CTR mode. The 14-byte nonce is the
//! wrapper's sequence information, serial number and message tag; the
//! session key is derived from the X25519 shared secret with SHA-256.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;
use sha2::{Digest, Sha256};

use crate::error::{KnxError, Result};
use crate::protocol::secure::{encode_u48, MAC_LENGTH};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// AES block size in octets
const BLOCK_SIZE: usize = 16;

/// Counter block used when only a MAC is encrypted during session setup
const CTR0_HANDSHAKE: [u8; 16] =
    [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x00];

/// Derive the 16-octet session key from an ECDH shared secret.
pub(crate) fn derive_session_key(shared_secret: &[u8]) -> [u8; 16] {
    let digest = Sha256::digest(shared_secret);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// CBC-MAC with a zero IV over zero-padded input blocks.
fn cbc_mac(key: &[u8; 16], input: &[u8]) -> [u8; MAC_LENGTH] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut state = [0u8; BLOCK_SIZE];
    for chunk in input.chunks(BLOCK_SIZE) {
        for (s, b) in state.iter_mut().zip(chunk) {
            *s ^= b;
        }
        let mut block = GenericArray::from(state);
        cipher.encrypt_block(&mut block);
        state.copy_from_slice(&block);
    }
    state
}

/// Nonce of a secure wrapper: sequence information, serial, message tag.
fn nonce(sequence: u64, serial: &[u8; 6], tag: u16) -> [u8; 14] {
    let mut n = [0u8; 14];
    n[..6].copy_from_slice(&encode_u48(sequence));
    n[6..12].copy_from_slice(serial);
    n[12..14].copy_from_slice(&tag.to_be_bytes());
    n
}

/// MAC input: B0 block (nonce + payload length), length-prefixed
/// associated data, then the payload, each zero-padded to block size.
fn mac_input(n: &[u8; 14], assoc: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(BLOCK_SIZE * 3 + assoc.len() + payload.len());
    input.extend_from_slice(n);
    input.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    input.extend_from_slice(&(assoc.len() as u16).to_be_bytes());
    input.extend_from_slice(assoc);
    pad_to_block(&mut input);
    input.extend_from_slice(payload);
    pad_to_block(&mut input);
    input
}

fn pad_to_block(buf: &mut Vec<u8>) {
    let rem = buf.len() % BLOCK_SIZE;
    if rem != 0 {
        buf.resize(buf.len() + BLOCK_SIZE - rem, 0);
    }
}

/// Encrypt a plaintext frame for a secure wrapper.
///
/// Returns the ciphertext and the encrypted MAC. The CTR counter block 0
/// encrypts the MAC, blocks 1.. encrypt the payload.
pub(crate) fn ccm_encrypt(
    key: &[u8; 16],
    sequence: u64,
    serial: &[u8; 6],
    tag: u16,
    assoc: &[u8],
    payload: &[u8],
) -> (Vec<u8>, [u8; MAC_LENGTH]) {
    let n = nonce(sequence, serial, tag);
    let mut mac = cbc_mac(key, &mac_input(&n, assoc, payload));

    let mut iv = [0u8; BLOCK_SIZE];
    iv[..14].copy_from_slice(&n);
    let mut cipher = Aes128Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv));
    cipher.apply_keystream(&mut mac);
    let mut ciphertext = payload.to_vec();
    cipher.apply_keystream(&mut ciphertext);
    (ciphertext, mac)
}

/// Verify and decrypt a secure wrapper.
///
/// The MAC is checked before any plaintext is exposed; a mismatch fails
/// with a `Secure` error.
pub(crate) fn ccm_decrypt(
    key: &[u8; 16],
    sequence: u64,
    serial: &[u8; 6],
    tag: u16,
    assoc: &[u8],
    ciphertext: &[u8],
    mac: &[u8; MAC_LENGTH],
) -> Result<Vec<u8>> {
    let n = nonce(sequence, serial, tag);
    let mut iv = [0u8; BLOCK_SIZE];
    iv[..14].copy_from_slice(&n);
    let mut cipher = Aes128Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv));

    let mut received_mac = *mac;
    cipher.apply_keystream(&mut received_mac);
    let mut payload = ciphertext.to_vec();
    cipher.apply_keystream(&mut payload);

    let computed = cbc_mac(key, &mac_input(&n, assoc, &payload));
    if computed != received_mac {
        return Err(KnxError::secure_mac_mismatch());
    }
    Ok(payload)
}

/// MAC over session-setup data (session response, session authenticate).
///
/// The input is a zeroed block, a length prefix and the setup data
/// (frame header, identifiers and the XOR of both public keys); the
/// resulting MAC is encrypted with the setup counter block.
pub(crate) fn handshake_mac(key: &[u8; 16], data: &[u8]) -> [u8; MAC_LENGTH] {
    let mut input = Vec::with_capacity(BLOCK_SIZE * 2 + data.len());
    input.extend_from_slice(&[0u8; BLOCK_SIZE]);
    input.extend_from_slice(&0u16.to_be_bytes());
    input.extend_from_slice(&(data.len() as u16).to_be_bytes());
    input.extend_from_slice(data);
    pad_to_block(&mut input);
    let mut mac = cbc_mac(key, &input);

    let mut cipher = Aes128Ctr::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(&CTR0_HANDSHAKE),
    );
    cipher.apply_keystream(&mut mac);
    mac
}

/// XOR of the client and server public values, part of the setup MAC input.
pub(crate) fn xor_keys(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b)) {
        *o = x ^ y;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
        0x0F,
    ];

    #[test]
    fn test_session_key_derivation() {
        let shared = [0x42u8; 32];
        let key = derive_session_key(&shared);
        assert_eq!(&key, &Sha256::digest(shared)[..16]);
    }

    #[test]
    fn test_ccm_round_trip() {
        let serial = [0, 0, 0, 0, 0, 1];
        let assoc = [0x06, 0x10, 0x09, 0x50, 0x00, 0x2E, 0x00, 0x01];
        let payload = b"\x06\x10\x04\x20\x00\x0a\x04\x15\x00\x00";

        let (ciphertext, mac) = ccm_encrypt(&KEY, 0, &serial, 0, &assoc, payload);
        assert_ne!(&ciphertext[..], &payload[..]);
        let plain = ccm_decrypt(&KEY, 0, &serial, 0, &assoc, &ciphertext, &mac).unwrap();
        assert_eq!(plain, payload);
    }

    #[test]
    fn test_ccm_detects_tampering() {
        let serial = [0, 0, 0, 0, 0, 1];
        let assoc = [0x06, 0x10, 0x09, 0x50, 0x00, 0x2E, 0x00, 0x01];
        let payload = [0xAAu8; 24];

        let (mut ciphertext, mac) = ccm_encrypt(&KEY, 7, &serial, 0, &assoc, &payload);
        ciphertext[3] ^= 0x01;
        let err = ccm_decrypt(&KEY, 7, &serial, 0, &assoc, &ciphertext, &mac).unwrap_err();
        assert!(matches!(err, KnxError::Secure(e) if e.is_mac_mismatch()));
    }

    #[test]
    fn test_ccm_sequence_changes_keystream() {
        let serial = [0; 6];
        let payload = [0x55u8; 16];
        let (c0, _) = ccm_encrypt(&KEY, 0, &serial, 0, &[], &payload);
        let (c1, _) = ccm_encrypt(&KEY, 1, &serial, 0, &[], &payload);
        assert_ne!(c0, c1);
    }

    #[test]
    fn test_handshake_mac_stable() {
        let data = [0x06, 0x10, 0x09, 0x52, 0x00, 0x38, 0x00, 0x01];
        let mac1 = handshake_mac(&KEY, &data);
        let mac2 = handshake_mac(&KEY, &data);
        assert_eq!(mac1, mac2);
        assert_ne!(mac1, [0u8; 16]);
    }

    #[test]
    fn test_xor_keys() {
        let a = [0xF0u8; 32];
        let b = [0x0Fu8; 32];
        assert_eq!(xor_keys(&a, &b), [0xFFu8; 32]);
        assert_eq!(xor_keys(&a, &a), [0u8; 32]);
    }
}
