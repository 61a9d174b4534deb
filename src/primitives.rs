//! Fixed-contract wrappers around the legacy primitives the Netlogon
//! credential chain is built from: single-block DES-ECB, the NTLM one-way
//! function (MD4 over UTF-16LE), MD5, HMAC-MD5 and a CSPRNG.
//!
//! Any failure inside the underlying providers collapses to
//! `NetlogonError::CryptoFailure`; nothing more specific ever escapes.

use encoding::codec::utf_16::UTF_16LE_ENCODING;
use encoding::{EncoderTrap, Encoding};
use generic_array::GenericArray;
use generic_array::typenum::{U7, U8};
use md4::{Digest, Md4};
use rand::{thread_rng, Rng};
use zeroize::Zeroizing;

use crypto::digest::Digest as RustCryptoDigest;
use crypto::hmac::Hmac;
use crypto::mac::Mac;
use crypto::md5::Md5;
use des::block_cipher::{BlockCipher, NewBlockCipher};
use des::Des;

use errors::NetlogonError;

/// The DES algorithm uses a 56-bit encryption key.
pub const DES_KEY_SZ: usize = 7;
pub const DES_BLOCK_SZ: usize = 8;
pub const MD_DIGEST_SZ: usize = 16;

/// Expand a 7-byte key to an 8-byte DES key, parity bit in the low bit of
/// each byte, as Netlogon (and NTLM) schedule DES keys.
pub fn make_des_key(key7: &GenericArray<u8, U7>) -> GenericArray<u8, U8> {
    GenericArray::from([
        (key7[0] >> 1) << 1,
        (((key7[0] & 0x01) << 6) | (key7[1] >> 2)) << 1,
        (((key7[1] & 0x03) << 5) | (key7[2] >> 3)) << 1,
        (((key7[2] & 0x07) << 4) | (key7[3] >> 4)) << 1,
        (((key7[3] & 0x0F) << 3) | (key7[4] >> 5)) << 1,
        (((key7[4] & 0x1F) << 2) | (key7[5] >> 6)) << 1,
        (((key7[5] & 0x3F) << 1) | (key7[6] >> 7)) << 1,
        (key7[6] & 0x7F) << 1,
    ])
}

/// Encrypt a single 8-byte block under a 7-byte key, ECB.
///
/// `key7` may be longer than 7 bytes; only the first 7 are used.
pub fn des_block(key7: &[u8], block: &[u8]) -> Result<[u8; DES_BLOCK_SZ], NetlogonError> {
    if key7.len() < DES_KEY_SZ || block.len() != DES_BLOCK_SZ {
        return Err(NetlogonError::CryptoFailure);
    }

    let key = make_des_key(GenericArray::from_slice(&key7[..DES_KEY_SZ]));
    let key = des::block_cipher::generic_array::GenericArray::clone_from_slice(key.as_slice());
    let mut buf = des::block_cipher::generic_array::GenericArray::clone_from_slice(block);

    Des::new(&key).encrypt_block(&mut buf);

    let mut out = [0u8; DES_BLOCK_SZ];
    out.copy_from_slice(&buf);
    Ok(out)
}

pub fn utf16<S: AsRef<str>>(s: S) -> Vec<u8> {
    UTF_16LE_ENCODING
        .encode(s.as_ref(), EncoderTrap::Ignore)
        .unwrap()
}

/// The NTLM one-way function: MD4 over the UTF-16LE encoding of the
/// password.
///
/// Text passwords are widened through their UTF-8 code points; raw bytes
/// that do not form UTF-8 (a rotated OWF password) are widened as-is.
pub fn ntlm_hash(password: &[u8]) -> Zeroizing<[u8; MD_DIGEST_SZ]> {
    let encoded = Zeroizing::new(match ::std::str::from_utf8(password) {
        Ok(s) => utf16(s),
        Err(_) => password.iter().flat_map(|&b| vec![b, 0]).collect(),
    });

    let digest = Md4::digest(&encoded);

    let mut hash = [0u8; MD_DIGEST_SZ];
    hash.copy_from_slice(&digest);
    Zeroizing::new(hash)
}

pub fn md5(chunks: &[&[u8]]) -> [u8; MD_DIGEST_SZ] {
    let mut md5 = Md5::new();

    for chunk in chunks {
        md5.input(chunk);
    }

    let mut digest = [0u8; MD_DIGEST_SZ];
    md5.result(&mut digest);
    digest
}

pub fn hmac_md5(key: &[u8], data: &[&[u8]]) -> [u8; MD_DIGEST_SZ] {
    let mut hmac = Hmac::new(Md5::new(), key);

    for b in data {
        hmac.input(b);
    }

    let mut code = [0u8; MD_DIGEST_SZ];
    code.copy_from_slice(hmac.result().code());
    code
}

/// An 8-byte nonce from the thread-local CSPRNG.
pub fn random_nonce() -> [u8; 8] {
    let mut nonce = [0u8; 8];
    thread_rng().fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn des_key_parity_expansion() {
        assert_eq!(
            make_des_key(GenericArray::from_slice(&[0u8; 7])).as_slice(),
            &[0u8; 8][..]
        );
        assert_eq!(
            make_des_key(GenericArray::from_slice(&[0xFFu8; 7])).as_slice(),
            &[0xFEu8; 8][..]
        );
    }

    #[test]
    fn des_single_block() {
        // first half of LMOWF("Password"), a fixture shared with [MS-NLMP]
        let out = des_block(b"PASSWOR", b"KGS!@#$%").unwrap();

        assert_eq!(out, [0xe5, 0x2c, 0xac, 0x67, 0x41, 0x9a, 0x9a, 0x22]);
    }

    #[test]
    fn des_rejects_short_inputs() {
        assert!(des_block(b"short", b"KGS!@#$%").is_err());
        assert!(des_block(b"PASSWOR", b"short").is_err());
    }

    #[test]
    fn ntlm_one_way_function() {
        #[cfg_attr(rustfmt, rustfmt_skip)]
        assert_eq!(
            &ntlm_hash(b"Password")[..],
            &[
                0xa4, 0xf4, 0x9c, 0x40, 0x65, 0x10, 0xbd, 0xca, 0xb6, 0x82, 0x4e, 0xe7, 0xc3, 0x0f, 0xd8, 0x52
            ][..]
        );

        #[cfg_attr(rustfmt, rustfmt_skip)]
        assert_eq!(
            &ntlm_hash(b"Pw!")[..],
            &[
                0x94, 0x68, 0x30, 0x10, 0x40, 0xcd, 0x8e, 0x9a, 0x9e, 0xe3, 0xef, 0x86, 0x2c, 0xe9, 0x76, 0xdd
            ][..]
        );
    }

    #[test]
    fn md5_digest() {
        #[cfg_attr(rustfmt, rustfmt_skip)]
        assert_eq!(
            md5(&[b"a", b"bc"]),
            [
                0x90, 0x01, 0x50, 0x98, 0x3c, 0xd2, 0x4f, 0xb0, 0xd6, 0x96, 0x3f, 0x7d, 0x28, 0xe1, 0x7f, 0x72
            ]
        );
    }

    #[test]
    fn hmac_md5_rfc2202() {
        #[cfg_attr(rustfmt, rustfmt_skip)]
        assert_eq!(
            hmac_md5(b"Jefe", &[b"what do ya want ", b"for nothing?"]),
            [
                0x75, 0x0c, 0x78, 0x3e, 0x6a, 0xb0, 0xb5, 0x03, 0xea, 0xa8, 0x6e, 0x31, 0x0a, 0x5d, 0xb7, 0x38
            ]
        );
    }

    #[test]
    fn utf16_little_endian() {
        assert_eq!(utf16("Pw!"), vec![0x50, 0x00, 0x77, 0x00, 0x21, 0x00]);
    }
}
