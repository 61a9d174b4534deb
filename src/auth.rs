//! Session-key derivation and the credential computations that prove
//! possession of it.
//!
//! Two derivations exist, selected by the negotiated flags: the strong-key
//! path (`gen_session_key_128`, HMAC-MD5 over an MD5 digest of both
//! challenges) and the legacy 64-bit path (`gen_session_key_64`, two DES
//! stages over the challenge sum). See the "Session-Key Computation"
//! section of [MS-NRPC].

use zeroize::{Zeroize, Zeroizing};

use errors::NetlogonError;
use primitives::{des_block, hmac_md5, md5, ntlm_hash, random_nonce, DES_KEY_SZ};
use proto::{load_le_u32, store_le_u32, NetrCredential, NETR_OWF_PASSWORD_SZ};

pub const NETR_SESSKEY64_SZ: usize = 8;
pub const NETR_SESSKEY128_SZ: usize = 16;

const NETR_SESSKEY_ZEROBUF_SZ: usize = 4;

/// Cap on the rejection-sampling loops that satisfy the DC mitigation
/// filter. A random draw fails the filter so rarely that reaching this
/// bound means the RNG is broken.
pub const NETR_MITIGATION_MAX_ATTEMPTS: usize = 64;

/// The negotiated session key. 16 bytes on the strong-key path, 8 on the
/// legacy path; the backing buffer is always 16 bytes, zero-padded, because
/// the credential computation slices its two DES keys out of bytes 0..14.
#[derive(Clone, PartialEq)]
pub struct SessionKey {
    key: [u8; NETR_SESSKEY128_SZ],
    len: usize,
}

impl ::std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "SessionKey({} bytes)", self.len)
    }
}

impl SessionKey {
    pub fn strong(key: [u8; NETR_SESSKEY128_SZ]) -> SessionKey {
        SessionKey {
            key,
            len: NETR_SESSKEY128_SZ,
        }
    }

    pub fn legacy(key: [u8; NETR_SESSKEY64_SZ]) -> SessionKey {
        let mut buf = [0u8; NETR_SESSKEY128_SZ];
        buf[..NETR_SESSKEY64_SZ].copy_from_slice(&key);
        SessionKey {
            key: buf,
            len: NETR_SESSKEY64_SZ,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The full zero-padded buffer the DES key schedule slices from.
    fn material(&self) -> &[u8; NETR_SESSKEY128_SZ] {
        &self.key
    }
}

impl Zeroize for SessionKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
        self.len = 0;
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Outcome signal from `gen_credentials`. `Retry` never leaves the two
/// call sites that resample their inputs (challenge generation and the
/// per-call authenticator).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CredentialError {
    /// The derived value failed the DC mitigation filter.
    Retry,
    /// The underlying primitive failed.
    Crypto,
}

impl From<CredentialError> for NetlogonError {
    fn from(err: CredentialError) -> NetlogonError {
        match err {
            CredentialError::Retry => NetlogonError::MitigationExhausted,
            CredentialError::Crypto => NetlogonError::CryptoFailure,
        }
    }
}

/// Windows DCs reject challenges and credentials where none of the first
/// 5 bytes are unique ([MS-NRPC] 3.1.4.1 "Session-Key Negotiation" Step 7);
/// 1/256 AES-CFB8 keys encrypt a block of zeros to all zeros and this is
/// the server-side filter for that. Interpreted as: amongst the first
/// 5 bytes, at least one must appear exactly once.
///
/// NOTE: Win2012r2 seems to only reject challenges whose first 5 bytes
/// are 0.
pub fn passes_dc_mitigation(buf: &[u8; 8]) -> bool {
    for i in 0..5 {
        if (0..5).all(|j| j == i || buf[i] != buf[j]) {
            return true;
        }
    }

    false
}

/// Sample a client challenge until it satisfies the DC mitigation filter.
pub fn gen_client_challenge() -> Result<NetrCredential, NetlogonError> {
    for _ in 0..NETR_MITIGATION_MAX_ATTEMPTS {
        let nonce = random_nonce();

        if passes_dc_mitigation(&nonce) {
            return Ok(NetrCredential(nonce));
        }
    }

    Err(NetlogonError::MitigationExhausted)
}

/// The 128-bit session key:
/// `HMAC_MD5(NTLM(password), MD5(zeros(4) || client_challenge || server_challenge))`.
pub fn gen_session_key_128(
    password: &[u8],
    client_challenge: &NetrCredential,
    server_challenge: &NetrCredential,
) -> Result<SessionKey, NetlogonError> {
    if password.is_empty() {
        return Err(NetlogonError::ConfigMissing("machine password"));
    }

    let hash = ntlm_hash(password);
    let zerobuf = [0u8; NETR_SESSKEY_ZEROBUF_SZ];
    let digest = md5(&[&zerobuf, &client_challenge.0, &server_challenge.0]);

    Ok(SessionKey::strong(hmac_md5(&hash[..], &[&digest])))
}

/// The legacy 64-bit session key: both challenges summed wordwise
/// (little-endian, wrapping) and pushed through two DES stages.
///
/// The second stage keys from byte 9 of the NTLM hash, not byte 8;
/// compatibility with existing DCs depends on that offset.
pub fn gen_session_key_64(
    password: &[u8],
    client_challenge: &NetrCredential,
    server_challenge: &NetrCredential,
) -> Result<SessionKey, NetlogonError> {
    if password.is_empty() {
        return Err(NetlogonError::ConfigMissing("machine password"));
    }

    let hash = ntlm_hash(password);

    let (c0, c1) = client_challenge.as_words();
    let (s0, s1) = server_challenge.as_words();

    let mut data = Zeroizing::new([0u8; 8]);
    store_le_u32(&mut data[0..4], c0.wrapping_add(s0));
    store_le_u32(&mut data[4..8], c1.wrapping_add(s1));

    let tmp = Zeroizing::new(des_block(&hash[..DES_KEY_SZ], &data[..])?);

    Ok(SessionKey::legacy(des_block(&hash[9..16], &tmp[..])?))
}

/// Derive an 8-byte credential from a challenge and the session key: the
/// timestamp is added to the challenge's first word, then two DES stages
/// run under `key[0..7]` and `key[7..14]`.
///
/// With `retry` the caller asks to be told when the result would trip the
/// DC mitigation filter ([MS-NRPC] 3.1.4.6 Step 6) so it can resample;
/// during negotiation the inputs are pinned and `retry` must be off.
pub fn gen_credentials(
    session_key: &SessionKey,
    challenge: &NetrCredential,
    timestamp: u32,
    retry: bool,
) -> Result<NetrCredential, CredentialError> {
    let key = session_key.material();

    let (c0, c1) = challenge.as_words();

    let mut data = [0u8; 8];
    store_le_u32(&mut data[0..4], c0.wrapping_add(timestamp));
    store_le_u32(&mut data[4..8], c1);

    let tmp = des_block(&key[..DES_KEY_SZ], &data).map_err(|_| CredentialError::Crypto)?;
    let out = des_block(&key[DES_KEY_SZ..2 * DES_KEY_SZ], &tmp)
        .map_err(|_| CredentialError::Crypto)?;

    let cred = NetrCredential(out);

    if retry && !passes_dc_mitigation(&cred.0) {
        return Err(CredentialError::Retry);
    }

    Ok(cred)
}

/// Derive the new OWF password for `ServerPasswordSet`: each 8-byte half
/// of the old password encrypted under its half of the session key.
pub fn gen_password(
    session_key: &SessionKey,
    old_password: &[u8; NETR_OWF_PASSWORD_SZ],
) -> Result<[u8; NETR_OWF_PASSWORD_SZ], NetlogonError> {
    let key = session_key.material();

    let mut new_password = [0u8; NETR_OWF_PASSWORD_SZ];
    new_password[0..8].copy_from_slice(&des_block(&key[..DES_KEY_SZ], &old_password[0..8])?);
    new_password[8..16].copy_from_slice(&des_block(
        &key[DES_KEY_SZ..2 * DES_KEY_SZ],
        &old_password[8..16],
    )?);

    Ok(new_password)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWORD: &[u8] = b"Pw!";

    lazy_static! {
        static ref CLIENT_CHALLENGE: NetrCredential =
            NetrCredential([0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
        static ref SERVER_CHALLENGE: NetrCredential =
            NetrCredential([0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17]);
        static ref SESSION_KEY_128: [u8; 16] = [
            0x3a, 0xf1, 0x50, 0x71, 0x51, 0x51, 0xfb, 0xee, 0x7c, 0xb6, 0x68, 0x05, 0xec, 0xe9,
            0x0a, 0xd2,
        ];
    }

    #[test]
    fn mitigation_all_equal_fails() {
        for b in &[0x00u8, 0x5A, 0xFF] {
            assert!(!passes_dc_mitigation(&[*b; 8]));
        }
    }

    #[test]
    fn mitigation_distinct_passes() {
        assert!(passes_dc_mitigation(&[0, 1, 2, 3, 4, 5, 6, 7]));
    }

    #[test]
    fn mitigation_ignores_trailing_bytes() {
        // first five all duplicated; the unique bytes past index 4 don't count
        assert!(!passes_dc_mitigation(&[
            0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF
        ]));
        // 0x01 appears exactly once in the first five
        assert!(passes_dc_mitigation(&[
            0x01, 0x02, 0x02, 0x02, 0x02, 0x00, 0x00, 0x00
        ]));
    }

    #[test]
    fn mitigation_two_pairs_and_a_singleton() {
        assert!(passes_dc_mitigation(&[
            0x0A, 0x0A, 0x0B, 0x0B, 0x0C, 0x00, 0x00, 0x00
        ]));
        assert!(!passes_dc_mitigation(&[
            0x0A, 0x0A, 0x0B, 0x0B, 0x0B, 0x00, 0x00, 0x00
        ]));
    }

    #[test]
    fn client_challenges_always_pass_the_filter() {
        for _ in 0..32 {
            let challenge = gen_client_challenge().unwrap();

            assert!(passes_dc_mitigation(&challenge.0));
        }
    }

    #[test]
    fn session_key_128_golden() {
        let key =
            gen_session_key_128(PASSWORD, &*CLIENT_CHALLENGE, &*SERVER_CHALLENGE).unwrap();

        assert_eq!(key.len(), NETR_SESSKEY128_SZ);
        assert_eq!(key.as_bytes(), &SESSION_KEY_128[..]);
    }

    #[test]
    fn session_key_64_golden() {
        let key = gen_session_key_64(PASSWORD, &*CLIENT_CHALLENGE, &*SERVER_CHALLENGE).unwrap();

        assert_eq!(key.len(), NETR_SESSKEY64_SZ);
        assert_eq!(
            key.as_bytes(),
            &[0xa0, 0x5e, 0x3d, 0xbe, 0xc0, 0x8c, 0x5e, 0x01][..]
        );
    }

    #[test]
    fn session_keys_are_pure() {
        let a = gen_session_key_128(PASSWORD, &*CLIENT_CHALLENGE, &*SERVER_CHALLENGE).unwrap();
        let b = gen_session_key_128(PASSWORD, &*CLIENT_CHALLENGE, &*SERVER_CHALLENGE).unwrap();

        assert_eq!(a, b);

        let a = gen_session_key_64(PASSWORD, &*CLIENT_CHALLENGE, &*SERVER_CHALLENGE).unwrap();
        let b = gen_session_key_64(PASSWORD, &*CLIENT_CHALLENGE, &*SERVER_CHALLENGE).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn empty_password_is_rejected() {
        assert_matches!(
            gen_session_key_128(b"", &*CLIENT_CHALLENGE, &*SERVER_CHALLENGE),
            Err(NetlogonError::ConfigMissing(_))
        );
        assert_matches!(
            gen_session_key_64(b"", &*CLIENT_CHALLENGE, &*SERVER_CHALLENGE),
            Err(NetlogonError::ConfigMissing(_))
        );
    }

    #[test]
    fn credentials_golden() {
        let key = SessionKey::strong(*SESSION_KEY_128);

        assert_eq!(
            gen_credentials(&key, &*CLIENT_CHALLENGE, 0, false).unwrap(),
            NetrCredential([0x56, 0x55, 0x26, 0xfb, 0x4d, 0xef, 0xd8, 0x70])
        );
        assert_eq!(
            gen_credentials(&key, &*SERVER_CHALLENGE, 0, false).unwrap(),
            NetrCredential([0x34, 0xad, 0x54, 0x0f, 0xce, 0x80, 0x5b, 0xdf])
        );
    }

    #[test]
    fn credentials_fold_the_timestamp_into_the_first_word() {
        let key = SessionKey::strong(*SESSION_KEY_128);
        let ts = 0x0102_0304;

        let (c0, c1) = CLIENT_CHALLENGE.as_words();
        let shifted = NetrCredential::from_words(c0.wrapping_add(ts), c1);

        assert_eq!(
            gen_credentials(&key, &*CLIENT_CHALLENGE, ts, false).unwrap(),
            gen_credentials(&key, &shifted, 0, false).unwrap()
        );
    }

    #[test]
    fn credentials_with_retry_pass_the_filter() {
        let key = SessionKey::strong(*SESSION_KEY_128);
        let cred = gen_credentials(&key, &*CLIENT_CHALLENGE, 0, true).unwrap();

        assert!(passes_dc_mitigation(&cred.0));
    }

    #[test]
    fn password_generation_golden() {
        let old = [
            0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8, 0xA9, 0xAA, 0xAB, 0xAC, 0xAD,
            0xAE, 0xAF,
        ];

        assert_eq!(
            gen_password(&SessionKey::strong(*SESSION_KEY_128), &old).unwrap(),
            [
                0x2f, 0x8d, 0xd2, 0xef, 0x36, 0x63, 0x3d, 0x57, 0x62, 0x37, 0xca, 0xef, 0x0a,
                0x50, 0x9e, 0xde,
            ]
        );
    }

    #[test]
    fn session_key_zeroizes() {
        let mut key = SessionKey::strong(*SESSION_KEY_128);

        key.zeroize();

        assert_eq!(key.len(), 0);
        assert!(key.material().iter().all(|&b| b == 0));
    }
}
