//! LAN payload encryption and decryption.
//! AES-128-CBC with PKCS7 padding, keyed by the MD5 digest of the devicekey.

use crate::error::{EwelinkError, Result};
use aes::Aes128;
use base64::{Engine as _, engine::general_purpose};
use cbc::{Decryptor, Encryptor};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, generic_array::GenericArray};
use md5::{Digest, Md5};
use rand::RngCore;
use serde_json::{Map, Value};

const BLOCK: usize = 16;

/// TXT keys a device splits its encrypted payload across, in order.
pub const DATA_FRAGMENTS: [&str; 4] = ["data1", "data2", "data3", "data4"];

/// RF bridges emit `"="` instead of `":"` after the `rf...` key.
const RF_PREFIX: &[u8] = b"{\"rf";

/// Encrypted `data` field plus the IV it was produced with, both base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    pub iv: String,
    pub data: String,
}

/// DeviceCipher holds the AES key derived from one device's devicekey.
pub struct DeviceCipher {
    key: [u8; BLOCK],
}

impl DeviceCipher {
    /// Derive the 16-byte key as MD5 over the UTF-8 devicekey.
    pub fn new(devicekey: &str) -> Self {
        let digest = Md5::digest(devicekey.as_bytes());
        let mut key = [0u8; BLOCK];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// CBC-encrypt `data` after PKCS7 padding it to whole blocks.
    pub fn encrypt(&self, data: &[u8], iv: &[u8; BLOCK]) -> Vec<u8> {
        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into(), &(*iv).into());

        // Manual PKCS7 padding
        let padding_len = BLOCK - data.len() % BLOCK;
        let mut ciphertext = data.to_vec();
        ciphertext.extend(std::iter::repeat_n(padding_len as u8, padding_len));

        for chunk in ciphertext.chunks_mut(BLOCK) {
            let block = GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }
        ciphertext
    }

    /// CBC-decrypt `data` and strip the PKCS7 padding.
    pub fn decrypt(&self, data: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != BLOCK || data.is_empty() || !data.len().is_multiple_of(BLOCK) {
            return Err(EwelinkError::DecryptionFailed);
        }
        let mut decryptor =
            Decryptor::<Aes128>::new(&self.key.into(), GenericArray::from_slice(iv));

        let mut plaintext = data.to_vec();
        for chunk in plaintext.chunks_mut(BLOCK) {
            let block = GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }

        // Manual PKCS7 unpadding
        let pad_len = plaintext[plaintext.len() - 1] as usize;
        if pad_len == 0 || pad_len > BLOCK {
            return Err(EwelinkError::DecryptionFailed);
        }
        if plaintext[plaintext.len() - pad_len..]
            .iter()
            .any(|&b| b as usize != pad_len)
        {
            return Err(EwelinkError::DecryptionFailed);
        }
        plaintext.truncate(plaintext.len() - pad_len);
        Ok(plaintext)
    }

    /// Encrypt a JSON value under a fresh random IV.
    pub fn encrypt_value(&self, value: &Value) -> Result<EncryptedData> {
        let mut iv = [0u8; BLOCK];
        rand::rng().fill_bytes(&mut iv);
        let plaintext = serde_json::to_vec(value)?;
        let ciphertext = self.encrypt(&plaintext, &iv);
        Ok(EncryptedData {
            iv: general_purpose::STANDARD.encode(iv),
            data: general_purpose::STANDARD.encode(ciphertext),
        })
    }

    /// Decrypt base64 `data` with base64 `iv` and parse the JSON inside.
    pub fn decrypt_value(&self, data: &str, iv: &str) -> Result<Value> {
        let iv = general_purpose::STANDARD
            .decode(iv)
            .map_err(|_| EwelinkError::DecryptionFailed)?;
        let ciphertext = general_purpose::STANDARD
            .decode(data)
            .map_err(|_| EwelinkError::DecryptionFailed)?;
        let plaintext = fix_rf_separator(self.decrypt(&ciphertext, &iv)?);
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

fn fix_rf_separator(plaintext: Vec<u8>) -> Vec<u8> {
    if !plaintext.starts_with(RF_PREFIX) {
        return plaintext;
    }
    match plaintext.windows(3).position(|w| w == b"\"=\"") {
        Some(pos) => {
            let mut fixed = plaintext;
            fixed[pos + 1] = b':';
            fixed
        }
        None => plaintext,
    }
}

/// Concatenate `data1`..`data4` from a TXT record or message, in order.
pub fn join_fragments(fields: &Map<String, Value>) -> String {
    DATA_FRAGMENTS
        .iter()
        .filter_map(|key| fields.get(*key).and_then(Value::as_str))
        .collect()
}

/// Replace `payload["data"]` with its encrypted form and add `encrypt`/`iv`.
pub fn encrypt_payload(payload: &mut Map<String, Value>, devicekey: &str) -> Result<()> {
    let data = payload.get("data").cloned().unwrap_or(Value::Object(Map::new()));
    let encrypted = DeviceCipher::new(devicekey)
        .encrypt_value(&data)
        .map_err(|_| EwelinkError::EncryptionFailed)?;
    payload.insert("encrypt".into(), Value::Bool(true));
    payload.insert("iv".into(), Value::String(encrypted.iv));
    payload.insert("data".into(), Value::String(encrypted.data));
    Ok(())
}

/// Decrypt the params carried by an encrypted LAN message.
///
/// The ciphertext is read from `data` when present, otherwise from the
/// `data1`..`data4` fragments.
pub fn decrypt_payload(msg: &Map<String, Value>, devicekey: &str) -> Result<Value> {
    let iv = msg
        .get("iv")
        .and_then(Value::as_str)
        .ok_or(EwelinkError::DecryptionFailed)?;
    let data = match msg.get("data").and_then(Value::as_str) {
        Some(data) => data.to_string(),
        None => join_fragments(msg),
    };
    DeviceCipher::new(devicekey).decrypt_value(&data, iv)
}
