//! AES-128-CBC stream decryptor for vendor `.iboot` archive containers.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, KeyIvInit};

use crate::constants::ARCHIVE_KEY;
use crate::error::UpdateError;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Decrypt an archive container into its plaintext text body.
///
/// The vendor format uses the fixed key as the IV as well and pads with
/// PKCS#7. Truncated ciphertext and bad padding both surface as
/// [`UpdateError::ArchiveCipher`].
pub fn decrypt_archive(ciphertext: &[u8]) -> Result<Vec<u8>, UpdateError> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(UpdateError::ArchiveCipher);
    }
    Aes128CbcDec::new(ARCHIVE_KEY.into(), ARCHIVE_KEY.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| UpdateError::ArchiveCipher)
}

/// Test-only counterpart of [`decrypt_archive`], used to build fixtures.
#[cfg(test)]
pub(crate) fn encrypt_archive(plaintext: &[u8]) -> Vec<u8> {
    use aes::cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    Aes128CbcEnc::new(ARCHIVE_KEY.into(), ARCHIVE_KEY.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}
