// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};

use pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
    #[error("Failed to load RSA public key: {0:?}")]
    LoadPubKey(PathBuf, #[source] pkcs8::spki::Error),
    #[error("Signature of {path:?} does not verify (sha256 {digest})")]
    BadSignature { path: PathBuf, digest: String },
}

type Result<T> = std::result::Result<T, Error>;

/// Read a PEM-encoded PKCS8 public key from a file.
pub fn read_pem_public_key_file(path: &Path) -> Result<RsaPublicKey> {
    let data =
        std::fs::read_to_string(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    let key = RsaPublicKey::from_public_key_pem(&data)
        .map_err(|e| Error::LoadPubKey(path.to_owned(), e))?;

    Ok(key)
}

/// Compute the SHA-256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<[u8; 32]> {
    let raw_reader = File::open(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;
    let mut reader = BufReader::new(raw_reader);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];

    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| Error::ReadFile(path.to_owned(), e))?;
        if n == 0 {
            break;
        }

        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize().into())
}

/// Verify a detached PKCS#1 v1.5 RSA signature over the SHA-256 digest of a
/// file against a pinned public key.
pub fn verify_detached(path: &Path, sig_path: &Path, key: &RsaPublicKey) -> Result<()> {
    let digest = sha256_file(path)?;
    let signature =
        std::fs::read(sig_path).map_err(|e| Error::ReadFile(sig_path.to_owned(), e))?;

    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
        .map_err(|_| Error::BadSignature {
            path: path.to_owned(),
            digest: hex::encode(digest),
        })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rsa::RsaPrivateKey;

    use super::{sha256_file, verify_detached, Error};

    #[test]
    fn detached_signature_round_trip() {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("tool.zip");
        let sig_path = dir.path().join("tool.zip.sig");

        std::fs::write(&data_path, b"tool contents").unwrap();

        let digest = sha256_file(&data_path).unwrap();
        let signature = key
            .sign(rsa::Pkcs1v15Sign::new::<sha2::Sha256>(), &digest)
            .unwrap();
        std::fs::write(&sig_path, &signature).unwrap();

        verify_detached(&data_path, &sig_path, &key.to_public_key()).unwrap();

        // Tampering with the file must fail verification.
        std::fs::write(&data_path, b"tool contents, but evil").unwrap();

        assert_matches!(
            verify_detached(&data_path, &sig_path, &key.to_public_key()),
            Err(Error::BadSignature { .. })
        );
    }
}
