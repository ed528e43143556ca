//! Digests used for passwords, data blocks and final file hashes.

use common::fs::FileHandle;
use common::pipeline::Pipeline;
use common::{TransferError, TransferErrorCode};
use sha2::Digest;
use tokio::io::AsyncReadExt;

/// Digest negotiated when the requester does not ask for one.
pub const DEFAULT_DIGEST: &str = "SHA-256";

const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgo {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsuported hash algorithm {0:?}")]
pub struct UnknownAlgo(pub String);

impl std::str::FromStr for HashAlgo {
    type Err = UnknownAlgo;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SHA-256" | "SHA256" => Ok(Self::Sha256),
            "SHA-384" | "SHA384" => Ok(Self::Sha384),
            "SHA-512" | "SHA512" => Ok(Self::Sha512),
            _ => Err(UnknownAlgo(s.to_string())),
        }
    }
}

enum Hasher {
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha384(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

impl HashAlgo {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }

    fn hasher(self) -> Hasher {
        match self {
            Self::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            Self::Sha384 => Hasher::Sha384(sha2::Sha384::new()),
            Self::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }

    pub fn hash_bytes(self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// Hashes a whole file from its current position.
    pub async fn hash_file(self, mut file: FileHandle) -> Result<Vec<u8>, TransferError> {
        let mut hasher = self.hasher();
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            let n = file.read(&mut buf).await.map_err(|err| {
                TransferError::with_cause(TransferErrorCode::Internal, "failed to compute the file hash", &err)
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }
}

/// Hashes the local file of a transfer, giving up when its signal is raised.
pub async fn local_file_hash(pip: &Pipeline, algo: HashAlgo) -> Result<Vec<u8>, TransferError> {
    pip.signal()
        .guard(async { algo.hash_file(pip.open_local().await?).await })
        .await
}

/// The password transform of the protocol: hex encoded SHA-256.
pub fn crypt_pass(password: &str) -> String {
    hex::encode(sha2::Sha256::digest(password.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_names() {
        for algo in [HashAlgo::Sha256, HashAlgo::Sha384, HashAlgo::Sha512] {
            assert_eq!(algo.name().parse::<HashAlgo>().unwrap(), algo);
        }
        assert_eq!("sha256".parse::<HashAlgo>().unwrap(), HashAlgo::Sha256);
        let err = "MD5".parse::<HashAlgo>().unwrap_err();
        assert_eq!(err.to_string(), "unsuported hash algorithm \"MD5\"");
    }

    #[test]
    fn digest_lengths() {
        assert_eq!(HashAlgo::Sha256.hash_bytes(b"abc").len(), 32);
        assert_eq!(HashAlgo::Sha384.hash_bytes(b"abc").len(), 48);
        assert_eq!(HashAlgo::Sha512.hash_bytes(b"abc").len(), 64);
        assert_eq!(
            hex::encode(HashAlgo::Sha256.hash_bytes(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn password_transform() {
        assert_eq!(
            crypt_pass("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn file_hash_matches_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        let file: FileHandle = Box::new(tokio::fs::File::open(&path).await.unwrap());
        let hash = HashAlgo::Sha512.hash_file(file).await.unwrap();
        assert_eq!(hash, HashAlgo::Sha512.hash_bytes(&data));
    }
}
