use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::{IoResultExt, Result};
use crate::Error;

/// buffer size used whenever content is streamed through a hasher
pub const STREAM_BUFFER: usize = 64 * 1024;

/// SHA-256 digest naming an object in the pool
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// all-zero digest; never names real content
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// parse from a 64 character lowercase hex string
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if !is_digest(s) {
            return Err(Error::InvalidHashHex(s.to_string()));
        }
        let bytes = hex::decode(s).map_err(|_| Error::InvalidHashHex(s.to_string()))?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// parse a `sha256:<hex>` registry digest
    pub fn from_prefixed(s: &str) -> crate::Result<Self> {
        let hex = s
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::InvalidHashHex(s.to_string()))?;
        Self::from_hex(hex)
    }

    /// get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// digest of an in-memory buffer
    pub fn of_bytes(data: &[u8]) -> Self {
        Hash(Sha256::digest(data).into())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..12])
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// true when `s` has the shape of an object reference: 64 lowercase hex chars
pub fn is_digest(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// stream a reader through SHA-256, returning the digest and byte count
pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<(Hash, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; STREAM_BUFFER];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((Hash(hasher.finalize().into()), total))
}

/// digest of a file's content
pub fn hash_file(path: &Path) -> Result<Hash> {
    let mut file = File::open(path).with_path(path)?;
    let (hash, _) = hash_reader(&mut file).with_path(path)?;
    Ok(hash)
}

/// writer adapter that hashes everything passing through it
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// number of bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// finalize, returning the inner writer and the digest
    pub fn finish(self) -> (W, Hash) {
        (self.inner, Hash(self.hasher.finalize().into()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_digest_names_zero_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.img");
        std::fs::write(&path, vec![0u8; 100 * 1024]).unwrap();

        let digest = hash_file(&path).unwrap();
        assert_eq!(digest, Hash::of_bytes(&[0u8; 100 * 1024]));
        assert_eq!(Hash::from_hex(&digest.to_string()).unwrap(), digest);
        assert_ne!(digest, Hash::ZERO);
    }

    #[test]
    fn test_from_hex_rejects_non_references() {
        let upper = Hash::of_bytes(b"x").to_hex().to_uppercase();
        for bad in ["bsp/run.json", "abcd", upper.as_str()] {
            assert!(
                matches!(Hash::from_hex(bad), Err(Error::InvalidHashHex(_))),
                "{bad}"
            );
        }
        let long = format!("{}00", Hash::of_bytes(b"x"));
        assert!(Hash::from_hex(&long).is_err());
    }

    #[test]
    fn test_is_digest() {
        assert!(is_digest(&"a".repeat(64)));
        assert!(!is_digest(&"g".repeat(64)));
        assert!(!is_digest(&"a".repeat(63)));
        assert!(!is_digest(&"a".repeat(65)));
    }

    #[test]
    fn test_prefixed_digest() {
        let hex = "abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789";
        let h = Hash::from_prefixed(&format!("sha256:{hex}")).unwrap();
        assert_eq!(h.to_hex(), hex);
        assert!(Hash::from_prefixed(hex).is_err());
    }

    #[test]
    fn test_streaming_matches_direct() {
        let data = vec![7u8; 3 * STREAM_BUFFER + 17];
        let (streamed, len) = hash_reader(&mut data.as_slice()).unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(streamed, Hash::of_bytes(&data));
    }

    #[test]
    fn test_known_digest() {
        // sha256("hello")
        assert_eq!(
            Hash::of_bytes(b"hello").to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hashing_writer() {
        let mut w = HashingWriter::new(Vec::new());
        w.write_all(b"hel").unwrap();
        w.write_all(b"lo").unwrap();
        assert_eq!(w.written(), 5);
        let (inner, hash) = w.finish();
        assert_eq!(inner, b"hello");
        assert_eq!(hash, Hash::of_bytes(b"hello"));
    }

    #[test]
    fn test_serializes_as_bare_hex() {
        let digest = Hash::of_bytes(b"object");
        let value = serde_json::json!({ "app/root.squashfs": digest });
        assert_eq!(value["app/root.squashfs"], digest.to_hex());

        let back: std::collections::BTreeMap<String, Hash> =
            serde_json::from_value(value).unwrap();
        assert_eq!(back["app/root.squashfs"], digest);
        assert!(serde_json::from_str::<Hash>("\"sha256:00\"").is_err());
    }
}
