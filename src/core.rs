use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for signatures and content addressing.
///
/// In `kiln`, this serves two primary purposes:
/// 1. It acts as the signature of a dynamic task key or a prune activity, so
///    the scheduler can deduplicate identical requests.
/// 2. It fingerprints serialized keys so that equal keys produced by
///    different planning passes compare equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hashes a domain label followed by the CBOR encoding of `value`.
    pub(crate) fn hash_labeled<T: Serialize>(label: &str, value: &T) -> Self {
        let mut hasher = Blake3Hasher::default();
        hasher.0.update(label.as_bytes());
        ciborium::into_writer(value, &mut hasher).expect("Keys always encode to CBOR");
        hasher.into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::io::Write for Blake3Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Compiler whose cache a task or prune action works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompilerFamily {
    Clang,
    Swift,
}

impl CompilerFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clang => "Clang",
            Self::Swift => "Swift",
        }
    }
}

/// A reference to a build target in a particular configuration.
///
/// The static graph owns the real target model; this core only needs a stable
/// identity to report which targets define a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfiguredTarget {
    /// Globally unique identifier of the target.
    pub guid: String,
    /// Human readable target name.
    pub name: String,
}

impl ConfiguredTarget {
    pub fn new(guid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            name: name.into(),
        }
    }
}

impl Display for ConfiguredTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_is_lowercase_and_full_length() {
        let hex = Hash32::hash(b"kiln").to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_labeled_hash_depends_on_label() {
        let value = ("a", 1u32);
        assert_eq!(
            Hash32::hash_labeled("One", &value),
            Hash32::hash_labeled("One", &value)
        );
        assert_ne!(
            Hash32::hash_labeled("One", &value),
            Hash32::hash_labeled("Two", &value)
        );
    }

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("not encodable"))
        }
    }

    #[test]
    #[should_panic(expected = "Keys always encode to CBOR")]
    fn test_labeled_hash_rejects_failed_encoding() {
        let _ = Hash32::hash_labeled("One", &Unencodable);
    }
}
