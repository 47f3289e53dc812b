use blake3::Hasher;
use http::Method;

/// Cache fingerprint: a fixed 256-bit digest over (method, path, body).
///
/// Equal inputs always produce equal fingerprints; no metadata travels in
/// the value itself. Callers that need normalization (case, query order)
/// must apply it before derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn derive(method: &Method, path: &str, body: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(path.as_bytes());
        hasher.update(body);
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// 64-char lowercase hex rendering, used as the durable-tier key column
    /// and the single-flight key.
    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}
