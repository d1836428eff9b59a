//! ---
//! tb_section: "06-key-material"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "code"
//! tb_description: "Role keypair storage and deterministic fixture signing."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Role keypairs for the harness.
//!
//! Workers and stages refer to key material by role name (`leader`,
//! `participant`, ...). The [`Keyring`] owns one Ed25519 keypair per role,
//! persists each as a JSON file under the configured key directory, and signs
//! stage fixtures deterministically: payloads are canonicalised through
//! `serde_json` (sorted object keys) and Ed25519 adds no per-signature
//! randomness, so identical payloads always produce identical signatures.

use std::fs;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use indexmap::IndexMap;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// Result alias used throughout the keys crate.
pub type Result<T> = std::result::Result<T, SigningError>;

/// Error type for keyring and signing operations.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    /// A role was requested that the keyring does not hold.
    #[error("unknown keypair role '{role}'")]
    UnknownRole {
        /// Role name as requested.
        role: String,
    },
    /// Reading or writing a keypair file failed.
    #[error("keypair io error at {path:?}: {source}")]
    Io {
        /// File the operation targeted.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// A keypair file exists but does not contain usable key material.
    #[error("malformed keypair file {path:?}: {detail}")]
    Malformed {
        /// File that failed to load.
        path: PathBuf,
        /// What was wrong with it.
        detail: String,
    },
    /// Wrapper for JSON serialization issues while canonicalising payloads.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A fixture signature did not verify against its public key.
    #[error("signature verification failed for role '{role}'")]
    Verification {
        /// Role the fixture claims.
        role: String,
    },
}

/// One Ed25519 keypair bound to a role name.
pub struct Keypair {
    role: String,
    signing: SigningKey,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("role", &self.role)
            .field("public_key", &self.public_key_b64())
            .finish()
    }
}

impl Keypair {
    /// Generate a fresh keypair for a role.
    pub fn generate(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Role this keypair is bound to.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Verifying half of the keypair.
    pub fn public_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Base64 public identifier, as embedded in fixtures and keypair files.
    pub fn public_key_b64(&self) -> String {
        general_purpose::STANDARD.encode(self.public_key().to_bytes())
    }

    /// Sign raw payload bytes. Ed25519 signing is deterministic.
    pub fn sign(&self, payload: &[u8]) -> Signature {
        self.signing.sign(payload)
    }

    fn to_file(&self) -> KeypairFile {
        KeypairFile {
            role: self.role.clone(),
            secret_key: general_purpose::STANDARD.encode(self.signing.to_bytes()),
            public_key: self.public_key_b64(),
        }
    }

    fn from_file(file: KeypairFile, path: &Path) -> Result<Self> {
        let secret = decode_exact::<32>(&file.secret_key, path, "secret_key")?;
        let public = decode_exact::<32>(&file.public_key, path, "public_key")?;
        let signing = SigningKey::from_bytes(&secret);
        if signing.verifying_key().to_bytes() != public {
            return Err(SigningError::Malformed {
                path: path.to_path_buf(),
                detail: "public key does not match secret key".to_owned(),
            });
        }
        Ok(Self {
            role: file.role,
            signing,
        })
    }
}

/// On-disk JSON shape of one keypair.
#[derive(Debug, Serialize, Deserialize)]
struct KeypairFile {
    role: String,
    secret_key: String,
    public_key: String,
}

/// A payload signed by a role keypair, reproducible for identical inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedFixture {
    /// Role whose keypair produced the signature.
    pub role: String,
    /// The signed payload.
    pub payload: Value,
    /// Base64 Ed25519 signature over the canonical payload bytes.
    pub signature: String,
    /// Base64 public key the signature verifies against.
    pub public_key: String,
}

impl SignedFixture {
    /// Verify the fixture against its embedded public key.
    pub fn verify(&self) -> Result<()> {
        let public = decode_exact::<32>(&self.public_key, Path::new("<fixture>"), "public_key")?;
        let key = VerifyingKey::from_bytes(&public).map_err(|err| SigningError::Malformed {
            path: PathBuf::from("<fixture>"),
            detail: format!("invalid public key material: {err}"),
        })?;
        let signature_bytes =
            decode_exact::<64>(&self.signature, Path::new("<fixture>"), "signature")?;
        let signature = Signature::from_bytes(&signature_bytes);
        let payload = canonical_payload(&self.payload)?;
        key.verify_strict(&payload, &signature)
            .map_err(|_| SigningError::Verification {
                role: self.role.clone(),
            })
    }
}

/// Named set of role keypairs backed by a key directory.
#[derive(Debug)]
pub struct Keyring {
    dir: PathBuf,
    keys: IndexMap<String, Keypair>,
}

impl Keyring {
    /// Load existing keypairs for the given roles, generating and writing any
    /// that are missing. The directory is created if needed.
    pub fn ensure<S: AsRef<str>>(dir: impl Into<PathBuf>, roles: &[S]) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| SigningError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut keys = IndexMap::new();
        for role in roles {
            let role = role.as_ref();
            let path = keypair_path(&dir, role);
            let keypair = if path.exists() {
                let loaded = load_keypair(&path)?;
                debug!(role = %role, path = %path.display(), "loaded keypair");
                loaded
            } else {
                let fresh = Keypair::generate(role);
                write_keypair(&fresh, &path)?;
                info!(role = %role, path = %path.display(), "generated keypair");
                fresh
            };
            keys.insert(role.to_owned(), keypair);
        }
        Ok(Self { dir, keys })
    }

    /// Generate fresh keypairs for every role, replacing any existing files.
    pub fn regenerate<S: AsRef<str>>(dir: impl Into<PathBuf>, roles: &[S]) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| SigningError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut keys = IndexMap::new();
        for role in roles {
            let role = role.as_ref();
            let path = keypair_path(&dir, role);
            let fresh = Keypair::generate(role);
            write_keypair(&fresh, &path)?;
            info!(role = %role, path = %path.display(), "rotated keypair");
            keys.insert(role.to_owned(), fresh);
        }
        Ok(Self { dir, keys })
    }

    /// Roles held by this keyring, in declaration order.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Whether a role is present.
    pub fn contains(&self, role: &str) -> bool {
        self.keys.contains_key(role)
    }

    /// Keypair for a role.
    pub fn keypair(&self, role: &str) -> Result<&Keypair> {
        self.keys.get(role).ok_or_else(|| SigningError::UnknownRole {
            role: role.to_owned(),
        })
    }

    /// On-disk keypair file path for a role, as handed to workers via env.
    pub fn path_for(&self, role: &str) -> Result<PathBuf> {
        if !self.contains(role) {
            return Err(SigningError::UnknownRole {
                role: role.to_owned(),
            });
        }
        Ok(keypair_path(&self.dir, role))
    }

    /// Sign raw bytes with a role's keypair.
    pub fn sign(&self, role: &str, payload: &[u8]) -> Result<Signature> {
        Ok(self.keypair(role)?.sign(payload))
    }

    /// Sign a JSON payload into a verifiable [`SignedFixture`].
    pub fn sign_fixture(&self, role: &str, payload: &Value) -> Result<SignedFixture> {
        let keypair = self.keypair(role)?;
        let bytes = canonical_payload(payload)?;
        let signature = keypair.sign(&bytes);
        Ok(SignedFixture {
            role: role.to_owned(),
            payload: payload.clone(),
            signature: general_purpose::STANDARD.encode(signature.to_bytes()),
            public_key: keypair.public_key_b64(),
        })
    }

    /// Verify a fixture and check it was signed by this keyring's key for its role.
    pub fn verify_fixture(&self, fixture: &SignedFixture) -> Result<()> {
        let keypair = self.keypair(&fixture.role)?;
        if keypair.public_key_b64() != fixture.public_key {
            return Err(SigningError::Verification {
                role: fixture.role.clone(),
            });
        }
        fixture.verify()
    }
}

/// Canonical bytes signed for a JSON payload: `serde_json` object keys are
/// sorted, so semantically equal payloads serialise identically.
pub fn canonical_payload(payload: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

fn keypair_path(dir: &Path, role: &str) -> PathBuf {
    dir.join(format!("{role}.json"))
}

fn load_keypair(path: &Path) -> Result<Keypair> {
    let bytes = fs::read(path).map_err(|source| SigningError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: KeypairFile =
        serde_json::from_slice(&bytes).map_err(|err| SigningError::Malformed {
            path: path.to_path_buf(),
            detail: err.to_string(),
        })?;
    Keypair::from_file(file, path)
}

fn write_keypair(keypair: &Keypair, path: &Path) -> Result<()> {
    let json = serde_json::to_vec_pretty(&keypair.to_file())?;
    fs::write(path, json).map_err(|source| SigningError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn decode_exact<const N: usize>(encoded: &str, path: &Path, field: &str) -> Result<[u8; N]> {
    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| SigningError::Malformed {
            path: path.to_path_buf(),
            detail: format!("{field} is not valid base64: {err}"),
        })?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| SigningError::Malformed {
            path: path.to_path_buf(),
            detail: format!("{field} must decode to {N} bytes, got {}", bytes.len()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn ensure_generates_then_reloads() {
        let dir = tempdir().unwrap();
        let ring = Keyring::ensure(dir.path(), &["leader", "participant"]).unwrap();
        let leader_pk = ring.keypair("leader").unwrap().public_key_b64();
        assert!(dir.path().join("leader.json").is_file());
        assert!(dir.path().join("participant.json").is_file());

        // A second keyring over the same directory sees the same material.
        let reloaded = Keyring::ensure(dir.path(), &["leader"]).unwrap();
        assert_eq!(reloaded.keypair("leader").unwrap().public_key_b64(), leader_pk);

        let rotated = Keyring::regenerate(dir.path(), &["leader"]).unwrap();
        assert_ne!(rotated.keypair("leader").unwrap().public_key_b64(), leader_pk);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let dir = tempdir().unwrap();
        let ring = Keyring::ensure(dir.path(), &["leader"]).unwrap();
        assert!(matches!(
            ring.sign("observer", b"payload"),
            Err(SigningError::UnknownRole { .. })
        ));
        assert!(matches!(
            ring.path_for("observer"),
            Err(SigningError::UnknownRole { .. })
        ));
    }

    #[test]
    fn signatures_are_deterministic_across_key_orderings() {
        let dir = tempdir().unwrap();
        let ring = Keyring::ensure(dir.path(), &["leader"]).unwrap();
        let a = json!({"round": 1, "winner": "worker-a"});
        let b: Value = serde_json::from_str(r#"{"winner": "worker-a", "round": 1}"#).unwrap();

        let fixture_a = ring.sign_fixture("leader", &a).unwrap();
        let fixture_b = ring.sign_fixture("leader", &b).unwrap();
        assert_eq!(fixture_a.signature, fixture_b.signature);
        ring.verify_fixture(&fixture_a).unwrap();
    }

    #[test]
    fn tampered_fixture_fails_verification() {
        let dir = tempdir().unwrap();
        let ring = Keyring::ensure(dir.path(), &["leader"]).unwrap();
        let mut fixture = ring.sign_fixture("leader", &json!({"value": 1})).unwrap();
        fixture.payload = json!({"value": 999});
        assert!(matches!(
            fixture.verify(),
            Err(SigningError::Verification { .. })
        ));
    }

    #[test]
    fn corrupt_keypair_file_is_rejected() {
        let dir = tempdir().unwrap();
        Keyring::ensure(dir.path(), &["leader"]).unwrap();
        let path = dir.path().join("leader.json");
        std::fs::write(&path, b"{\"role\": \"leader\"}").unwrap();
        let err = Keyring::ensure(dir.path(), &["leader"]).unwrap_err();
        assert!(matches!(err, SigningError::Malformed { .. }));
    }

    #[test]
    fn mismatched_public_key_is_rejected() {
        let dir = tempdir().unwrap();
        Keyring::ensure(dir.path(), &["leader", "other"]).unwrap();
        let leader =
            std::fs::read_to_string(dir.path().join("leader.json")).unwrap();
        let other = std::fs::read_to_string(dir.path().join("other.json")).unwrap();
        let mut leader_json: serde_json::Value = serde_json::from_str(&leader).unwrap();
        let other_json: serde_json::Value = serde_json::from_str(&other).unwrap();
        leader_json["public_key"] = other_json["public_key"].clone();
        std::fs::write(
            dir.path().join("leader.json"),
            serde_json::to_vec_pretty(&leader_json).unwrap(),
        )
        .unwrap();

        let err = Keyring::ensure(dir.path(), &["leader"]).unwrap_err();
        assert!(matches!(err, SigningError::Malformed { ref detail, .. }
            if detail.contains("does not match")));
    }
}
