use anyhow::{anyhow, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::{ActionTier, GpsFix, ViolationKind};

pub const METADATA_FILE: &str = "metadata.json";
pub const MANIFEST_FILE: &str = "manifest.json";

// -------------------- Errors --------------------

/// Packaging and integrity failures. Carried inside `anyhow::Error`; callers
/// that need to tell integrity failures apart use `downcast_ref`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvidenceError {
    NoFrames,
    MissingArtifact { name: String },
    HashMismatch { name: String },
    ManifestMismatch,
    BadSignature,
    CorruptMetadata(String),
}

impl EvidenceError {
    pub fn code(&self) -> &'static str {
        match self {
            EvidenceError::NoFrames => "EVIDENCE_NO_FRAMES",
            EvidenceError::MissingArtifact { .. } => "EVIDENCE_MISSING_ARTIFACT",
            EvidenceError::HashMismatch { .. } => "EVIDENCE_HASH_MISMATCH",
            EvidenceError::ManifestMismatch => "EVIDENCE_MANIFEST_MISMATCH",
            EvidenceError::BadSignature => "EVIDENCE_BAD_SIGNATURE",
            EvidenceError::CorruptMetadata(_) => "EVIDENCE_CORRUPT_METADATA",
        }
    }

    /// True for failures of stored evidence (as opposed to nothing to package).
    pub fn is_integrity_failure(&self) -> bool {
        !matches!(self, EvidenceError::NoFrames)
    }
}

impl std::fmt::Display for EvidenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            EvidenceError::NoFrames => "no frames in capture window".to_string(),
            EvidenceError::MissingArtifact { name } => format!("artifact {} is missing", name),
            EvidenceError::HashMismatch { name } => {
                format!("artifact {} does not match its recorded sha256", name)
            }
            EvidenceError::ManifestMismatch => {
                "metadata does not match the manifest digest".to_string()
            }
            EvidenceError::BadSignature => "manifest signature does not verify".to_string(),
            EvidenceError::CorruptMetadata(detail) => format!("unreadable metadata: {}", detail),
        };
        write!(f, "{}: {}", self.code(), message)
    }
}

impl std::error::Error for EvidenceError {}

// -------------------- Records --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Frame,
    Video,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Frame => "frame",
            ArtifactKind::Video => "video",
        }
    }
}

/// One file in a packet. `name` is relative to the packet directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub kind: ArtifactKind,
    pub sha256: String,
    pub size: u64,
    /// Source frame for frame artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMetadata {
    pub violation_id: String,
    pub kind: ViolationKind,
    pub display_name: String,
    pub confidence: f32,
    pub tier: ActionTier,
    pub track_id: u64,
    pub timestamp_ms: u64,
    pub consecutive_frames: u32,
    pub supporting_frames: Vec<u64>,
    pub clip_frame_count: usize,
    #[serde(default)]
    pub plate_text: Option<String>,
    #[serde(default)]
    pub plate_confidence: Option<f32>,
    #[serde(default)]
    pub gps: Option<GpsFix>,
    /// Caption line rendered for reviewers.
    pub caption: String,
    pub artifacts: Vec<Artifact>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub metadata_sha256: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// -------------------- Packet --------------------

/// A written, hash-verified evidence bundle on disk.
#[derive(Clone, Debug, PartialEq)]
pub struct EvidencePacket {
    pub violation_id: String,
    pub dir: PathBuf,
    pub metadata: EvidenceMetadata,
    pub manifest: Manifest,
}

impl EvidencePacket {
    /// Re-read a packet from `root/<violation_id>`.
    pub fn load(root: &Path, violation_id: &str) -> Result<Self> {
        Self::load_dir(&root.join(violation_id))
    }

    pub fn load_dir(dir: &Path) -> Result<Self> {
        let manifest_bytes = fs::read(dir.join(MANIFEST_FILE)).map_err(|_| {
            EvidenceError::MissingArtifact {
                name: MANIFEST_FILE.to_string(),
            }
        })?;
        let metadata_bytes = fs::read(dir.join(METADATA_FILE)).map_err(|_| {
            EvidenceError::MissingArtifact {
                name: METADATA_FILE.to_string(),
            }
        })?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| EvidenceError::CorruptMetadata(e.to_string()))?;
        let metadata: EvidenceMetadata = serde_json::from_slice(&metadata_bytes)
            .map_err(|e| EvidenceError::CorruptMetadata(e.to_string()))?;
        Ok(Self {
            violation_id: metadata.violation_id.clone(),
            dir: dir.to_path_buf(),
            metadata,
            manifest,
        })
    }

    pub fn frames(&self) -> impl Iterator<Item = &Artifact> {
        self.metadata
            .artifacts
            .iter()
            .filter(|a| a.kind == ArtifactKind::Frame)
    }

    pub fn video(&self) -> Option<&Artifact> {
        self.metadata
            .artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::Video)
    }

    pub fn path_of(&self, artifact: &Artifact) -> PathBuf {
        self.dir.join(&artifact.name)
    }

    /// Bytes of the highest ranked frame, checked against its hash.
    pub fn best_frame_bytes(&self) -> Result<Vec<u8>> {
        let artifact = self.frames().next().ok_or(EvidenceError::NoFrames)?;
        self.read_artifact(artifact)
    }

    /// Artifact bytes, checked against the recorded hash.
    pub fn read_artifact(&self, artifact: &Artifact) -> Result<Vec<u8>> {
        let bytes = fs::read(self.path_of(artifact)).map_err(|_| EvidenceError::MissingArtifact {
            name: artifact.name.clone(),
        })?;
        if sha256_hex(&bytes) != artifact.sha256 {
            return Err(EvidenceError::HashMismatch {
                name: artifact.name.clone(),
            }
            .into());
        }
        Ok(bytes)
    }

    /// Check every artifact and the metadata digest. With a `trusted` device
    /// key the manifest must also carry a signature by that key; the key
    /// recorded in the manifest is never used to judge its own signature.
    /// Reads from disk; the in-memory copy is not trusted.
    pub fn verify(
        &self,
        trusted: Option<&VerifyingKey>,
    ) -> std::result::Result<(), EvidenceError> {
        let on_disk = fs::read(self.dir.join(METADATA_FILE)).map_err(|_| {
            EvidenceError::MissingArtifact {
                name: METADATA_FILE.to_string(),
            }
        })?;
        let digest = Sha256::digest(&on_disk);
        if hex::encode(digest) != self.manifest.metadata_sha256 {
            return Err(EvidenceError::ManifestMismatch);
        }
        let stored: EvidenceMetadata = serde_json::from_slice(&on_disk)
            .map_err(|e| EvidenceError::CorruptMetadata(e.to_string()))?;
        if stored != self.metadata {
            return Err(EvidenceError::ManifestMismatch);
        }
        for artifact in &stored.artifacts {
            let bytes =
                fs::read(self.path_of(artifact)).map_err(|_| EvidenceError::MissingArtifact {
                    name: artifact.name.clone(),
                })?;
            if sha256_hex(&bytes) != artifact.sha256 {
                return Err(EvidenceError::HashMismatch {
                    name: artifact.name.clone(),
                });
            }
        }
        if let Some(key) = trusted {
            if let Some(recorded) = &self.manifest.public_key {
                if !recorded.eq_ignore_ascii_case(&hex::encode(key.to_bytes())) {
                    return Err(EvidenceError::BadSignature);
                }
            }
            let sig_hex = self
                .manifest
                .signature
                .as_deref()
                .ok_or(EvidenceError::BadSignature)?;
            verify_signature(key, sig_hex, digest.as_slice())
                .map_err(|_| EvidenceError::BadSignature)?;
        }
        Ok(())
    }

    /// Remove the packet directory. Releasing twice is not an error.
    pub fn release(&self) -> Result<()> {
        release_dir(&self.dir)
    }
}

pub fn release_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow!("failed to release evidence {}: {}", dir.display(), e)),
    }
}

/// Parse a hex-encoded Ed25519 verifying key.
pub fn parse_verifying_key(key_hex: &str) -> Result<VerifyingKey> {
    let key_bytes: [u8; 32] = hex::decode(key_hex.trim())?
        .try_into()
        .map_err(|_| anyhow!("public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&key_bytes).map_err(|e| anyhow!("invalid verifying key bytes: {}", e))
}

fn verify_signature(key: &VerifyingKey, sig_hex: &str, message: &[u8]) -> Result<()> {
    let sig_bytes: [u8; 64] = hex::decode(sig_hex)?
        .try_into()
        .map_err(|_| anyhow!("signature must be 64 bytes"))?;
    key.verify(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|e| anyhow!("signature verification failed: {}", e))
}
