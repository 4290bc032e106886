//! Evidence packaging.
//!
//! A packet lives in `<evidence_dir>/<violation_id>/`:
//!
//! - `frame_NN.jpg`: annotated best frames, best first
//! - `clip.mp4`: short clip of the capture window (optional; encoder failure
//!   is not fatal)
//! - `metadata.json`: candidate facts plus the sha256 of every artifact
//! - `manifest.json`: sha256 of `metadata.json`, optionally Ed25519-signed
//!
//! Every file is written with write-then-rename and fsync. The manifest is
//! written last; a directory without one is an incomplete packet.

mod annotate;
mod packet;
mod video;

pub use annotate::{annotate, caption, encode_jpeg};
pub use packet::{
    parse_verifying_key, release_dir, sha256_hex, Artifact, ArtifactKind, EvidenceError,
    EvidenceMetadata, EvidencePacket, Manifest, MANIFEST_FILE, METADATA_FILE,
};
pub use video::{encode_with_fallback, FfmpegEncoder, VideoEncoder};

use anyhow::{anyhow, Result};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::frame::FrameSnapshot;
use crate::{GpsFix, ViolationCandidate};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceSettings {
    pub evidence_dir: PathBuf,
    pub best_frames: usize,
    /// Seconds of history before the confirming frame included in the clip.
    pub clip_before_secs: u64,
    pub jpeg_quality: u8,
    pub video_enabled: bool,
    pub video_fps: f32,
    pub ffmpeg_binary: String,
    /// Try the V4L2 hardware encoder before libx264.
    pub hardware_encoder: bool,
    pub encode_timeout_secs: u64,
}

impl Default for EvidenceSettings {
    fn default() -> Self {
        Self {
            evidence_dir: PathBuf::from("evidence"),
            best_frames: 3,
            clip_before_secs: 2,
            jpeg_quality: 95,
            video_enabled: true,
            video_fps: 8.0,
            ffmpeg_binary: "ffmpeg".to_string(),
            hardware_encoder: true,
            encode_timeout_secs: 60,
        }
    }
}

pub fn signing_key_from_seed(seed: &str) -> Result<SigningKey> {
    let trimmed = seed.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("device_key_seed is empty"));
    }
    let digest: [u8; 32] = Sha256::digest(trimmed.as_bytes()).into();
    Ok(SigningKey::from_bytes(&digest))
}

pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

pub struct EvidencePackager {
    settings: EvidenceSettings,
    encoders: Vec<Box<dyn VideoEncoder>>,
    signer: Option<SigningKey>,
}

impl EvidencePackager {
    /// Packager with the ffmpeg encoder chain from `settings`.
    pub fn new(settings: EvidenceSettings, signer: Option<SigningKey>) -> Self {
        let timeout = Duration::from_secs(settings.encode_timeout_secs.max(1));
        let mut encoders: Vec<Box<dyn VideoEncoder>> = Vec::new();
        if settings.video_enabled {
            if settings.hardware_encoder {
                encoders.push(Box::new(FfmpegEncoder::hardware(
                    &settings.ffmpeg_binary,
                    timeout,
                )));
            }
            encoders.push(Box::new(FfmpegEncoder::software(
                &settings.ffmpeg_binary,
                timeout,
            )));
        }
        Self {
            settings,
            encoders,
            signer,
        }
    }

    pub fn with_encoders(mut self, encoders: Vec<Box<dyn VideoEncoder>>) -> Self {
        self.encoders = encoders;
        self
    }

    pub fn settings(&self) -> &EvidenceSettings {
        &self.settings
    }

    /// Key that verifies this packager's manifests, if it signs them.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        self.signer.as_ref().map(|key| key.verifying_key())
    }

    pub fn root(&self) -> &Path {
        &self.settings.evidence_dir
    }

    /// Start of the capture window for a candidate confirmed at `at_ms`.
    pub fn window_start(&self, at_ms: u64) -> u64 {
        at_ms.saturating_sub(self.settings.clip_before_secs.saturating_mul(1000))
    }

    /// Top-K frames by score on the candidate track, best first. Ties go to
    /// the more recent frame.
    pub fn select_best<'a>(
        &self,
        candidate: &ViolationCandidate,
        window: &'a [Arc<FrameSnapshot>],
    ) -> Vec<&'a Arc<FrameSnapshot>> {
        let mut ranked: Vec<(&Arc<FrameSnapshot>, f32)> = window
            .iter()
            .map(|f| (f, f.score_for_track(candidate.track_id)))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| b.0.frame_id.cmp(&a.0.frame_id))
        });
        ranked
            .into_iter()
            .take(self.settings.best_frames.max(1))
            .map(|(f, _)| f)
            .collect()
    }

    /// Write a complete packet for `candidate` from the given window.
    /// On error nothing is left behind on disk.
    pub fn package(
        &self,
        violation_id: &str,
        candidate: &ViolationCandidate,
        window: &[Arc<FrameSnapshot>],
    ) -> Result<EvidencePacket> {
        if window.is_empty() {
            return Err(EvidenceError::NoFrames.into());
        }
        let dir = self.settings.evidence_dir.join(violation_id);
        fs::create_dir_all(&dir)
            .map_err(|e| anyhow!("failed to create evidence dir {}: {}", dir.display(), e))?;
        match self.write_packet(violation_id, candidate, window, &dir) {
            Ok(packet) => Ok(packet),
            Err(e) => {
                if let Err(cleanup) = release_dir(&dir) {
                    warn!("{}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn write_packet(
        &self,
        violation_id: &str,
        candidate: &ViolationCandidate,
        window: &[Arc<FrameSnapshot>],
        dir: &Path,
    ) -> Result<EvidencePacket> {
        let mut artifacts = Vec::new();
        for (i, frame) in self.select_best(candidate, window).into_iter().enumerate() {
            let pixels = annotate(frame, candidate.track_id);
            let jpeg = encode_jpeg(&pixels, frame.width, frame.height, self.settings.jpeg_quality)?;
            let name = format!("frame_{:02}.jpg", i);
            write_atomic(&dir.join(&name), &jpeg)?;
            artifacts.push(Artifact {
                name,
                kind: ArtifactKind::Frame,
                sha256: sha256_hex(&jpeg),
                size: jpeg.len() as u64,
                frame_id: Some(frame.frame_id),
            });
        }

        let mut clip: Vec<Arc<FrameSnapshot>> = window.to_vec();
        clip.sort_by_key(|f| f.frame_id);
        if !self.encoders.is_empty() {
            let out = dir.join("clip.mp4");
            match encode_with_fallback(&self.encoders, &clip, self.settings.video_fps, &out) {
                Ok(_) => {
                    let bytes = fs::read(&out)?;
                    File::open(&out)?.sync_all()?;
                    artifacts.push(Artifact {
                        name: "clip.mp4".to_string(),
                        kind: ArtifactKind::Video,
                        sha256: sha256_hex(&bytes),
                        size: bytes.len() as u64,
                        frame_id: None,
                    });
                }
                Err(e) => warn!("{}: continuing without clip: {}", violation_id, e),
            }
        }

        let metadata = EvidenceMetadata {
            violation_id: violation_id.to_string(),
            kind: candidate.kind,
            display_name: candidate.kind.display_name().to_string(),
            confidence: candidate.confidence,
            tier: candidate.tier,
            track_id: candidate.track_id,
            timestamp_ms: candidate.created_at_ms,
            consecutive_frames: candidate.consecutive_frames,
            supporting_frames: candidate.supporting_frames.clone(),
            clip_frame_count: clip.len(),
            plate_text: candidate.plate_text.clone(),
            plate_confidence: candidate.plate_confidence,
            gps: candidate.gps.and_then(GpsFix::sanitized),
            caption: caption(candidate),
            artifacts,
        };
        let metadata_bytes = serde_json::to_vec_pretty(&metadata)?;
        write_atomic(&dir.join(METADATA_FILE), &metadata_bytes)?;

        let digest = Sha256::digest(&metadata_bytes);
        let manifest = Manifest {
            metadata_sha256: hex::encode(digest),
            signature: self
                .signer
                .as_ref()
                .map(|key| hex::encode(key.sign(digest.as_slice()).to_bytes())),
            public_key: self
                .signer
                .as_ref()
                .map(|key| hex::encode(key.verifying_key().to_bytes())),
        };
        write_atomic(&dir.join(MANIFEST_FILE), &serde_json::to_vec_pretty(&manifest)?)?;

        let packet = EvidencePacket {
            violation_id: violation_id.to_string(),
            dir: dir.to_path_buf(),
            metadata,
            manifest,
        };
        info!(
            "evidence packaged: {} ({}, conf={:.2}, frames={}, clip={})",
            violation_id,
            candidate.kind,
            candidate.confidence,
            packet.frames().count(),
            packet.video().is_some()
        );
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActionTier, BoundingBox, CandidateStatus, Detection, ObjectClass, ViolationKind};

    fn candidate() -> ViolationCandidate {
        ViolationCandidate {
            kind: ViolationKind::RedLightJump,
            confidence: 0.91,
            tier: ActionTier::Verify,
            track_id: 3,
            supporting_frames: vec![1, 2, 3],
            plate_text: None,
            plate_confidence: None,
            gps: None,
            created_at_ms: 300,
            consecutive_frames: 3,
            status: CandidateStatus::Emitted,
        }
    }

    fn frame(id: u64, conf: f32) -> Arc<FrameSnapshot> {
        Arc::new(
            FrameSnapshot::blank(id, id * 100, 16, 12).with_detections(vec![Detection::new(
                ObjectClass::Car,
                BoundingBox::new(0.2, 0.5, 0.5, 0.9),
                conf,
                id,
                id * 100,
            )
            .with_track(3)]),
        )
    }

    fn packager(dir: &Path) -> EvidencePackager {
        let settings = EvidenceSettings {
            evidence_dir: dir.to_path_buf(),
            video_enabled: false,
            ..EvidenceSettings::default()
        };
        EvidencePackager::new(settings, None)
    }

    #[test]
    fn empty_window_is_no_frames() {
        let dir = tempfile::tempdir().unwrap();
        let err = packager(dir.path())
            .package("v1", &candidate(), &[])
            .unwrap_err();
        assert_eq!(err.downcast_ref::<EvidenceError>(), Some(&EvidenceError::NoFrames));
        assert!(!dir.path().join("v1").exists());
    }

    #[test]
    fn selects_top_frames_with_recency_tiebreak() {
        let dir = tempfile::tempdir().unwrap();
        let p = packager(dir.path());
        let window = vec![frame(1, 0.8), frame(2, 0.9), frame(3, 0.8), frame(4, 0.7)];
        let ids: Vec<u64> = p
            .select_best(&candidate(), &window)
            .iter()
            .map(|f| f.frame_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn writes_complete_packet() {
        let dir = tempfile::tempdir().unwrap();
        let p = packager(dir.path());
        let window = vec![frame(1, 0.8), frame(2, 0.9)];
        let packet = p.package("v1", &candidate(), &window).unwrap();
        assert_eq!(packet.frames().count(), 2);
        assert!(packet.video().is_none());
        assert!(dir.path().join("v1/frame_00.jpg").exists());
        assert!(dir.path().join("v1/manifest.json").exists());
        assert_eq!(packet.metadata.artifacts[0].frame_id, Some(2));
        assert_eq!(packet.metadata.display_name, "Red Light Violation");
        packet.verify(None).unwrap();
    }

    fn signing_packager(dir: &Path, seed: &str) -> EvidencePackager {
        let settings = EvidenceSettings {
            evidence_dir: dir.to_path_buf(),
            video_enabled: false,
            ..EvidenceSettings::default()
        };
        EvidencePackager::new(settings, Some(signing_key_from_seed(seed).unwrap()))
    }

    #[test]
    fn signed_manifest_verifies_and_detects_tamper() {
        let dir = tempfile::tempdir().unwrap();
        let p = signing_packager(dir.path(), "unit-test-device");
        let device = p.verifying_key().unwrap();
        let packet = p.package("v2", &candidate(), &[frame(1, 0.9)]).unwrap();
        assert!(packet.manifest.signature.is_some());
        packet.verify(Some(&device)).unwrap();

        let mut forged = packet.clone();
        forged.manifest.signature = Some(hex::encode([0u8; 64]));
        assert_eq!(forged.verify(Some(&device)), Err(EvidenceError::BadSignature));
    }

    #[test]
    fn packet_resigned_with_foreign_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let device = signing_packager(dir.path(), "unit-test-device");
        let device_key = device.verifying_key().unwrap();
        device.package("v4", &candidate(), &[frame(1, 0.9)]).unwrap();

        let mut rewritten = candidate();
        rewritten.kind = ViolationKind::WrongSide;
        signing_packager(dir.path(), "someone-else")
            .package("v4", &rewritten, &[frame(2, 0.95)])
            .unwrap();

        let loaded = EvidencePacket::load(dir.path(), "v4").unwrap();
        assert_eq!(loaded.metadata.kind, ViolationKind::WrongSide);
        assert_eq!(loaded.verify(None), Ok(()));
        assert_eq!(loaded.verify(Some(&device_key)), Err(EvidenceError::BadSignature));

        // Same forgery without the recorded key still fails on the signature.
        let mut anonymous = loaded.clone();
        anonymous.manifest.public_key = None;
        assert_eq!(
            anonymous.verify(Some(&device_key)),
            Err(EvidenceError::BadSignature)
        );
    }

    #[test]
    fn stripped_signature_fails_when_device_key_is_known() {
        let dir = tempfile::tempdir().unwrap();
        let p = signing_packager(dir.path(), "unit-test-device");
        let device_key = p.verifying_key().unwrap();
        let packet = p.package("v5", &candidate(), &[frame(1, 0.9)]).unwrap();

        let stripped = Manifest {
            signature: None,
            public_key: None,
            ..packet.manifest.clone()
        };
        write_atomic(
            &packet.dir.join(MANIFEST_FILE),
            &serde_json::to_vec_pretty(&stripped).unwrap(),
        )
        .unwrap();

        let loaded = EvidencePacket::load(dir.path(), "v5").unwrap();
        assert_eq!(
            loaded.verify(Some(&device_key)),
            Err(EvidenceError::BadSignature)
        );
        assert_eq!(loaded.verify(None), Ok(()));
    }

    #[test]
    fn verifying_key_round_trips_through_hex() {
        let key = signing_key_from_seed("unit-test-device").unwrap().verifying_key();
        let parsed = parse_verifying_key(&hex::encode(key.to_bytes())).unwrap();
        assert_eq!(parsed, key);
        assert!(parse_verifying_key("abcd").is_err());
    }

    #[test]
    fn nan_heading_still_yields_a_verifiable_packet() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = candidate();
        c.gps = Some(GpsFix {
            latitude: 18.52,
            longitude: 73.85,
            heading_deg: Some(f64::NAN),
            speed_kmh: 0.0,
            fix_quality: 1,
        });
        packager(dir.path())
            .package("v6", &c, &[frame(1, 0.9)])
            .unwrap();
        let loaded = EvidencePacket::load(dir.path(), "v6").unwrap();
        loaded.verify(None).unwrap();
        let gps = loaded.metadata.gps.unwrap();
        assert_eq!(gps.heading_deg, None);
        assert_eq!(gps.latitude, 18.52);
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let packet = packager(dir.path())
            .package("v3", &candidate(), &[frame(1, 0.9)])
            .unwrap();
        packet.release().unwrap();
        assert!(!packet.dir.exists());
        packet.release().unwrap();
    }

    #[test]
    fn empty_seed_is_rejected() {
        assert!(signing_key_from_seed("   ").is_err());
    }
}
