use anyhow::{anyhow, Result};
use log::{debug, warn};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::frame::FrameSnapshot;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Encodes a frame sequence into a video file at `out`.
pub trait VideoEncoder: Send + Sync {
    fn name(&self) -> &str;

    fn encode(&self, frames: &[Arc<FrameSnapshot>], fps: f32, out: &Path) -> Result<()>;
}

/// H.264 MP4 through an `ffmpeg` subprocess fed raw RGB on stdin.
pub struct FfmpegEncoder {
    binary: String,
    codec: String,
    codec_args: Vec<String>,
    timeout: Duration,
}

impl FfmpegEncoder {
    pub fn new(binary: &str, codec: &str, codec_args: &[&str], timeout: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            codec: codec.to_string(),
            codec_args: codec_args.iter().map(|s| s.to_string()).collect(),
            timeout,
        }
    }

    /// V4L2 memory-to-memory hardware encoder.
    pub fn hardware(binary: &str, timeout: Duration) -> Self {
        Self::new(
            binary,
            "h264_v4l2m2m",
            &["-b:v", "1M", "-maxrate", "1.5M", "-bufsize", "2M"],
            timeout,
        )
    }

    pub fn software(binary: &str, timeout: Duration) -> Self {
        Self::new(binary, "libx264", &["-preset", "fast", "-crf", "28"], timeout)
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn name(&self) -> &str {
        &self.codec
    }

    fn encode(&self, frames: &[Arc<FrameSnapshot>], fps: f32, out: &Path) -> Result<()> {
        let first = frames
            .first()
            .ok_or_else(|| anyhow!("no frames to encode"))?;
        let (w, h) = (first.width, first.height);
        let frames: Vec<Arc<FrameSnapshot>> = frames
            .iter()
            .filter(|f| f.width == w && f.height == h)
            .cloned()
            .collect();

        let mut child = Command::new(&self.binary)
            .args(["-y", "-hide_banner", "-loglevel", "error"])
            .args(["-f", "rawvideo", "-vcodec", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-s")
            .arg(format!("{}x{}", w, h))
            .arg("-r")
            .arg(format!("{}", fps))
            .args(["-i", "-", "-c:v", self.codec.as_str()])
            .args(&self.codec_args)
            .args(["-pix_fmt", "yuv420p", "-f", "mp4"])
            .arg(out)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("failed to spawn {}: {}", self.binary, e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdin unavailable"))?;
        let writer = thread::spawn(move || -> std::io::Result<()> {
            for frame in &frames {
                stdin.write_all(frame.pixels())?;
            }
            Ok(())
        });
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(anyhow!(
                        "{} timed out after {:?}",
                        self.codec,
                        self.timeout
                    ));
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        };
        let write_result = writer
            .join()
            .map_err(|_| anyhow!("ffmpeg writer thread panicked"))?;
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        if !status.success() {
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.codec,
                status,
                stderr.trim()
            ));
        }
        write_result.map_err(|e| anyhow!("{} input write failed: {}", self.codec, e))?;
        Ok(())
    }
}

/// Try each encoder in turn; the first success wins. Returns the encoder
/// name that produced `out`.
pub fn encode_with_fallback(
    encoders: &[Box<dyn VideoEncoder>],
    frames: &[Arc<FrameSnapshot>],
    fps: f32,
    out: &Path,
) -> Result<String> {
    let mut last_err = anyhow!("no video encoders configured");
    for encoder in encoders {
        match encoder.encode(frames, fps, out) {
            Ok(()) if out.exists() => {
                debug!("clip encoded with {}", encoder.name());
                return Ok(encoder.name().to_string());
            }
            Ok(()) => {
                last_err = anyhow!("{} reported success but wrote nothing", encoder.name());
            }
            Err(e) => {
                warn!("video encoder {} failed: {}", encoder.name(), e);
                last_err = e;
            }
        }
        let _ = std::fs::remove_file(out);
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;
    impl VideoEncoder for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn encode(&self, _: &[Arc<FrameSnapshot>], _: f32, _: &Path) -> Result<()> {
            Err(anyhow!("no hardware"))
        }
    }

    struct Writes;
    impl VideoEncoder for Writes {
        fn name(&self) -> &str {
            "writes"
        }
        fn encode(&self, frames: &[Arc<FrameSnapshot>], _: f32, out: &Path) -> Result<()> {
            std::fs::write(out, format!("{} frames", frames.len()))?;
            Ok(())
        }
    }

    #[test]
    fn falls_back_to_next_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("clip.mp4");
        let frames = vec![Arc::new(FrameSnapshot::blank(1, 0, 4, 4))];
        let encoders: Vec<Box<dyn VideoEncoder>> = vec![Box::new(Failing), Box::new(Writes)];
        let used = encode_with_fallback(&encoders, &frames, 8.0, &out).unwrap();
        assert_eq!(used, "writes");
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "1 frames");
    }

    #[test]
    fn all_encoders_failing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("clip.mp4");
        let frames = vec![Arc::new(FrameSnapshot::blank(1, 0, 4, 4))];
        let encoders: Vec<Box<dyn VideoEncoder>> = vec![Box::new(Failing)];
        assert!(encode_with_fallback(&encoders, &frames, 8.0, &out).is_err());
        assert!(!out.exists());
    }

    #[test]
    fn missing_binary_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("clip.mp4");
        let frames = vec![Arc::new(FrameSnapshot::blank(1, 0, 4, 4))];
        let encoder = FfmpegEncoder::software("/nonexistent/ffmpeg", Duration::from_secs(1));
        assert!(encoder.encode(&frames, 8.0, &out).is_err());
    }
}
