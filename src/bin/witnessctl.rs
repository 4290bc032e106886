//! witnessctl - operator CLI for the traffic witness store
//!
//! Reads the same configuration as the daemon and works on its database and
//! evidence directory while the daemon is running.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::VerifyingKey;
use std::path::{Path, PathBuf};

use traffic_witness::config::TrafficWitnessConfig;
use traffic_witness::evidence::{parse_verifying_key, signing_key_from_seed};
use traffic_witness::{now_ms, EvidencePacket, QueueKind, WitnessStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "TRAFFIC_WITNESS_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify evidence packets (one violation, or every packet on disk).
    ///
    /// Signatures are checked against the device key: `--public-key`,
    /// `--public-key-file`, or the one derived from the configured seed.
    Verify {
        #[arg(long)]
        violation: Option<String>,
        /// Device verifying key (32 bytes, hex).
        #[arg(long, value_name = "HEX", conflicts_with = "public_key_file")]
        public_key: Option<String>,
        /// File holding the device verifying key as hex.
        #[arg(long, value_name = "PATH")]
        public_key_file: Option<PathBuf>,
        /// Check hashes only when no device key is available.
        #[arg(long, default_value_t = false)]
        allow_unsigned: bool,
    },
    /// Show queue depths and the most recent error.
    Status,
    /// List recent integrity alarms.
    Alarms {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Return interrupted queue items to pending. Run with the daemon stopped.
    Recover,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("TRAFFIC_WITNESS_CONFIG", path);
    }
    let cfg = TrafficWitnessConfig::load()?;

    match args.command {
        Command::Verify {
            violation,
            public_key,
            public_key_file,
            allow_unsigned,
        } => {
            let key = device_key(&cfg, public_key, public_key_file.as_deref(), allow_unsigned)?;
            verify(&cfg, violation.as_deref(), key.as_ref())
        }
        Command::Status => status(&cfg),
        Command::Alarms { limit } => alarms(&cfg, limit),
        Command::Recover => {
            let mut store = WitnessStore::open(&cfg.db_path)?;
            let recovered = store.recover_interrupted(now_ms()?)?;
            println!("recovered {} item(s)", recovered);
            Ok(())
        }
    }
}

fn device_key(
    cfg: &TrafficWitnessConfig,
    public_key: Option<String>,
    public_key_file: Option<&Path>,
    allow_unsigned: bool,
) -> Result<Option<VerifyingKey>> {
    let hex = match (public_key, public_key_file) {
        (Some(hex), _) => Some(hex),
        (None, Some(path)) => Some(
            std::fs::read_to_string(path)
                .map_err(|e| anyhow!("cannot read {}: {}", path.display(), e))?,
        ),
        (None, None) => None,
    };
    if let Some(hex) = hex {
        return parse_verifying_key(hex.trim()).map(Some);
    }
    if let Some(seed) = cfg.device_key_seed.as_deref() {
        return Ok(Some(signing_key_from_seed(seed)?.verifying_key()));
    }
    if allow_unsigned {
        log::warn!("no device key; checking hashes only");
        return Ok(None);
    }
    Err(anyhow!(
        "no device key: pass --public-key or --public-key-file, set TRAFFIC_WITNESS_DEVICE_KEY_SEED, or use --allow-unsigned"
    ))
}

fn verify(
    cfg: &TrafficWitnessConfig,
    violation: Option<&str>,
    key: Option<&VerifyingKey>,
) -> Result<()> {
    let dirs: Vec<PathBuf> = match violation {
        Some(id) => {
            let store = WitnessStore::open(&cfg.db_path)?;
            let record = store
                .violation(id)?
                .ok_or_else(|| anyhow!("violation {} not found", id))?;
            vec![record.evidence_dir]
        }
        None => {
            let root = &cfg.evidence.evidence_dir;
            let mut dirs = Vec::new();
            for entry in std::fs::read_dir(root)
                .map_err(|e| anyhow!("cannot read {}: {}", root.display(), e))?
            {
                let path = entry?.path();
                if path.is_dir() {
                    dirs.push(path);
                }
            }
            dirs.sort();
            dirs
        }
    };

    let mut failures = 0usize;
    for dir in &dirs {
        let result = EvidencePacket::load_dir(dir).and_then(|packet| {
            packet.verify(key)?;
            Ok(packet)
        });
        match result {
            Ok(packet) => println!(
                "OK   {} ({} artifacts{})",
                packet.violation_id,
                packet.metadata.artifacts.len(),
                if packet.manifest.signature.is_some() {
                    ", signed"
                } else {
                    ""
                }
            ),
            Err(e) => {
                failures += 1;
                println!("FAIL {}: {}", dir.display(), e);
            }
        }
    }
    println!("{} packet(s) checked, {} failed", dirs.len(), failures);
    if failures > 0 {
        return Err(anyhow!("{} packet(s) failed verification", failures));
    }
    Ok(())
}

fn status(cfg: &TrafficWitnessConfig) -> Result<()> {
    let store = WitnessStore::open(&cfg.db_path)?;
    for queue in QueueKind::ALL {
        let stats = store.queue_stats(queue)?;
        println!(
            "{:<12} pending={} processing={} done={} failed={}",
            queue.as_str(),
            stats.pending,
            stats.processing,
            stats.done,
            stats.failed
        );
    }
    match store.last_queue_error()? {
        Some(err) => println!("last error: {}", err),
        None => println!("last error: none"),
    }
    Ok(())
}

fn alarms(cfg: &TrafficWitnessConfig, limit: usize) -> Result<()> {
    let store = WitnessStore::open(&cfg.db_path)?;
    let alarms = store.alarms(limit)?;
    if alarms.is_empty() {
        println!("no alarms");
    }
    for alarm in alarms {
        println!("{} {} {}", alarm.created_ms, alarm.code, alarm.message);
    }
    Ok(())
}
