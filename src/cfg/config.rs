// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::{Path, PathBuf}, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{PartitionsMode, TimeoutPolicy};

/// TLS material for shard connections (spec.md §4.1 "the connection
/// wraps itself in a TLS session using the host's CA/cert/key
/// material"). Presence of a `Tls` block in the config turns TLS on for
/// every shard connection this process dials; the individual fields are
/// all optional so a deployment can lean on the platform's native trust
/// store and skip mutual-TLS entirely.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// CA bundle used to verify a shard's certificate. `None` falls back
    /// to the OS-native trust store (mirrors `rustls-native-certs`).
    #[serde(rename = "CaFile", default)]
    pub ca_file: Option<PathBuf>,

    /// Client certificate for mutual TLS, paired with `key_file`.
    #[serde(rename = "CertFile", default)]
    pub cert_file: Option<PathBuf>,

    /// Private key for `cert_file`.
    #[serde(rename = "KeyFile", default)]
    pub key_file: Option<PathBuf>,
}

/// Coordinator-wide configuration (spec §6.1 "Configuration parameters").
///
/// Loaded from YAML via [`Config::load_from_file`], or assembled from
/// loose `key=value` pairs via [`Config::from_args`] the way the original
/// module accepted both a config file and inline module-load arguments.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// `TIMEOUT` — default coordinator request deadline, in milliseconds.
    #[serde(rename = "Timeout", with = "serde_millis")]
    pub timeout: Duration,

    /// `SEARCH_THREADS` — worker-pool size for CPU-bound reducers (spec §5).
    #[serde(rename = "SearchThreads")]
    pub search_threads: usize,

    /// `CONN_PER_SHARD` — connection-pool size per shard. `None` means
    /// "default to `io_threads + 1`" per spec §5.
    #[serde(rename = "ConnPerShard", default)]
    pub conn_per_shard: Option<usize>,

    /// `CURSOR_REPLY_THRESHOLD` — channel threshold consulted by
    /// `Iterator::maybe_trigger_next` (spec §4.7).
    #[serde(rename = "CursorReplyThreshold")]
    pub cursor_reply_threshold: usize,

    /// `TOPOLOGY_VALIDATION_TIMEOUT` — failure timer for readiness gating,
    /// in milliseconds; `0` means unlimited (spec §4.3).
    #[serde(rename = "TopologyValidationTimeout", with = "serde_millis_opt")]
    pub topology_validation_timeout: Option<Duration>,

    /// `PARTITIONS` — deprecated, always `Auto`.
    #[serde(rename = "Partitions", default)]
    pub partitions: PartitionsMode,

    /// `OSS_GLOBAL_PASSWORD` — deprecated, kept only so old config files
    /// parse without error.
    #[serde(rename = "OssGlobalPassword", default)]
    pub oss_global_password: Option<String>,

    /// Strict vs. relaxed timeout policy (spec §5, §9), not itself a named
    /// config key in §6.1 but the knob those timers feed.
    #[serde(rename = "TimeoutPolicy", default)]
    pub timeout_policy: TimeoutPolicy,

    /// Number of `IORuntime` reactor threads backing the `Cluster` (spec
    /// §5 "fixed pool of N reactor threads").
    #[serde(rename = "IoThreads")]
    pub io_threads: usize,

    /// TLS material for shard connections (spec §4.1). `None` means
    /// plaintext, the default.
    #[serde(rename = "Tls", default)]
    pub tls: Option<TlsConfig>,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Assembles a `Config` from `NAME VALUE` pairs the way module-load
    /// arguments are passed (spec §6.1 table; the original coordinator
    /// also accepts these inline rather than only via a config file).
    pub fn from_args(pairs: &[(&str, &str)]) -> Result<Self> {
        let mut cfg = Config::default();
        for &(name, value) in pairs {
            match name.to_ascii_uppercase().as_str() {
                "TIMEOUT" => {
                    cfg.timeout = Duration::from_millis(
                        value.parse().context("TIMEOUT must be an integer")?,
                    )
                },
                "SEARCH_THREADS" => {
                    cfg.search_threads =
                        value.parse().context("SEARCH_THREADS must be an integer")?
                },
                "CONN_PER_SHARD" => {
                    cfg.conn_per_shard = Some(
                        value.parse().context("CONN_PER_SHARD must be an integer")?,
                    )
                },
                "CURSOR_REPLY_THRESHOLD" => {
                    cfg.cursor_reply_threshold = value
                        .parse()
                        .context("CURSOR_REPLY_THRESHOLD must be an integer")?
                },
                "TOPOLOGY_VALIDATION_TIMEOUT" => {
                    let ms: u64 = value
                        .parse()
                        .context("TOPOLOGY_VALIDATION_TIMEOUT must be an integer")?;
                    cfg.topology_validation_timeout =
                        (ms > 0).then(|| Duration::from_millis(ms));
                },
                "PARTITIONS" => {
                    // Deprecated; accepted and ignored (always Auto).
                },
                "OSS_GLOBAL_PASSWORD" => {
                    cfg.oss_global_password = Some(value.to_string());
                },
                "IO_THREADS" => {
                    cfg.io_threads =
                        value.parse().context("IO_THREADS must be an integer")?
                },
                "TLS" => {
                    cfg.tls = value
                        .parse::<bool>()
                        .context("TLS must be true or false")?
                        .then(TlsConfig::default);
                },
                "TLS_CA_FILE" => {
                    cfg.tls.get_or_insert_with(TlsConfig::default).ca_file =
                        Some(PathBuf::from(value));
                },
                "TLS_CERT_FILE" => {
                    cfg.tls.get_or_insert_with(TlsConfig::default).cert_file =
                        Some(PathBuf::from(value));
                },
                "TLS_KEY_FILE" => {
                    cfg.tls.get_or_insert_with(TlsConfig::default).key_file =
                        Some(PathBuf::from(value));
                },
                other => anyhow::bail!("unrecognized configuration parameter: {other}"),
            }
        }
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.io_threads >= 1, "IoThreads must be >= 1");
        ensure!(self.search_threads >= 1, "SearchThreads must be >= 1");
        ensure!(
            self.cursor_reply_threshold >= 1,
            "CursorReplyThreshold must be >= 1"
        );

        if self.conn_per_shard.is_none() {
            // Spec §5: "Pool size is tied to the number of worker threads + 1 by
            // default."
            self.conn_per_shard = Some(self.io_threads + 1);
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            search_threads: 2,
            conn_per_shard: None,
            cursor_reply_threshold: 1,
            topology_validation_timeout: Some(Duration::from_secs(30)),
            partitions: PartitionsMode::Auto,
            oss_global_password: None,
            timeout_policy: TimeoutPolicy::Strict,
            io_threads: 1,
            tls: None,
        }
    }
}

/// Serde helpers for representing a mandatory `Duration` as milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Serde helpers for representing `0 => None`, `n => Some(n ms)`.
mod serde_millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.map(|d| d.as_millis() as u64).unwrap_or(0))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok((ms > 0).then(|| Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_per_shard_defaults_to_io_threads_plus_one() {
        let mut cfg = Config {
            io_threads: 4,
            ..Config::default()
        };
        cfg.validate_and_normalize().expect("valid");
        assert_eq!(cfg.conn_per_shard, Some(5));
    }

    #[test]
    fn from_args_parses_known_keys() {
        let cfg = Config::from_args(&[
            ("TIMEOUT", "1000"),
            ("SEARCH_THREADS", "4"),
            ("IO_THREADS", "2"),
            ("CURSOR_REPLY_THRESHOLD", "1"),
            ("TOPOLOGY_VALIDATION_TIMEOUT", "0"),
        ])
        .expect("parses");
        assert_eq!(cfg.timeout, Duration::from_millis(1000));
        assert_eq!(cfg.search_threads, 4);
        assert_eq!(cfg.topology_validation_timeout, None);
        assert_eq!(cfg.conn_per_shard, Some(3));
    }

    #[test]
    fn from_args_rejects_unknown_key() {
        let err = Config::from_args(&[("BOGUS", "1")]).unwrap_err();
        assert!(err.to_string().contains("unrecognized"));
    }

    #[test]
    fn from_args_enables_tls_and_sets_ca_file() {
        let cfg = Config::from_args(&[
            ("TIMEOUT", "1000"),
            ("SEARCH_THREADS", "1"),
            ("IO_THREADS", "1"),
            ("CURSOR_REPLY_THRESHOLD", "1"),
            ("TOPOLOGY_VALIDATION_TIMEOUT", "0"),
            ("TLS", "true"),
            ("TLS_CA_FILE", "/etc/coord/ca.pem"),
        ])
        .expect("parses");
        let tls = cfg.tls.expect("tls enabled");
        assert_eq!(tls.ca_file, Some(PathBuf::from("/etc/coord/ca.pem")));
    }

    #[test]
    fn zero_io_threads_is_rejected() {
        let mut cfg = Config {
            io_threads: 0,
            ..Config::default()
        };
        assert!(cfg.validate_and_normalize().is_err());
    }
}
