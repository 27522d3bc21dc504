/*!
Configuration management for the acquisition simulator.

One TOML file describes a run: the tier and scan mode, transport and
reassembly tuning, network impairment, injected faults and the UDP
loopback socket. Durations are written in milliseconds and converted to
the nanosecond clock the pipeline runs on.
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use shared::{ScanMode, Tier, TierParams};

use crate::acquisition::{EngineOptions, DEFAULT_LINK_TRAIN_TICKS, DEFAULT_WATCHDOG_NS};
use crate::fault::FaultSpec;
use crate::fragmenter::DEFAULT_HISTORY_FRAMES;
use crate::impairment::ImpairmentConfig;
use crate::pipeline::{PipelineConfig, DEFAULT_LINK_CAPACITY, DEFAULT_NET_CAPACITY};
use crate::reassembly::{
    ReassemblyConfig, DEFAULT_MAX_RECOVERABLE_LOSS, DEFAULT_MAX_RESEND_ROUNDS, DEFAULT_MAX_SLOTS,
    DEFAULT_RESEND_DELAY_NS, DEFAULT_TIMEOUT_NS,
};
use crate::transport::TransportConfig;

const NS_PER_MS: u64 = 1_000_000;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub scan: ScanConfig,
    pub engine: EngineConfig,
    pub transport: TransportSection,
    pub reassembly: ReassemblySection,
    pub network: ImpairmentConfig,
    pub udp: UdpConfig,
    pub faults: Vec<FaultSpec>,
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.as_ref().display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Tier parameters after applying any geometry overrides
    pub fn tier_params(&self) -> TierParams {
        let mut params = self.scan.tier.params();
        if let Some(rows) = self.scan.rows {
            params.rows = rows;
        }
        if let Some(cols) = self.scan.cols {
            params.cols = cols;
        }
        if let Some(fps) = self.scan.target_fps {
            params.target_fps = fps;
        }
        params
    }

    pub fn validate(&self) -> Result<()> {
        let pipeline = self.to_pipeline_config();
        pipeline.validate().context("pipeline settings rejected")?;
        if self.udp.channel_capacity == 0 {
            anyhow::bail!("udp.channel_capacity must be non-zero");
        }
        Ok(())
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        let params = self.tier_params();
        let mut config = PipelineConfig::new(params, self.scan.mode);
        config.engine = EngineOptions {
            watchdog_ns: self.engine.watchdog_ms * NS_PER_MS,
            link_train_ticks: self.engine.link_train_ticks,
            self_check: self.engine.self_check,
        };
        config.transport = TransportConfig {
            max_payload: self.transport.max_payload,
            history_frames: self.transport.history_frames,
            confirm_ticks: self.transport.confirm_ticks,
            arm_timeout_ticks: self.transport.arm_timeout_ticks,
        };
        config.reassembly = ReassemblyConfig {
            max_slots: self.reassembly.max_slots,
            timeout_ns: self.reassembly.timeout_ms * NS_PER_MS,
            resend_delay_ns: self.reassembly.resend_delay_ms * NS_PER_MS,
            max_resend_rounds: self.reassembly.max_resend_rounds,
            max_recoverable_loss: self.reassembly.max_recoverable_loss,
            max_payload: self.transport.max_payload,
        };
        config.impairment = self.network;
        config.faults = self.faults.clone();
        config.link_capacity = self.engine.link_capacity;
        config.net_capacity = self.transport.net_capacity;
        config
    }
}

/// Tier, mode and run length
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub tier: Tier,
    pub mode: ScanMode,
    /// Frames per run; 0 runs until interrupted
    pub frames: u32,
    /// Reduced geometry for verification runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_fps: Option<u32>,
    /// Safety stop for the simulation loop
    pub max_ticks: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            tier: Tier::Minimum,
            mode: ScanMode::Single,
            frames: 1,
            rows: None,
            cols: None,
            target_fps: None,
            max_ticks: 10_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub watchdog_ms: u64,
    pub link_train_ticks: u64,
    /// Verify each line's CRC before it leaves the engine
    pub self_check: bool,
    pub link_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            watchdog_ms: DEFAULT_WATCHDOG_NS / NS_PER_MS,
            link_train_ticks: DEFAULT_LINK_TRAIN_TICKS,
            self_check: true,
            link_capacity: DEFAULT_LINK_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSection {
    /// Largest fragment payload in bytes
    pub max_payload: usize,
    pub history_frames: usize,
    pub confirm_ticks: u64,
    pub arm_timeout_ticks: u64,
    pub net_capacity: usize,
}

impl Default for TransportSection {
    fn default() -> Self {
        let defaults = TransportConfig::default();
        Self {
            max_payload: defaults.max_payload,
            history_frames: DEFAULT_HISTORY_FRAMES,
            confirm_ticks: defaults.confirm_ticks,
            arm_timeout_ticks: defaults.arm_timeout_ticks,
            net_capacity: DEFAULT_NET_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblySection {
    pub max_slots: usize,
    pub timeout_ms: u64,
    pub resend_delay_ms: u64,
    pub max_resend_rounds: u8,
    /// Fraction of missing fragments beyond which a frame is given up
    pub max_recoverable_loss: f64,
}

impl Default for ReassemblySection {
    fn default() -> Self {
        Self {
            max_slots: DEFAULT_MAX_SLOTS,
            timeout_ms: DEFAULT_TIMEOUT_NS / NS_PER_MS,
            resend_delay_ms: DEFAULT_RESEND_DELAY_NS / NS_PER_MS,
            max_resend_rounds: DEFAULT_MAX_RESEND_ROUNDS,
            max_recoverable_loss: DEFAULT_MAX_RECOVERABLE_LOSS,
        }
    }
}

/// Loopback socket used by the `udp` subcommand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub bind_addr: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub recv_buffer_bytes: usize,
    pub channel_capacity: usize,
    pub recv_timeout_ms: u64,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            recv_buffer_bytes: 4 * 1024 * 1024,
            channel_capacity: 10_000,
            recv_timeout_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultKind, Persistence};
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_roundtrip() {
        let mut original = AppConfig::new();
        original.scan.rows = Some(64);
        original.network.loss_rate = 0.05;
        original.faults.push(FaultSpec::once(FaultKind::LinkStall { row: 3, ticks: 9 }).from_frame(2));

        let temp_file = NamedTempFile::new().unwrap();
        original.save_to_file(temp_file.path()).unwrap();
        let loaded = AppConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::new();

        assert_eq!(config.scan.tier, Tier::Minimum);
        assert_eq!(config.scan.mode, ScanMode::Single);
        assert_eq!(config.transport.max_payload, 8192);
        assert_eq!(config.reassembly.timeout_ms, 1500);
        assert_eq!(config.udp.bind_addr, "127.0.0.1");
        assert!(config.network.is_clean());
        assert!(config.faults.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_hand_written_file() {
        let text = r#"
            [scan]
            tier = "intermediate"
            mode = "continuous"
            frames = 20
            rows = 32
            cols = 64

            [network]
            loss_rate = 0.01
            reorder_window = 4

            [[faults]]
            kind = "sensor_stall"
            row = 5
            persistence = "always"

            [[faults]]
            kind = "link_init"
            persistence = { times = 2 }
            from_frame = 7
        "#;
        let config: AppConfig = toml::from_str(text).unwrap();
        config.validate().unwrap();

        let params = config.tier_params();
        assert_eq!((params.rows, params.cols, params.target_fps), (32, 64, 15));
        assert_eq!(config.scan.mode, ScanMode::Continuous);
        assert_eq!(config.network.reorder_window, 4);
        assert_eq!(config.faults.len(), 2);
        assert_eq!(config.faults[0], FaultSpec::always(FaultKind::SensorStall { row: 5 }));
        assert_eq!(config.faults[1].persistence, Persistence::Times(2));
        assert_eq!(config.faults[1].from_frame, 7);

        let pipeline = config.to_pipeline_config();
        assert_eq!(pipeline.reassembly.max_payload, pipeline.transport.max_payload);
        assert_eq!(pipeline.reassembly.timeout_ns, 1_500_000_000);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut config = AppConfig::new();
        config.scan.target_fps = Some(5000);
        assert!(config.validate().is_err());

        let mut config = AppConfig::new();
        config.network.loss_rate = 1.5;
        assert!(config.validate().is_err());

        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[scan]\ntier = \"huge\"\n").unwrap();
        assert!(AppConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_retry_count_is_not_configurable() {
        for text in ["[transport]\nmax_retries = 7\n", "[transport]\nmax_retries = 0\n"] {
            assert!(toml::from_str::<AppConfig>(text).is_err(), "{}", text);
        }

        let saved = toml::to_string(&AppConfig::new()).unwrap();
        assert!(!saved.contains("max_retries"));
    }
}
