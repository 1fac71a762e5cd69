//! Plant configuration with layered loading
//!
//! Configuration is loaded from multiple sources (lowest to highest priority):
//! 1. Compiled defaults
//! 2. `bottling.ron` file (if exists), or an explicit file which must exist
//! 3. Environment variables prefixed with `BOTTLING_`
//!
//! Example environment variable: `BOTTLING_SERVER__PORT=5020`

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::entity::layout;
use crate::error::PlantError;
use crate::fieldbus::MAX_OBJECT_LEN;
use crate::registers::{Consistency, Tag, DEFAULT_BANK_SIZE, MAX_BANK_SIZE};

/// Main plant configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PlantConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub registers: RegisterConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,

    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

/// Modbus/TCP listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Run without a listener when false (headless batch runs)
    pub enabled: bool,
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            enabled: true,
            identity: IdentityConfig::default(),
        }
    }
}

/// Device identification objects reported to masters (function 43/14)
///
/// The first three are the mandatory basic objects. Empty regular objects
/// are left out of responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    pub vendor_name: String,
    pub product_code: String,
    pub major_minor_revision: String,
    pub vendor_url: String,
    pub product_name: String,
    pub model_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            vendor_name: "IO ANALYTICA".to_string(),
            product_code: "IOMP".to_string(),
            major_minor_revision: "1.0".to_string(),
            vendor_url: "http://github.com/bashwork/pymodbus/".to_string(),
            product_name: "IOPLC 3000".to_string(),
            model_name: "IOPLC Ultimate".to_string(),
        }
    }
}

impl IdentityConfig {
    /// Object id and value of every identification object
    pub fn objects(&self) -> [(u8, &str); 6] {
        [
            (0x00, self.vendor_name.as_str()),
            (0x01, self.product_code.as_str()),
            (0x02, self.major_minor_revision.as_str()),
            (0x03, self.vendor_url.as_str()),
            (0x04, self.product_name.as_str()),
            (0x05, self.model_name.as_str()),
        ]
    }
}

/// Register bank settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterConfig {
    /// Registers per bank
    pub bank_size: usize,
    pub consistency: Consistency,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            bank_size: DEFAULT_BANK_SIZE,
            consistency: Consistency::PerAddress,
        }
    }
}

/// Scan cycle and physics settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationConfig {
    /// Scan cycles per second; also fixes the physics time step
    pub tick_rate_hz: f64,
    /// Vertical acceleration in pixels/sec^2
    pub gravity: f32,
    /// Conveyor travel per tick while the motor runs, in pixels
    pub conveyor_step: f32,
    /// Minimum ticks between two droplets
    pub droplet_spawn_interval: u32,
    /// Seed of the droplet jitter
    pub seed: u64,
    /// Preset RUN=1 at startup
    pub start_running: bool,
    /// Pace ticks to wall-clock time
    pub realtime: bool,
    /// Stop after this many ticks
    #[serde(default)]
    pub max_ticks: Option<u64>,
    /// Ticks between status log lines (0 disables)
    pub status_interval_ticks: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 50.0,
            gravity: layout::GRAVITY,
            conveyor_step: 0.25,
            droplet_spawn_interval: 1,
            seed: 0,
            start_running: false,
            realtime: true,
            max_ticks: None,
            status_interval_ticks: 250,
        }
    }
}

impl SimulationConfig {
    /// Physics time step in seconds
    pub fn dt(&self) -> f32 {
        (1.0 / self.tick_rate_hz) as f32
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz)
    }
}

/// Extent of the modeled line; bodies leaving it are evicted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceConfig {
    pub width: f32,
    /// Distance past the right edge at which bodies are evicted
    pub exit_margin: f32,
    /// Bodies falling below this height are evicted
    pub floor: f32,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            width: 600.0,
            exit_margin: 150.0,
            floor: 150.0,
        }
    }
}

impl WorkspaceConfig {
    pub fn right_bound(&self) -> f32 {
        self.width + self.exit_margin
    }

    pub fn contains(&self, position: Vec2) -> bool {
        position.x <= self.right_bound() && position.y >= self.floor
    }
}

impl PlantConfig {
    /// Load configuration with layered priority:
    /// 1. Compiled defaults (lowest priority)
    /// 2. `path` if given (must exist), else `bottling.ron` (if exists)
    /// 3. Environment variables prefixed with `BOTTLING_` (highest priority)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).format(FileFormat::Ron).required(true),
            None => File::with_name("bottling")
                .format(FileFormat::Ron)
                .required(false),
        };

        let builder = Config::builder()
            // Layer 1: Compiled defaults
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 502_i64)?
            .set_default("server.enabled", true)?
            .set_default("registers.bank_size", DEFAULT_BANK_SIZE as i64)?
            .set_default("registers.consistency", "per_address")?
            .set_default("simulation.tick_rate_hz", 50.0)?
            .set_default("simulation.gravity", f64::from(layout::GRAVITY))?
            .set_default("simulation.conveyor_step", 0.25)?
            .set_default("simulation.droplet_spawn_interval", 1_i64)?
            .set_default("simulation.seed", 0_i64)?
            .set_default("simulation.start_running", false)?
            .set_default("simulation.realtime", true)?
            .set_default("simulation.status_interval_ticks", 250_i64)?
            .set_default("workspace.width", 600.0)?
            .set_default("workspace.exit_margin", 150.0)?
            .set_default("workspace.floor", 150.0)?
            // Layer 2: Config file
            .add_source(file)
            // Layer 3: Environment variables (BOTTLING_SERVER__PORT, etc.)
            .add_source(
                Environment::with_prefix("BOTTLING")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Reject settings the plant cannot start with
    pub fn validate(&self) -> Result<(), PlantError> {
        let fault = |message: String| Err(PlantError::Configuration(message));

        if self.server.host.trim().is_empty() {
            return fault("server.host is empty".to_string());
        }
        for (id, value) in self.server.identity.objects() {
            if id <= 0x02 && value.is_empty() {
                return fault(format!("server.identity object {id:#04x} is mandatory"));
            }
            if value.len() > MAX_OBJECT_LEN {
                return fault(format!(
                    "server.identity object {id:#04x} is {} bytes, at most {MAX_OBJECT_LEN} fit a response",
                    value.len()
                ));
            }
        }

        let bank_size = self.registers.bank_size;
        let min = Tag::required_bank_size();
        if bank_size < min || bank_size > MAX_BANK_SIZE {
            return fault(format!(
                "registers.bank_size {bank_size} must be within {min}..={MAX_BANK_SIZE}"
            ));
        }

        let sim = &self.simulation;
        if !(sim.tick_rate_hz.is_finite() && sim.tick_rate_hz > 0.0) {
            return fault(format!(
                "simulation.tick_rate_hz must be positive, got {}",
                sim.tick_rate_hz
            ));
        }
        if !sim.gravity.is_finite() {
            return fault("simulation.gravity must be finite".to_string());
        }
        if !(sim.conveyor_step.is_finite() && sim.conveyor_step >= 0.0) {
            return fault(format!(
                "simulation.conveyor_step must be finite and non-negative, got {}",
                sim.conveyor_step
            ));
        }
        if sim.droplet_spawn_interval == 0 {
            return fault("simulation.droplet_spawn_interval must be at least 1".to_string());
        }

        let ws = &self.workspace;
        if !(ws.width.is_finite() && ws.width > 0.0) {
            return fault(format!("workspace.width must be positive, got {}", ws.width));
        }
        if !(ws.exit_margin.is_finite() && ws.exit_margin >= 0.0) {
            return fault(format!(
                "workspace.exit_margin must be non-negative, got {}",
                ws.exit_margin
            ));
        }
        if !ws.floor.is_finite() {
            return fault("workspace.floor must be finite".to_string());
        }

        Ok(())
    }

    /// Render as RON, the format of the config file
    pub fn to_ron(&self) -> Result<String> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PlantConfig::default();
        assert_eq!(config.server.port, 502);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.registers.bank_size, 100);
        assert_eq!(config.registers.consistency, Consistency::PerAddress);
        assert_eq!(config.simulation.tick_rate_hz, 50.0);
        assert_eq!(config.simulation.droplet_spawn_interval, 1);
        assert!(!config.simulation.start_running);
        assert_eq!(config.workspace.right_bound(), 750.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".ron")
            .tempfile()
            .expect("Failed to create temp file");
        writeln!(
            file,
            "(server: (host: \"0.0.0.0\", port: 5020, enabled: false), \
             registers: (bank_size: 200, consistency: \"tick_snapshot\"))"
        )
        .unwrap();

        let config = PlantConfig::load(Some(file.path())).expect("Failed to load config");
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 5020);
        assert!(!config.server.enabled);
        assert_eq!(config.registers.bank_size, 200);
        assert_eq!(config.registers.consistency, Consistency::TickSnapshot);
        // Untouched sections keep their defaults
        assert_eq!(config.simulation.conveyor_step, 0.25);
        assert_eq!(config.workspace.width, 600.0);
    }

    #[test]
    fn test_explicit_config_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.ron");
        assert!(PlantConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_validate_rejects_small_bank() {
        let mut config = PlantConfig::default();
        config.registers.bank_size = 0x10;
        assert!(matches!(
            config.validate(),
            Err(PlantError::Configuration(_))
        ));
        config.registers.bank_size = 0x11;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_simulation() {
        let mut config = PlantConfig::default();
        config.simulation.tick_rate_hz = 0.0;
        assert!(config.validate().is_err());

        let mut config = PlantConfig::default();
        config.simulation.droplet_spawn_interval = 0;
        assert!(config.validate().is_err());

        let mut config = PlantConfig::default();
        config.workspace.width = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_identity() {
        let mut config = PlantConfig::default();
        config.server.identity.vendor_url.clear();
        assert!(config.validate().is_ok());

        config.server.identity.product_code.clear();
        assert!(config.validate().is_err());

        let mut config = PlantConfig::default();
        config.server.identity.model_name = "x".repeat(MAX_OBJECT_LEN + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identity_section_is_optional() {
        let mut file = tempfile::Builder::new()
            .suffix(".ron")
            .tempfile()
            .expect("Failed to create temp file");
        writeln!(
            file,
            "(server: (port: 1502, identity: (product_name: \"Line 2\")))"
        )
        .unwrap();

        let config = PlantConfig::load(Some(file.path())).expect("Failed to load config");
        assert_eq!(config.server.identity.product_name, "Line 2");
        assert_eq!(config.server.identity.vendor_name, "IO ANALYTICA");
    }

    #[test]
    fn test_workspace_bounds() {
        let ws = WorkspaceConfig::default();
        assert!(ws.contains(Vec2::new(750.0, 301.0)));
        assert!(!ws.contains(Vec2::new(750.5, 301.0)));
        assert!(!ws.contains(Vec2::new(100.0, 149.0)));
    }

    #[test]
    fn test_ron_output_loads_back() {
        let mut config = PlantConfig::default();
        config.simulation.max_ticks = Some(1000);
        config.server.port = 1502;
        let text = config.to_ron().unwrap();
        let parsed: PlantConfig = ron::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_printed_config_loads_as_file() {
        let mut config = PlantConfig::default();
        config.registers.consistency = Consistency::TickSnapshot;
        config.simulation.max_ticks = Some(1000);
        config.simulation.seed = 7;
        config.server.identity.model_name = "Bench".to_string();

        let mut file = tempfile::Builder::new()
            .suffix(".ron")
            .tempfile()
            .expect("Failed to create temp file");
        write!(file, "{}", config.to_ron().unwrap()).unwrap();

        let loaded = PlantConfig::load(Some(file.path())).expect("Failed to load printed config");
        assert_eq!(loaded, config);

        let defaults = PlantConfig::default().to_ron().unwrap();
        std::fs::write(file.path(), defaults).unwrap();
        assert_eq!(PlantConfig::load(Some(file.path())).unwrap(), PlantConfig::default());
    }
}
