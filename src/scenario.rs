//! Scenario file loading and validation.
//!
//! A scenario names the horizon, the seed, how many runs to make and the contending entities.
//! Files ending in `.toml` are parsed as TOML, everything else as JSON:
//!
//! ```json
//! {
//!   "horizon": 1000000,
//!   "seed": 1,
//!   "runs": 3,
//!   "entities": [
//!     { "family": "wifi" },
//!     { "family": "nru", "mcot": 6 },
//!     { "family": "fbe", "variant": "fixed_muting", "ffp": 10000, "cot": 9500, "max_muted_periods": 2 }
//!   ]
//! }
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::simulation::runner::validate;
use crate::simulation::types::{EntityConfig, Micros};

#[derive(Debug)]
pub enum ScenarioLoadError {
    FileReadError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for ScenarioLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioLoadError::FileReadError(msg) => write!(f, "Failed to read file: {}", msg),
            ScenarioLoadError::ParseError(msg) => write!(f, "Failed to parse scenario: {}", msg),
            ScenarioLoadError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ScenarioLoadError {}

/// On-disk format of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioFormat {
    Json,
    Toml,
}

impl ScenarioFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ScenarioFormat::Toml,
            _ => ScenarioFormat::Json,
        }
    }
}

fn default_runs() -> u32 {
    1
}

/// A complete simulation setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Simulated time in microseconds.
    pub horizon: Micros,
    /// Seed of the first run; run `i` uses `seed + i`.
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_runs")]
    pub runs: u32,
    pub entities: Vec<EntityConfig>,
}

impl Scenario {
    pub fn seeds(&self) -> Vec<u64> {
        (0..self.runs as u64).map(|i| self.seed.wrapping_add(i)).collect()
    }
}

/// Load and validate a scenario file.
pub fn load_scenario(path: &str) -> Result<Scenario, ScenarioLoadError> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path))
        .map_err(|e| ScenarioLoadError::FileReadError(e.to_string()))?;

    parse_scenario(&data, ScenarioFormat::from_path(Path::new(path)))
}

/// Parse and validate scenario text.
pub fn parse_scenario(data: &str, format: ScenarioFormat) -> Result<Scenario, ScenarioLoadError> {
    let scenario: Scenario = match format {
        ScenarioFormat::Json => serde_json::from_str(data).context("Invalid JSON format"),
        ScenarioFormat::Toml => toml::from_str(data).context("Invalid TOML format"),
    }
    .map_err(|e| ScenarioLoadError::ParseError(format!("{:#}", e)))?;

    validate_scenario(&scenario).map_err(ScenarioLoadError::ValidationError)?;
    Ok(scenario)
}

/// Validate scenario-wide settings and every entity.
pub fn validate_scenario(scenario: &Scenario) -> Result<(), String> {
    if scenario.horizon == 0 {
        return Err("horizon must be positive".to_string());
    }
    if scenario.runs == 0 {
        return Err("runs must be at least 1".to_string());
    }
    if scenario.entities.is_empty() {
        return Err("scenario has no entities".to_string());
    }
    for (index, entity) in scenario.entities.iter().enumerate() {
        validate(entity).map_err(|e| format!("entity #{}: {}", index + 1, e))?;
    }
    Ok(())
}
