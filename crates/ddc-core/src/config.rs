//! Run configuration, loadable from JSON.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DdcError, Result};
use crate::extract::ExtractOptions;
use crate::fill::FillOptions;
use crate::orchestrator::CalcOptions;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegreeDayConfig {
    pub calc: CalcOptions,
    pub fill: FillOptions,
}

impl DegreeDayConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| DdcError::io_at(path, e))?;
        serde_json::from_str(&text).map_err(|e| DdcError::Setup(format!("config {}: {e}", path.display())))
    }

    pub fn extract(&self) -> &ExtractOptions {
        &self.calc.extract
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: DegreeDayConfig =
            serde_json::from_str(r#"{ "calc": { "workers": 8, "extract": { "use_fallback": true } } }"#).unwrap();
        assert_eq!(cfg.calc.workers, 8);
        assert!(cfg.extract().use_fallback);
        assert_eq!(cfg.extract().max_iterations, 50);
        assert_eq!(cfg.fill, FillOptions::default());
        assert!(cfg.fill.reset, "flagged cells are reset unless disabled");
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ddc.json");
        fs::write(&path, r#"{ "fill": { "kernel_radius": 2, "reset": false } }"#).unwrap();
        let cfg = DegreeDayConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.fill.kernel_radius, 2);
        assert!(!cfg.fill.reset);

        fs::write(&path, "not json").unwrap();
        assert!(DegreeDayConfig::from_json_file(&path).unwrap_err().is_setup());
    }
}
