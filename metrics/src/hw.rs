//! Hardware generations
//!
//! Selected once when a device is created. Everything generation specific that
//! the metrics engine needs is answered here at runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareGeneration {
    Gen9,
    Gen11,
    Gen12Lp,
    XeHpg,
    XeHpc,
}

impl HardwareGeneration {
    /// Generation id handed to the counter library when a context is created
    pub fn metrics_library_gen_id(self) -> u32 {
        match self {
            HardwareGeneration::Gen9 => 1,
            HardwareGeneration::Gen11 => 2,
            HardwareGeneration::Gen12Lp => 3,
            HardwareGeneration::XeHpg => 4,
            HardwareGeneration::XeHpc => 5,
        }
    }

    /// Size of one OA report written by the counter unit
    pub fn oa_report_size(self) -> u32 {
        match self {
            HardwareGeneration::Gen9 | HardwareGeneration::Gen11 => 256,
            HardwareGeneration::Gen12Lp | HardwareGeneration::XeHpg => 256,
            HardwareGeneration::XeHpc => 576,
        }
    }
}

impl fmt::Display for HardwareGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HardwareGeneration::Gen9 => "Gen9",
            HardwareGeneration::Gen11 => "Gen11",
            HardwareGeneration::Gen12Lp => "Gen12LP",
            HardwareGeneration::XeHpg => "Xe-HPG",
            HardwareGeneration::XeHpc => "Xe-HPC",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for HardwareGeneration {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gen9" => Ok(HardwareGeneration::Gen9),
            "gen11" => Ok(HardwareGeneration::Gen11),
            "gen12lp" | "gen12" => Ok(HardwareGeneration::Gen12Lp),
            "xe-hpg" | "xehpg" => Ok(HardwareGeneration::XeHpg),
            "xe-hpc" | "xehpc" => Ok(HardwareGeneration::XeHpc),
            other => anyhow::bail!("unknown hardware generation: {}", other),
        }
    }
}
