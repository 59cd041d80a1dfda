// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// CPU architecture family of an instance type.
///
/// - `X86_64`: two virtual cores per physical core (hyperthreading).
/// - `Arm64`: one virtual core is one physical core.
///
/// `X86_64` is the primary architecture; `Arm64` is only considered when the
/// workload explicitly allows the alternate architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86_64,
    Arm64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
        }
    }
}

impl Default for Arch {
    fn default() -> Self {
        Arch::X86_64
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "x86_64" | "amd64" => Ok(Arch::X86_64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            other => Err(format!(
                "invalid architecture: {other} (expected \"x86_64\" or \"arm64\")"
            )),
        }
    }
}

/// Explicit core layout requested for an instance.
///
/// Only set when hyperthreading is disabled on an x86 instance; the provider
/// requires both fields together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
    pub core_count: u32,
    pub threads_per_core: u32,
}
