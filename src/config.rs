//! Runtime configuration types.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// JIT disabled, interpreter only
    Off,
    /// Compile every method on its first call
    On,
    /// Compile at native call sites, and hot methods after `jit_threshold` calls
    #[default]
    Auto,
}

/// What the embedder does with a fatal runtime fault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFault {
    /// Report and terminate the process with a failure code
    #[default]
    Exit,
    /// Report, set the halt flag and hand control back to the embedder
    Halt,
}

/// Code generation target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// The machine this process runs on
    #[default]
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "x86_64-sysv")]
    X86_64Sysv,
    #[serde(rename = "x86_64-win64")]
    X86_64Win64,
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl Target {
    /// Resolves `Host` to a concrete backend, if one exists for this machine.
    pub fn resolve(self) -> Option<Target> {
        match self {
            Target::Host => {
                if cfg!(all(target_arch = "x86_64", windows)) {
                    Some(Target::X86_64Win64)
                } else if cfg!(target_arch = "x86_64") {
                    Some(Target::X86_64Sysv)
                } else if cfg!(target_arch = "aarch64") {
                    Some(Target::Aarch64)
                } else {
                    None
                }
            }
            other => Some(other),
        }
    }

    /// Whether code for this target can run in this process.
    pub fn is_executable_here(self) -> bool {
        Target::Host.resolve() == Some(self) || self == Target::Host
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    pub jit_threshold: u32,
    pub trace_jit: bool,
    pub on_fault: OnFault,
    /// Operand stack capacity in words
    pub op_stack_size: usize,
    /// Maximum call depth
    pub call_stack_size: usize,
    pub target: Target,
    /// Hard limit on heap size in words (None = unlimited)
    pub heap_limit: Option<usize>,
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Auto,
            jit_threshold: 1000,
            trace_jit: false,
            on_fault: OnFault::Exit,
            op_stack_size: 256,
            call_stack_size: 1024,
            target: Target::Host,
            heap_limit: None,
            log_level: "warn".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml(text: &str, path: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        Self::from_toml(&text, &display)
    }

    pub fn with_jit_mode(mut self, mode: JitMode) -> Self {
        self.jit_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config = RuntimeConfig::from_toml("jit_mode = \"on\"\n", "inline").unwrap();
        assert_eq!(config.jit_mode, JitMode::On);
        assert_eq!(config.jit_threshold, 1000);
        assert_eq!(config.on_fault, OnFault::Exit);
        assert_eq!(config.op_stack_size, 256);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = RuntimeConfig::from_toml("gc_mode = \"stw\"\n", "inline").unwrap_err();
        assert!(err.to_string().contains("inline"));
    }

    #[test]
    fn test_target_names() {
        let config =
            RuntimeConfig::from_toml("target = \"x86_64-win64\"\non_fault = \"halt\"\n", "inline")
                .unwrap();
        assert_eq!(config.target, Target::X86_64Win64);
        assert_eq!(config.on_fault, OnFault::Halt);
        assert_eq!(Target::Aarch64.resolve(), Some(Target::Aarch64));
    }
}
