//! Core types for SIMS

use crate::error::{Error, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which loop a step or epoch belongs to. Used as the prefix of every logged metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    Train,
    Val,
    Test,
}

impl Tag {
    /// Metric-name prefix for this split
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }

    /// Build a `{tag}_{name}` metric key
    pub fn key(&self, name: &str) -> String {
        format!("{}_{}", self.as_str(), name)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device specification (for config files and model archives).
///
/// Non-unit variants are written as one-key maps; YAML fields holding a
/// `DeviceSpec` use `serde_yaml::with::singleton_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSpec {
    #[default]
    Cpu,
    Cuda {
        #[serde(default)]
        index: Option<usize>,
    },
    Metal {
        #[serde(default)]
        index: Option<usize>,
    },
}

impl DeviceSpec {
    /// Create the Candle device for this spec
    pub fn to_device(&self) -> Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda { index } => Device::new_cuda(index.unwrap_or(0))
                .map_err(|e| Error::config(format!("Failed to create CUDA device: {}", e))),
            Self::Metal { index } => Device::new_metal(index.unwrap_or(0))
                .map_err(|e| Error::config(format!("Failed to create Metal device: {}", e))),
        }
    }

    /// Best-effort spec describing an existing device
    pub fn from_device(device: &Device) -> Self {
        match device {
            Device::Cpu => Self::Cpu,
            Device::Cuda(_) => Self::Cuda { index: None },
            Device::Metal(_) => Self::Metal { index: None },
        }
    }

    /// Parse the short device names accepted on the command line
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "cuda:0" | "gpu" => Ok(Self::Cuda { index: Some(0) }),
            "mps" | "metal" => Ok(Self::Metal { index: Some(0) }),
            other => {
                if let Some(idx) = other.strip_prefix("cuda:") {
                    let index = idx
                        .parse()
                        .map_err(|_| Error::config(format!("Invalid CUDA index: {}", idx)))?;
                    Ok(Self::Cuda { index: Some(index) })
                } else {
                    Err(Error::config(format!("Unknown device: {}", name)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_keys() {
        assert_eq!(Tag::Train.key("loss"), "train_loss");
        assert_eq!(Tag::Val.key("median_f1"), "val_median_f1");
        assert_eq!(Tag::Test.to_string(), "test");
    }

    #[test]
    fn test_device_spec_parse() {
        assert_eq!(DeviceSpec::parse("cpu").unwrap(), DeviceSpec::Cpu);
        assert_eq!(
            DeviceSpec::parse("cuda:2").unwrap(),
            DeviceSpec::Cuda { index: Some(2) }
        );
        assert_eq!(
            DeviceSpec::parse("mps").unwrap(),
            DeviceSpec::Metal { index: Some(0) }
        );
        assert!(DeviceSpec::parse("tpu").is_err());
    }

    #[test]
    fn test_device_spec_yaml() {
        let spec: DeviceSpec = serde_yaml::from_str("cpu").unwrap();
        assert_eq!(spec, DeviceSpec::Cpu);

        // config files write devices as one-key maps
        let spec: DeviceSpec = serde_yaml::with::singleton_map::deserialize(
            serde_yaml::Deserializer::from_str("cuda:\n  index: 1"),
        )
        .unwrap();
        assert_eq!(spec, DeviceSpec::Cuda { index: Some(1) });
    }

    #[test]
    fn test_cpu_device() {
        let device = DeviceSpec::Cpu.to_device().unwrap();
        assert!(matches!(device, Device::Cpu));
        assert_eq!(DeviceSpec::from_device(&device), DeviceSpec::Cpu);
    }
}
