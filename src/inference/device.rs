use anyhow::{anyhow, Result};
use candle::{DType, Device};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    Auto,
    Cpu,
    Cuda(usize),
}

pub fn parse_device_preference(value: &str) -> DevicePreference {
    let trimmed = value.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.is_empty() || lower == "auto" {
        DevicePreference::Auto
    } else if lower == "cpu" {
        DevicePreference::Cpu
    } else if lower.starts_with("cuda") || lower.starts_with("gpu") {
        let ordinal = trimmed
            .split(':')
            .nth(1)
            .and_then(|part| part.parse::<usize>().ok())
            .unwrap_or(0);
        DevicePreference::Cuda(ordinal)
    } else {
        warn!("unrecognized CHAT_DEVICE value '{}', defaulting to auto", trimmed);
        DevicePreference::Auto
    }
}

pub fn build_device(preference: &str) -> Result<Device> {
    match parse_device_preference(preference) {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|err| {
            anyhow!(
                "requested CUDA device {} but initialization failed: {err}. Build with the \
                 `cuda` feature and ensure CUDA libraries are available.",
                ordinal
            )
        }),
        DevicePreference::Auto => {
            if candle::utils::cuda_is_available() {
                match Device::new_cuda(0) {
                    Ok(device) => Ok(device),
                    Err(err) => {
                        warn!("CUDA reported available but device 0 failed ({err}); using CPU");
                        Ok(Device::Cpu)
                    }
                }
            } else {
                Ok(Device::Cpu)
            }
        }
    }
}

/// Half precision only pays off on an accelerator.
pub fn select_dtype(requested: Option<&str>, device: &Device) -> DType {
    match requested {
        Some("f32") => DType::F32,
        Some("f16") => DType::F16,
        Some("bf16") => DType::BF16,
        _ if device.is_cuda() => DType::BF16,
        _ => DType::F32,
    }
}
