//! Audio device enumeration and selection.
//!
//! Selection is strict: a named device that cannot be found is an error,
//! never a silent switch to another device.

use serde::{Deserialize, Serialize};

#[cfg(feature = "audio-cpal")]
use crate::error::{Result, TalkscriberError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Input,
    Output,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub kind: DeviceKind,
    /// Whether this is the system default for its kind.
    pub is_default: bool,
    /// Input that most likely records system output rather than a voice.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
];

/// Best-effort check for capture devices that record system output.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Order for display: defaults first, loopback inputs last, then by name.
pub fn sort_devices(list: &mut [DeviceInfo]) {
    list.sort_by_key(|d| {
        (
            d.kind == DeviceKind::Output,
            !d.is_default,
            d.is_loopback_like,
            d.name.to_ascii_lowercase(),
        )
    });
}

/// List every input and output device on the default host.
///
/// Returns an empty `Vec` when cpal is not available or enumeration fails.
#[cfg(feature = "audio-cpal")]
pub fn list_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let mut list = Vec::new();

    let default_in = host.default_input_device().and_then(|d| d.name().ok());
    match host.input_devices() {
        Ok(devices) => {
            for (idx, device) in devices.enumerate() {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                list.push(DeviceInfo {
                    is_default: default_in.as_deref() == Some(name.as_str()),
                    is_loopback_like: is_loopback_like_name(&name),
                    kind: DeviceKind::Input,
                    name,
                });
            }
        }
        Err(e) => tracing::warn!("failed to enumerate input devices: {e}"),
    }

    let default_out = host.default_output_device().and_then(|d| d.name().ok());
    match host.output_devices() {
        Ok(devices) => {
            for (idx, device) in devices.enumerate() {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Output Device {}", idx + 1));
                list.push(DeviceInfo {
                    is_default: default_out.as_deref() == Some(name.as_str()),
                    is_loopback_like: false,
                    kind: DeviceKind::Output,
                    name,
                });
            }
        }
        Err(e) => tracing::warn!("failed to enumerate output devices: {e}"),
    }

    sort_devices(&mut list);
    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_devices() -> Vec<DeviceInfo> {
    vec![]
}

/// Resolve a device by exact name, or the host default when `preferred` is `None`.
///
/// # Errors
/// - `Device` when the named device does not exist.
/// - `NoDefaultDevice` when no name is given and the host has no default.
#[cfg(feature = "audio-cpal")]
pub fn select_device(kind: DeviceKind, preferred: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let Some(wanted) = preferred else {
        let default = match kind {
            DeviceKind::Input => host.default_input_device(),
            DeviceKind::Output => host.default_output_device(),
        };
        return default.ok_or(TalkscriberError::NoDefaultDevice {
            direction: kind.as_str(),
        });
    };

    let mut devices = match kind {
        DeviceKind::Input => host.input_devices(),
        DeviceKind::Output => host.output_devices(),
    }
    .map_err(|e| TalkscriberError::Device(e.to_string()))?;

    devices
        .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
        .ok_or_else(|| {
            TalkscriberError::Device(format!("{} device '{wanted}' not found", kind.as_str()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, kind: DeviceKind, is_default: bool) -> DeviceInfo {
        DeviceInfo {
            name: name.into(),
            kind,
            is_default,
            is_loopback_like: is_loopback_like_name(name),
        }
    }

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
        assert!(!is_loopback_like_name("USB Microphone"));
    }

    #[test]
    fn sorts_inputs_first_defaults_first_loopback_last() {
        let mut list = vec![
            info("Speakers", DeviceKind::Output, true),
            info("Stereo Mix", DeviceKind::Input, false),
            info("Zoom H1", DeviceKind::Input, false),
            info("Built-in Mic", DeviceKind::Input, true),
        ];
        sort_devices(&mut list);
        let names: Vec<_> = list.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["Built-in Mic", "Zoom H1", "Stereo Mix", "Speakers"]);
    }
}
