//! Persistent CLI settings (JSON file in the user data directory).
//!
//! Command-line flags override anything stored here.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use talkscriber_core::config::{DEFAULT_SPEAKER, DEFAULT_STT_URL, DEFAULT_TTS_MODEL, DEFAULT_TTS_URL};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct CliSettings {
    pub api_key: Option<String>,
    pub stt_url: String,
    pub tts_url: String,
    pub batch_url: Option<String>,
    pub language: String,
    pub multilingual: bool,
    pub turn_detection: bool,
    pub turn_timeout_ms: u64,
    pub tts_model: String,
    pub speaker_name: String,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub jitter_capacity: usize,
    pub jitter_min_fill: usize,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            stt_url: DEFAULT_STT_URL.into(),
            tts_url: DEFAULT_TTS_URL.into(),
            batch_url: None,
            language: "en".into(),
            multilingual: false,
            turn_detection: false,
            turn_timeout_ms: 600,
            tts_model: DEFAULT_TTS_MODEL.into(),
            speaker_name: DEFAULT_SPEAKER.into(),
            preferred_input_device: None,
            preferred_output_device: None,
            jitter_capacity: 64,
            jitter_min_fill: 3,
        }
    }
}

impl CliSettings {
    pub fn normalize(&mut self) {
        let defaults = Self::default();
        self.api_key = trimmed(self.api_key.take());
        self.batch_url = trimmed(self.batch_url.take());
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.preferred_output_device = trimmed(self.preferred_output_device.take());
        self.stt_url = or_default(&self.stt_url, &defaults.stt_url);
        self.tts_url = or_default(&self.tts_url, &defaults.tts_url);
        self.tts_model = or_default(&self.tts_model, &defaults.tts_model);
        self.speaker_name = or_default(&self.speaker_name, &defaults.speaker_name);
        self.language = normalize_language(&self.language);
        self.turn_timeout_ms = self.turn_timeout_ms.clamp(100, 10_000);
        self.jitter_capacity = self.jitter_capacity.clamp(4, 1024);
        self.jitter_min_fill = self.jitter_min_fill.clamp(1, self.jitter_capacity);
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn or_default(raw: &str, default: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        default.into()
    } else {
        value.into()
    }
}

/// Language codes are two-letter ISO 639-1; common names are accepted too.
pub fn normalize_language(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "english" | "eng" => "en".into(),
        "german" | "deu" => "de".into(),
        "spanish" | "spa" => "es".into(),
        "french" | "fra" => "fr".into(),
        "mandarin" | "chinese" | "zh-cn" => "zh".into(),
        "russian" | "rus" => "ru".into(),
        other => other.into(),
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Talkscriber")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config")
            })
            .join("talkscriber")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> CliSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<CliSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &CliSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("absent.json"));
        assert_eq!(settings, CliSettings::default());
    }

    #[test]
    fn partial_file_is_filled_and_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"apiKey": "  ", "language": "German", "jitterCapacity": 8, "jitterMinFill": 99}"#,
        )
        .unwrap();
        let settings = load_settings(&path);
        assert_eq!(settings.api_key, None);
        assert_eq!(settings.language, "de");
        assert_eq!(settings.jitter_min_fill, 8);
        assert_eq!(settings.speaker_name, DEFAULT_SPEAKER);
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = CliSettings {
            speaker_name: "leo".into(),
            turn_detection: true,
            ..CliSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
    }
}
