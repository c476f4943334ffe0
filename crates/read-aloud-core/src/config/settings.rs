use crate::config::defaults::*;
use serde::{Deserialize, Deserializer, Serialize};

pub const MIN_SPEED: f32 = 0.7;
pub const MAX_SPEED: f32 = 1.2;
pub const MIN_NATIVE_RATE: f32 = 0.1;
pub const MAX_NATIVE_RATE: f32 = 10.0;

/// The persisted user settings record.
///
/// Keys are camelCase so the record stays readable by the options surface,
/// and older key names are accepted as aliases. Every field has a default,
/// so fields added later never need an explicit migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    #[serde(default = "default_local_voice_id", alias = "kokoroVoiceId")]
    pub local_voice_id: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_stability")]
    pub stability: f32,
    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f32,
    #[serde(default)]
    pub style: f32,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default)]
    pub auto_read: bool,
    #[serde(default = "default_auto_read_delay_ms", alias = "autoReadDelay")]
    pub auto_read_delay_ms: u64,
    #[serde(
        default,
        alias = "ttsEngine",
        deserialize_with = "deserialize_lenient"
    )]
    pub engine: EnginePreference,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub fallback_engine: FallbackEngine,
    #[serde(default, alias = "browserVoiceName")]
    pub native_voice: Option<String>,
    #[serde(default = "default_native_rate")]
    pub native_rate: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            api_key: String::new(),
            voice_id: default_voice_id(),
            local_voice_id: default_local_voice_id(),
            model_id: default_model_id(),
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
            style: 0.0,
            speed: default_speed(),
            auto_read: false,
            auto_read_delay_ms: default_auto_read_delay_ms(),
            engine: EnginePreference::Auto,
            fallback_engine: FallbackEngine::Native,
            native_voice: None,
            native_rate: default_native_rate(),
        }
    }
}

impl Settings {
    /// Parse a stored record and normalize it.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Settings>(raw).map(Settings::normalized)
    }

    /// Clamp every numeric knob into the range the engines accept.
    pub fn normalized(mut self) -> Self {
        self.speed = clamp_or(self.speed, MIN_SPEED, MAX_SPEED, default_speed());
        self.stability = clamp_or(self.stability, 0.0, 1.0, default_stability());
        self.similarity_boost = clamp_or(self.similarity_boost, 0.0, 1.0, default_similarity_boost());
        self.style = clamp_or(self.style, 0.0, 1.0, 0.0);
        self.native_rate = clamp_or(
            self.native_rate,
            MIN_NATIVE_RATE,
            MAX_NATIVE_RATE,
            default_native_rate(),
        );
        if self.local_voice_id.trim().is_empty() {
            self.local_voice_id = default_local_voice_id();
        }
        if self
            .native_voice
            .as_deref()
            .is_some_and(|voice| voice.trim().is_empty())
        {
            self.native_voice = None;
        }
        self
    }

    pub fn has_credential(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn remote_params(&self) -> RemoteParams {
        RemoteParams {
            api_key: self.api_key.trim().to_string(),
            voice_id: self.voice_id.clone(),
            model_id: self.model_id.clone(),
            stability: self.stability,
            similarity_boost: self.similarity_boost,
            style: self.style,
            speed: self.speed,
        }
    }
}

fn clamp_or(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

/// Everything the remote API needs for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteParams {
    pub api_key: String,
    pub voice_id: String,
    pub model_id: String,
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub speed: f32,
}

/// The user's engine choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePreference {
    #[default]
    Auto,
    Remote,
    Local,
    Native,
}

impl EnginePreference {
    pub fn as_str(self) -> &'static str {
        match self {
            EnginePreference::Auto => "auto",
            EnginePreference::Remote => "remote",
            EnginePreference::Local => "local",
            EnginePreference::Native => "native",
        }
    }
}

/// Where an explicit `remote` preference is demoted to without a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackEngine {
    #[default]
    Native,
    Local,
}

trait LenientParse: Default {
    fn parse_lenient(raw: &str) -> Self;
}

impl LenientParse for EnginePreference {
    fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "remote" | "elevenlabs" => EnginePreference::Remote,
            "local" | "kokoro" => EnginePreference::Local,
            "native" | "browser" => EnginePreference::Native,
            _ => EnginePreference::Auto,
        }
    }
}

impl LenientParse for FallbackEngine {
    fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" | "kokoro" => FallbackEngine::Local,
            _ => FallbackEngine::Native,
        }
    }
}

/// Unknown strings and non-string values normalize to the default variant
/// instead of rejecting the whole record.
fn deserialize_lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: LenientParse,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => T::parse_lenient(&text),
        Raw::Other(_) => T::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_is_clamped_on_load() {
        let slow = Settings::from_json_str(r#"{"speed": 0.3}"#).expect("valid record");
        let fast = Settings::from_json_str(r#"{"speed": 5.0}"#).expect("valid record");
        assert_eq!(slow.speed, 0.7);
        assert_eq!(fast.speed, 1.2);
    }

    #[test]
    fn unit_knobs_are_clamped() {
        let settings = Settings::from_json_str(
            r#"{"stability": -2, "similarityBoost": 3.5, "style": 1.01, "nativeRate": 40}"#,
        )
        .expect("valid record");
        assert_eq!(settings.stability, 0.0);
        assert_eq!(settings.similarity_boost, 1.0);
        assert_eq!(settings.style, 1.0);
        assert_eq!(settings.native_rate, MAX_NATIVE_RATE);
    }

    #[test]
    fn unrecognized_engine_normalizes_to_auto() {
        let settings = Settings::from_json_str(r#"{"engine": "polly"}"#).expect("valid record");
        assert_eq!(settings.engine, EnginePreference::Auto);

        let numeric = Settings::from_json_str(r#"{"engine": 7}"#).expect("valid record");
        assert_eq!(numeric.engine, EnginePreference::Auto);
    }

    #[test]
    fn legacy_keys_are_accepted() {
        let settings = Settings::from_json_str(
            r#"{"ttsEngine": "kokoro", "kokoroVoiceId": "bf_emma", "autoReadDelay": 250, "browserVoiceName": "Samantha"}"#,
        )
        .expect("valid record");
        assert_eq!(settings.engine, EnginePreference::Local);
        assert_eq!(settings.local_voice_id, "bf_emma");
        assert_eq!(settings.auto_read_delay_ms, 250);
        assert_eq!(settings.native_voice.as_deref(), Some("Samantha"));

        let remote = Settings::from_json_str(r#"{"ttsEngine": "elevenlabs"}"#).expect("valid");
        assert_eq!(remote.engine, EnginePreference::Remote);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let settings = Settings::from_json_str(r#"{"apiKey": "k"}"#).expect("valid record");
        assert_eq!(
            Settings {
                api_key: "k".to_string(),
                ..Settings::default()
            },
            settings
        );
    }

    #[test]
    fn blank_voices_fall_back() {
        let settings = Settings::from_json_str(r#"{"localVoiceId": "  ", "nativeVoice": ""}"#)
            .expect("valid record");
        assert_eq!(settings.local_voice_id, "af_heart");
        assert_eq!(settings.native_voice, None);
    }

    #[test]
    fn credential_ignores_whitespace() {
        let settings = Settings {
            api_key: "   ".to_string(),
            ..Settings::default()
        };
        assert!(!settings.has_credential());
    }
}
