// Eleven Labs API Client
// Text-to-speech for scene narration

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::collaborators::{CollaboratorResult, SpeechSynthesizer};
use crate::config::VoiceConfig;
use crate::error::CollaboratorError;
use crate::types::MediaArtifact;
use crate::utils::probe_duration;

pub const DEFAULT_TTS_MODEL: &str = "eleven_multilingual_v2";

/// ElevenLabs accepts speeds in this range only.
const MIN_SPEED: f64 = 0.7;
const MAX_SPEED: f64 = 1.2;

#[derive(Serialize, Debug)]
pub struct TextToSpeechRequest {
    pub text: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
    pub voice_settings: VoiceSettings,
}

#[derive(Serialize, Debug)]
pub struct VoiceSettings {
    pub speed: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_boost: Option<f64>,
}

#[derive(Clone)]
pub struct ElevenLabsSynthesizer {
    api_key: String,
    client: Client,
    base_url: String,
    model_id: String,
}

impl ElevenLabsSynthesizer {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: Client::new(),
            base_url: "https://api.elevenlabs.io/v1".to_string(),
            model_id: DEFAULT_TTS_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn build_request(&self, text: &str, voice: &VoiceConfig) -> TextToSpeechRequest {
        // `en-us` -> `en`
        let language_code = voice
            .language
            .split(['-', '_'])
            .next()
            .filter(|code| !code.is_empty())
            .map(str::to_lowercase);

        TextToSpeechRequest {
            text: text.to_string(),
            model_id: self.model_id.clone(),
            language_code,
            voice_settings: VoiceSettings {
                speed: voice.speed.clamp(MIN_SPEED, MAX_SPEED),
                stability: Some(0.5),
                similarity_boost: Some(0.75),
            },
        }
    }

    /// Generate speech from text using a specific voice
    pub async fn text_to_speech(&self, text: &str, voice: &VoiceConfig) -> CollaboratorResult<Vec<u8>> {
        let url = format!("{}/text-to-speech/{}", self.base_url, voice.voice);
        let body = self.build_request(text, voice);
        debug!("ElevenLabs TTS request: {} chars, voice {}", text.len(), voice.voice);

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .query(&[("output_format", "mp3_44100_128")])
            .timeout(Duration::from_secs(120))
            .json(&body)
            .send()
            .await
            .map_err(|e| CollaboratorError::Model(format!("Eleven Labs request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CollaboratorError::Model(format!("Eleven Labs TTS API error ({}): {}", status, error_text)));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| CollaboratorError::Model(format!("Eleven Labs response body: {}", e)))?;
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    fn identity(&self) -> String {
        format!("elevenlabs:{}", self.model_id)
    }

    async fn synthesize(&self, script: &str, voice: &VoiceConfig, output: &Path) -> CollaboratorResult<MediaArtifact> {
        let audio = self.text_to_speech(script, voice).await?;
        if audio.is_empty() {
            return Err(CollaboratorError::Malformed("Eleven Labs returned empty audio".to_string()));
        }
        tokio::fs::write(output, &audio).await?;
        info!("🎙️ Narration saved: {} ({} bytes)", output.display(), audio.len());

        let artifact = MediaArtifact::new(output);
        Ok(match probe_duration(output).await {
            Ok(secs) => artifact.with_duration(secs),
            Err(_) => artifact,
        })
    }
}
