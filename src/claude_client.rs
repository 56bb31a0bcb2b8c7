use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::collaborators::{CodeGenerator, CollaboratorResult, ProblemSolver, SceneSplitter, ScriptPlanner};
use crate::error::CollaboratorError;
use crate::types::{AnimationPlan, RawScriptPlan, ScenePlanEntry};

lazy_static! {
    static ref JSON_FENCE: Regex = Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("static regex");
}

const SOLVER_SYSTEM: &str = "You are a patient math tutor. Solve the problem step by step, \
stating each step and the reasoning behind it. Finish with the final answer on its own line.";

const SPLITTER_SYSTEM: &str = "You turn worked math solutions into short educational video scenes. \
Answer with JSON only: an array of objects with fields `index` (1-based, contiguous), \
`description` (what the scene shows) and `duration` (seconds, 5 to 40).";

const SCRIPT_SYSTEM: &str = "You write narration and animation plans for Manim math videos. \
Answer with JSON only: {\"script\": narration text, \"animation_plan\": {\"title\": string, \
\"estimated_duration\": seconds, \"elements\": [{\"type\": \"text\"|\"equation\"|\"graph\"|\"shape\", \
\"content\": string, \"animation\": Manim animation name, \"duration\": seconds, \
\"sync_with_narration\": optional phrase}]}}. The narration must fit the planned duration.";

const CODEGEN_SYSTEM: &str = "You write Manim Community Edition code. Answer with a single Python \
file that starts with `from manim import *` and defines exactly one class deriving from Scene with a \
`construct(self)` method. Use only MathTex, Tex, Text, Axes and basic shapes. No explanations.";

#[derive(Debug, Serialize)]
pub struct ClaudeRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<ClaudeMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClaudeMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ClaudeResponse {
    pub content: Vec<ResponseContent>,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ResponseContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Anthropic Messages API client backing the text-generation stages.
///
/// Makes exactly one request per call; the scene controller owns retries.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: "https://api.anthropic.com/v1".to_string(),
            model: model.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub async fn generate_text(&self, system: &str, prompt: &str) -> CollaboratorResult<String> {
        let request = ClaudeRequest {
            model: self.model.clone(),
            max_tokens: 8192,
            messages: vec![ClaudeMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            system: Some(system.to_string()),
            temperature: Some(0.7),
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .timeout(Duration::from_secs(120))
            .json(&request)
            .send()
            .await
            .map_err(|e| CollaboratorError::Model(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CollaboratorError::Model(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(CollaboratorError::Model(format!("API error ({}): {}", status, body)));
        }

        let parsed: ClaudeResponse = serde_json::from_str(&body)
            .map_err(|e| CollaboratorError::Model(format!("unexpected response body: {}", e)))?;
        tracing::debug!(
            "Claude usage: {} in / {} out (stop: {:?})",
            parsed.usage.input_tokens,
            parsed.usage.output_tokens,
            parsed.stop_reason
        );

        parsed
            .content
            .into_iter()
            .find_map(|c| match c {
                ResponseContent::Text { text } => Some(text),
                ResponseContent::Other => None,
            })
            .ok_or_else(|| CollaboratorError::Malformed("no text content in Claude response".to_string()))
    }
}

/// Pulls the JSON payload out of a model answer: fenced block first, then
/// the outermost object or array.
pub fn extract_json(text: &str) -> CollaboratorResult<Value> {
    let candidate = JSON_FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or_else(|| text.trim());

    if let Ok(value) = serde_json::from_str(candidate) {
        return Ok(value);
    }

    let start = candidate.find(|c: char| c == '{' || c == '[');
    let end = candidate.rfind(|c: char| c == '}' || c == ']');
    match (start, end) {
        (Some(start), Some(end)) if end > start => serde_json::from_str(&candidate[start..=end])
            .map_err(|e| CollaboratorError::Malformed(format!("response is not valid JSON: {}", e))),
        _ => Err(CollaboratorError::Malformed("response contains no JSON".to_string())),
    }
}

#[async_trait]
impl ProblemSolver for AnthropicClient {
    fn identity(&self) -> String {
        format!("anthropic:{}:solve:v1", self.model)
    }

    async fn solve(&self, problem: &str) -> CollaboratorResult<String> {
        self.generate_text(SOLVER_SYSTEM, &format!("Solve this problem:\n\n{}", problem))
            .await
    }
}

#[async_trait]
impl SceneSplitter for AnthropicClient {
    fn identity(&self) -> String {
        format!("anthropic:{}:split:v1", self.model)
    }

    async fn split(&self, solution: &str) -> CollaboratorResult<Value> {
        let text = self
            .generate_text(
                SPLITTER_SYSTEM,
                &format!("Split this solution into 2 to 6 scenes:\n\n{}", solution),
            )
            .await?;
        extract_json(&text)
    }
}

#[async_trait]
impl ScriptPlanner for AnthropicClient {
    fn identity(&self) -> String {
        format!("anthropic:{}:script_plan:v1", self.model)
    }

    async fn generate_script_and_plan(&self, entry: &ScenePlanEntry, solution: &str) -> CollaboratorResult<RawScriptPlan> {
        let prompt = format!(
            "Full solution:\n{}\n\nScene {} ({:.0} seconds): {}\n\nWrite the narration and animation plan for this scene only.",
            solution, entry.index, entry.duration, entry.description
        );
        let mut value = extract_json(&self.generate_text(SCRIPT_SYSTEM, &prompt).await?)?;

        let script = value
            .get("script")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CollaboratorError::Malformed("missing `script` string".to_string()))?;
        let animation_plan = value
            .get_mut("animation_plan")
            .map(Value::take)
            .ok_or_else(|| CollaboratorError::Malformed("missing `animation_plan` object".to_string()))?;

        Ok(RawScriptPlan { script, animation_plan })
    }
}

#[async_trait]
impl CodeGenerator for AnthropicClient {
    fn identity(&self) -> String {
        format!("anthropic:{}:code_gen:v1", self.model)
    }

    async fn generate_code(&self, plan: &AnimationPlan, script: &str, prior_error: Option<&str>) -> CollaboratorResult<String> {
        let plan_json = serde_json::to_string_pretty(plan)
            .map_err(|e| CollaboratorError::Malformed(format!("cannot encode animation plan: {}", e)))?;
        let mut prompt = format!(
            "Animation plan:\n{}\n\nNarration:\n{}\n\nWrite the Manim scene.",
            plan_json, script
        );
        if let Some(error) = prior_error {
            prompt.push_str(&format!(
                "\n\nYour previous attempt was rejected: {}\nFix that problem in this attempt.",
                error
            ));
        }
        self.generate_text(CODEGEN_SYSTEM, &prompt).await
    }
}
