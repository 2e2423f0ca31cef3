//! Translation through an OpenAI-compatible chat server, usually LM Studio.

use async_openai::{Client, config::OpenAIConfig};
use leaky_bucket::RateLimiter;
use serde_json::json;

use crate::{config::EngineConfig, prelude::*};

use super::Translator;

/// The system prompt for every translation request.
const SYSTEM_PROMPT: &str =
    "You are a professional translator. Return ONLY the translation, nothing else.";

/// Build the user prompt for a translation request.
fn translation_prompt(text: &str, target_language: &str) -> String {
    format!(
        "Translate the following text to {target_language}. Return ONLY the translated \
         text, with no additional commentary, explanations, or notes.\n\
         Preserve the original formatting and paragraph structure.\n\n\
         Text to translate:\n{text}"
    )
}

/// Translator backed by `/chat/completions`.
pub struct LmStudioTranslator {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    rate_limiter: Option<RateLimiter>,
}

impl LmStudioTranslator {
    /// Create a new translator. This does not contact the server.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let mut client_config = OpenAIConfig::new().with_api_base(&config.lmstudio_url);
        // LM Studio ignores the key, but the client insists on sending one.
        client_config = client_config
            .with_api_key(config.lmstudio_api_key.as_deref().unwrap_or("lm-studio"));
        Ok(Self {
            client: Client::with_config(client_config),
            model: config.lmstudio_model.clone(),
            temperature: config.temperature,
            rate_limiter: config.rate_limit.map(|limit| limit.to_rate_limiter()),
        })
    }

    /// Check that the server is up, returning the names of its models.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let models = self
            .client
            .models()
            .list()
            .await
            .context("cannot list models")?;
        Ok(models.data.into_iter().map(|model| model.id).collect())
    }
}

#[async_trait]
impl Translator for LmStudioTranslator {
    #[instrument(level = "debug", skip_all, fields(model = %self.model, target_language))]
    async fn translate(&self, text: &str, target_language: &str) -> Result<String> {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        let request = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": translation_prompt(text, target_language) },
            ],
        });
        trace!(%request, "Request");
        let response: Value = self
            .client
            .chat()
            .create_byot(request)
            .await
            .context("translation request failed")?;
        trace!(%response, "Response");
        extract_translation(&response)
    }
}

/// Pull the translated text out of a chat completion response.
fn extract_translation(response: &Value) -> Result<String> {
    let content = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            anyhow!(
                "server returned no translation; check that the model is loaded and responding"
            )
        })?;
    let content = content.trim();
    if content.is_empty() {
        return Err(anyhow!("server returned an empty translation"));
    }
    Ok(content.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_message_content() {
        let response = json!({
            "choices": [{ "message": { "role": "assistant", "content": "  Hello world\n" } }]
        });
        assert_eq!(extract_translation(&response).unwrap(), "Hello world");
    }

    #[test]
    fn rejects_missing_or_empty_content() {
        assert!(extract_translation(&json!({ "choices": [] })).is_err());
        let empty = json!({ "choices": [{ "message": { "content": " " } }] });
        assert!(extract_translation(&empty).is_err());
    }

    #[test]
    fn prompt_names_the_target_language() {
        let prompt = translation_prompt("Olá", "English");
        assert!(prompt.starts_with("Translate the following text to English."));
        assert!(prompt.ends_with("Text to translate:\nOlá"));
    }

    #[tokio::test]
    #[ignore = "Needs LM Studio running"]
    async fn translates_with_local_server() {
        let translator = LmStudioTranslator::new(&EngineConfig::default()).unwrap();
        let text = translator.translate("Bom dia", "English").await.unwrap();
        assert!(!text.is_empty());
    }
}
