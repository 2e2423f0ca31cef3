//! Translation through the `opencode` CLI.
//!
//! We attach the page text as a file and ask for the translation. The CLI
//! streams newline-delimited JSON events, and models sometimes decorate their
//! answer with reasoning or with the line numbers the CLI showed them, so we
//! clean the output up before returning it.

use std::{io::Write as _, sync::LazyLock};

use leaky_bucket::RateLimiter;
use regex::Regex;
use crate::{
    async_utils::{check_for_command_failure, engine_command},
    config::EngineConfig,
    prelude::*,
};

use super::Translator;

/// Instructions sent with each page.
fn instructions(target_language: &str) -> String {
    format!(
        "Translate the provided text to {target_language}. Return ONLY the translated \
         text, with no additional commentary, explanations, or notes. Preserve the \
         original formatting and paragraph structure. The translation must read as \
         natural, fluent {target_language} and fully preserve the meaning of the \
         original; prefer idiomatic phrasing to word-for-word translation. If the text \
         is shown with line numbers like '1:' or editor prefixes, ignore them and do \
         NOT reproduce them.\n\nThe text to translate is in the attached file."
    )
}

/// Translator that runs `opencode run`.
pub struct OpenCodeTranslator {
    model: String,
    rate_limiter: Option<RateLimiter>,
}

impl OpenCodeTranslator {
    /// Create a new translator.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            model: config.opencode_model.clone(),
            rate_limiter: config.rate_limit.map(|limit| limit.to_rate_limiter()),
        }
    }
}

#[async_trait]
impl Translator for OpenCodeTranslator {
    #[instrument(level = "debug", skip_all, fields(model = %self.model, target_language))]
    async fn translate(&self, text: &str, target_language: &str) -> Result<String> {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        let input = write_input_file(text)?;

        let output = engine_command("opencode")
            .arg("run")
            .arg("--format")
            .arg("json")
            .arg("-m")
            .arg(&self.model)
            .arg("-f")
            .arg(input.path())
            .arg("--")
            .arg(instructions(target_language))
            .output()
            .await
            .context("cannot run opencode")?;
        check_for_command_failure("opencode", &output, None)?;

        let translation = parse_opencode_output(&String::from_utf8_lossy(&output.stdout));
        if translation.trim().is_empty() {
            return Err(anyhow!(
                "opencode returned an empty translation; check model availability"
            ));
        }
        Ok(translation)
    }
}

/// Write the page text to a file in the system temporary directory, for
/// `opencode -f`.
fn write_input_file(text: &str) -> Result<tempfile::NamedTempFile> {
    let mut input = tempfile::Builder::new()
        .prefix("lumos_translate_")
        .suffix(".txt")
        .tempfile()
        .context("cannot create opencode input file")?;
    input
        .write_all(text.as_bytes())
        .and_then(|()| input.flush())
        .context("cannot write opencode input file")?;
    Ok(input)
}

/// Collect the text of an `opencode run --format json` response.
fn parse_opencode_output(raw: &str) -> String {
    let text = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        // Anything that isn't JSON is progress chatter.
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|event| event.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|event| {
            event
                .pointer("/part/text")
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
        .collect::<String>();
    let text = strip_preamble(&text);
    let text = LINE_ID.replace_all(&text, "");
    strip_line_numbers(&text)
}

/// Phrases that start a reasoning block rather than the translation.
const PREAMBLE_MARKERS: &[&str] = &["I detect ", "My approach:", "I'll ", "I will "];

/// Drop leading paragraphs of model reasoning.
fn strip_preamble(text: &str) -> String {
    let blocks = text.split("\n\n").collect::<Vec<_>>();
    for (i, block) in blocks.iter().enumerate() {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        if !PREAMBLE_MARKERS
            .iter()
            .any(|marker| block.starts_with(marker))
        {
            return blocks[i..].join("\n\n").trim().to_owned();
        }
    }
    text.trim().to_owned()
}

/// Editor line IDs like `12#JB|` that some models echo back.
static LINE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\d+#[A-Z]{2}\|").expect("failed to compile regex"));

/// A `12: ` line-number prefix.
static LINE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\d{1,6}:\s+").expect("failed to compile regex"));

/// Strip `N:` prefixes, but only when at least 70% of non-empty lines have
/// one. Otherwise this is probably a real numbered list.
fn strip_line_numbers(text: &str) -> String {
    let non_empty = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>();
    if non_empty.is_empty() {
        return text.to_owned();
    }
    let numbered = non_empty
        .iter()
        .filter(|line| LINE_NUMBER.is_match(line))
        .count();
    if numbered * 10 < non_empty.len() * 7 {
        return text.to_owned();
    }
    LINE_NUMBER.replace_all(text, "").into_owned()
}
