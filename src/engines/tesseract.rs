//! OCR using the `tesseract` CLI.

use tokio::fs;

use crate::{
    async_utils::{check_for_command_failure, engine_command},
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

use super::{PageImage, Recognizer};

/// Runs `tesseract <image> stdout -l <languages>`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TesseractRecognizer;

#[async_trait]
impl Recognizer for TesseractRecognizer {
    #[instrument(level = "debug", skip_all, fields(languages = %languages.join("+")))]
    async fn recognize(&self, page: &PageImage, languages: &[String]) -> Result<String> {
        let tmpdir = tempfile::TempDir::with_prefix("lumos-ocr")?;
        let input_path = tmpdir.path().join(format!("page.{}", page.extension()));
        fs::write(&input_path, &page.data)
            .await
            .context("cannot write tesseract input file")?;

        let mut cmd = engine_command("tesseract");
        cmd.arg(&input_path).arg("stdout");
        if !languages.is_empty() {
            cmd.arg("-l").arg(languages.join("+"));
        }
        let output = with_cpu_semaphore(move || async move {
            cmd.output().await.context("cannot run tesseract")
        })
        .await?;
        check_for_command_failure("tesseract", &output, None)?;

        let text = String::from_utf8(output.stdout)
            .context("tesseract output was not valid UTF-8")?;
        Ok(clean_tesseract_output(&text))
    }
}

/// Strip the trailing form feed and blank lines `tesseract` adds.
fn clean_tesseract_output(text: &str) -> String {
    text.trim_end_matches(|c: char| c.is_whitespace() || c == '\u{c}')
        .to_owned()
}

/// List the language packs installed for `tesseract`.
pub async fn installed_languages() -> Result<Vec<String>> {
    let output = engine_command("tesseract")
        .arg("--list-langs")
        .output()
        .await
        .context("cannot run tesseract")?;
    check_for_command_failure("tesseract", &output, None)?;
    // Older versions print the list on stderr.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    Ok(parse_language_list(&format!("{stdout}\n{stderr}")))
}

/// Parse the output of `tesseract --list-langs`.
fn parse_language_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of available"))
        .map(str::to_owned)
        .collect()
}
