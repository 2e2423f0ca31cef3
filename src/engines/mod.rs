//! External engines: rasterizers, OCR and translation.
//!
//! The pipeline only sees these as capabilities. Each engine may fail, or
//! take a long time; timeouts and retries are applied by the caller (see
//! [`crate::retry::call_engine`]), so implementations should just do one
//! attempt and report errors with plenty of context.

use std::sync::Arc;

use crate::{
    config::{EngineConfig, TranslatorBackend},
    page_source::{PageSourceOpener, PopplerOpener},
    prelude::*,
};

pub mod lmstudio;
pub mod opencode;
pub mod tesseract;

/// A rasterized page.
#[derive(Clone, Debug)]
pub struct PageImage {
    /// The MIME type of `data`, such as `image/png`.
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl PageImage {
    /// A file extension suitable for this image.
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            "image/tiff" => "tif",
            _ => "png",
        }
    }
}

/// Extracts text from a page image.
#[async_trait]
pub trait Recognizer: Send + Sync + 'static {
    /// Recognize the text on `page`, using the given OCR languages.
    async fn recognize(&self, page: &PageImage, languages: &[String]) -> Result<String>;
}

/// Translates text.
#[async_trait]
pub trait Translator: Send + Sync + 'static {
    /// Translate `text` into `target_language`.
    async fn translate(&self, text: &str, target_language: &str) -> Result<String>;
}

/// The set of engines used by a pipeline.
#[derive(Clone)]
pub struct Engines {
    pub sources: Arc<dyn PageSourceOpener>,
    pub recognizer: Arc<dyn Recognizer>,
    /// Missing if no translation backend is available.
    pub translator: Option<Arc<dyn Translator>>,
}

impl Engines {
    /// Create the real engines described by `config`.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let translator: Arc<dyn Translator> = match config.translator {
            TranslatorBackend::LmStudio => {
                Arc::new(lmstudio::LmStudioTranslator::new(config)?)
            }
            TranslatorBackend::OpenCode => {
                Arc::new(opencode::OpenCodeTranslator::new(config))
            }
        };
        Ok(Self {
            sources: Arc::new(PopplerOpener { dpi: config.dpi }),
            recognizer: Arc::new(tesseract::TesseractRecognizer),
            translator: Some(translator),
        })
    }
}
