//! Documents as sequences of page images.
//!
//! PDFs are rasterized one page at a time with Poppler's `pdftocairo`, so a
//! resumed run only pays for the pages it still needs. Plain images are
//! treated as one-page documents.

use std::{collections::BTreeMap, sync::{Arc, LazyLock}};

use regex::Regex;
use tokio::fs;

use crate::{
    async_utils::{DEFAULT_ERROR_REGEX, check_for_command_failure, engine_command},
    cpu_limit::with_cpu_semaphore,
    engines::PageImage,
    prelude::*,
};

/// Image types we can OCR directly.
const SUPPORTED_IMAGE_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/gif",
    "image/tiff",
];

/// Poppler reports some recoverable problems as errors.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of Poppler output contain a real error?
fn is_error_line(line: &str) -> bool {
    DEFAULT_ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// A document we can render page by page.
#[async_trait]
pub trait PageSource: Send + Sync + 'static {
    /// Number of pages in the document.
    fn page_count(&self) -> usize;

    /// Render the page at zero-based `index`.
    async fn render_page(&self, index: usize) -> Result<PageImage>;
}

/// Opens documents as [`PageSource`]s.
#[async_trait]
pub trait PageSourceOpener: Send + Sync + 'static {
    /// Open the document at `path`.
    async fn open(&self, path: &Path) -> Result<Arc<dyn PageSource>>;
}

/// Opens PDFs with Poppler and images as-is.
#[derive(Clone, Copy, Debug)]
pub struct PopplerOpener {
    /// Resolution for rasterizing PDF pages.
    pub dpi: u32,
}

#[async_trait]
impl PageSourceOpener for PopplerOpener {
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn open(&self, path: &Path) -> Result<Arc<dyn PageSource>> {
        let mime_type = get_mime_type(path)?;
        if mime_type == "application/pdf" {
            let page_count = get_pdf_page_count(path).await?;
            Ok(Arc::new(PdfPageSource {
                path: path.to_owned(),
                page_count,
                dpi: self.dpi,
            }))
        } else if SUPPORTED_IMAGE_TYPES.contains(&mime_type.as_str()) {
            Ok(Arc::new(ImagePageSource {
                path: path.to_owned(),
                mime_type,
            }))
        } else {
            Err(anyhow!(
                "unsupported file type {} for {:?}",
                mime_type,
                path.display()
            ))
        }
    }
}

/// A PDF, rasterized on demand.
#[derive(Debug)]
pub struct PdfPageSource {
    path: PathBuf,
    page_count: usize,
    dpi: u32,
}

#[async_trait]
impl PageSource for PdfPageSource {
    fn page_count(&self) -> usize {
        self.page_count
    }

    #[instrument(level = "debug", skip_all, fields(path = %self.path.display(), index, dpi = self.dpi))]
    async fn render_page(&self, index: usize) -> Result<PageImage> {
        if index >= self.page_count {
            return Err(anyhow!(
                "page {} is out of range for a {}-page document",
                index,
                self.page_count
            ));
        }

        // Poppler page numbers are 1-based and the range is inclusive.
        let page_number = (index + 1).to_string();
        let tmpdir = tempfile::TempDir::with_prefix("lumos-page")?;
        let out_base = tmpdir.path().join("page");
        let mut cmd = engine_command("pdftocairo");
        cmd.arg("-png")
            .arg("-singlefile")
            .arg("-f")
            .arg(&page_number)
            .arg("-l")
            .arg(&page_number)
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg(&self.path)
            .arg(&out_base);

        // `pdftocairo` keeps a whole core busy.
        let output = with_cpu_semaphore(move || async move {
            cmd.output().await.with_context(|| {
                format!("failed to run pdftocairo on {:?}", self.path.display())
            })
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

        let png_path = out_base.with_extension("png");
        let data = fs::read(&png_path)
            .await
            .with_context(|| format!("failed to read rendered page {:?}", png_path))?;
        Ok(PageImage {
            mime_type: "image/png".to_owned(),
            data,
        })
    }
}

/// A single image, treated as a one-page document.
#[derive(Debug)]
pub struct ImagePageSource {
    path: PathBuf,
    mime_type: String,
}

#[async_trait]
impl PageSource for ImagePageSource {
    fn page_count(&self) -> usize {
        1
    }

    async fn render_page(&self, index: usize) -> Result<PageImage> {
        if index != 0 {
            return Err(anyhow!("page {} is out of range for an image", index));
        }
        let data = fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read image {:?}", self.path.display()))?;
        Ok(PageImage {
            mime_type: self.mime_type.clone(),
            data,
        })
    }
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let output = engine_command("pdfinfo")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_pdfinfo_page_count(&output)
        .with_context(|| format!("failed to get page count for {:?}", path.display()))
}

/// Find the `Pages:` entry in `pdfinfo` output.
fn parse_pdfinfo_page_count(output: &str) -> Result<usize> {
    let properties = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();
    let pages = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("no page count in pdfinfo output"))?;
    pages
        .parse::<usize>()
        .with_context(|| format!("bad page count {:?}", pages))
}

/// Get the MIME type of a file from its contents.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to read {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown file type for {:?}", path.display()))?
        .mime_type()
        .to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The first bytes of a PNG file, which is all `infer` looks at.
    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn parses_pdfinfo_output() {
        let output = "Title:          Scan\nCreator:        scanner: v2\nPages:          12\nEncrypted:      no\n";
        assert_eq!(parse_pdfinfo_page_count(output).unwrap(), 12);
        assert!(parse_pdfinfo_page_count("Title: x\n").is_err());
    }

    #[test]
    fn xref_warnings_are_not_errors() {
        assert!(!is_error_line("Syntax Error: xref num 12 not found but needed"));
        assert!(is_error_line("Syntax Error: Couldn't read xref table"));
    }

    #[tokio::test]
    async fn images_are_single_page_documents() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("scan.png");
        std::fs::write(&path, PNG_MAGIC)?;

        let source = PopplerOpener { dpi: 150 }.open(&path).await?;
        assert_eq!(source.page_count(), 1);
        let page = source.render_page(0).await?;
        assert_eq!(page.mime_type, "image/png");
        assert_eq!(page.data, PNG_MAGIC);
        assert!(source.render_page(1).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_files_are_rejected() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "just some text")?;
        assert!(PopplerOpener { dpi: 150 }.open(&path).await.is_err());
        Ok(())
    }
}
