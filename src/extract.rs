//! Extraction routing for input files.
//!
//! Maps each file to a [`Document`] by dispatching on its file-type tag.
//! PDFs try direct text extraction first and fall back to batch OCR over
//! rendered page images when the direct path yields too little; images go
//! straight to OCR. OCR work is never performed inline: pages are submitted
//! to the shared [`OcrScheduler`] as one task group per file and awaited.

use std::io::Read;
use std::path::Path;

use uuid::Uuid;

use crate::config::OcrConfig;
use crate::error::IngestError;
use crate::models::{Document, FileKind, Origin, PageMarker};
use crate::ocr::scheduler::OcrScheduler;
use crate::ocr::OcrTask;
use crate::render;

/// Maximum decompressed bytes read from a single OOXML zip entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// A PDF averaging fewer direct characters per page than this is
    /// routed to OCR.
    pub min_chars_per_page: usize,
    pub render_dpi: u32,
    pub force_ocr: bool,
}

impl From<&OcrConfig> for ExtractOptions {
    fn from(config: &OcrConfig) -> Self {
        Self {
            min_chars_per_page: config.min_chars_per_page,
            render_dpi: config.render_dpi,
            force_ocr: config.force_ocr,
        }
    }
}

/// Extract one file into a [`Document`]. Failures are per-file: the caller
/// records the error and the ingest continues.
pub async fn extract_document(
    path: &Path,
    scheduler: &OcrScheduler,
    opts: &ExtractOptions,
) -> Result<Document, IngestError> {
    match FileKind::from_path(path) {
        FileKind::Pdf => extract_pdf(path, scheduler, opts).await,
        FileKind::Pptx | FileKind::Ppt => extract_pptx(path),
        FileKind::Docx => extract_docx(path),
        FileKind::Doc | FileKind::Text | FileKind::Markdown => extract_text_file(path),
        FileKind::Image => extract_image(path, scheduler).await,
        FileKind::Other => Err(IngestError::UnsupportedType(
            path.to_string_lossy().into_owned(),
        )),
    }
}

/// Concatenate pages in ascending page index, each preceded by a marker
/// line. Pages whose text is empty after trimming are dropped from the
/// output but still counted by the caller.
fn assemble_pages(label: &str, pages: &[(usize, String)]) -> (String, Vec<PageMarker>) {
    let mut text = String::new();
    let mut markers = Vec::new();
    let mut char_offset = 0usize;

    for (number, page_text) in pages {
        let trimmed = page_text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push_str("\n\n");
            char_offset += 2;
        }
        markers.push(PageMarker {
            number: *number,
            offset: char_offset,
        });
        let marker_line = format!("--- {} {} ---\n", label, number);
        char_offset += marker_line.chars().count() + trimmed.chars().count();
        text.push_str(&marker_line);
        text.push_str(trimmed);
    }

    (text, markers)
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, IngestError> {
    std::fs::read(path).map_err(|e| IngestError::FileUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Decode a text-like file: strict UTF-8 first, then a lossy fallback for
/// legacy encodings. Files with NUL bytes are rejected as binary.
fn extract_text_file(path: &Path) -> Result<Document, IngestError> {
    let bytes = read_bytes(path)?;
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            let bytes = e.into_bytes();
            if bytes.contains(&0) {
                return Err(IngestError::FileUnreadable {
                    path: path.to_path_buf(),
                    reason: "binary content in text file".to_string(),
                });
            }
            String::from_utf8_lossy(&bytes).into_owned()
        }
    };

    Ok(Document {
        source: path.to_path_buf(),
        kind: FileKind::from_path(path),
        text,
        markers: Vec::new(),
        origin: Origin::Text,
        pages: 1,
        ocr_pages: 0,
    })
}

async fn extract_pdf(
    path: &Path,
    scheduler: &OcrScheduler,
    opts: &ExtractOptions,
) -> Result<Document, IngestError> {
    let bytes = read_bytes(path)?;

    // Direct text extraction; a parser failure just routes the file to OCR.
    let direct_pages: Option<Vec<String>> = if opts.force_ocr {
        None
    } else {
        pdf_extract::extract_text_by_pages_from_mem(&bytes).ok()
    };

    let needs_full_ocr = match &direct_pages {
        None => true,
        Some(pages) => {
            if pages.is_empty() {
                true
            } else {
                let total: usize = pages.iter().map(|p| p.trim().chars().count()).sum();
                total / pages.len() < opts.min_chars_per_page
            }
        }
    };

    if needs_full_ocr {
        let images =
            render::render_pdf_pages(path, opts.render_dpi).map_err(|e| {
                IngestError::FileUnreadable {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            })?;
        let page_count = images.len();
        let results = run_ocr_group(path, scheduler, images.into_iter().zip(1..).collect()).await;
        let (text, markers) = assemble_pages("Page", &results);
        return Ok(Document {
            source: path.to_path_buf(),
            kind: FileKind::Pdf,
            text,
            markers,
            origin: Origin::Ocr,
            pages: page_count,
            ocr_pages: page_count,
        });
    }

    let pages = direct_pages.unwrap_or_default();
    let trivial: Vec<usize> = pages
        .iter()
        .enumerate()
        .filter(|(_, p)| p.trim().chars().count() < opts.min_chars_per_page)
        .map(|(i, _)| i + 1)
        .collect();

    if trivial.is_empty() {
        let numbered: Vec<(usize, String)> = pages
            .into_iter()
            .enumerate()
            .map(|(i, p)| (i + 1, p))
            .collect();
        let page_count = numbered.len();
        let (text, markers) = assemble_pages("Page", &numbered);
        return Ok(Document {
            source: path.to_path_buf(),
            kind: FileKind::Pdf,
            text,
            markers,
            origin: Origin::Text,
            pages: page_count,
            ocr_pages: 0,
        });
    }

    // Mixed origin: OCR only the pages the direct path left empty, then
    // merge preserving page order.
    let images = render::render_pdf_pages(path, opts.render_dpi).map_err(|e| {
        IngestError::FileUnreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })?;
    let ocr_inputs: Vec<(Vec<u8>, usize)> = trivial
        .iter()
        .filter_map(|page| images.get(page - 1).map(|img| (img.clone(), *page)))
        .collect();
    let ocr_pages = ocr_inputs.len();
    let ocr_results = run_ocr_group(path, scheduler, ocr_inputs).await;

    let mut merged: Vec<(usize, String)> = Vec::with_capacity(pages.len());
    for (i, page_text) in pages.into_iter().enumerate() {
        let number = i + 1;
        if trivial.contains(&number) {
            let ocr_text = ocr_results
                .iter()
                .find(|(p, _)| *p == number)
                .map(|(_, t)| t.clone())
                .unwrap_or_default();
            merged.push((number, ocr_text));
        } else {
            merged.push((number, page_text));
        }
    }
    let page_count = merged.len();
    let (text, markers) = assemble_pages("Page", &merged);
    Ok(Document {
        source: path.to_path_buf(),
        kind: FileKind::Pdf,
        text,
        markers,
        origin: Origin::Mixed,
        pages: page_count,
        ocr_pages,
    })
}

async fn extract_image(path: &Path, scheduler: &OcrScheduler) -> Result<Document, IngestError> {
    let bytes = read_bytes(path)?;
    let results = run_ocr_group(path, scheduler, vec![(bytes, 1)]).await;
    let (text, markers) = assemble_pages("Page", &results);
    Ok(Document {
        source: path.to_path_buf(),
        kind: FileKind::Image,
        text,
        markers,
        origin: Origin::Ocr,
        pages: 1,
        ocr_pages: 1,
    })
}

/// Register one task group for this file under a fresh id and await its
/// ordered results.
async fn run_ocr_group(
    path: &Path,
    scheduler: &OcrScheduler,
    images: Vec<(Vec<u8>, usize)>,
) -> Vec<(usize, String)> {
    let group_id = Uuid::new_v4().to_string();
    let tasks: Vec<OcrTask> = images
        .into_iter()
        .map(|(image, page_index)| OcrTask { page_index, image })
        .collect();
    let source = path.to_string_lossy();
    if scheduler
        .submit_group(&group_id, &source, tasks)
        .await
        .is_err()
    {
        return Vec::new();
    }
    scheduler.await_group(&group_id).await
}

fn zip_error(path: &Path, e: impl std::fmt::Display) -> IngestError {
    IngestError::FileUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<Vec<u8>>>,
    name: &str,
    path: &Path,
) -> Result<Vec<u8>, IngestError> {
    let entry = archive.by_name(name).map_err(|e| zip_error(path, e))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| zip_error(path, e))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(zip_error(
            path,
            format!("zip entry {} exceeds size limit", name),
        ));
    }
    Ok(out)
}

fn extract_docx(path: &Path) -> Result<Document, IngestError> {
    let bytes = read_bytes(path)?;
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| zip_error(path, e))?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", path)?;
    let text = extract_t_elements(&doc_xml).map_err(|e| zip_error(path, e))?;

    Ok(Document {
        source: path.to_path_buf(),
        kind: FileKind::from_path(path),
        text,
        markers: Vec::new(),
        origin: Origin::Text,
        pages: 1,
        ocr_pages: 0,
    })
}

fn extract_pptx(path: &Path) -> Result<Document, IngestError> {
    let bytes = read_bytes(path)?;
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| zip_error(path, e))?;

    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut slides: Vec<(usize, String)> = Vec::with_capacity(slide_names.len());
    for (i, name) in slide_names.iter().enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, name, path)?;
        let text = extract_t_elements(&xml).map_err(|e| zip_error(path, e))?;
        slides.push((i + 1, text));
    }

    let slide_count = slides.len();
    let (text, markers) = assemble_pages("Slide", &slides);
    Ok(Document {
        source: path.to_path_buf(),
        kind: FileKind::from_path(path),
        text,
        markers,
        origin: Origin::Text,
        pages: slide_count,
        ocr_pages: 0,
    })
}

/// Pull the text content of `<w:t>`/`<a:t>` runs out of OOXML, separating
/// runs with spaces.
fn extract_t_elements(xml: &[u8]) -> Result<String, quick_xml::Error> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        if !out.is_empty() {
                            out.push(' ');
                        }
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OcrConfig;
    use crate::ocr::resources::{ResourceController, ResourceProbe, ResourceSample};
    use crate::ocr::{OcrEngine, OcrEngineFactory, OcrLine};
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct QuietProbe;

    impl ResourceProbe for QuietProbe {
        fn sample(&self) -> ResourceSample {
            ResourceSample {
                cpu_percent: 5.0,
                memory_percent: 10.0,
            }
        }
    }

    struct EchoEngine;

    impl OcrEngine for EchoEngine {
        fn recognize(
            &mut self,
            image: &[u8],
            _languages: &[String],
        ) -> anyhow::Result<Vec<OcrLine>> {
            Ok(vec![OcrLine {
                text: String::from_utf8_lossy(image).into_owned(),
                confidence: 1.0,
            }])
        }
    }

    struct EchoFactory;

    impl OcrEngineFactory for EchoFactory {
        fn create(&self) -> anyhow::Result<Box<dyn OcrEngine>> {
            Ok(Box::new(EchoEngine))
        }
    }

    fn test_scheduler() -> OcrScheduler {
        let config = OcrConfig {
            serial: true,
            ..OcrConfig::default()
        };
        let controller =
            ResourceController::new(Box::new(QuietProbe), 75.0, 85.0, config.max_workers);
        OcrScheduler::new(&config, Arc::new(EchoFactory), controller, None)
    }

    fn opts() -> ExtractOptions {
        ExtractOptions {
            min_chars_per_page: 20,
            render_dpi: 200,
            force_ocr: false,
        }
    }

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn unsupported_extension_is_reported() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob.xyz");
        std::fs::write(&path, b"data").unwrap();

        let scheduler = test_scheduler();
        let err = extract_document(&path, &scheduler, &opts())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedType(_)));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn text_file_extracts_verbatim() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.md");
        std::fs::write(&path, "# Title\n\nBody text.").unwrap();

        let scheduler = test_scheduler();
        let doc = extract_document(&path, &scheduler, &opts()).await.unwrap();
        assert_eq!(doc.origin, Origin::Text);
        assert_eq!(doc.kind, FileKind::Markdown);
        assert!(doc.text.contains("Body text."));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn latin1_text_decodes_lossily() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("legacy.txt");
        std::fs::write(&path, [b'c', b'a', b'f', 0xE9, b' ', b'o', b'k']).unwrap();

        let scheduler = test_scheduler();
        let doc = extract_document(&path, &scheduler, &opts()).await.unwrap();
        assert!(doc.text.contains("ok"));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn nul_bytes_in_text_file_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("binary.txt");
        std::fs::write(&path, [0u8, 1, 2, 0xFF, 0x80]).unwrap();

        let scheduler = test_scheduler();
        let err = extract_document(&path, &scheduler, &opts())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::FileUnreadable { .. }));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn docx_text_runs_are_joined() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("report.docx");
        write_zip(
            &path,
            &[(
                "word/document.xml",
                r#"<w:document><w:p><w:r><w:t>Hello</w:t></w:r><w:r><w:t>world</w:t></w:r></w:p></w:document>"#,
            )],
        );

        let scheduler = test_scheduler();
        let doc = extract_document(&path, &scheduler, &opts()).await.unwrap();
        assert_eq!(doc.text, "Hello world");
        assert_eq!(doc.origin, Origin::Text);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn pptx_slides_are_ordered_and_marked() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deck.pptx");
        // slide10 sorts after slide2 numerically, not lexically.
        write_zip(
            &path,
            &[
                (
                    "ppt/slides/slide10.xml",
                    r#"<p:sld><a:t>tenth slide</a:t></p:sld>"#,
                ),
                (
                    "ppt/slides/slide1.xml",
                    r#"<p:sld><a:t>first slide</a:t></p:sld>"#,
                ),
                (
                    "ppt/slides/slide2.xml",
                    r#"<p:sld><a:t>second slide</a:t></p:sld>"#,
                ),
            ],
        );

        let scheduler = test_scheduler();
        let doc = extract_document(&path, &scheduler, &opts()).await.unwrap();
        assert!(doc.text.contains("--- Slide 1 ---"));
        assert!(doc.text.contains("--- Slide 2 ---"));
        assert!(doc.text.contains("--- Slide 3 ---"));
        let first = doc.text.find("first slide").unwrap();
        let second = doc.text.find("second slide").unwrap();
        let tenth = doc.text.find("tenth slide").unwrap();
        assert!(first < second && second < tenth);
        assert_eq!(doc.pages, 3);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn corrupt_pptx_is_a_per_file_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("old.ppt");
        std::fs::write(&path, b"not a zip archive").unwrap();

        let scheduler = test_scheduler();
        let err = extract_document(&path, &scheduler, &opts())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::FileUnreadable { .. }));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn image_goes_through_ocr_with_page_marker() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("scan.png");
        std::fs::write(&path, b"recognized image text").unwrap();

        let scheduler = test_scheduler();
        let doc = extract_document(&path, &scheduler, &opts()).await.unwrap();
        assert_eq!(doc.origin, Origin::Ocr);
        assert_eq!(doc.ocr_pages, 1);
        assert!(doc.text.contains("--- Page 1 ---"));
        assert!(doc.text.contains("recognized image text"));
        scheduler.shutdown().await;
    }

    #[test]
    fn assemble_drops_empty_pages_but_keeps_order() {
        let pages = vec![
            (1, "first page".to_string()),
            (2, "   ".to_string()),
            (3, "third page".to_string()),
            (4, String::new()),
        ];
        let (text, markers) = assemble_pages("Page", &pages);
        assert!(text.contains("--- Page 1 ---"));
        assert!(!text.contains("--- Page 2 ---"));
        assert!(text.contains("--- Page 3 ---"));
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].number, 1);
        assert_eq!(markers[1].number, 3);
        assert!(markers[0].offset < markers[1].offset);
    }

    #[test]
    fn marker_offsets_point_at_marker_lines() {
        let pages = vec![(1, "alpha".to_string()), (2, "beta".to_string())];
        let (text, markers) = assemble_pages("Page", &pages);
        let chars: Vec<char> = text.chars().collect();
        for marker in &markers {
            let at: String = chars[marker.offset..].iter().take(3).collect();
            assert_eq!(at, "---");
        }
    }
}
