//! Text extraction registry.
//!
//! Maps a file to plain UTF-8 text plus metadata. Extractors are plugins
//! keyed by lowercase file extension; files whose extension has no
//! registered extractor go to the fallback (plain text with binary
//! detection). Extraction failures are per-file and never panic.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use thiserror::Error;

/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Bytes inspected when sniffing for binary content.
const BINARY_SNIFF_BYTES: usize = 8192;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "csv", "log", "rst", "toml", "yaml", "yml", "ini", "html", "xml",
];

const CODE_EXTENSIONS: &[&str] = &[
    "py", "js", "jsx", "ts", "tsx", "java", "cpp", "cc", "c", "h", "hpp", "cs", "rb", "go", "php",
    "swift", "kt", "rs", "sh",
];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no extractor for file type: {0}")]
    Unsupported(String),
    #[error("file exceeds size limit: {size} > {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("binary content cannot be indexed as text")]
    Binary,
    #[error("JSON parse failed: {0}")]
    Json(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

/// Successful extraction.
#[derive(Debug, Clone, Default)]
pub struct Extracted {
    pub text: String,
    pub metadata: Map<String, Value>,
}

/// A format plugin.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;
    /// Lowercase extensions without the leading dot.
    fn extensions(&self) -> Vec<&'static str>;
    fn extract(&self, path: &Path, bytes: &[u8]) -> Result<Extracted, ExtractError>;
}

/// Extension-keyed extractor lookup with a fallback.
pub struct ExtractorRegistry {
    by_extension: HashMap<String, Arc<dyn Extractor>>,
    fallback: Option<Arc<dyn Extractor>>,
    max_file_size: u64,
}

impl ExtractorRegistry {
    /// Empty registry with no fallback.
    pub fn new(max_file_size: u64) -> Self {
        Self {
            by_extension: HashMap::new(),
            fallback: None,
            max_file_size,
        }
    }

    /// Registry with every built-in extractor and the plain-text fallback.
    pub fn with_defaults(max_file_size: u64) -> Self {
        let mut registry = Self::new(max_file_size);
        registry.register(Arc::new(TextExtractor));
        registry.register(Arc::new(CodeExtractor));
        registry.register(Arc::new(JsonExtractor));
        registry.register(Arc::new(PdfExtractor));
        registry.register(Arc::new(DocxExtractor));
        registry.set_fallback(Arc::new(TextExtractor));
        registry
    }

    /// Register an extractor for all of its extensions, replacing earlier ones.
    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        for ext in extractor.extensions() {
            self.by_extension
                .insert(ext.to_string(), Arc::clone(&extractor));
        }
    }

    pub fn set_fallback(&mut self, extractor: Arc<dyn Extractor>) {
        self.fallback = Some(extractor);
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn extractor_for(&self, path: &Path) -> Option<&Arc<dyn Extractor>> {
        extension_of(path)
            .and_then(|ext| self.by_extension.get(&ext))
            .or(self.fallback.as_ref())
    }

    /// True when a dedicated (non-fallback) extractor exists.
    pub fn is_supported(&self, path: &Path) -> bool {
        extension_of(path)
            .map(|ext| self.by_extension.contains_key(&ext))
            .unwrap_or(false)
    }

    /// Sorted list of extensions with a dedicated extractor.
    pub fn supported_extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self.by_extension.keys().cloned().collect();
        exts.sort();
        exts
    }

    /// Read a file (respecting the size limit) and extract it.
    pub fn extract(&self, path: &Path) -> Result<Extracted, ExtractError> {
        let size = std::fs::metadata(path)?.len();
        if size > self.max_file_size {
            return Err(ExtractError::TooLarge {
                size,
                limit: self.max_file_size,
            });
        }
        let bytes = std::fs::read(path)?;
        self.extract_bytes(path, &bytes)
    }

    /// Extract already-read bytes; `path` only selects the extractor.
    pub fn extract_bytes(&self, path: &Path, bytes: &[u8]) -> Result<Extracted, ExtractError> {
        if bytes.len() as u64 > self.max_file_size {
            return Err(ExtractError::TooLarge {
                size: bytes.len() as u64,
                limit: self.max_file_size,
            });
        }
        let extractor = self
            .extractor_for(path)
            .ok_or_else(|| ExtractError::Unsupported(detect_file_type(path)))?;
        let mut extracted = extractor.extract(path, bytes)?;
        extracted
            .metadata
            .insert("extractor".to_string(), json!(extractor.name()));
        Ok(extracted)
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .filter(|e| !e.is_empty())
}

/// Map a path to its file type label.
pub fn detect_file_type(path: &Path) -> String {
    let Some(ext) = extension_of(path) else {
        return "unknown".to_string();
    };
    let mapped = match ext.as_str() {
        "txt" => "text",
        "pdf" => "pdf",
        "docx" => "docx",
        "doc" => "doc",
        "md" | "markdown" => "markdown",
        "json" => "json",
        "csv" => "csv",
        "py" => "python",
        "js" => "javascript",
        "jsx" => "javascript-react",
        "ts" => "typescript",
        "tsx" => "typescript-react",
        "java" => "java",
        "cpp" | "cc" | "hpp" => "cpp",
        "c" | "h" => "c",
        "cs" => "csharp",
        "rb" => "ruby",
        "go" => "go",
        "php" => "php",
        "swift" => "swift",
        "kt" => "kotlin",
        "rs" => "rust",
        "sh" => "shell",
        _ => return ext,
    };
    mapped.to_string()
}

/// Whether a file type label names a programming language.
pub fn is_code_type(file_type: &str) -> bool {
    matches!(
        file_type,
        "python"
            | "javascript"
            | "javascript-react"
            | "typescript"
            | "typescript-react"
            | "java"
            | "cpp"
            | "c"
            | "csharp"
            | "ruby"
            | "go"
            | "php"
            | "swift"
            | "kotlin"
            | "rust"
            | "shell"
    )
}

fn decode_text(bytes: &[u8]) -> Result<(String, &'static str), ExtractError> {
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if sniff.contains(&0) {
        return Err(ExtractError::Binary);
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok((s.trim_start_matches('\u{feff}').to_string(), "utf-8")),
        Err(_) => Ok((String::from_utf8_lossy(bytes).into_owned(), "utf-8-lossy")),
    }
}

/// Plain text, markdown, CSV and other line-oriented formats.
pub struct TextExtractor;

impl Extractor for TextExtractor {
    fn name(&self) -> &'static str {
        "text"
    }

    fn extensions(&self) -> Vec<&'static str> {
        TEXT_EXTENSIONS.to_vec()
    }

    fn extract(&self, _path: &Path, bytes: &[u8]) -> Result<Extracted, ExtractError> {
        let (text, encoding) = decode_text(bytes)?;
        let mut metadata = Map::new();
        metadata.insert("encoding".to_string(), json!(encoding));
        metadata.insert("line_count".to_string(), json!(text.lines().count()));
        Ok(Extracted { text, metadata })
    }
}

/// Source code; records the language.
pub struct CodeExtractor;

impl Extractor for CodeExtractor {
    fn name(&self) -> &'static str {
        "code"
    }

    fn extensions(&self) -> Vec<&'static str> {
        CODE_EXTENSIONS.to_vec()
    }

    fn extract(&self, path: &Path, bytes: &[u8]) -> Result<Extracted, ExtractError> {
        let (text, encoding) = decode_text(bytes)?;
        let mut metadata = Map::new();
        metadata.insert("encoding".to_string(), json!(encoding));
        metadata.insert("language".to_string(), json!(detect_file_type(path)));
        metadata.insert("line_count".to_string(), json!(text.lines().count()));
        Ok(Extracted { text, metadata })
    }
}

/// JSON documents, re-serialized in pretty form so keys and values tokenize.
pub struct JsonExtractor;

impl Extractor for JsonExtractor {
    fn name(&self) -> &'static str {
        "json"
    }

    fn extensions(&self) -> Vec<&'static str> {
        vec!["json"]
    }

    fn extract(&self, _path: &Path, bytes: &[u8]) -> Result<Extracted, ExtractError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ExtractError::Json(e.to_string()))?;
        let text =
            serde_json::to_string_pretty(&value).map_err(|e| ExtractError::Json(e.to_string()))?;
        let top_level = match &value {
            Value::Object(_) => "object",
            Value::Array(_) => "array",
            _ => "scalar",
        };
        let mut metadata = Map::new();
        metadata.insert("top_level".to_string(), json!(top_level));
        Ok(Extracted { text, metadata })
    }
}

pub struct PdfExtractor;

impl Extractor for PdfExtractor {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn extensions(&self) -> Vec<&'static str> {
        vec!["pdf"]
    }

    fn extract(&self, _path: &Path, bytes: &[u8]) -> Result<Extracted, ExtractError> {
        let text =
            pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
        Ok(Extracted {
            text,
            metadata: Map::new(),
        })
    }
}

/// Word documents: the text runs of `word/document.xml`, one paragraph per
/// blank-line-separated block.
pub struct DocxExtractor;

impl Extractor for DocxExtractor {
    fn name(&self) -> &'static str {
        "docx"
    }

    fn extensions(&self) -> Vec<&'static str> {
        vec!["docx"]
    }

    fn extract(&self, _path: &Path, bytes: &[u8]) -> Result<Extracted, ExtractError> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| ExtractError::Docx(e.to_string()))?;
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|e| ExtractError::Docx(e.to_string()))?;
        let mut xml = Vec::new();
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut xml)
            .map_err(|e| ExtractError::Docx(e.to_string()))?;
        if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(ExtractError::Docx(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }
        let (text, paragraphs) = docx_paragraphs(&xml)?;
        let mut metadata = Map::new();
        metadata.insert("paragraphs".to_string(), json!(paragraphs));
        Ok(Extracted { text, metadata })
    }
}

fn docx_paragraphs(xml: &[u8]) -> Result<(String, usize), ExtractError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| ExtractError::Docx(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let para = current.trim();
                    if !para.is_empty() {
                        paragraphs.push(para.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }
    let count = paragraphs.len();
    Ok((paragraphs.join("\n\n"), count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn registry() -> ExtractorRegistry {
        ExtractorRegistry::with_defaults(1024 * 1024)
    }

    #[test]
    fn file_type_detection() {
        assert_eq!(detect_file_type(Path::new("a/b.PY")), "python");
        assert_eq!(detect_file_type(Path::new("notes.md")), "markdown");
        assert_eq!(detect_file_type(Path::new("data.parquet")), "parquet");
        assert_eq!(detect_file_type(Path::new("Makefile")), "unknown");
        assert!(is_code_type("rust"));
        assert!(!is_code_type("markdown"));
    }

    #[test]
    fn text_extraction_strips_bom() {
        let out = registry()
            .extract_bytes(Path::new("a.txt"), "\u{feff}hello\nworld".as_bytes())
            .unwrap();
        assert_eq!(out.text, "hello\nworld");
        assert_eq!(out.metadata["line_count"], json!(2));
        assert_eq!(out.metadata["extractor"], json!("text"));
    }

    #[test]
    fn code_extraction_records_language() {
        let out = registry()
            .extract_bytes(Path::new("main.rs"), b"fn main() {}\n")
            .unwrap();
        assert_eq!(out.metadata["language"], json!("rust"));
    }

    #[test]
    fn fallback_rejects_binary() {
        let err = registry()
            .extract_bytes(Path::new("blob.bin"), &[0x7f, 0x45, 0x00, 0x01])
            .unwrap_err();
        assert!(matches!(err, ExtractError::Binary));
    }

    #[test]
    fn fallback_reads_unknown_text() {
        let reg = registry();
        assert!(!reg.is_supported(Path::new("README")));
        let out = reg.extract_bytes(Path::new("README"), b"plain words").unwrap();
        assert_eq!(out.text, "plain words");
    }

    #[test]
    fn no_fallback_means_unsupported() {
        let reg = ExtractorRegistry::new(1024);
        let err = reg.extract_bytes(Path::new("x.txt"), b"hi").unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
    }

    #[test]
    fn invalid_json_fails() {
        let err = registry()
            .extract_bytes(Path::new("x.json"), b"{not json")
            .unwrap_err();
        assert!(matches!(err, ExtractError::Json(_)));
    }

    #[test]
    fn json_is_pretty_printed() {
        let out = registry()
            .extract_bytes(Path::new("x.json"), br#"{"invoice":{"total":42}}"#)
            .unwrap();
        assert!(out.text.contains("\"total\": 42"));
        assert_eq!(out.metadata["top_level"], json!("object"));
    }

    #[test]
    fn invalid_pdf_and_docx_fail() {
        let reg = registry();
        assert!(matches!(
            reg.extract_bytes(Path::new("x.pdf"), b"not a pdf"),
            Err(ExtractError::Pdf(_))
        ));
        assert!(matches!(
            reg.extract_bytes(Path::new("x.docx"), b"not a zip"),
            Err(ExtractError::Docx(_))
        ));
    }

    #[test]
    fn docx_paragraphs_are_separated() {
        let xml = br#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
<w:body>
<w:p><w:r><w:t>Invoice</w:t></w:r><w:r><w:t xml:space="preserve"> total</w:t></w:r></w:p>
<w:p><w:r><w:t>Due &amp; payable</w:t></w:r></w:p>
</w:body></w:document>"#;
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut cursor);
            zip.start_file(
                "word/document.xml",
                zip::write::SimpleFileOptions::default(),
            )
            .unwrap();
            zip.write_all(xml).unwrap();
            zip.finish().unwrap();
        }
        let out = registry()
            .extract_bytes(Path::new("letter.docx"), cursor.get_ref())
            .unwrap();
        assert_eq!(out.text, "Invoice total\n\nDue & payable");
        assert_eq!(out.metadata["paragraphs"], json!(2));
    }

    #[test]
    fn size_limit_enforced() {
        let reg = ExtractorRegistry::with_defaults(4);
        let err = reg.extract_bytes(Path::new("a.txt"), b"too long").unwrap_err();
        assert!(matches!(err, ExtractError::TooLarge { size: 8, limit: 4 }));
    }
}
