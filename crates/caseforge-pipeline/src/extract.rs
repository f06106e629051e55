use std::fmt::Display;
use std::io::{Cursor, Read};
use std::panic::{self, AssertUnwindSafe};

use calamine::{Data, Reader};
use quick_xml::events::Event;
use zip::ZipArchive;

use caseforge_core::error::{CaseforgeError, ParseErrorKind, Result};
use caseforge_core::traits::DocumentTextExtractor;
use caseforge_core::types::{DocumentFormat, InputDocument};

const PDF_MAGIC: &[u8] = b"%PDF";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
/// Compound File Binary header used by legacy `.doc` files.
const CFB_MAGIC: &[u8] = b"\xD0\xCF\x11\xE0";

const WORD_BODY: &str = "word/document.xml";

/// Why a document yielded no text, before the filename is attached.
struct Unreadable {
    kind: ParseErrorKind,
    message: String,
}

impl Unreadable {
    fn corrupt(message: impl Display) -> Self {
        Self {
            kind: ParseErrorKind::Corrupt,
            message: message.to_string(),
        }
    }

    fn unsupported(message: impl Display) -> Self {
        Self {
            kind: ParseErrorKind::UnsupportedFormat,
            message: message.to_string(),
        }
    }

    fn for_file(self, filename: &str) -> CaseforgeError {
        CaseforgeError::Parse {
            kind: self.kind,
            filename: filename.to_string(),
            message: self.message,
        }
    }
}

type Extracted = std::result::Result<String, Unreadable>;

/// Extractor for every supported format: plain text, Markdown, XML, PDF,
/// Word (`.docx`) and Excel workbooks.
///
/// The format comes from the extension; PDF and zip magic numbers override
/// a text-like extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentExtractor;

impl DocumentExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentTextExtractor for DocumentExtractor {
    fn extract_text(&self, document: &InputDocument) -> Result<String> {
        let content = document.content.as_slice();
        let extracted = match DocumentFormat::from_filename(&document.filename) {
            DocumentFormat::Pdf => pdf_text(content),
            DocumentFormat::Docx => docx_text(content),
            DocumentFormat::Xlsx => workbook_text(content),
            _ if content.starts_with(PDF_MAGIC) => pdf_text(content),
            _ if content.starts_with(ZIP_MAGIC) => container_text(content),
            DocumentFormat::Xml => decode_utf8(content).and_then(xml_text),
            _ => decode_utf8(content).map(|text| text.replace("\r\n", "\n")),
        };
        extracted.map_err(|e| e.for_file(&document.filename))
    }
}

fn decode_utf8(content: &[u8]) -> std::result::Result<&str, Unreadable> {
    let bytes = content.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(content);
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Unreadable::corrupt(format!("invalid UTF-8: {}", e)))?;
    if text.contains('\0') {
        return Err(Unreadable::corrupt("content contains NUL bytes"));
    }
    Ok(text)
}

fn pdf_text(content: &[u8]) -> Extracted {
    // the PDF decoder panics on some malformed input
    match panic::catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(content))) {
        Ok(Ok(text)) => Ok(text.replace("\r\n", "\n")),
        Ok(Err(e)) => Err(Unreadable::corrupt(format!("unreadable PDF: {}", e))),
        Err(_) => Err(Unreadable::corrupt("PDF could not be decoded")),
    }
}

fn docx_text(content: &[u8]) -> Extracted {
    if content.starts_with(CFB_MAGIC) {
        return Err(Unreadable::unsupported(
            "legacy binary Word documents are not supported; save as .docx",
        ));
    }
    let mut archive = ZipArchive::new(Cursor::new(content))
        .map_err(|e| Unreadable::corrupt(format!("not a Word document: {}", e)))?;
    let mut body = String::new();
    archive
        .by_name(WORD_BODY)
        .map_err(|e| Unreadable::corrupt(format!("missing {}: {}", WORD_BODY, e)))?
        .read_to_string(&mut body)
        .map_err(|e| Unreadable::corrupt(format!("unreadable {}: {}", WORD_BODY, e)))?;
    word_paragraphs(&body)
}

/// Paragraph text of a WordprocessingML body, one paragraph per block.
fn word_paragraphs(xml: &str) -> Extracted {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let paragraph = current.trim();
                    if !paragraph.is_empty() {
                        paragraphs.push(paragraph.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Text(e)) if in_text => match e.unescape() {
                Ok(text) => current.push_str(&text),
                Err(_) => current.push_str(&String::from_utf8_lossy(&e)),
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(Unreadable::corrupt(format!("malformed document XML: {}", e))),
            _ => {}
        }
    }

    let trailing = current.trim();
    if !trailing.is_empty() {
        paragraphs.push(trailing.to_string());
    }
    Ok(paragraphs.join("\n\n"))
}

/// One block per non-empty row, cells separated by ` | `, sheets in order.
fn workbook_text(content: &[u8]) -> Extracted {
    let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(content))
        .map_err(|e| Unreadable::corrupt(format!("not a spreadsheet: {}", e)))?;

    let mut blocks = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| Unreadable::corrupt(format!("unreadable sheet '{}': {}", name, e)))?;
        let rows: Vec<String> = range
            .rows()
            .map(|row| {
                row.iter()
                    .filter(|cell| !matches!(cell, Data::Empty))
                    .map(|cell| cell.to_string().trim().to_string())
                    .filter(|cell| !cell.is_empty())
                    .collect::<Vec<_>>()
                    .join(" | ")
            })
            .filter(|row| !row.is_empty())
            .collect();
        if rows.is_empty() {
            continue;
        }
        blocks.push(format!("Sheet: {}", name));
        blocks.extend(rows);
    }
    Ok(blocks.join("\n\n"))
}

/// A zip container behind a text-like extension: Word or Excel by content.
fn container_text(content: &[u8]) -> Extracted {
    let archive = ZipArchive::new(Cursor::new(content))
        .map_err(|e| Unreadable::corrupt(format!("unreadable zip container: {}", e)))?;
    let is_word = archive.file_names().any(|name| name == WORD_BODY);
    let is_workbook = archive.file_names().any(|name| name == "xl/workbook.xml");
    match (is_word, is_workbook) {
        (true, _) => docx_text(content),
        (_, true) => workbook_text(content),
        _ => Err(Unreadable::unsupported(
            "zip container is neither a Word document nor a workbook",
        )),
    }
}

/// Character data of every element, one block per text node.
fn xml_text(xml: &str) -> Extracted {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.trim_text(true);
    let mut blocks = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                let text = match e.unescape() {
                    Ok(text) => text.into_owned(),
                    Err(_) => String::from_utf8_lossy(&e).into_owned(),
                };
                blocks.push(text);
            }
            Ok(Event::CData(e)) => blocks.push(String::from_utf8_lossy(&e).trim().to_string()),
            Ok(Event::Eof) => break,
            Err(e) => return Err(Unreadable::corrupt(format!("malformed XML: {}", e))),
            _ => {}
        }
    }
    blocks.retain(|b| !b.is_empty());
    Ok(blocks.join("\n\n"))
}
