/*
 * Meeting Minutes Pipeline - Document Parser
 * Copyright (c) 2024 Meeting Minutes Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use std::io::Read;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use tokio::process::Command;

use crate::error::{PipelineError, PipelineResult};

lazy_static! {
    static ref DOCX_TEXT_RUN: Regex = Regex::new(r"<w:t[^>]*>([^<]*)</w:t>").unwrap();
    static ref BLANK_RUNS: Regex = Regex::new(r"\n{3,}").unwrap();
}

/// Extract plain text from a supported document, preserving paragraph
/// boundaries. Unknown extensions fail with `UNSUPPORTED_FORMAT`.
pub async fn extract_text(path: &Path) -> PipelineResult<String> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let raw = match extension.as_str() {
        "txt" | "md" => read_text_file(path)?,
        "docx" => extract_docx(path)?,
        "pdf" => extract_pdf(path).await?,
        other => {
            return Err(PipelineError::UnsupportedFormat(format!(
                "unsupported document extension: .{other}"
            )))
        }
    };

    let normalized = normalize_whitespace(&raw);
    if normalized.is_empty() {
        return Err(PipelineError::BadInput(format!(
            "document contains no extractable text: {}",
            path.display()
        )));
    }
    Ok(normalized)
}

fn read_text_file(path: &Path) -> PipelineResult<String> {
    let bytes = std::fs::read(path)
        .map_err(|e| PipelineError::BadInput(format!("cannot read {}: {e}", path.display())))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// A docx is a zip archive; paragraph text lives in `word/document.xml`.
fn extract_docx(path: &Path) -> PipelineResult<String> {
    let file = std::fs::File::open(path)
        .map_err(|e| PipelineError::BadInput(format!("cannot open {}: {e}", path.display())))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| PipelineError::UnsupportedFormat(format!("not a docx archive: {e}")))?;
    let mut document = archive
        .by_name("word/document.xml")
        .map_err(|_| PipelineError::UnsupportedFormat("docx is missing word/document.xml".into()))?;
    let mut xml = String::new();
    document
        .read_to_string(&mut xml)
        .map_err(|e| PipelineError::UnsupportedFormat(format!("docx read failed: {e}")))?;
    Ok(docx_xml_to_text(&xml))
}

fn docx_xml_to_text(xml: &str) -> String {
    let mut out = String::new();
    for paragraph in xml.split("</w:p>") {
        let mut para_text = String::new();
        for capture in DOCX_TEXT_RUN.captures_iter(paragraph) {
            para_text.push_str(&xml_unescape(&capture[1]));
        }
        if !para_text.trim().is_empty() {
            out.push_str(para_text.trim());
            out.push_str("\n\n");
        }
    }
    out
}

fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

async fn extract_pdf(path: &Path) -> PipelineResult<String> {
    let output = Command::new("pdftotext")
        .arg("-layout")
        .arg(path)
        .arg("-")
        .output()
        .await
        .map_err(|_| {
            PipelineError::UnsupportedFormat(
                "pdf extraction requires the pdftotext tool, which is not installed".into(),
            )
        })?;
    if !output.status.success() {
        return Err(PipelineError::UnsupportedFormat(format!(
            "pdftotext failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// CRLF to LF, trailing spaces stripped, runs of blank lines collapsed so
/// at most one empty line separates paragraphs.
pub fn normalize_whitespace(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed_lines: Vec<&str> = unified.lines().map(|l| l.trim_end()).collect();
    let joined = trimmed_lines.join("\n");
    BLANK_RUNS.replace_all(&joined, "\n\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_blank_runs() {
        let input = "a\r\n\r\n\r\n\r\nb  \n\nc\n";
        assert_eq!(normalize_whitespace(input), "a\n\nb\n\nc");
    }

    #[test]
    fn docx_xml_keeps_paragraph_boundaries() {
        let xml = r#"<w:document><w:body>
            <w:p><w:r><w:t>第一段</w:t></w:r><w:r><w:t xml:space="preserve">继续</w:t></w:r></w:p>
            <w:p><w:r><w:t>第二段 &amp; 附录</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let text = docx_xml_to_text(xml);
        assert_eq!(normalize_whitespace(&text), "第一段继续\n\n第二段 & 附录");
    }

    #[tokio::test]
    async fn unknown_extension_is_unsupported() {
        let err = extract_text(Path::new("/tmp/a.xyz")).await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_FORMAT");
    }

    #[tokio::test]
    async fn txt_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "会议记录\n\n\n\n结论如下").unwrap();
        let text = extract_text(&path).await.unwrap();
        assert_eq!(text, "会议记录\n\n结论如下");
    }
}
