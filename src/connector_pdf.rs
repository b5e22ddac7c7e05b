//! Document page extraction.
//!
//! Cuts one page out of a PDF in the case directory into a standalone
//! PDF artifact and records its text. Page numbers are 1-based.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use datareq_harness_core::error::EngineError;
use datareq_harness_core::models::{OriginClass, Request, Row};
use datareq_harness_core::params::{PdfPageParams, RequestParams};
use serde_json::{json, Map};

use crate::evidence::{sha256_hex, ArtifactDir, ArtifactSpec};
use crate::traits::{Connector, ConnectorOutput, RunContext};

pub const DOC_PAGES_TABLE: &str = "DOC_PAGES";
const EXCERPT_CHARS: usize = 300;

pub struct PdfPageConnector;

/// A page cut out of its document.
#[derive(Debug)]
pub struct ExtractedPage {
    pub pdf: Vec<u8>,
    pub text: String,
    pub total_pages: u32,
}

/// Keep only `page` and re-serialize the document.
pub fn extract_page(bytes: &[u8], page: u32) -> Result<ExtractedPage, EngineError> {
    let mut doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| EngineError::data_quality(format!("not a readable PDF: {}", e)))?;
    let total_pages = doc.get_pages().len() as u32;
    if page == 0 || page > total_pages {
        return Err(EngineError::config(format!(
            "page {} out of range (document has {} pages)",
            page, total_pages
        )));
    }
    let source_text = doc.extract_text(&[page]).unwrap_or_default();

    let others: Vec<u32> = (1..=total_pages).filter(|n| *n != page).collect();
    if !others.is_empty() {
        doc.delete_pages(&others);
        doc.prune_objects();
    }
    let mut pdf = Vec::new();
    doc.save_to(&mut pdf)
        .map_err(|e| EngineError::data_quality(format!("cannot write page PDF: {}", e)))?;

    let text = match pdf_extract::extract_text_from_mem(&pdf) {
        Ok(t) if !t.trim().is_empty() => t,
        Ok(_) => source_text,
        Err(e) => {
            tracing::debug!(error = %e, "pdf-extract failed; using lopdf text");
            source_text
        }
    };
    Ok(ExtractedPage {
        pdf,
        text,
        total_pages,
    })
}

/// Whitespace-collapsed prefix of `text`.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}…", cut.trim_end())
    }
}

fn resolve(case_root: &Path, rel: &str) -> PathBuf {
    let p = Path::new(rel.trim());
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        case_root.join(p)
    }
}

fn default_title(p: &PdfPageParams) -> String {
    let name = Path::new(&p.pdf_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| p.pdf_path.clone());
    format!("PDF_PAGE:{} p{}", name, p.page)
}

#[async_trait]
impl Connector for PdfPageConnector {
    fn name(&self) -> &str {
        "PDF_PAGE"
    }

    fn description(&self) -> &str {
        "Single PDF page cut out as evidence, with its text"
    }

    fn default_target_table(&self) -> &str {
        DOC_PAGES_TABLE
    }

    async fn execute(
        &self,
        request: &Request,
        params: &RequestParams,
        ctx: &RunContext<'_>,
    ) -> Result<ConnectorOutput, EngineError> {
        let RequestParams::PdfPage(p) = params else {
            return Err(EngineError::invariant("PDF_PAGE connector got foreign params"));
        };
        let path = resolve(ctx.case_root(), &p.pdf_path);
        let bytes = std::fs::read(&path)
            .map_err(|e| EngineError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let page = extract_page(&bytes, p.page)?;

        let mut warnings = Vec::new();
        let char_count = page.text.chars().filter(|c| !c.is_whitespace()).count();
        if char_count == 0 {
            warnings.push(format!("page {} has no extractable text", p.page));
        }

        let ev_id = ctx.new_evidence_id(request)?;
        let title = p
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| default_title(p));
        let mut meta = Map::new();
        meta.insert("source_path".into(), json!(p.pdf_path));
        meta.insert("source_sha256".into(), json!(sha256_hex(&bytes)));
        meta.insert("page".into(), json!(p.page));
        meta.insert("total_pages".into(), json!(page.total_pages));
        meta.insert("char_count".into(), json!(char_count));
        let evidence = ctx.recorder.record(ArtifactSpec {
            evidence_id: &ev_id,
            request,
            dir: ArtifactDir::Pdf,
            file_name: format!("{}_page{}.pdf", ev_id, p.page),
            bytes: &page.pdf,
            kind: "document_page",
            title: title.clone(),
            origin: OriginClass::UserSupplied,
            metadata: meta,
        })?;

        let mut row = Row::new();
        row.insert("page_id".into(), json!(format!("{}-P{}", request.id, p.page)));
        row.insert("title".into(), json!(title));
        row.insert("source_path".into(), json!(p.pdf_path));
        row.insert("page".into(), json!(p.page));
        row.insert("total_pages".into(), json!(page.total_pages));
        row.insert("char_count".into(), json!(char_count));
        row.insert("excerpt".into(), json!(excerpt(&page.text, EXCERPT_CHARS)));
        row.insert("data_origin".into(), json!(OriginClass::UserSupplied.as_str()));
        row.insert("source_tag".into(), json!(request.source_tag_or_default()));
        row.insert("evidence_id".into(), json!(ev_id));

        Ok(ConnectorOutput {
            rows: vec![row],
            evidence: vec![evidence],
            warnings,
        })
    }

    async fn verify(&self, request: Option<&Request>, ctx: &RunContext<'_>) -> Result<String, EngineError> {
        let Some(request) = request else {
            return Ok("no credentials required".to_string());
        };
        let RequestParams::PdfPage(p) = RequestParams::from_request(request)? else {
            return Err(EngineError::config(format!("{} is not a PDF_PAGE request", request.id)));
        };
        let path = resolve(ctx.case_root(), &p.pdf_path);
        let bytes = std::fs::read(&path)
            .map_err(|e| EngineError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let doc = lopdf::Document::load_mem(&bytes)
            .map_err(|e| EngineError::data_quality(format!("not a readable PDF: {}", e)))?;
        let total = doc.get_pages().len();
        if p.page as usize > total {
            return Err(EngineError::config(format!(
                "page {} out of range (document has {} pages)",
                p.page, total
            )));
        }
        Ok(format!("{} readable, {} pages", p.pdf_path, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-assembled PDF with one text line per page, correct xref offsets.
    fn pdf_with_pages(lines: &[&str]) -> Vec<u8> {
        let n = lines.len();
        let font_id = 3 + 2 * n;
        let mut out = Vec::new();
        let mut offsets = Vec::new();
        out.extend_from_slice(b"%PDF-1.4\n");
        offsets.push(out.len());
        out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
        offsets.push(out.len());
        let kids: Vec<String> = (0..n).map(|i| format!("{} 0 R", 3 + 2 * i)).collect();
        out.extend_from_slice(
            format!("2 0 obj << /Type /Pages /Kids [{}] /Count {} >> endobj\n", kids.join(" "), n)
                .as_bytes(),
        );
        for (i, line) in lines.iter().enumerate() {
            let page_id = 3 + 2 * i;
            offsets.push(out.len());
            out.extend_from_slice(format!(
                "{} 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R /Resources << /Font << /F1 {} 0 R >> >> >> endobj\n",
                page_id, page_id + 1, font_id
            ).as_bytes());
            let content = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", line);
            offsets.push(out.len());
            out.extend_from_slice(
                format!(
                    "{} 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
                    page_id + 1,
                    content.len(),
                    content
                )
                .as_bytes(),
            );
        }
        offsets.push(out.len());
        out.extend_from_slice(
            format!("{} 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n", font_id)
                .as_bytes(),
        );
        let xref_start = out.len();
        out.extend_from_slice(format!("xref\n0 {}\n", offsets.len() + 1).as_bytes());
        out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
        for o in &offsets {
            out.extend_from_slice(format!("{:010} 00000 n \n", o).as_bytes());
        }
        out.extend_from_slice(
            format!("trailer << /Size {} /Root 1 0 R >>\nstartxref\n", offsets.len() + 1).as_bytes(),
        );
        out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
        out.extend_from_slice(b"%%EOF\n");
        out
    }

    #[test]
    fn extracts_the_requested_page_only() {
        let pdf = pdf_with_pages(&["first page text", "second page text", "third page text"]);
        let page = extract_page(&pdf, 2).unwrap();
        assert_eq!(page.total_pages, 3);
        assert!(page.pdf.starts_with(b"%PDF-"));
        let cut = lopdf::Document::load_mem(&page.pdf).unwrap();
        assert_eq!(cut.get_pages().len(), 1);
        assert!(page.text.contains("second"), "got {:?}", page.text);
    }

    #[test]
    fn page_out_of_range_is_a_configuration_error() {
        let pdf = pdf_with_pages(&["only"]);
        assert!(matches!(extract_page(&pdf, 2), Err(EngineError::Configuration(_))));
        assert!(matches!(extract_page(b"not a pdf", 1), Err(EngineError::DataQuality(_))));
    }

    #[test]
    fn excerpt_collapses_and_truncates() {
        assert_eq!(excerpt("a  b\n\nc", 10), "a b c");
        assert_eq!(excerpt("abcdefghij", 4), "abcd…");
    }
}
