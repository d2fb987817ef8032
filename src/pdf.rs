//! PDF text extraction seam.
//!
//! No PDF engine ships with the crate. A host that can read PDFs installs
//! a [`PdfLoader`]; without one, `.pdf` files are never scanned.

use std::path::Path;

use crate::error::Result;

/// Document-level metadata fields copied onto every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PdfField {
    Title,
    Author,
    Subject,
    Keywords,
}

/// An opened PDF.
pub trait PdfDocument {
    fn page_count(&self) -> usize;

    /// Plain text of a zero-based page.
    fn page_text(&self, page: usize) -> Result<String>;

    /// A metadata field, empty when absent.
    fn metadata(&self, field: PdfField) -> String;
}

pub trait PdfLoader: Send {
    fn open(&self, path: &Path) -> Result<Box<dyn PdfDocument>>;
}

/// Whether a path names a PDF by its extension.
pub fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_pdf_extension() {
        assert!(is_pdf(Path::new("/docs/paper.pdf")));
        assert!(is_pdf(Path::new("/docs/PAPER.PDF")));
        assert!(!is_pdf(Path::new("/docs/paper.txt")));
        assert!(!is_pdf(Path::new("/docs/pdf")));
    }
}
