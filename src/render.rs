//! Certificate documents. The issuer only hands snapshot fields across this
//! seam; turning them into PDF or any other binary format is the renderer's
//! business.

use html_escape::encode_text;
use thiserror::Error;

use crate::models::Certificate;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("renderer failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

pub trait CertificateRenderer: Send + Sync {
    fn render(&self, certificate: &Certificate) -> Result<RenderedDocument, RenderError>;
}

/// Plain HTML page, enough for a browser print-to-PDF.
pub struct HtmlRenderer {
    pub issuer_name: String,
}

impl Default for HtmlRenderer {
    fn default() -> Self {
        Self {
            issuer_name: "Course Platform".into(),
        }
    }
}

impl CertificateRenderer for HtmlRenderer {
    fn render(&self, c: &Certificate) -> Result<RenderedDocument, RenderError> {
        let html = format!(
            r#"<!DOCTYPE html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Certificate {id}</title>
  <style>
    body{{font-family:sans-serif;text-align:center;padding:48px}}
    .frame{{border:8px double #c4a36e;padding:40px}}
    .name{{font-size:32px;font-weight:700;margin:24px 0 8px}}
  </style>
</head>
<body>
<div class='frame'>
  <h1>Certificate of Completion</h1>
  <div class='name'>{student}</div>
  <p>has completed <strong>{course}</strong> ({hours:.1} hours)</p>
  <p>Issued {issued} &middot; No. {id}</p>
  <p>{issuer}</p>
</div>
</body>
</html>"#,
            id = c.id,
            student = encode_text(&c.student_name),
            course = encode_text(&c.course_title),
            hours = c.total_hours,
            issued = c.issued_at.format("%d.%m.%Y"),
            issuer = encode_text(&self.issuer_name),
        );
        Ok(RenderedDocument {
            content_type: "text/html; charset=utf-8",
            bytes: html.into_bytes(),
        })
    }
}
