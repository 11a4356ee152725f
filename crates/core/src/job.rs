//! Render job model and validation.
//!
//! A job carries either inline HTML or a URL to print, the page options, and
//! an opaque caller tag that is echoed back on the result.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Largest inline HTML payload accepted (5 MiB).
pub const MAX_HTML_BYTES: usize = 5 * 1024 * 1024;

/// Longest URL accepted as a render source.
pub const MAX_URL_LEN: usize = 2048;

/// Margins above this many millimetres are almost certainly a unit mistake.
pub const MAX_MARGIN_MM: f32 = 100.0;

pub const MIN_SCALE: f32 = 0.1;
pub const MAX_SCALE: f32 = 2.0;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What to print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderSource {
    Html(String),
    Url(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageFormat {
    A3,
    #[default]
    A4,
    A5,
    Letter,
    Legal,
    Tabloid,
}

impl PageFormat {
    /// CSS `@page size` keyword.
    pub fn css_size(self) -> &'static str {
        match self {
            Self::A3 => "A3",
            Self::A4 => "A4",
            Self::A5 => "A5",
            Self::Letter => "letter",
            Self::Legal => "legal",
            Self::Tabloid => "11in 17in",
        }
    }
}

/// Page margins in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Margins {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl Default for Margins {
    fn default() -> Self {
        Self {
            top: 10.0,
            right: 10.0,
            bottom: 10.0,
            left: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub format: PageFormat,
    pub landscape: bool,
    pub margins: Margins,
    pub print_background: bool,
    pub scale: f32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            format: PageFormat::A4,
            landscape: false,
            margins: Margins::default(),
            print_background: true,
            scale: 1.0,
        }
    }
}

impl RenderOptions {
    /// Stylesheet injected ahead of the document so the print engine honours
    /// the requested page geometry.
    pub fn page_css(&self) -> String {
        let orientation = if self.landscape { " landscape" } else { "" };
        let m = &self.margins;
        let mut css = format!(
            "@page {{ size: {}{orientation}; margin: {}mm {}mm {}mm {}mm; }}",
            self.format.css_size(),
            m.top,
            m.right,
            m.bottom,
            m.left
        );
        if self.print_background {
            css.push_str(" html { -webkit-print-color-adjust: exact; print-color-adjust: exact; }");
        }
        if (self.scale - 1.0).abs() > f32::EPSILON {
            css.push_str(&format!(" html {{ zoom: {}; }}", self.scale));
        }
        css
    }
}

/// One unit of work submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderJob {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    #[serde(flatten)]
    pub source: RenderSource,
    #[serde(default)]
    pub options: RenderOptions,
    /// Opaque caller tag, echoed back on the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl RenderJob {
    pub fn html(html: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: RenderSource::Html(html.into()),
            options: RenderOptions::default(),
            metadata: None,
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: RenderSource::Url(url.into()),
            options: RenderOptions::default(),
            metadata: None,
        }
    }

    /// Size of the payload in bytes, for logging.
    pub fn payload_len(&self) -> usize {
        match &self.source {
            RenderSource::Html(html) => html.len(),
            RenderSource::Url(url) => url.len(),
        }
    }

    /// HTML with the page stylesheet prepended, or `None` for URL sources.
    pub fn html_with_page_css(&self) -> Option<String> {
        match &self.source {
            RenderSource::Html(html) => Some(format!(
                "<style>{}</style>\n{html}",
                self.options.page_css()
            )),
            RenderSource::Url(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a job before it reaches admission.
///
/// Rules:
/// - HTML must be non-empty and at most [`MAX_HTML_BYTES`].
/// - URLs must be `http` or `https` and at most [`MAX_URL_LEN`] characters.
/// - Margins must be finite and within `0..=MAX_MARGIN_MM`.
/// - Scale must be within `MIN_SCALE..=MAX_SCALE`.
pub fn validate_job(job: &RenderJob) -> Result<(), CoreError> {
    match &job.source {
        RenderSource::Html(html) => {
            if html.trim().is_empty() {
                return Err(CoreError::Validation("html must not be empty".into()));
            }
            if html.len() > MAX_HTML_BYTES {
                return Err(CoreError::Validation(format!(
                    "html exceeds {MAX_HTML_BYTES} bytes"
                )));
            }
        }
        RenderSource::Url(url) => {
            if url.len() > MAX_URL_LEN {
                return Err(CoreError::Validation(format!(
                    "url exceeds {MAX_URL_LEN} characters"
                )));
            }
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(CoreError::Validation(
                    "url must use the http or https scheme".into(),
                ));
            }
        }
    }

    let m = &job.options.margins;
    for (side, value) in [
        ("top", m.top),
        ("right", m.right),
        ("bottom", m.bottom),
        ("left", m.left),
    ] {
        if !value.is_finite() || !(0.0..=MAX_MARGIN_MM).contains(&value) {
            return Err(CoreError::Validation(format!(
                "margin {side} must be between 0 and {MAX_MARGIN_MM} mm"
            )));
        }
    }

    let scale = job.options.scale;
    if !scale.is_finite() || !(MIN_SCALE..=MAX_SCALE).contains(&scale) {
        return Err(CoreError::Validation(format!(
            "scale must be between {MIN_SCALE} and {MAX_SCALE}"
        )));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Deserialization ---------------------------------------------------

    #[test]
    fn html_job_parses_with_defaults() {
        let job: RenderJob = serde_json::from_str(r#"{"html": "<p>hi</p>"}"#).unwrap();
        assert_eq!(job.source, RenderSource::Html("<p>hi</p>".into()));
        assert_eq!(job.options, RenderOptions::default());
        assert!(job.metadata.is_none());
    }

    #[test]
    fn url_job_parses_with_options_and_metadata() {
        let job: RenderJob = serde_json::from_str(
            r#"{
                "url": "https://example.com/invoice/7",
                "options": {"format": "Letter", "landscape": true},
                "metadata": {"invoice": 7}
            }"#,
        )
        .unwrap();
        assert_eq!(job.source, RenderSource::Url("https://example.com/invoice/7".into()));
        assert_eq!(job.options.format, PageFormat::Letter);
        assert!(job.options.landscape);
        assert_eq!(job.options.margins, Margins::default());
        assert_eq!(job.metadata.unwrap()["invoice"], 7);
    }

    #[test]
    fn explicit_id_is_kept() {
        let job: RenderJob = serde_json::from_str(
            r#"{"id": "0190a0c4-5a7e-7b1e-9c1e-3b6f2b9f1a00", "html": "x"}"#,
        )
        .unwrap();
        assert_eq!(job.id.to_string(), "0190a0c4-5a7e-7b1e-9c1e-3b6f2b9f1a00");
    }

    #[test]
    fn job_without_source_is_rejected() {
        assert!(serde_json::from_str::<RenderJob>(r#"{"options": {}}"#).is_err());
    }

    // -- Validation --------------------------------------------------------

    #[test]
    fn valid_job_passes() {
        assert!(validate_job(&RenderJob::html("<h1>Report</h1>")).is_ok());
        assert!(validate_job(&RenderJob::url("https://example.com")).is_ok());
    }

    #[test]
    fn empty_html_rejected() {
        assert!(validate_job(&RenderJob::html("   ")).is_err());
    }

    #[test]
    fn oversize_html_rejected() {
        let job = RenderJob::html("a".repeat(MAX_HTML_BYTES + 1));
        assert!(validate_job(&job).is_err());
    }

    #[test]
    fn non_http_url_rejected() {
        assert!(validate_job(&RenderJob::url("file:///etc/passwd")).is_err());
    }

    #[test]
    fn negative_margin_rejected() {
        let mut job = RenderJob::html("<p>x</p>");
        job.options.margins.left = -1.0;
        assert!(validate_job(&job).is_err());
    }

    #[test]
    fn out_of_range_scale_rejected() {
        let mut job = RenderJob::html("<p>x</p>");
        job.options.scale = 3.0;
        assert!(validate_job(&job).is_err());
        job.options.scale = f32::NAN;
        assert!(validate_job(&job).is_err());
    }

    // -- Page CSS ----------------------------------------------------------

    #[test]
    fn page_css_includes_size_orientation_and_margins() {
        let options = RenderOptions {
            format: PageFormat::Letter,
            landscape: true,
            margins: Margins {
                top: 5.0,
                right: 6.0,
                bottom: 7.0,
                left: 8.0,
            },
            print_background: false,
            scale: 1.0,
        };
        assert_eq!(
            options.page_css(),
            "@page { size: letter landscape; margin: 5mm 6mm 7mm 8mm; }"
        );
    }

    #[test]
    fn page_css_adds_background_and_zoom() {
        let options = RenderOptions {
            scale: 0.5,
            ..RenderOptions::default()
        };
        let css = options.page_css();
        assert!(css.contains("print-color-adjust: exact"));
        assert!(css.contains("zoom: 0.5"));
    }

    #[test]
    fn url_jobs_have_no_inline_html() {
        assert!(RenderJob::url("https://example.com").html_with_page_css().is_none());
        let html = RenderJob::html("<p>x</p>").html_with_page_css().unwrap();
        assert!(html.starts_with("<style>@page"));
        assert!(html.ends_with("<p>x</p>"));
    }
}
