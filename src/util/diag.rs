//! Rendering of flush diagnostics
//!
//! A failed flush is a programming error in the calling code, so the most
//! useful diagnostic points at the source line that emitted the offending
//! reference. The writer records `#[track_caller]` locations for every
//! pending label reference; this module turns them into a rustc-style
//! excerpt, or into a `miette` graphical report when the
//! `fancy-diagnostics` feature is enabled.

use std::fs;
use std::panic;

#[cfg(feature = "fancy-diagnostics")]
use std::fmt;

#[cfg(feature = "fancy-diagnostics")]
use miette::{Diagnostic, GraphicalReportHandler, LabeledSpan, NamedSource, SourceSpan};

/// Locate `line` (1-based) in `content`, returning its byte range.
fn line_bounds(content: &str, line: u32) -> Option<(usize, usize)> {
    let bytes = content.as_bytes();
    if line == 0 || bytecount::count(bytes, b'\n') + 1 < line as usize {
        return None;
    }

    let start = if line == 1 {
        0
    } else {
        let mut seen = 0;
        let mut start = None;
        for pos in memchr::memchr_iter(b'\n', bytes) {
            seen += 1;
            if seen == line - 1 {
                start = Some(pos + 1);
                break;
            }
        }
        start?
    };

    let end = memchr::memchr(b'\n', &bytes[start..])
        .map(|pos| start + pos)
        .unwrap_or(bytes.len());

    Some((start, end))
}

fn header(message: &str, site: &panic::Location<'_>) -> String {
    format!(
        "error: {message}\n  --> {file}:{line}:{column}",
        file = site.file(),
        line = site.line(),
        column = site.column()
    )
}

/// Render `message` with a source excerpt for `site`, rustc style.
///
/// Falls back to the bare header when the source file cannot be read
/// (stripped binaries, relocated build trees).
#[cfg(not(feature = "fancy-diagnostics"))]
pub fn render_ref_site(message: &str, site: &'static panic::Location<'static>) -> String {
    let header = header(message, site);

    let Ok(content) = fs::read_to_string(site.file()) else {
        return header;
    };
    let Some((start, end)) = line_bounds(&content, site.line()) else {
        return header;
    };

    let line = &content[start..end];
    let line_number = site.line().to_string();
    let pad = " ".repeat(line_number.len());
    let caret = " ".repeat((site.column() as usize).saturating_sub(1)) + "^";

    format!("{header}\n{pad} |\n{line_number} | {line}\n{pad} | {caret}")
}

/// Render `message` as a `miette` graphical report anchored at `site`.
#[cfg(feature = "fancy-diagnostics")]
pub fn render_ref_site(message: &str, site: &'static panic::Location<'static>) -> String {
    let fallback = header(message, site);

    let Ok(content) = fs::read_to_string(site.file()) else {
        return fallback;
    };
    let Some((start, _)) = line_bounds(&content, site.line()) else {
        return fallback;
    };

    let offset = start + (site.column() as usize).saturating_sub(1);
    let diag = RefSiteDiagnostic {
        message: message.to_owned(),
        src: NamedSource::new(site.file(), content),
        span: SourceSpan::from(offset..offset + 1),
    };

    let mut rendered = String::with_capacity(512);
    if GraphicalReportHandler::new()
        .render_report(&mut rendered, &diag)
        .is_err()
    {
        return fallback;
    }

    rendered
}

#[cfg(feature = "fancy-diagnostics")]
#[derive(Debug)]
struct RefSiteDiagnostic {
    message: String,
    src: NamedSource<String>,
    span: SourceSpan,
}

#[cfg(feature = "fancy-diagnostics")]
impl fmt::Display for RefSiteDiagnostic {
    #[inline(always)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(feature = "fancy-diagnostics")]
impl std::error::Error for RefSiteDiagnostic {}

#[cfg(feature = "fancy-diagnostics")]
impl Diagnostic for RefSiteDiagnostic {
    fn source_code(&self) -> Option<&dyn miette::SourceCode> {
        Some(&self.src)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = LabeledSpan> + '_>> {
        Some(Box::new(std::iter::once(LabeledSpan::underline(self.span))))
    }
}
