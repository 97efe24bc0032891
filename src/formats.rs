//! Rendering of downloaded documents into the requested output formats.

use crate::searches::OutputFormat;
use scraper::{ElementRef, Html};

/// Content to store for `format`, given the document body returned by the API.
pub fn render(format: OutputFormat, content: &str) -> String {
    match format {
        OutputFormat::Html | OutputFormat::Txt => content.to_string(),
        OutputFormat::TxtOnly => extract_text(content),
    }
}

/// Title, headline and body text of a document, separated by blank lines.
/// The headline is left out when it repeats the title.
pub fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);

    let title = element_text(&document, "title").unwrap_or_default();
    let headline = element_text(&document, "h1")
        .filter(|h| !h.is_empty())
        .or_else(|| element_text(&document, "nitf:hedline"))
        .unwrap_or_default();
    let body = element_text(&document, "bodytext").unwrap_or_default();

    let mut parts = vec![title.clone()];
    if title != headline {
        parts.push(headline);
    }
    parts.push(body);
    parts.retain(|p| !p.is_empty());
    parts.join("\n\n")
}

/// Text of the first element called `name`. Matches on the tag name directly
/// since namespaced tags like `nitf:hedline` are not valid CSS selectors.
fn element_text(document: &Html, name: &str) -> Option<String> {
    document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name().eq_ignore_ascii_case(name))
        .map(|el| el.text().collect::<String>().trim().to_string())
}
