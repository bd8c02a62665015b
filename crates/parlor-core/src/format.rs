//! Chat post-processing.
//!
//! Formatting is presentation only: room state stores whatever the chain
//! returns and never depends on it.

use regex::Regex;

/// A single text transform applied to outgoing chat messages.
pub trait MessageFormatter: Send + Sync {
    fn format(&self, text: &str) -> String;
}

/// Escapes HTML so user text cannot inject markup.
pub struct EscapeHtml;

impl MessageFormatter for EscapeHtml {
    fn format(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#39;"),
                _ => out.push(c),
            }
        }
        out
    }
}

// URLs are only rewritten at the start of the text or after whitespace,
// so a URL already inside an attribute is left alone.
const IMAGE_URL: &str =
    r#"(?i)(?P<pre>^|\s)(?P<url>https?://[^\s<>"]+\.(?:png|jpe?g|gif|webp)(?:\?[^\s<>"]*)?)"#;
const BARE_URL: &str = r#"(?P<pre>^|\s)(?P<url>https?://[^\s<>"]+)"#;

/// Turns bare image URLs into inline images.
pub struct ImageEmbed {
    pattern: Regex,
}

impl ImageEmbed {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(IMAGE_URL)?,
        })
    }
}

impl MessageFormatter for ImageEmbed {
    fn format(&self, text: &str) -> String {
        self.pattern
            .replace_all(text, r#"${pre}<img src="${url}" alt="">"#)
            .into_owned()
    }
}

/// Turns bare URLs into links.
pub struct Linkify {
    pattern: Regex,
}

impl Linkify {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(BARE_URL)?,
        })
    }
}

impl MessageFormatter for Linkify {
    fn format(&self, text: &str) -> String {
        self.pattern
            .replace_all(
                text,
                r#"${pre}<a href="${url}" target="_blank" rel="noopener">${url}</a>"#,
            )
            .into_owned()
    }
}

/// Ordered list of formatters.
#[derive(Default)]
pub struct FormatterChain {
    formatters: Vec<Box<dyn MessageFormatter>>,
}

impl FormatterChain {
    /// A chain that returns text unchanged.
    pub fn plain() -> Self {
        Self::default()
    }

    /// Escape, then embed images, then link remaining URLs.
    pub fn standard() -> Result<Self, regex::Error> {
        Ok(Self::plain()
            .with(EscapeHtml)
            .with(ImageEmbed::new()?)
            .with(Linkify::new()?))
    }

    pub fn with(mut self, formatter: impl MessageFormatter + 'static) -> Self {
        self.formatters.push(Box::new(formatter));
        self
    }

    pub fn len(&self) -> usize {
        self.formatters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formatters.is_empty()
    }
}

impl MessageFormatter for FormatterChain {
    fn format(&self, text: &str) -> String {
        self.formatters
            .iter()
            .fold(text.to_owned(), |acc, f| f.format(&acc))
    }
}

impl std::fmt::Debug for FormatterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatterChain")
            .field("len", &self.formatters.len())
            .finish()
    }
}
