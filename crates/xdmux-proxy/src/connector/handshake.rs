//! DBGp `init` packet parsing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

static ELEMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([A-Za-z_][\w:.-]*)((?:\s[^>]*)?)>").expect("static regex is valid")
});
static ATTRIBUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w:.-]*)\s*=\s*"([^"]*)""#).expect("static regex is valid")
});

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Handshake contains no XML element")]
    NoElement,
}

/// The first packet a peer sends after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Name of the root element; `init` for a well-formed handshake.
    pub element: String,
    pub attributes: HashMap<String, String>,
    pub raw: String,
}

impl Handshake {
    pub fn parse(raw: &str) -> Result<Self, HandshakeError> {
        let captures = ELEMENT_RE.captures(raw).ok_or(HandshakeError::NoElement)?;
        let element = captures[1].to_string();
        let attributes = captures.get(2).map_or_else(HashMap::new, |attrs| {
            ATTRIBUTE_RE
                .captures_iter(attrs.as_str())
                .map(|c| (c[1].to_string(), unescape(&c[2])))
                .collect()
        });

        Ok(Self {
            element,
            attributes,
            raw: raw.to_string(),
        })
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn idekey(&self) -> Option<&str> {
        self.attribute("idekey")
    }

    pub fn fileuri(&self) -> Option<&str> {
        self.attribute("fileuri")
    }

    pub fn appid(&self) -> Option<&str> {
        self.attribute("appid")
    }

    /// Structural check: an `init` packet naming its script, carrying the
    /// expected IDE key when one is configured.
    pub fn is_correct(&self, expected_idekey: Option<&str>) -> bool {
        if self.element != "init" || self.fileuri().is_none() {
            return false;
        }
        expected_idekey.is_none_or(|expected| self.idekey() == Some(expected))
    }

    /// Whether the peer is running the dummy request script.
    pub fn is_dummy(&self, dummy_request_file: &Path) -> bool {
        let Some(fileuri) = self.fileuri() else {
            return false;
        };
        let script = Path::new(fileuri.strip_prefix("file://").unwrap_or(fileuri));
        match (script.file_name(), dummy_request_file.file_name()) {
            (Some(actual), Some(expected)) => actual == expected,
            _ => false,
        }
    }
}

fn unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
