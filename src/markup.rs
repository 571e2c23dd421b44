// File: src/markup.rs
//
// Tokenizer for inline line markup.
// Lines may carry bracketed attributes such as `[wave]`, `[/wave]`,
// `[wave /]`, `[/]`, and shorthand forms like `[bounce=2]`. The parser
// produces an ordered attribute list with byte-accurate source spans and
// never fails: bracket text it cannot recognize is left for the driver to
// emit as plain text.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Attribute name synthesized for a leading `Speaker:` prefix.
pub const CHARACTER_ATTRIB: &str = "character";

static CHARACTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+):\s+").expect("character regex is valid"));

// Captures: 1 = attribute name, 2 = shorthand `=value`, 3 = properties
// blob, 4 = closing section, 5 = name being closed.
static ATTRIBUTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\[\s*(\w*)\s*(=\s*(?:"[^"]*"|[^\s"/\]]+))?([^/\]]*)(/?\s*(\w*)\])"#)
        .expect("attribute regex is valid")
});

static PROPERTY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([^\s=]+)\s*=\s*(?:"([^"]*)"|([^\s"]+))"#).expect("property regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttribType {
    Open,
    Close,
    SelfClosing,
    CloseAll,
}

/// One bracketed annotation in a line of dialogue.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub kind: AttribType,
    pub properties: HashMap<String, String>,
    /// Byte offset of the attribute's source span in the line.
    pub position: usize,
    /// Byte length of the source span.
    pub length: usize,
}

impl Attribute {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Parse `key=value` pairs out of a property blob. The first key also
    /// names the attribute when the name is still unset, which is how the
    /// shorthand `[bounce=2]` form resolves.
    fn parse_properties(&mut self, text: &str) {
        for caps in PROPERTY_RE.captures_iter(text) {
            let key = caps[1].to_string();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();

            if self.name.is_empty() {
                self.name = key.clone();
            }
            self.properties.insert(key, value);
        }
    }
}

/// The ordered attribute list parsed out of one line.
#[derive(Debug, Clone, Default)]
pub struct LineAttributes {
    pub attribs: Vec<Attribute>,
}

impl LineAttributes {
    pub fn parse(line: &str) -> LineAttributes {
        let mut attribs = Vec::new();

        // A line that opens with `identifier: ` names its speaker. The
        // prefix surfaces as a self-closing `character` attribute whose
        // span covers the identifier, the colon, and the whitespace.
        if let Some(caps) = CHARACTER_RE.captures(line) {
            let span = caps.get(0).expect("whole match exists");
            attribs.push(Attribute {
                name: CHARACTER_ATTRIB.to_string(),
                kind: AttribType::SelfClosing,
                properties: HashMap::from([("name".to_string(), caps[1].to_string())]),
                position: 0,
                length: span.end(),
            });
        }

        for caps in ATTRIBUTE_RE.captures_iter(line) {
            let span = caps.get(0).expect("whole match exists");
            let mut attr = Attribute {
                name: String::new(),
                kind: AttribType::Open,
                properties: HashMap::new(),
                position: span.start(),
                length: span.len(),
            };

            if let Some(name) = caps.get(1) {
                attr.name = name.as_str().to_string();
            }

            // Shorthand `[name=value ...]` reads as `[name name=value ...]`.
            if let Some(shorthand) = caps.get(2) {
                if !attr.name.is_empty() {
                    let pair = format!("{}{}", attr.name, shorthand.as_str());
                    attr.parse_properties(&pair);
                }
            }

            if let Some(blob) = caps.get(3) {
                attr.parse_properties(blob.as_str());
            }

            let closing = caps.get(4).map(|m| m.as_str()).unwrap_or("]");
            if !closing.starts_with('/') {
                attr.kind = AttribType::Open;
            } else {
                let close_name = caps.get(5).map(|m| m.as_str()).unwrap_or("");
                if !close_name.is_empty() {
                    // `[/name]`
                    attr.kind = AttribType::Close;
                    attr.name = close_name.to_string();
                } else if !attr.name.is_empty() {
                    // `[name ... /]`
                    attr.kind = AttribType::SelfClosing;
                } else {
                    // `[/]`
                    attr.kind = AttribType::CloseAll;
                }
            }

            attribs.push(attr);
        }

        LineAttributes { attribs }
    }
}

/// English cardinal plural class of a numeric string: one, or other.
pub fn cardinal_plural_class(value: &str) -> &'static str {
    match value.parse::<f64>() {
        Ok(n) if n == 1.0 => "one",
        _ => "other",
    }
}

/// English ordinal plural class of a numeric string: 1st is "one", 2nd is
/// "two", 3rd is "few", everything else (including 11th through 13th) is
/// "other".
pub fn ordinal_plural_class(value: &str) -> &'static str {
    let Ok(n) = value.parse::<f64>() else {
        return "other";
    };
    let n = n.abs() as i64;

    if (11..=13).contains(&(n % 100)) {
        return "other";
    }
    match n % 10 {
        1 => "one",
        2 => "two",
        3 => "few",
        _ => "other",
    }
}
