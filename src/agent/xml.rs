//! Minimal tag scanning for agent output. Agent replies are XML-like blocks
//! with a fixed, non-recursive grammar per agent; there is no need for a
//! real XML parser, and no heuristic recovery on malformed output: the
//! caller records the failure and the status checker re-dispatches.

use regex::Regex;
use std::sync::OnceLock;

/// Content of the last closed `<tag>…</tag>` pair, trimmed.
pub fn extract_last_tag(text: &str, tag: &str) -> Option<String> {
    extract_all_tags(text, tag).into_iter().next_back()
}

/// Contents of every closed `<tag>…</tag>` pair, in order. Opening tags may
/// carry attributes.
pub fn extract_all_tags(text: &str, tag: &str) -> Vec<String> {
    find_elements(text, tag).into_iter().map(|e| e.inner).collect()
}

/// A scanned element: the raw opening tag (with attributes) plus its inner
/// text (empty for self-closing elements).
#[derive(Debug, Clone)]
pub struct Element {
    pub open_tag: String,
    pub inner: String,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<String> {
        attr_value(&self.open_tag, name)
    }
}

/// Scan for `<tag …>…</tag>` and `<tag …/>` occurrences of one tag name.
pub fn find_elements(text: &str, tag: &str) -> Vec<Element> {
    let open_prefix = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut pos = 0;

    while let Some(found) = text[pos..].find(&open_prefix) {
        let start = pos + found;
        let after_name = start + open_prefix.len();
        // Require a real boundary so "<table" does not match "<tables".
        match text[after_name..].chars().next() {
            Some(c) if c == '>' || c == '/' || c.is_whitespace() => {}
            _ => {
                pos = after_name;
                continue;
            }
        }
        let Some(tag_end_rel) = text[start..].find('>') else {
            break;
        };
        let tag_end = start + tag_end_rel;
        let open_tag = text[start..=tag_end].to_string();

        if open_tag.ends_with("/>") {
            out.push(Element {
                open_tag,
                inner: String::new(),
            });
            pos = tag_end + 1;
            continue;
        }

        let body_start = tag_end + 1;
        let Some(close_rel) = text[body_start..].find(&close) else {
            pos = tag_end + 1;
            continue;
        };
        let body_end = body_start + close_rel;
        out.push(Element {
            open_tag,
            inner: text[body_start..body_end].trim().to_string(),
        });
        pos = body_end + close.len();
    }
    out
}

/// Value of `name="…"` (or single-quoted) inside a raw opening tag.
pub fn attr_value(open_tag: &str, name: &str) -> Option<String> {
    let mut search_from = 0;
    loop {
        let idx = open_tag[search_from..].find(name)? + search_from;
        // Attribute name must sit on a boundary and be followed by '='.
        let before_ok = idx == 0
            || open_tag[..idx]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_whitespace() || c == '<');
        let rest = open_tag[idx + name.len()..].trim_start();
        if !before_ok || !rest.starts_with('=') {
            search_from = idx + name.len();
            continue;
        }
        let rest = rest[1..].trim_start();
        let quote = rest.chars().next()?;
        if quote != '"' && quote != '\'' {
            return None;
        }
        let inner = &rest[1..];
        let end = inner.find(quote)?;
        return Some(unescape(&inner[..end]));
    }
}

/// Strip every `<…>` tag, keeping text content only.
pub fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// Locate the agent's artifact block `<root>…</root>` in a raw reply.
/// Falls back to the contents of an xml-fenced code block, which models
/// sometimes wrap their answer in.
pub fn extract_block(text: &str, root: &str) -> Option<String> {
    let open = format!("<{root}>");
    let close = format!("</{root}>");
    if let Some(start) = text.find(&open)
        && let Some(end_rel) = text[start..].find(&close)
    {
        return Some(text[start..start + end_rel + close.len()].to_string());
    }

    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```xml\s*\n(.*?)\n```").expect("fence regex")
    });
    let captured = fence.captures(text)?.get(1)?.as_str();
    if captured.contains(&open) {
        Some(captured.to_string())
    } else {
        None
    }
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::{attr_value, extract_all_tags, extract_block, extract_last_tag, find_elements, strip_tags};

    #[test]
    fn last_tag_prefers_last_closed_pair() {
        let raw = "<sql>bad</sql> noise <sql>SELECT 1</sql>";
        assert_eq!(extract_last_tag(raw, "sql").as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn all_tags_in_order() {
        let raw = "<rule>a</rule><rule>b</rule>";
        assert_eq!(extract_all_tags(raw, "rule"), vec!["a", "b"]);
    }

    #[test]
    fn tag_name_boundary_respected() {
        let raw = "<tables><table name=\"t\">x</table></tables>";
        let found = find_elements(raw, "table");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].attr("name").as_deref(), Some("t"));
    }

    #[test]
    fn self_closing_elements_have_empty_inner() {
        let raw = r#"<join from_table="a" to_table="b" type="INNER"/>"#;
        let found = find_elements(raw, "join");
        assert_eq!(found.len(), 1);
        assert!(found[0].inner.is_empty());
        assert_eq!(found[0].attr("type").as_deref(), Some("INNER"));
        // from_table must not satisfy a lookup for "table"
        assert_eq!(found[0].attr("table"), None);
    }

    #[test]
    fn attr_values_unescape_entities() {
        let open = r#"<column name="Eligible Free Rate (K-12)" note="a &amp; b">"#;
        assert_eq!(
            attr_value(open, "name").as_deref(),
            Some("Eligible Free Rate (K-12)")
        );
        assert_eq!(attr_value(open, "note").as_deref(), Some("a & b"));
    }

    #[test]
    fn block_extraction_direct_and_fenced() {
        let direct = "prose <analysis><intent>x</intent></analysis> more";
        assert!(extract_block(direct, "analysis").unwrap().starts_with("<analysis>"));

        let fenced = "Here you go:\n```xml\n<analysis><intent>x</intent></analysis>\n```\n";
        assert!(extract_block(fenced, "analysis").is_some());

        assert!(extract_block("no block here", "analysis").is_none());
    }

    #[test]
    fn strip_tags_keeps_text() {
        assert_eq!(strip_tags("<b>keep</b> this"), "keep this");
    }

    #[test]
    fn unclosed_tag_is_skipped() {
        let raw = "<sql>SELECT 1";
        assert!(extract_last_tag(raw, "sql").is_none());
    }
}
