//! Multi-document YAML framing.

use once_cell::sync::Lazy;
use regex::bytes::Regex;

static SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^---[ \t]*(?:#[^\n]*)?\r?$").expect("separator regex"));

/// Split a `---`-separated stream into its documents.
///
/// Documents holding only whitespace or comments are dropped, so leading and
/// trailing separators do not produce empty entries.
pub fn split_manifests(data: &[u8]) -> Vec<Vec<u8>> {
    SEPARATOR
        .split(data)
        .filter(|doc| !is_blank(doc))
        .map(|doc| doc.to_vec())
        .collect()
}

/// Join documents with `---` separator lines; each document ends with a newline.
pub fn join_manifests<D: AsRef<[u8]>>(docs: &[D]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, doc) in docs.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(b"---\n");
        }
        let doc = trim_leading_newlines(doc.as_ref());
        out.extend_from_slice(doc);
        if !doc.ends_with(b"\n") {
            out.push(b'\n');
        }
    }
    out
}

fn trim_leading_newlines(doc: &[u8]) -> &[u8] {
    let start = doc.iter().position(|b| *b != b'\n' && *b != b'\r').unwrap_or(doc.len());
    &doc[start..]
}

fn is_blank(doc: &[u8]) -> bool {
    doc.split(|b| *b == b'\n').all(|line| {
        let line = String::from_utf8_lossy(line);
        let t = line.trim();
        t.is_empty() || t.starts_with('#')
    })
}
