//! Flat-XML tag codec for metadata sectors
//!
//! The on-disk records are not XML documents, just runs of
//! `<tag>value</tag>` pairs packed into a sector and zero-padded, so a
//! full parser is unnecessary; escaping still matters for user-supplied
//! labels.

use lvhd_common::{Result, StorageError};
use quick_xml::escape::{escape, unescape};
use tracing::warn;

/// Render one `<tag>value</tag>` pair, escaped
pub fn tag(name: &str, value: &str) -> String {
    format!("<{name}>{}</{name}>", escape(value))
}

/// Extract and unescape the value of `name`, if the tag is present
pub fn find_tag(xml: &str, name: &str) -> Result<Option<String>> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let Some(start) = xml.find(&open) else {
        return Ok(None);
    };
    let rest = &xml[start + open.len()..];
    let end = rest
        .find(&close)
        .ok_or_else(|| StorageError::metadata(format!("unterminated <{name}> tag")))?;
    let value = unescape(&rest[..end])
        .map_err(|e| StorageError::metadata(format!("bad escape in <{name}>: {e}")))?;
    Ok(Some(value.into_owned()))
}

/// Like [`find_tag`] but the tag must exist
pub fn require_tag(xml: &str, name: &str) -> Result<String> {
    find_tag(xml, name)?
        .ok_or_else(|| StorageError::metadata(format!("missing <{name}> tag")))
}

/// Render one tag into a fixed-capacity sector, truncating the value with
/// a warning if the encoding would overflow
pub fn one_tag_fitting(name: &str, value: &str, capacity: usize) -> String {
    let mut v = value.to_string();
    loop {
        let encoded = tag(name, &v);
        if encoded.len() <= capacity {
            if v.len() < value.len() {
                warn!(tag = name, "metadata value truncated to fit one sector");
            }
            return encoded;
        }
        v.pop();
    }
}

/// Render two tags into a fixed-capacity sector, truncating the values
/// (longest first) with a warning if the encoding would overflow
pub fn two_tags_fitting(
    name_a: &str,
    value_a: &str,
    name_b: &str,
    value_b: &str,
    capacity: usize,
) -> String {
    let mut a = value_a.to_string();
    let mut b = value_b.to_string();
    loop {
        let encoded = format!("{}{}", tag(name_a, &a), tag(name_b, &b));
        if encoded.len() <= capacity {
            if a.len() < value_a.len() || b.len() < value_b.len() {
                warn!(
                    tag_a = name_a,
                    tag_b = name_b,
                    "metadata values truncated to fit one sector"
                );
            }
            return encoded;
        }
        // drop one char from whichever value is longer; both non-empty
        // values cannot fail to fit a 512-byte sector once emptied
        let trim = if a.chars().count() >= b.chars().count() {
            &mut a
        } else {
            &mut b
        };
        trim.pop();
    }
}

/// Parse "0"/"1" bool tags
pub fn parse_bool(value: &str) -> bool {
    value.trim() == "1"
}

/// Encode bools the way the on-disk format expects
pub fn bool_str(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_escaping_round_trip() {
        let rendered = tag("name_label", "a <b> & \"c\"");
        assert!(!rendered.contains("<b>"));
        let xml = format!("{rendered}<other>x</other>");
        assert_eq!(
            find_tag(&xml, "name_label").unwrap().as_deref(),
            Some("a <b> & \"c\"")
        );
        assert_eq!(find_tag(&xml, "missing").unwrap(), None);
    }

    #[test]
    fn test_require_tag() {
        assert!(require_tag("<a>1</a>", "b").is_err());
        assert_eq!(require_tag("<a>1</a>", "a").unwrap(), "1");
    }

    #[test]
    fn test_two_tags_truncation() {
        let long = "x".repeat(600);
        let encoded = two_tags_fitting("name_label", &long, "name_description", "short", 512);
        assert!(encoded.len() <= 512);
        assert!(encoded.contains("<name_description>short</name_description>"));
    }

    #[test]
    fn test_bools() {
        assert!(parse_bool("1"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool(""));
        assert_eq!(bool_str(true), "1");
    }
}
