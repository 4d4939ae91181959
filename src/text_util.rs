//! Shared string/number coercion utilities.
//!
//! These must behave identically everywhere they're used (spec.md §4.4): the
//! batch extractor, the graph merger's description joins, and any future
//! chunked extraction path all call through here rather than re-implementing
//! sanitation locally.

/// The literal separator used to join list-like string fields (spec.md GLOSSARY).
pub const SEP: &str = "<SEP>";

/// Strip control characters, unescape a handful of common HTML entities, and trim.
///
/// `null` (absent) input coerces to an empty string.
pub fn sanitize_str(input: Option<&str>) -> String {
    let raw = match input {
        Some(s) => s,
        None => return String::new(),
    };
    let unescaped = html_unescape(raw);
    let stripped: String = unescaped
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    stripped.trim().to_string()
}

/// Unescape the small set of HTML entities that show up in LLM output.
pub fn html_unescape(input: &str) -> String {
    input
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
}

/// Parse a float from LLM output, coercing anything unparseable (including
/// `None`) to `1.0` rather than failing the extraction.
pub fn safe_float(input: Option<&str>) -> f64 {
    match input {
        Some(s) => s.trim().parse::<f64>().unwrap_or(1.0),
        None => 1.0,
    }
}

/// Same as [`safe_float`] but accepting a `serde_json::Value` directly, since
/// NDJSON fields may arrive as either a JSON number or a numeric string.
pub fn safe_float_json(value: Option<&serde_json::Value>) -> f64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(1.0),
        Some(serde_json::Value::String(s)) => safe_float(Some(s.as_str())),
        _ => 1.0,
    }
}

/// Join non-empty, de-duplicated parts with [`SEP`], preserving first-seen order.
pub fn sep_join<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for part in parts {
        let part = part.into();
        if part.is_empty() {
            continue;
        }
        if seen.insert(part.clone()) {
            out.push(part);
        }
    }
    out.join(SEP)
}

/// Split a `<SEP>`-joined field back into its parts.
pub fn sep_split(joined: &str) -> Vec<String> {
    if joined.is_empty() {
        return Vec::new();
    }
    joined.split(SEP).map(|s| s.to_string()).collect()
}

/// Normalize an entity name: uppercase, quotes stripped, trimmed (spec.md §3).
pub fn normalize_entity_name(name: &str) -> String {
    name.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .to_uppercase()
}

/// Sanitize a value destined to be used as a graph label: `[A-Za-z0-9_]+` only.
pub fn sanitize_label(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "UNKNOWN".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_str_none_is_empty() {
        assert_eq!(sanitize_str(None), "");
    }

    #[test]
    fn sanitize_str_strips_control_chars() {
        assert_eq!(sanitize_str(Some("\x00hello")), "hello");
    }

    #[test]
    fn sanitize_str_unescapes_and_trims() {
        assert_eq!(sanitize_str(Some("  Tom &amp; Jerry  ")), "Tom & Jerry");
    }

    #[test]
    fn safe_float_null_is_one() {
        assert_eq!(safe_float(None), 1.0);
    }

    #[test]
    fn safe_float_garbage_is_one() {
        assert_eq!(safe_float(Some("abc")), 1.0);
    }

    #[test]
    fn safe_float_parses_valid() {
        assert_eq!(safe_float(Some("3.5")), 3.5);
    }

    #[test]
    fn sep_join_dedupes_preserving_order() {
        let joined = sep_join(vec!["a", "b", "a", "c"]);
        assert_eq!(joined, format!("a{SEP}b{SEP}c"));
    }

    #[test]
    fn sep_split_roundtrips() {
        let joined = sep_join(vec!["x", "y"]);
        assert_eq!(sep_split(&joined), vec!["x", "y"]);
    }

    #[test]
    fn sep_split_empty_string_is_empty_vec() {
        assert!(sep_split("").is_empty());
    }

    #[test]
    fn normalize_entity_name_uppercases_and_strips_quotes() {
        assert_eq!(normalize_entity_name("\"Executive Order 14196\""), "EXECUTIVE ORDER 14196");
    }

    #[test]
    fn sanitize_label_replaces_invalid_chars() {
        assert_eq!(sanitize_label("Law-Type!"), "Law_Type_");
    }

    #[test]
    fn sanitize_label_empty_becomes_unknown() {
        assert_eq!(sanitize_label(""), "UNKNOWN");
    }
}
