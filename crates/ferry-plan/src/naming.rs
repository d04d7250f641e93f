//! DNS-1123 label rewriting for target VM names

use ferry_common::NAME_MAX_LENGTH;

/// Name used when nothing of the source name survives the rewrite
const FALLBACK_NAME: &str = "vm";

/// True when `name` is a valid DNS-1123 label
pub fn is_dns1123_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= NAME_MAX_LENGTH
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// Rewrite `name` into a DNS-1123 label.
///
/// Uppercase is lowered, every run of other invalid characters becomes a
/// single hyphen, and the result is cut to the label length limit without
/// a leading or trailing hyphen. The same input always yields the same
/// output; valid names are returned unchanged.
pub fn to_dns1123_label(name: &str) -> String {
    if is_dns1123_label(name) {
        return name.to_string();
    }
    let mut out = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.truncate(NAME_MAX_LENGTH);
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// The rewritten name, or `None` when `name` is already valid
pub fn rename(name: &str) -> Option<String> {
    (!is_dns1123_label(name)).then(|| to_dns1123_label(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("My_VM!", "my-vm")]
    #[case("web server 01", "web-server-01")]
    #[case("--db.prod--", "db-prod")]
    #[case("ÜBER", "ber")]
    #[case("!!!", "vm")]
    fn test_invalid_names_are_rewritten(#[case] raw: &str, #[case] expected: &str) {
        let name = to_dns1123_label(raw);
        assert_eq!(name, expected);
        assert!(is_dns1123_label(&name));
        assert_eq!(rename(raw).as_deref(), Some(expected));
    }

    #[test]
    fn test_valid_names_are_left_alone() {
        assert_eq!(to_dns1123_label("valid-name"), "valid-name");
        assert_eq!(rename("valid-name"), None);
    }

    #[test]
    fn test_long_names_are_cut_without_a_trailing_hyphen() {
        let raw = format!("{}_{}", "a".repeat(62), "b".repeat(10));
        let name = to_dns1123_label(&raw);
        assert!(name.len() <= NAME_MAX_LENGTH);
        assert!(is_dns1123_label(&name));
        assert_eq!(name, "a".repeat(62));
    }

    #[test]
    fn test_rewriting_is_deterministic() {
        assert_eq!(to_dns1123_label("Win 2019 (SQL)"), to_dns1123_label("Win 2019 (SQL)"));
    }
}
