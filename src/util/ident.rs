//! Escaping of arbitrary names into identifier-safe strings.

/// Escape `name` so it only contains `[A-Za-z0-9_]` and does not start
/// with a digit.
///
/// Every other byte, and a leading digit, becomes `_` followed by two
/// lowercase hex digits. The empty string maps to `_`.
#[must_use]
pub fn escape_identifier(name: &str) -> String {
    if name.is_empty() {
        return "_".to_string();
    }

    let mut out = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let safe = byte.is_ascii_alphabetic() || (i > 0 && byte.is_ascii_digit());
        if safe {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("_{byte:02x}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_unsafe_bytes() {
        assert_eq!(escape_identifier("e-mail"), "e_2dmail");
        assert_eq!(escape_identifier("IM"), "IM");
        assert_eq!(escape_identifier("a_b"), "a_5fb");
    }

    #[test]
    fn escapes_leading_digit_and_empty() {
        assert_eq!(escape_identifier("3d"), "_33d");
        assert_eq!(escape_identifier(""), "_");
        assert_eq!(escape_identifier("é"), "_c3_a9");
    }
}
