//! Reversible escaping of partition and row keys.
//!
//! The store rejects `/`, `\`, `#`, `?` and control characters inside keys. Those
//! characters, together with the escape character `%` itself, are written as
//! `%XX` per UTF-8 byte; every other character passes through untouched.

use crate::AppError;

const ESCAPE: char = '%';

fn must_escape(c: char) -> bool {
    matches!(c, '/' | '\\' | '#' | '?' | ESCAPE) || c.is_control()
}

pub fn encode_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut buf = [0u8; 4];
    for c in raw.chars() {
        if must_escape(c) {
            for b in c.encode_utf8(&mut buf).as_bytes() {
                out.push(ESCAPE);
                out.push_str(&format!("{:02X}", b));
            }
        } else {
            out.push(c);
        }
    }
    out
}

pub fn decode_key(encoded: &str) -> Result<String, AppError> {
    urlencoding::decode(encoded)
        .map(|s| s.into_owned())
        .map_err(|e| AppError::KeyDecoding(format!("{encoded}: {e}")))
}

/// Table names are alphanumeric, start with a letter and span 3..=63 characters.
pub fn clean_table_name(raw: &str) -> String {
    let mut name: String = raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if name.is_empty() {
        return "table".to_string();
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        name.insert(0, 't');
    }
    while name.len() < 3 {
        name.push('0');
    }
    name.truncate(63);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn plain_keys_are_untouched() {
        assert_eq!(encode_key("customer-42_FL"), "customer-42_FL");
    }

    #[test]
    fn forbidden_characters_are_escaped() {
        assert_eq!(encode_key("a/b\\c#d?e"), "a%2Fb%5Cc%23d%3Fe");
        assert_eq!(encode_key("100%"), "100%25");
        assert_eq!(encode_key("tab\there"), "tab%09here");
        assert!(!encode_key("x\u{7f}\u{85}y").chars().any(|c| c.is_control()));
    }

    #[test]
    fn decode_inverts_encode() {
        let samples = [
            "",
            "simple",
            "%41 literal percent sequence",
            "path/to\\file#frag?q=1",
            "unicode ß→東京 🚀",
            "controls \u{0}\u{1f}\u{7f}\u{9f}",
            "%%%///",
        ];
        for s in samples {
            assert_eq!(decode_key(&encode_key(s)).unwrap(), s, "round trip of {s:?}");
        }
    }

    #[test]
    fn table_names_are_cleaned() {
        assert_eq!(clean_table_name("my-table_2024"), "mytable2024");
        assert_eq!(clean_table_name("2024data"), "t2024data");
        assert_eq!(clean_table_name("a"), "a00");
        assert_eq!(clean_table_name("--"), "table");
        assert_eq!(clean_table_name(&"x".repeat(80)).len(), 63);
    }

    proptest! {
        #[test]
        fn any_key_round_trips_without_forbidden_characters(raw in any::<String>()) {
            let encoded = encode_key(&raw);
            prop_assert!(!encoded.chars().any(|c| matches!(c, '/' | '\\' | '#' | '?') || c.is_control()), "{:?}", encoded);
            prop_assert_eq!(decode_key(&encoded).unwrap(), raw);
        }
    }
}
