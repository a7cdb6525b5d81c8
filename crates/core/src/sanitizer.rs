use std::borrow::Cow;

/// Clean raw content for parsing
///
/// Decodes lossily as UTF-8, drops control characters other than tab, line
/// feed and carriage return, normalizes line endings to `\n` and trims
/// trailing whitespace from every line. Never fails, and applying it to its
/// own output changes nothing.
///
/// Returns the cleaned text and whether it differs from the input bytes.
pub fn sanitize(buffer: &[u8]) -> (String, bool) {
    let decoded = String::from_utf8_lossy(buffer);

    let without_controls: Cow<'_, str> = if decoded.chars().any(is_stripped_control) {
        Cow::Owned(decoded.chars().filter(|c| !is_stripped_control(*c)).collect())
    } else {
        Cow::Borrowed(decoded.as_ref())
    };

    let normalized: Cow<'_, str> = if without_controls.contains('\r') {
        Cow::Owned(without_controls.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        without_controls
    };

    let mut cleaned = String::with_capacity(normalized.len());
    for (i, line) in normalized.split('\n').enumerate() {
        if i > 0 {
            cleaned.push('\n');
        }
        cleaned.push_str(line.trim_end());
    }

    let changed = cleaned.as_bytes() != buffer;
    (cleaned, changed)
}

fn is_stripped_control(c: char) -> bool {
    c.is_control() && !matches!(c, '\t' | '\n' | '\r')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_clean_input_is_unchanged() {
        let (text, changed) = sanitize(b"import os\n\nimport sys\n");
        assert_eq!(text, "import os\n\nimport sys\n");
        assert!(!changed);
    }

    #[test]
    fn test_strips_nulls_and_controls() {
        let (text, changed) = sanitize(b"import os\x00\n\x07\nimport sys\x1b\n");
        assert_eq!(text, "import os\n\nimport sys\n");
        assert!(changed);
    }

    #[test]
    fn test_normalizes_line_endings() {
        let (text, _) = sanitize(b"a = 1\r\nb = 2\rc = 3\n");
        assert_eq!(text, "a = 1\nb = 2\nc = 3\n");
    }

    #[test]
    fn test_trims_trailing_whitespace() {
        let (text, changed) = sanitize(b"import os   \n\tx = 1\t\n");
        assert_eq!(text, "import os\n\tx = 1\n");
        assert!(changed);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let (text, changed) = sanitize(b"import os\n\xff\xfe\n");
        assert!(text.starts_with("import os\n"));
        assert!(text.contains('\u{FFFD}'));
        assert!(changed);
    }

    #[test]
    fn test_control_between_cr_and_lf() {
        let (once, _) = sanitize(b"a\r\x01\nb");
        assert_eq!(once, "a\nb");
        let (twice, changed) = sanitize(once.as_bytes());
        assert_eq!(once, twice);
        assert!(!changed);
    }

    proptest! {
        #[test]
        fn prop_sanitize_is_idempotent(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            let (once, _) = sanitize(&bytes);
            let (twice, changed) = sanitize(once.as_bytes());
            prop_assert_eq!(&once, &twice);
            prop_assert!(!changed);
        }

        #[test]
        fn prop_sanitize_is_idempotent_on_text(text in r"[ -~\t\r\n\x00-\x1f\x{85}\x{2028}]{0,256}") {
            let (once, _) = sanitize(text.as_bytes());
            let (twice, _) = sanitize(once.as_bytes());
            prop_assert_eq!(once, twice);
        }
    }
}
