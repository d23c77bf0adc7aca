//! Inbound text sanitizer.
//!
//! Order is fixed: NFC normalize → strip zero-width → strip control chars.
//! The function is total (never fails) and idempotent.

use unicode_normalization::UnicodeNormalization;

/// Zero-width and invisible formatting characters removed from input.
fn is_zero_width(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200F}' // ZWSP, ZWNJ, ZWJ, LRM, RLM
            | '\u{FEFF}' // BOM / zero-width no-break space
            | '\u{2060}' // word joiner
            | '\u{00AD}' // soft hyphen
            | '\u{061C}' // Arabic letter mark
            | '\u{180E}' // Mongolian vowel separator
    )
}

/// Bidi embedding/override/isolate controls.
fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}

/// C0/C1 control characters, keeping newline and tab.
fn is_stripped_control(c: char) -> bool {
    if c == '\n' || c == '\t' {
        return false;
    }
    matches!(c, '\u{0000}'..='\u{001F}' | '\u{0080}'..='\u{009F}')
}

/// Normalize and clean one inbound user message.
pub fn sanitize(input: &str) -> String {
    input
        .nfc()
        .collect::<String>()
        .chars()
        .filter(|c| !is_zero_width(*c) && !is_bidi_control(*c))
        .filter(|c| !is_stripped_control(*c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_to_nfc() {
        // "e" + combining acute accent becomes the precomposed "é".
        assert_eq!(sanitize("caf\u{0065}\u{0301}"), "café");
    }

    #[test]
    fn strips_zero_width_characters() {
        assert_eq!(sanitize("he\u{200B}llo\u{FEFF}"), "hello");
        assert_eq!(sanitize("a\u{00AD}b\u{2060}c"), "abc");
    }

    #[test]
    fn strips_bidi_controls() {
        assert_eq!(sanitize("\u{202E}evil\u{202C}"), "evil");
        assert_eq!(sanitize("\u{2066}x\u{2069}"), "x");
    }

    #[test]
    fn keeps_newline_and_tab_drops_other_controls() {
        assert_eq!(sanitize("a\nb\tc\rd\u{0007}e"), "a\nb\tcde");
        assert_eq!(sanitize("x\u{0085}y"), "xy");
    }

    #[test]
    fn idempotent() {
        let messy = "ca\u{0066}\u{0065}\u{0301}\u{200D}\u{202A}hi\u{0003}";
        let once = sanitize(messy);
        assert_eq!(sanitize(&once), once);
    }

    #[test]
    fn plain_ascii_untouched() {
        assert_eq!(sanitize("what's in README.md?"), "what's in README.md?");
    }
}
