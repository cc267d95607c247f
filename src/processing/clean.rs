//! Cleanup applied to extracted text before chunking.

use std::sync::LazyLock;

use regex::Regex;

static HYPHEN_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w)-\n(\w)").expect("valid regex"));
static INLINE_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("valid regex"));
static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// UTF-8 read as Windows-1252, the usual source of mojibake in uploads.
const MOJIBAKE: &[(&str, &str)] = &[
    ("\u{e2}\u{20ac}\u{2122}", "'"),
    ("\u{e2}\u{20ac}\u{2dc}", "'"),
    ("\u{e2}\u{20ac}\u{153}", "\""),
    ("\u{e2}\u{20ac}\u{9d}", "\""),
    ("\u{e2}\u{20ac}\u{201c}", "\u{2013}"),
    ("\u{e2}\u{20ac}\u{201d}", "\u{2014}"),
    ("\u{e2}\u{20ac}\u{a6}", "..."),
    ("\u{c3}\u{a9}", "\u{e9}"),
    ("\u{c3}\u{a8}", "\u{e8}"),
    ("\u{c3}\u{a0}", "\u{e0}"),
    ("\u{c3}\u{bc}", "\u{fc}"),
    ("\u{c3}\u{b6}", "\u{f6}"),
    ("\u{c3}\u{a4}", "\u{e4}"),
    ("\u{c2}\u{a0}", " "),
];

const LIGATURES: &[(char, &str)] = &[
    ('\u{fb00}', "ff"),
    ('\u{fb01}', "fi"),
    ('\u{fb02}', "fl"),
    ('\u{fb03}', "ffi"),
    ('\u{fb04}', "ffl"),
];

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{feff}' | '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{2060}' | '\u{fffd}'
    )
}

/// Normalise whitespace and repair common encoding artefacts.
///
/// Paragraph breaks survive as exactly one blank line so the chunker can split on them.
pub fn clean_text(raw: &str) -> String {
    let mut text = raw.replace("\r\n", "\n").replace('\r', "\n");
    for (broken, fixed) in MOJIBAKE {
        if text.contains(broken) {
            text = text.replace(broken, fixed);
        }
    }

    let mut normalized = String::with_capacity(text.len());
    for c in text.chars() {
        if is_invisible(c) {
            continue;
        }
        if let Some((_, expanded)) = LIGATURES.iter().find(|(lig, _)| *lig == c) {
            normalized.push_str(expanded);
            continue;
        }
        match c {
            '\u{a0}' | '\u{2007}' | '\u{202f}' => normalized.push(' '),
            '\n' | '\t' => normalized.push(c),
            c if c.is_control() => {}
            c => normalized.push(c),
        }
    }

    let joined = HYPHEN_BREAK.replace_all(&normalized, "$1$2");
    let spaced = INLINE_SPACE.replace_all(&joined, " ");
    let trimmed_lines = spaced.lines().map(str::trim).collect::<Vec<_>>().join("\n");
    EXCESS_NEWLINES
        .replace_all(&trimmed_lines, "\n\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_blank_lines() {
        let raw = "  Title \t here  \r\n\r\n\r\n\r\nBody   text\t\tline  \n";
        assert_eq!(clean_text(raw), "Title here\n\nBody text line");
    }

    #[test]
    fn repairs_mojibake_and_invisible_characters() {
        let raw = "\u{feff}It\u{e2}\u{20ac}\u{2122}s caf\u{c3}\u{a9}\u{200b} time\u{fffd}";
        assert_eq!(clean_text(raw), "It's caf\u{e9} time");
    }

    #[test]
    fn expands_ligatures_and_joins_hyphenated_breaks() {
        let raw = "e\u{fb03}cient work\u{fb02}ow for docu-\nments";
        assert_eq!(clean_text(raw), "efficient workflow for documents");
    }

    #[test]
    fn drops_control_characters_and_nbsp() {
        let raw = "alpha\u{0007}\u{a0}beta\u{000c}gamma";
        assert_eq!(clean_text(raw), "alpha betagamma");
    }

    #[test]
    fn blank_input_stays_blank() {
        assert_eq!(clean_text(" \n\t\u{200b}\n "), "");
    }
}
