//! Word tokenization and display measurement helpers

use std::collections::BTreeSet;
use unicode_width::UnicodeWidthChar;

/// Word characters are alphanumerics plus the configured unifying set.
pub fn is_word_char(c: char, unifying_chars: &BTreeSet<char>) -> bool {
    c.is_alphanumeric() || unifying_chars.contains(&c)
}

pub fn lower(text: &str) -> String {
    text.to_lowercase()
}

/// Split lines into word tokens, optionally case-folded.
pub fn coalesce<'a, I>(lines: I, unifying_chars: &BTreeSet<char>, fold_case: bool) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut words = Vec::new();
    let mut current = String::new();
    for line in lines {
        for c in line.chars() {
            if is_word_char(c, unifying_chars) {
                if fold_case {
                    current.extend(c.to_lowercase());
                } else {
                    current.push(c);
                }
            } else if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
    }
    words
}

/// The trailing run of word characters before the cursor.
pub fn cword_before(
    unifying_chars: &BTreeSet<char>,
    fold_case: bool,
    line_before: &str,
) -> String {
    let tail: Vec<char> = line_before
        .chars()
        .rev()
        .take_while(|c| is_word_char(*c, unifying_chars))
        .collect();
    let word: String = tail.into_iter().rev().collect();
    if fold_case {
        lower(&word)
    } else {
        word
    }
}

/// Width in display columns, with tab expansion. Multi-byte glyphs count
/// by column, not byte length.
pub fn display_width(text: &str, tabstop: usize) -> usize {
    text.chars()
        .map(|c| {
            if c == '\t' {
                tabstop
            } else {
                UnicodeWidthChar::width(c).unwrap_or(0)
            }
        })
        .sum()
}
