//! Heuristic token estimation for the live UI meter.
//!
//! This is an approximation for display, not a billing oracle. Character
//! classes carry different weights: CJK ideographs count one token each,
//! Latin words are bucketed by length, numbers, whitespace runs, emoji,
//! punctuation and URLs are weighted separately, plus a small fixed
//! overhead. The estimate is deterministic and never decreases as text
//! grows, so the meter can only tick upward during a stream.

use std::sync::LazyLock;

use regex::Regex;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("valid URL regex"));

static EMOJI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{Extended_Pictographic}").expect("valid emoji regex"));

/// Fixed overhead added to any non-empty estimate.
const MODEL_OVERHEAD: u32 = 3;

/// Base weight of a URL. Chosen so a URL never weighs less than its scheme
/// prefix did while it was still being counted as plain characters, which
/// keeps the estimate monotonic as a URL crystallizes out of the stream.
const URL_BASE: u32 = 4;

/// Estimates the token count of `text`.
pub fn estimate(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    let mut total = 0u32;

    // URLs are carved out first and weighted as a unit.
    let mut cursor = 0;
    for m in URL_RE.find_iter(text) {
        total += estimate_plain(&text[cursor..m.start()]);
        total += URL_BASE + ceil_div(m.as_str().chars().count() as u32, 4);
        cursor = m.end();
    }
    total += estimate_plain(&text[cursor..]);

    total + MODEL_OVERHEAD
}

fn estimate_plain(text: &str) -> u32 {
    let mut total = 0u32;
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if is_cjk(c) {
            total += 1;
            i += 1;
        } else if c.is_ascii_alphabetic() {
            let len = word_run_len(&chars[i..]);
            total += word_weight(len as u32);
            i += len;
        } else if c.is_ascii_digit() {
            let len = number_run_len(&chars[i..]);
            total += number_weight(len as u32);
            i += len;
        } else if c.is_whitespace() {
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            total += 1;
        } else if is_emoji(c) {
            total += 2;
            i += 1;
        } else {
            // Punctuation and everything else: one token per character.
            total += 1;
            i += 1;
        }
    }

    total
}

/// Length of a Latin word run, allowing an internal `-` or `'` that is
/// immediately followed by another letter (`well-known`, `don't`).
fn word_run_len(chars: &[char]) -> usize {
    let mut len = 0;
    while len < chars.len() {
        let c = chars[len];
        if c.is_ascii_alphabetic() {
            len += 1;
        } else if (c == '-' || c == '\'')
            && chars.get(len + 1).is_some_and(char::is_ascii_alphabetic)
        {
            len += 2;
        } else {
            break;
        }
    }
    len
}

/// Length of a number run, allowing a single decimal point between digits.
fn number_run_len(chars: &[char]) -> usize {
    let mut len = 0;
    let mut seen_dot = false;
    while len < chars.len() {
        let c = chars[len];
        if c.is_ascii_digit() {
            len += 1;
        } else if c == '.'
            && !seen_dot
            && chars.get(len + 1).is_some_and(char::is_ascii_digit)
        {
            seen_dot = true;
            len += 1;
        } else {
            break;
        }
    }
    len
}

fn word_weight(len: u32) -> u32 {
    if len <= 2 {
        1
    } else if len <= 6 {
        // ceil(len / 2.5)
        (len * 2).div_ceil(5)
    } else {
        len.div_ceil(2)
    }
}

fn number_weight(len: u32) -> u32 {
    if len <= 2 { 1 } else { len.div_ceil(2) }
}

fn ceil_div(n: u32, d: u32) -> u32 {
    n.div_ceil(d)
}

/// CJK ideographs, kana and halfwidth katakana.
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30ff}'
        | '\u{3400}'..='\u{4dbf}'
        | '\u{4e00}'..='\u{9fff}'
        | '\u{f900}'..='\u{faff}'
        | '\u{ff66}'..='\u{ff9f}')
}

fn is_emoji(c: char) -> bool {
    let mut buf = [0u8; 4];
    EMOJI_RE.is_match(c.encode_utf8(&mut buf))
}
