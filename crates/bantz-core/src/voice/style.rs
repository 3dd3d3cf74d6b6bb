//! Deterministic persona style layer for spoken replies.
//!
//! No LLM here: variant picks are seed-hashed (stable per seed, varied
//! across seeds), "Efendim" appears at most once, emoji can be stripped,
//! and long replies are capped to a sentence budget before TTS.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Turkish cancel acknowledgements.
pub const CANCEL_VARIANTS: &[&str] = &["Tamam, vazgeçtim.", "Anlaşıldı, iptal.", "Peki, bırakıyorum."];

/// Confirmation reprompts.
pub const CONFIRM_REPROMPTS: &[&str] = &[
    "1 mi 0 mı?",
    "Evet için 1, hayır için 0.",
    "Onay mı iptal mi? (1/0)",
];

/// Clarification intros for low-confidence plans.
pub const CLARIFY_INTROS: &[&str] = &[
    "Tam anlayamadım.",
    "Emin olamadım.",
    "Bir daha alayım.",
];

/// Apology fallbacks when both router and finalizer fail.
pub const APOLOGY_VARIANTS: &[&str] = &[
    "Efendim, şu an yardımcı olamıyorum. Birazdan tekrar dener misiniz?",
    "Üzgünüm, bir aksaklık oldu. Az sonra tekrar deneyelim.",
    "Efendim, bu isteği şu an tamamlayamadım.",
];

/// Deterministically pick a variant by seed hash. Same seed → same
/// variant (test-stable); different seeds give variety.
pub fn pick_variant<'a>(variants: &[&'a str], seed: &str) -> &'a str {
    match variants {
        [] => "",
        [only] => only,
        _ => {
            let digest = Sha256::digest(seed.as_bytes());
            let mut acc: u64 = 0;
            for b in &digest[..8] {
                acc = (acc << 8) | u64::from(*b);
            }
            variants[(acc % variants.len() as u64) as usize]
        }
    }
}

pub fn cancel_reply(seed: &str) -> &'static str {
    pick_variant(CANCEL_VARIANTS, seed)
}

pub fn confirm_reprompt(seed: &str) -> &'static str {
    pick_variant(CONFIRM_REPROMPTS, seed)
}

pub fn apology_reply(seed: &str) -> &'static str {
    pick_variant(APOLOGY_VARIANTS, seed)
}

/// Formatter knobs, sourced from the brain config.
#[derive(Debug, Clone, Copy)]
pub struct StyleOptions {
    pub strip_emoji: bool,
    pub max_sentences: usize,
}

impl Default for StyleOptions {
    fn default() -> Self {
        Self {
            strip_emoji: true,
            max_sentences: 6,
        }
    }
}

static LIST_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(\s*)(?:(\d+)[\)\-]|[•·▪-])\s+").unwrap());

/// Apply the persona constraints to a finalizer reply.
pub fn format_voice_reply(text: &str, opts: &StyleOptions) -> String {
    let mut out = dedupe_efendim(text.trim());
    if opts.strip_emoji {
        out = strip_emoji(&out);
    }
    out = normalize_list_markers(&out);
    cap_sentences(&out, opts.max_sentences)
}

/// Keep only the first "Efendim"; later occurrences (any inflection of
/// the standalone word) are dropped.
fn dedupe_efendim(text: &str) -> String {
    static EFENDIM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\befendim\b[,.]?\s*").unwrap());

    let mut seen = false;
    let mut result = String::with_capacity(text.len());
    let mut last = 0;
    for m in EFENDIM_RE.find_iter(text) {
        result.push_str(&text[last..m.start()]);
        if !seen {
            result.push_str(m.as_str());
            seen = true;
        }
        last = m.end();
    }
    result.push_str(&text[last..]);
    result
}

fn is_emoji(c: char) -> bool {
    matches!(u32::from(c),
        0x1F000..=0x1FAFF   // pictographs, emoticons, transport, symbols
        | 0x2600..=0x27BF   // misc symbols + dingbats
        | 0x2190..=0x21FF   // arrows
        | 0xFE00..=0xFE0F   // variation selectors
        | 0x200D            // zero-width joiner
        | 0x2B00..=0x2BFF)
}

fn strip_emoji(text: &str) -> String {
    let stripped: String = text.chars().filter(|c| !is_emoji(*c)).collect();
    // Collapse double spaces the removal may have left behind.
    let mut out = String::with_capacity(stripped.len());
    let mut prev_space = false;
    for c in stripped.chars() {
        let is_space = c == ' ';
        if !(is_space && prev_space) {
            out.push(c);
        }
        prev_space = is_space;
    }
    out.trim_end().to_string()
}

/// `1)` / `2-` / `•` list markers → `1.` form for cleaner TTS reading.
fn normalize_list_markers(text: &str) -> String {
    let mut bullet_counter = 0u32;
    let mut out = String::with_capacity(text.len());
    for (i, line) in text.lines().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if let Some(caps) = LIST_MARKER_RE.captures(line) {
            let indent = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let rest = &line[caps.get(0).expect("group 0").end()..];
            let number = match caps.get(2) {
                Some(n) => n.as_str().to_string(),
                None => {
                    bullet_counter += 1;
                    bullet_counter.to_string()
                }
            };
            out.push_str(&format!("{indent}{number}. {rest}"));
        } else {
            out.push_str(line);
        }
    }
    out
}

/// Cap at `max` sentences; sentence boundaries are `.`, `!`, `?` followed
/// by whitespace or end of text.
fn cap_sentences(text: &str, max: usize) -> String {
    if max == 0 {
        return text.to_string();
    }

    let mut count = 0;
    let chars: Vec<char> = text.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if matches!(c, '.' | '!' | '?') {
            let next = chars.get(i + 1);
            let is_boundary = next.is_none_or(|n| n.is_whitespace());
            // Don't count decimal points or enumerators like "1.".
            let prev_digit = i >= 1 && chars[i - 1].is_ascii_digit();
            let next_digit = next.is_some_and(|n| n.is_ascii_digit());
            if is_boundary && !(prev_digit && next_digit) && !(prev_digit && *c == '.') {
                count += 1;
                if count >= max {
                    return chars[..=i].iter().collect::<String>().trim_end().to_string();
                }
            }
        }
    }
    text.to_string()
}
