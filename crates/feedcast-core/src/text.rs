//! Small text helpers used when composing and answering broadcasts.

use chrono::DateTime;

/// Options for [`slugify_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlugOptions {
    /// Drop hyphens so the slug can be used as a hashtag.
    pub hashtag_friendly: bool,
}

fn fold_diacritic(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'ç' => 'c',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ñ' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}

/// Lower-cases, folds common Latin accents, drops punctuation and joins
/// words with single hyphens.
pub fn slugify(text: &str) -> String {
    slugify_with(text, SlugOptions::default())
}

/// [`slugify`] with explicit options.
pub fn slugify_with(text: &str, options: SlugOptions) -> String {
    let mut cleaned = String::with_capacity(text.len());
    for c in text.to_lowercase().chars().map(fold_diacritic) {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c.is_whitespace() {
            cleaned.push(c);
        }
    }

    let mut slug = String::with_capacity(cleaned.len());
    for c in cleaned.trim().chars() {
        let c = if c.is_whitespace() { '-' } else { c };
        if c == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(c);
    }

    if options.hashtag_friendly {
        slug.retain(|c| c != '-');
    }
    slug
}

/// Truncates to at most `max_chars` characters, cutting at the last space
/// when possible and appending `...`.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    match truncated.rfind(' ') {
        Some(idx) if idx > 0 => format!("{}...", &truncated[..idx]),
        _ => format!("{truncated}..."),
    }
}

/// Formats unix seconds as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_timestamp(unix_secs: u64) -> String {
    i64::try_from(unix_secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "invalid time".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("  Bitcoin   Magazine! "), "bitcoin-magazine");
        assert_eq!(slugify("CNN Brasil"), "cnn-brasil");
        assert_eq!(slugify("a -- b"), "a-b");
    }

    #[test]
    fn slugify_folds_accents() {
        assert_eq!(slugify("Economia & Negócios"), "economia-negocios");
        assert_eq!(slugify("Ação"), "acao");
    }

    #[test]
    fn hashtag_slugs_drop_hyphens() {
        let opts = SlugOptions {
            hashtag_friendly: true,
        };
        assert_eq!(slugify_with("Bitcoin Magazine", opts), "bitcoinmagazine");
    }

    #[test]
    fn truncate_respects_word_boundaries() {
        assert_eq!(truncate_text("short", 280), "short");
        assert_eq!(truncate_text("hello brave new world", 12), "hello brave...");
        assert_eq!(truncate_text("abcdefghij", 4), "abcd...");
    }

    #[test]
    fn formats_unix_timestamps() {
        assert_eq!(format_timestamp(1_704_067_200), "2024-01-01 00:00:00");
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
    }
}
