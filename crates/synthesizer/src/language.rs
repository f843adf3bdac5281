//! Cheap script-based language detection (§4.3): a longest-match count over
//! a handful of Unicode block ranges, defaulting to the configured
//! `primary_language` when no script outside Latin dominates (Latin script
//! alone is shared by too many languages to disambiguate this way, so it
//! defers to the configured default rather than guessing).

fn is_cyrillic(codepoint: u32) -> bool {
    matches!(codepoint, 0x0400..=0x04FF)
}

fn is_cjk(codepoint: u32) -> bool {
    matches!(codepoint, 0x4E00..=0x9FFF | 0x3040..=0x30FF | 0x30A0..=0x30FF)
}

fn is_arabic(codepoint: u32) -> bool {
    matches!(codepoint, 0x0600..=0x06FF)
}

fn is_latin(codepoint: u32) -> bool {
    matches!(codepoint, 0x0041..=0x005A | 0x0061..=0x007A | 0x00C0..=0x024F)
}

pub fn detect_language(text: &str, default_language: &str) -> String {
    let mut cyrillic = 0usize;
    let mut cjk = 0usize;
    let mut arabic = 0usize;
    let mut latin = 0usize;

    for ch in text.chars() {
        let cp = ch as u32;
        if is_cyrillic(cp) {
            cyrillic += 1;
        } else if is_cjk(cp) {
            cjk += 1;
        } else if is_arabic(cp) {
            arabic += 1;
        } else if is_latin(cp) {
            latin += 1;
        }
    }

    let candidates = [(cyrillic, "ru"), (cjk, "zh"), (arabic, "ar")];
    match candidates.into_iter().max_by_key(|(count, _)| *count) {
        Some((count, lang)) if count > 0 && count >= latin => lang.to_string(),
        _ => default_language.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_cyrillic_script() {
        assert_eq!(detect_language("Привет, как дела?", "en"), "ru");
    }

    #[test]
    fn detects_cjk_script() {
        assert_eq!(detect_language("你好，今天天气怎么样？", "en"), "zh");
    }

    #[test]
    fn detects_arabic_script() {
        assert_eq!(detect_language("مرحبا كيف حالك", "en"), "ar");
    }

    #[test]
    fn falls_back_to_default_for_latin_text() {
        assert_eq!(detect_language("What time is it?", "en"), "en");
    }

    #[test]
    fn falls_back_to_default_for_script_free_text() {
        assert_eq!(detect_language("12:30", "en"), "en");
    }
}
