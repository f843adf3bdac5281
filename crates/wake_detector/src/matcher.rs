//! Normalization, pattern matching (exact + fuzzy), best-hit selection and
//! question extraction — the algorithm in SPEC_FULL.md §4.1 step by step.

use config::{FuzzyConfig, PatternGroup, PatternTableFile, QuestionConfig, ThresholdsConfig};
use pipeline_domain::types::PatternKind;

/// The pattern table compiled once per load/hot-reload: phrases lowercased
/// up front, kinds parsed, so the per-segment hot path never re-parses
/// configuration.
#[derive(Debug, Clone)]
pub struct CompiledPatternTable {
    groups: Vec<CompiledGroup>,
    thresholds: ThresholdsConfig,
    fuzzy: FuzzyConfig,
    question: QuestionConfig,
}

#[derive(Debug, Clone)]
struct CompiledGroup {
    kind: PatternKind,
    phrases: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("unknown pattern kind in patterns file: {0}")]
    UnknownKind(String),
}

impl CompiledPatternTable {
    pub fn compile(table: &PatternTableFile) -> Result<Self, CompileError> {
        let groups = table
            .patterns
            .iter()
            .map(compile_group)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            groups,
            thresholds: table.thresholds.clone(),
            fuzzy: table.fuzzy.clone(),
            question: table.question.clone(),
        })
    }

    pub fn fuzzy_enabled(&self) -> bool {
        self.fuzzy.enabled
    }

    pub fn question_bounds(&self) -> (usize, usize) {
        (self.question.min_chars, self.question.max_chars)
    }
}

fn compile_group(group: &PatternGroup) -> Result<CompiledGroup, CompileError> {
    let kind: PatternKind = group
        .kind
        .parse()
        .map_err(|_| CompileError::UnknownKind(group.kind.clone()))?;
    Ok(CompiledGroup { kind, phrases: group.phrases.iter().map(|p| p.to_lowercase()).collect() })
}

/// §4.1 step 1: lowercase, collapse internal whitespace, strip leading and
/// trailing punctuation except `,` and `?`.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let collapsed: String = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    let is_strippable = |c: char| c.is_ascii_punctuation() && c != ',' && c != '?';
    collapsed.trim_matches(is_strippable).trim().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub kind: PatternKind,
    pub phrase: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub confidence: f32,
}

fn confidence_for(kind: PatternKind, thresholds: &ThresholdsConfig) -> f32 {
    match kind {
        PatternKind::Primary => thresholds.primary,
        PatternKind::Secondary => thresholds.secondary,
        // "each kind inherits the higher of the two unless explicitly listed" (§4.1).
        _ => thresholds.primary.max(thresholds.secondary),
    }
}

/// §4.1 step 2: for each `(kind, phrase)` pair, record every hit as
/// `(kind, phrase, start_offset, confidence)`. Exact substring match for
/// non-fuzzy kinds; edit-distance match (restricted to phrases explicitly
/// enumerated under the `fuzzy` kind) otherwise.
pub fn find_all_hits(normalized_text: &str, table: &CompiledPatternTable) -> Vec<Hit> {
    let mut hits = Vec::new();

    for group in &table.groups {
        let confidence = confidence_for(group.kind, &table.thresholds);
        for phrase in &group.phrases {
            if group.kind == PatternKind::Fuzzy {
                if !table.fuzzy.enabled {
                    continue;
                }
                if let Some((start, end, _distance)) =
                    best_fuzzy_window(normalized_text, phrase, table.fuzzy.max_edit_distance)
                {
                    hits.push(Hit { kind: group.kind, phrase: phrase.clone(), start_offset: start, end_offset: end, confidence });
                }
            } else {
                for (start, _) in normalized_text.match_indices(phrase.as_str()) {
                    hits.push(Hit {
                        kind: group.kind,
                        phrase: phrase.clone(),
                        start_offset: start,
                        end_offset: start + phrase.len(),
                        confidence,
                    });
                }
            }
        }
    }

    hits
}

/// §4.1 step 3: highest confidence, ties broken by earliest `start_offset`,
/// further ties by pattern ordering in configuration (preserved here by
/// `find_all_hits` iterating groups/phrases in file order, so a stable sort
/// on the first two keys keeps that ordering for the final tie-break).
pub fn select_best_hit(hits: &[Hit]) -> Option<&Hit> {
    hits.iter().enumerate().min_by(|(ia, a), (ib, b)| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.start_offset.cmp(&b.start_offset))
            .then(ia.cmp(ib))
    }).map(|(_, hit)| hit)
}

/// §4.1 step 4: the substring after the matched phrase, up to the end of
/// text or the next strong punctuation boundary (`.`, `!`, `;` — `,` and
/// `?` are not boundaries since normalization preserves them as part of
/// the spoken question).
pub fn extract_question(normalized_text: &str, hit: &Hit) -> String {
    let after = &normalized_text[hit.end_offset..];
    let boundary = after.find(['.', '!', ';']).unwrap_or(after.len());
    after[..boundary].trim().trim_start_matches(',').trim().to_string()
}

fn damerau_levenshtein(a: &[char], b: &[char]) -> usize {
    let (la, lb) = (a.len(), b.len());
    let mut d = vec![vec![0usize; lb + 1]; la + 1];
    for (i, row) in d.iter_mut().enumerate().take(la + 1) {
        row[0] = i;
    }
    for j in 0..=lb {
        d[0][j] = j;
    }
    for i in 1..=la {
        for j in 1..=lb {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            d[i][j] = (d[i - 1][j] + 1).min(d[i][j - 1] + 1).min(d[i - 1][j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                d[i][j] = d[i][j].min(d[i - 2][j - 2] + cost);
            }
        }
    }
    d[la][lb]
}

/// Slides a window sized within `phrase.len() ± max_distance` chars across
/// `text` and returns the `(start, end, distance)` of the closest match, if
/// any window is within `max_distance`. Byte offsets are returned (text is
/// already normalized to lowercase ASCII-ish text for this pipeline's
/// purposes, but we still index by char to stay correct on multi-byte
/// input).
fn best_fuzzy_window(text: &str, phrase: &str, max_distance: usize) -> Option<(usize, usize, usize)> {
    let text_chars: Vec<char> = text.chars().collect();
    let phrase_chars: Vec<char> = phrase.chars().collect();
    let plen = phrase_chars.len();
    if plen == 0 || text_chars.is_empty() {
        return None;
    }

    let min_len = plen.saturating_sub(max_distance).max(1);
    let max_len = plen + max_distance;

    let mut best: Option<(usize, usize, usize)> = None;
    for window_len in min_len..=max_len {
        if window_len > text_chars.len() {
            continue;
        }
        for start in 0..=(text_chars.len() - window_len) {
            let window = &text_chars[start..start + window_len];
            let distance = damerau_levenshtein(window, &phrase_chars);
            if distance <= max_distance && best.map(|(_, _, d)| distance < d).unwrap_or(true) {
                let start_byte = text_chars[..start].iter().collect::<String>().len();
                let end_byte = start_byte + window.iter().collect::<String>().len();
                best = Some((start_byte, end_byte, distance));
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CompiledPatternTable {
        CompiledPatternTable::compile(&PatternTableFile::default()).unwrap()
    }

    #[test]
    fn normalize_lowercases_and_collapses_whitespace() {
        assert_eq!(normalize("  Hey   RAVEN, what's up? "), "hey raven, what's up?");
    }

    #[test]
    fn normalize_strips_outer_punctuation_but_keeps_comma_and_question_mark() {
        assert_eq!(normalize("\"hey raven?\""), "hey raven?");
    }

    #[test]
    fn exact_match_finds_primary_phrase() {
        let table = table();
        let text = normalize("hey raven what time is it?");
        let hits = find_all_hits(&text, &table);
        let best = select_best_hit(&hits).unwrap();
        assert_eq!(best.kind, PatternKind::Primary);
        assert_eq!(best.phrase, "hey raven");
    }

    #[test]
    fn question_extraction_stops_at_strong_punctuation() {
        let table = table();
        let text = normalize("hey raven what time is it. by the way hello");
        let hits = find_all_hits(&text, &table);
        let best = select_best_hit(&hits).unwrap();
        assert_eq!(extract_question(&text, best), "what time is it");
    }

    #[test]
    fn fuzzy_match_requires_fuzzy_enabled() {
        let mut raw = PatternTableFile::default();
        raw.fuzzy.enabled = false;
        let table = CompiledPatternTable::compile(&raw).unwrap();
        let text = normalize("hey haven can you help");
        let hits = find_all_hits(&text, &table);
        assert!(hits.iter().all(|h| h.kind != PatternKind::Fuzzy));
    }

    #[test]
    fn fuzzy_match_finds_near_miss_when_enabled() {
        let table = table();
        let text = normalize("hey haven can you help");
        let hits = find_all_hits(&text, &table);
        assert!(hits.iter().any(|h| h.kind == PatternKind::Fuzzy));
    }

    #[test]
    fn best_hit_prefers_highest_confidence_then_earliest_offset() {
        let hits = vec![
            Hit { kind: PatternKind::Secondary, phrase: "raven".into(), start_offset: 0, end_offset: 5, confidence: 0.7 },
            Hit { kind: PatternKind::Primary, phrase: "hey raven".into(), start_offset: 4, end_offset: 13, confidence: 0.9 },
        ];
        let best = select_best_hit(&hits).unwrap();
        assert_eq!(best.kind, PatternKind::Primary);
    }

    #[test]
    fn damerau_levenshtein_counts_transposition_as_one_edit() {
        let a: Vec<char> = "raven".chars().collect();
        let b: Vec<char> = "ravne".chars().collect();
        assert_eq!(damerau_levenshtein(&a, &b), 1);
    }
}
