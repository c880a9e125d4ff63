//! Transcript matching against an expected utterance
//!
//! Both sides are normalized first: whitespace and a fixed set of
//! punctuation are stripped and the rest is lower-cased.

/// Punctuation removed before comparing (ASCII plus common CJK marks)
const PUNCTUATION: &[char] = &[
    '.', ',', '!', '?', ';', ':', '\'', '"', '-', '_', '(', ')', '[', ']', '{', '}', '/', '\\',
    '`', '~', '…', '，', '。', '！', '？', '；', '：', '、', '“', '”', '‘', '’', '（', '）',
    '《', '》', '「', '」',
];

/// Strip whitespace and punctuation, then case-fold
#[must_use]
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace() && !PUNCTUATION.contains(c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Final pass/fail judgement
///
/// True when either normalized string contains the other. An empty expected
/// string never matches, and neither does an empty candidate.
#[must_use]
pub fn matches(candidate: &str, expected: &str) -> bool {
    let expected = normalize(expected);
    let candidate = normalize(candidate);
    if expected.is_empty() || candidate.is_empty() {
        return false;
    }
    candidate.contains(&expected) || expected.contains(&candidate)
}

/// Early-exit check on a partial hypothesis
///
/// One-directional: the hypothesis must already contain the whole expected
/// phrase, so a half-spoken word never ends the attempt.
#[must_use]
pub fn contains_expected(hypothesis: &str, expected: &str) -> bool {
    let expected = normalize(expected);
    !expected.is_empty() && normalize(hypothesis).contains(&expected)
}
