use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;

const NAME_PREFIX_CHARS: usize = 50;
const NAME_SUFFIX_CHARS: usize = 6;
const ARTIFACT_EXTENSION: &str = ".png";

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^0-9A-Za-z]").expect("static pattern is valid"));

pub fn sanitize_prompt(prompt: &str) -> String {
    UNSAFE_CHARS
        .replace_all(prompt, "_")
        .chars()
        .take(NAME_PREFIX_CHARS)
        .collect()
}

/// File name for a generated image: sanitized prompt prefix, a random
/// suffix, and `.png`.
pub fn derive_artifact_name(prompt: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_SUFFIX_CHARS)
        .map(char::from)
        .collect();
    format!(
        "{}_{}{}",
        sanitize_prompt(prompt),
        suffix,
        ARTIFACT_EXTENSION
    )
}
