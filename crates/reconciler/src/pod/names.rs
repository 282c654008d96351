use rand::distributions::Alphanumeric;
use rand::Rng;

/// Longest name that can also be used as a label value.
const MAX_NAME_LENGTH: usize = 63;
const SUFFIX_LENGTH: usize = 5;

/// `len` random lowercase alphanumerics.
#[must_use]
pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .take(len)
        .collect()
}

/// `<base>-<5 random chars>`, with `base` shortened so the result fits in a label.
#[must_use]
pub fn with_random_suffix(base: &str) -> String {
    let max_base = MAX_NAME_LENGTH.saturating_sub(SUFFIX_LENGTH).saturating_sub(1);
    let base: String = base.chars().take(max_base).collect();
    format!("{}-{}", base.trim_end_matches('-'), random_suffix(SUFFIX_LENGTH))
}

/// Name of a new pod for run `run_name`.
#[must_use]
pub fn pod_name(run_name: &str) -> String {
    with_random_suffix(&format!("{run_name}-pod"))
}
