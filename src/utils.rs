//! Small helpers shared across the crate

use regex::Regex;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

/// Maximum length of the label part of an artifact file name.
pub const MAX_LABEL_STEM_LEN: usize = 64;

/// Number of fingerprint characters appended to labelled artifact names.
pub const LABELLED_FINGERPRINT_LEN: usize = 16;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unsafe_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.-]+").expect("label pattern is a valid regex"))
}

/// Turn a free-form label such as `"la blas/gemm - mini - int"` into a file-name-safe stem.
pub fn sanitize_label(label: &str) -> String {
    let replaced = unsafe_chars().replace_all(label, "_");
    let trimmed = replaced.trim_matches(|c| c == '_' || c == '.');
    trimmed.chars().take(MAX_LABEL_STEM_LEN).collect()
}

/// File stem for an artifact: `<label>_<short fingerprint>` or `vc_<fingerprint>`.
pub fn artifact_stem(label: Option<&str>, fingerprint: &str) -> String {
    let label = label.map(sanitize_label).filter(|l| !l.is_empty());
    match label {
        Some(label) => {
            let short = &fingerprint[..fingerprint.len().min(LABELLED_FINGERPRINT_LEN)];
            format!("{}_{}", label, short)
        }
        None => format!("vc_{}", fingerprint),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_label() {
        let cases = vec![
            ("la blas/gemm - mini - int", "la_blas_gemm_-_mini_-_int"),
            ("plain", "plain"),
            ("../escape", "escape"),
            ("  ", ""),
        ];

        for (input, expected) in cases {
            assert_eq!(sanitize_label(input), expected, "Failed for input: '{}'", input);
        }
    }

    #[test]
    fn test_artifact_stem() {
        let fingerprint = "0123456789abcdef0123456789abcdef";
        assert_eq!(artifact_stem(None, fingerprint), format!("vc_{}", fingerprint));
        assert_eq!(
            artifact_stem(Some("ker/2mm"), fingerprint),
            "ker_2mm_0123456789abcdef"
        );
        assert_eq!(artifact_stem(Some("///"), fingerprint), format!("vc_{}", fingerprint));
    }

    #[test]
    fn test_long_labels_are_truncated() {
        let label = "x".repeat(200);
        assert_eq!(sanitize_label(&label).len(), MAX_LABEL_STEM_LEN);
    }
}
