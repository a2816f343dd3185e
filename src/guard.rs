//! Input guard - cheap rejection of probe and gibberish queries
//!
//! The free-text box is a scanner target. Checks run in a fixed order and stop
//! at the first match:
//!
//! 1. single-character keys
//! 2. keys of two characters or fewer that are not allow-listed
//! 3. exact probe words (`wp-admin`, `phpmyadmin`, ...)
//! 4. keyboard noise: fixed-length all-letter keys that look random and are
//!    not curated real words
//! 5. ordered regex blocklist over the raw query and the key (file/config
//!    probes, CMS/admin probes, credential probes, traversal/shell injection,
//!    SQL/XSS injection)
//!
//! The verdict carries a [`RejectReason`] for logging only. Callers surface a
//! generic `Blocked` error and never learn which rule fired.

use regex::RegexSet;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::canonical::CanonicalKey;

// ============================================================================
// Policy
// ============================================================================

/// Blocklists and allow-lists for the input guard
///
/// Every field has a default, so a TOML file only needs to list what it
/// overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardPolicy {
    /// Legitimate terms of two characters or fewer
    pub short_terms: Vec<String>,
    /// Exact-match probe words (compared against the canonical key)
    pub probe_words: Vec<String>,
    /// Key length that triggers the keyboard-noise heuristic
    pub noise_length: usize,
    /// Real words of `noise_length` letters that would otherwise look like noise
    pub real_words: Vec<String>,
    /// Ordered regex blocklist, matched against the lowercased raw query and the key
    pub patterns: Vec<String>,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            short_terms: to_strings(&[
                "42", "ai", "ar", "vr", "ui", "ux", "os", "io", "pi", "tv", "uk", "us", "eu",
                "un", "3d", "5g", "db", "go", "js", "ok",
            ]),
            probe_words: to_strings(&[
                "admin",
                "administrator",
                "wp-admin",
                "wp-login",
                "wp-content",
                "wp-includes",
                "phpmyadmin",
                "phpinfo",
                "xmlrpc",
                "cgi-bin",
                "env",
                "dotenv",
                "passwd",
                "htaccess",
                "htpasswd",
                "config",
                "credentials",
                "secrets",
                "null",
                "undefined",
                "localhost",
            ]),
            noise_length: 8,
            real_words: to_strings(&[
                "strength", "twelfths", "borschts", "schmaltz", "schlepps", "schticks",
            ]),
            patterns: to_strings(&[
                // File / config probes
                r"(^|/)\.(env|git|svn|hg|ds_store|aws|ssh|npmrc|dockerenv)\b",
                r"\.(ini|conf|cfg|bak|old|swp|sql|log|ya?ml|toml|lock|php|asp|aspx|jsp)$",
                r"^(dot)?env-?(local|prod|production|dev|development|staging|test|example|bak|backup|old|save)$",
                r"^(web|app)?-?config-?(php|json|js|xml|ya?ml|ini|bak)$",
                r"^(composer|package)-?(json|lock)$",
                r"^docker-?compose",
                // CMS / admin probes
                r"^wp-",
                r"(phpmyadmin|adminer|xmlrpc|cgi-bin)",
                r"^(admin|administrator|cpanel|webadmin|siteadmin)-?(login|panel|php|console|area)$",
                r"^(joomla|drupal|magento|typo3)-?(admin|login|administrator)$",
                // Credential / secret probes
                // Machine-style names only; "api key" or "access token" as prose is fine
                r"^\.?[a-z0-9_]*?(aws|api|secret|private|access|auth)_?(key|token|secret)s?$",
                r"id-?(rsa|dsa|ecdsa|ed25519)",
                r"(^|/)etc/(passwd|shadow|hosts)",
                // Path traversal / shell injection
                r"\.\./|\.\.\\|%2e%2e",
                r"(^|/)(proc|bin|etc|var|usr)/",
                r"[;&|`]\s*(cat|ls|rm|wget|curl|nc|bash|sh|whoami|id|uname)\b",
                r"\$\(|\$\{",
                r"(cmd\.exe|powershell|/bin/sh|/bin/bash)",
                // SQL / XSS injection
                r"<\s*/?\s*(script|img|svg|iframe|object|embed)",
                r"javascript:|vbscript:|data:text/html",
                r"\bon(error|load|click|mouseover|focus)\s*=",
                r"\bunion\s+(all\s+)?select\b",
                r"\bselect\s+(\*|[\w.]+(\s*,\s*[\w.]+)+)\s+from\b",
                r"\bselect\s+.+\s+from\s+\S+\s*(;|\bwhere\b)",
                r"\b(insert\s+into|drop\s+table|delete\s+from|truncate\s+table)\b",
                r"'\s*(or|and)\s+'?\w*'?\s*=",
                r"\bor\s+1\s*=\s*1\b",
                r"(;|')\s*--",
                r"\b(sleep|benchmark|pg_sleep)\s*\(|waitfor\s+delay",
            ]),
        }
    }
}

impl GuardPolicy {
    /// Load a policy from a TOML file, falling back to defaults for missing fields
    pub fn from_file(path: &Path) -> Result<Self, GuardError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GuardError::Policy(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&text).map_err(|e| GuardError::Policy(format!("{}: {}", path.display(), e)))
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Error building the guard
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Invalid guard policy: {0}")]
    Policy(String),

    #[error("Invalid blocklist pattern: {0}")]
    Pattern(#[from] regex::Error),
}

// ============================================================================
// Verdict
// ============================================================================

/// Internal reason code for a rejection (logged, never returned)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TooShort,
    ProbeWord,
    KeyboardNoise,
    Pattern(usize),
}

impl RejectReason {
    pub fn code(&self) -> String {
        match self {
            RejectReason::TooShort => "g-short".to_string(),
            RejectReason::ProbeWord => "g-word".to_string(),
            RejectReason::KeyboardNoise => "g-noise".to_string(),
            RejectReason::Pattern(index) => format!("g-pattern-{}", index),
        }
    }
}

/// Outcome of the guard checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

// ============================================================================
// Guard
// ============================================================================

/// Stateless matcher compiled once from a [`GuardPolicy`]
#[derive(Debug)]
pub struct InputGuard {
    short_terms: HashSet<String>,
    probe_words: HashSet<String>,
    real_words: HashSet<String>,
    noise_length: usize,
    patterns: RegexSet,
}

impl InputGuard {
    /// Compile the policy
    pub fn new(policy: &GuardPolicy) -> Result<Self, GuardError> {
        Ok(Self {
            short_terms: policy.short_terms.iter().map(|s| s.to_lowercase()).collect(),
            probe_words: policy.probe_words.iter().map(|s| s.to_lowercase()).collect(),
            real_words: policy.real_words.iter().map(|s| s.to_lowercase()).collect(),
            noise_length: policy.noise_length,
            patterns: RegexSet::new(&policy.patterns)?,
        })
    }

    /// Guard with the built-in policy
    pub fn with_defaults() -> Self {
        Self::new(&GuardPolicy::default()).expect("built-in guard policy compiles")
    }

    /// Number of compiled blocklist patterns
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Run the ordered checks against the raw query and its canonical key
    pub fn check(&self, raw: &str, key: &CanonicalKey) -> Verdict {
        let k = key.as_str();
        let len = key.len();

        if len == 1 {
            return Verdict::Reject(RejectReason::TooShort);
        }

        if len <= 2 && !self.short_terms.contains(k) {
            return Verdict::Reject(RejectReason::TooShort);
        }

        if self.probe_words.contains(k) {
            return Verdict::Reject(RejectReason::ProbeWord);
        }

        if len == self.noise_length
            && k.chars().all(|c| c.is_ascii_lowercase())
            && !self.real_words.contains(k)
            && looks_like_noise(k)
        {
            return Verdict::Reject(RejectReason::KeyboardNoise);
        }

        let raw_lower = raw.trim().to_lowercase();
        let first_match = self
            .patterns
            .matches(&raw_lower)
            .iter()
            .chain(self.patterns.matches(k).iter())
            .min();
        if let Some(index) = first_match {
            return Verdict::Reject(RejectReason::Pattern(index));
        }

        Verdict::Accept
    }
}

/// Random keyboard mashing has almost no vowels or long consonant runs
fn looks_like_noise(word: &str) -> bool {
    let is_vowel = |c: char| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');

    let vowels = word.chars().filter(|&c| is_vowel(c)).count();
    if vowels <= 1 {
        return true;
    }

    let mut run = 0;
    for c in word.chars() {
        if is_vowel(c) {
            run = 0;
        } else {
            run += 1;
            if run >= 5 {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonicalize;

    fn verdict(raw: &str) -> Verdict {
        let guard = InputGuard::with_defaults();
        let key = canonicalize(raw).unwrap();
        guard.check(raw, &key)
    }

    #[test]
    fn test_default_patterns_compile() {
        let guard = InputGuard::new(&GuardPolicy::default()).unwrap();
        assert_eq!(guard.pattern_count(), GuardPolicy::default().patterns.len());
    }

    #[test]
    fn test_rejects_short_keys() {
        assert_eq!(verdict("a"), Verdict::Reject(RejectReason::TooShort));
        assert_eq!(verdict("zq"), Verdict::Reject(RejectReason::TooShort));
    }

    #[test]
    fn test_accepts_allow_listed_short_terms() {
        assert!(verdict("42").is_accept());
        assert!(verdict("ai").is_accept());
        assert!(verdict("AI").is_accept());
    }

    #[test]
    fn test_rejects_probe_words() {
        assert_eq!(verdict("wp-admin"), Verdict::Reject(RejectReason::ProbeWord));
        assert_eq!(verdict("phpMyAdmin"), Verdict::Reject(RejectReason::ProbeWord));
        assert_eq!(verdict("/.env"), Verdict::Reject(RejectReason::ProbeWord));
    }

    #[test]
    fn test_rejects_env_probe_variants() {
        for raw in [".env", ".env.local", ".env.production", "env.bak", "/.env.example", "env-backup"] {
            assert!(!verdict(raw).is_accept(), "{} should be rejected", raw);
        }
    }

    #[test]
    fn test_rejects_keyboard_noise() {
        assert_eq!(verdict("xqzvbklt"), Verdict::Reject(RejectReason::KeyboardNoise));
        assert_eq!(verdict("asdfghjk"), Verdict::Reject(RejectReason::KeyboardNoise));
    }

    #[test]
    fn test_real_eight_letter_words_pass() {
        assert!(verdict("strength").is_accept());
        assert!(verdict("universe").is_accept());
        assert!(verdict("dolphins").is_accept());
    }

    #[test]
    fn test_rejects_pattern_probes() {
        for raw in [
            "wp-config.php",
            "../../etc/passwd",
            "aws_secret_key",
            "id_rsa",
            "<script>alert(1)</script>",
            "x' OR '1'='1",
            "1 UNION SELECT password FROM users",
            "foo; cat /etc/hosts",
            "$(whoami)",
            "docker-compose.yml",
            "drupal admin",
            "api_key",
            ".aws_access_key",
            "SELECT * FROM users",
            "select name, email from accounts",
            "select password from users where 1",
            "select id from users;",
        ] {
            assert!(
                matches!(verdict(raw), Verdict::Reject(_)),
                "{} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_accepts_ordinary_terms() {
        for raw in [
            "babel-fish",
            "Babel Fish",
            "pan galactic gargle blaster",
            "towel",
            "don't panic",
            "improbability drive",
            "select committee",
            "environment",
            "configuration management",
            "private key",
            "access token",
            "api key",
            "oauth token",
            "select items from the menu",
            "select from the list",
        ] {
            assert!(verdict(raw).is_accept(), "{} should be accepted", raw);
        }
    }

    #[test]
    fn test_reason_codes_are_opaque() {
        assert_eq!(RejectReason::Pattern(3).code(), "g-pattern-3");
        assert!(!RejectReason::ProbeWord.code().contains("admin"));
    }

    #[test]
    fn test_policy_from_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.toml");
        std::fs::write(&path, "probe_words = [\"towel\"]\nnoise_length = 9\n").unwrap();

        let policy = GuardPolicy::from_file(&path).unwrap();
        assert_eq!(policy.probe_words, vec!["towel".to_string()]);
        assert_eq!(policy.noise_length, 9);
        assert!(!policy.patterns.is_empty());

        let guard = InputGuard::new(&policy).unwrap();
        let key = canonicalize("towel").unwrap();
        assert_eq!(guard.check("towel", &key), Verdict::Reject(RejectReason::ProbeWord));
    }

    #[test]
    fn test_invalid_pattern_is_error() {
        let policy = GuardPolicy {
            patterns: vec!["(unclosed".to_string()],
            ..Default::default()
        };
        assert!(matches!(InputGuard::new(&policy), Err(GuardError::Pattern(_))));
    }
}
