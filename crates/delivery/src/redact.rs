//! Credential scrubbing for anything exposed through stats or logs

/// Replacement for error text that mentions a sensitive keyword
pub const REDACTED_ERROR: &str = "[error contains sensitive info]";

const SENSITIVE_KEYWORDS: [&str; 5] = ["token", "key", "secret", "password", "auth"];

/// Longest error text kept in stats
const MAX_ERROR_CHARS: usize = 100;

/// Strip everything between `://` and the last `@` from an address
///
/// Passwords may contain `/`, so the whole remainder is searched.
pub fn redact_address(address: &str) -> String {
    let authority_start = address.find("://").map_or(0, |sep| sep + 3);

    match address[authority_start..].rfind('@') {
        Some(at) => format!(
            "{}{}",
            &address[..authority_start],
            &address[authority_start + at + 1..]
        ),
        None => address.to_string(),
    }
}

/// Scrub an error message
///
/// Messages mentioning a sensitive keyword are replaced whole; partial
/// redaction is never attempted. Others are truncated.
pub fn redact_error(message: &str) -> String {
    let lower = message.to_lowercase();
    if SENSITIVE_KEYWORDS.iter().any(|word| lower.contains(word)) {
        return REDACTED_ERROR.to_string();
    }
    message.chars().take(MAX_ERROR_CHARS).collect()
}
