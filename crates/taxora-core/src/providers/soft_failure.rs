//! Detection of quota notices embedded in otherwise successful replies
//!
//! Some providers answer an exhausted account with HTTP 200 and a short
//! apology instead of a 429. Financial advice talks about "rates" and
//! "limits" all the time, so the match is deliberately narrow: the reply must
//! be short, name quota exhaustion explicitly, and mention billing or plan
//! terms. Extend the phrase lists only together with a regression test.

/// Replies at or above this many characters are never treated as notices
pub const MAX_NOTICE_CHARS: usize = 200;

const QUOTA_PHRASES: &[&str] = &[
    "quota exceeded",
    "exceeded your current quota",
    "insufficient_quota",
    "resource_exhausted",
    "resource has been exhausted",
];

const BILLING_TERMS: &[&str] = &["billing", "check your plan", "upgrade your plan", "check quota"];

/// Whether `text` is a provider quota notice rather than a real answer
pub fn is_quota_notice(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.chars().count() >= MAX_NOTICE_CHARS {
        return false;
    }
    let lower = trimmed.to_lowercase();
    QUOTA_PHRASES.iter().any(|p| lower.contains(p)) && BILLING_TERMS.iter().any(|t| lower.contains(t))
}
