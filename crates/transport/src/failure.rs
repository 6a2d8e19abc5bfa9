//! Maps raw failure text to something a person can act on.

/// Failure category, checked in declaration order; the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Timeout,
    QuotaExhausted,
    RateLimited,
    NetworkUnreachable,
    ServerFault,
    Generic,
}

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "超时"];
const QUOTA_PATTERNS: &[&str] = &["quota", "balance", "insufficient", "余额不足"];
const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "too many requests", "限流", "http 429"];
const NETWORK_PATTERNS: &[&str] = &[
    "network",
    "connect",
    "dns",
    "unreachable",
    "failed to fetch",
    "网络",
];
const SERVER_FAULT_PATTERNS: &[&str] = &[
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

impl FailureKind {
    pub fn classify(raw: &str, status: Option<u16>) -> Self {
        let lowered = raw.to_lowercase();
        let matches = |patterns: &[&str]| patterns.iter().any(|pattern| lowered.contains(pattern));

        if matches(TIMEOUT_PATTERNS) {
            Self::Timeout
        } else if matches(QUOTA_PATTERNS) {
            Self::QuotaExhausted
        } else if status == Some(429) || matches(RATE_LIMIT_PATTERNS) {
            Self::RateLimited
        } else if matches(NETWORK_PATTERNS) {
            Self::NetworkUnreachable
        } else if status.is_some_and(|status| (500..600).contains(&status))
            || matches(SERVER_FAULT_PATTERNS)
        {
            Self::ServerFault
        } else {
            Self::Generic
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::Timeout => "The request timed out, please try again later.",
            Self::QuotaExhausted => "The API quota is exhausted, please contact the administrator.",
            Self::RateLimited => "Too many requests, please wait a moment and retry.",
            Self::NetworkUnreachable => "Network connection failed, please check your connection.",
            Self::ServerFault => "The server hit an internal error, please try again later.",
            Self::Generic => "Send failed, please retry.",
        }
    }
}

/// Text shown for a connect, status, read or timeout failure.
pub fn transport_failure_message(raw: &str, status: Option<u16>) -> String {
    FailureKind::classify(raw, status).user_message().to_string()
}

/// Text shown for an `error` frame sent by the server.
///
/// Known categories get their friendly text; anything else keeps the server's wording.
pub fn server_failure_message(raw: &str) -> String {
    let raw = raw.trim();
    match FailureKind::classify(raw, None) {
        FailureKind::Generic if !raw.is_empty() => raw.to_string(),
        kind => kind.user_message().to_string(),
    }
}
