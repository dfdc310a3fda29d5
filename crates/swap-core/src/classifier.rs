use crate::error::{RemoteError, SwapError};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    Validation,
    Network,
    Permission,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Network => "network",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Timeout | ErrorCategory::Network | ErrorCategory::Unknown
        )
    }

    pub fn should_refresh(self) -> bool {
        matches!(self, ErrorCategory::Validation | ErrorCategory::Permission)
    }

    pub fn user_message(self) -> &'static str {
        match self {
            ErrorCategory::Timeout => "The request took too long to complete.",
            ErrorCategory::Validation => {
                "This proposal has changed since you opened it. Refreshing its latest state."
            }
            ErrorCategory::Network => "We couldn't reach the server. Check your connection.",
            ErrorCategory::Permission => "You don't have permission to act on this proposal.",
            ErrorCategory::Unknown => "Something went wrong while processing your action.",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(ErrorCategory::Timeout),
            "validation" => Ok(ErrorCategory::Validation),
            "network" => Ok(ErrorCategory::Network),
            "permission" => Ok(ErrorCategory::Permission),
            "unknown" => Ok(ErrorCategory::Unknown),
            _ => Err(SwapError::InvalidCategory(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorClassification (output)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub is_retryable: bool,
    pub should_refresh: bool,
    pub user_message: String,
}

impl From<ErrorCategory> for ErrorClassification {
    fn from(category: ErrorCategory) -> Self {
        Self {
            category,
            is_retryable: category.is_retryable(),
            should_refresh: category.should_refresh(),
            user_message: category.user_message().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct Rule {
    category: ErrorCategory,
    needles: &'static [&'static str],
}

/// Evaluated top to bottom; the first rule with a matching needle wins.
const RULES: &[Rule] = &[
    Rule {
        category: ErrorCategory::Timeout,
        needles: &["timeout", "timed out"],
    },
    Rule {
        category: ErrorCategory::Validation,
        needles: &[
            "invalid state",
            "already processed",
            "expired",
            "not found",
            "state mismatch",
        ],
    },
    Rule {
        category: ErrorCategory::Network,
        needles: &["network", "fetch", "connection", "cors"],
    },
    Rule {
        category: ErrorCategory::Permission,
        needles: &["unauthorized", "forbidden", "permission"],
    },
];

// ---------------------------------------------------------------------------
// classify
// ---------------------------------------------------------------------------

/// Map a raw remote failure onto a category with retry and refresh hints.
///
/// A structured `code` on the error is authoritative. Otherwise the message
/// and detail text are matched case-insensitively against [`RULES`], falling
/// back to [`ErrorCategory::Unknown`].
pub fn classify(err: &RemoteError) -> ErrorClassification {
    if let Some(code) = err.code {
        return code.into();
    }
    classify_text(&err.message, err.detail.as_deref()).into()
}

fn classify_text(message: &str, detail: Option<&str>) -> ErrorCategory {
    let mut haystack = message.to_lowercase();
    if let Some(detail) = detail {
        haystack.push('\n');
        haystack.push_str(&detail.to_lowercase());
    }

    RULES
        .iter()
        .find(|rule| rule.needles.iter().any(|n| haystack.contains(n)))
        .map(|rule| rule.category)
        .unwrap_or(ErrorCategory::Unknown)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn category(msg: &str) -> ErrorCategory {
        classify(&RemoteError::new(msg)).category
    }

    #[test]
    fn timeout_messages() {
        assert_eq!(category("Request Timeout"), ErrorCategory::Timeout);
        assert_eq!(category("the operation timed out"), ErrorCategory::Timeout);
        let c = classify(&RemoteError::new("timeout"));
        assert!(c.is_retryable);
        assert!(!c.should_refresh);
    }

    #[test]
    fn validation_messages() {
        for msg in [
            "Invalid State: proposal closed",
            "proposal already processed",
            "offer EXPIRED",
            "proposal not found",
            "state mismatch detected",
        ] {
            assert_eq!(category(msg), ErrorCategory::Validation, "{msg}");
        }
        let c = classify(&RemoteError::new("already processed"));
        assert!(!c.is_retryable);
        assert!(c.should_refresh);
    }

    #[test]
    fn network_messages() {
        assert_eq!(category("Network request failed"), ErrorCategory::Network);
        assert_eq!(category("Failed to fetch"), ErrorCategory::Network);
        assert_eq!(category("connection reset by peer"), ErrorCategory::Network);
        assert_eq!(category("blocked by CORS policy"), ErrorCategory::Network);
        assert!(classify(&RemoteError::new("network")).is_retryable);
    }

    #[test]
    fn permission_messages() {
        assert_eq!(category("401 Unauthorized"), ErrorCategory::Permission);
        assert_eq!(category("Forbidden"), ErrorCategory::Permission);
        assert_eq!(category("permission denied"), ErrorCategory::Permission);
        let c = classify(&RemoteError::new("forbidden"));
        assert!(!c.is_retryable);
        assert!(c.should_refresh);
    }

    #[test]
    fn unmatched_is_unknown_and_retryable() {
        let c = classify(&RemoteError::new("boom"));
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert!(c.is_retryable);
        assert!(!c.should_refresh);
    }

    #[test]
    fn precedence_follows_rule_order() {
        assert_eq!(category("network timeout"), ErrorCategory::Timeout);
        assert_eq!(category("fetch failed: not found"), ErrorCategory::Validation);
        assert_eq!(
            category("connection refused: unauthorized"),
            ErrorCategory::Network
        );
        assert_eq!(category("forbidden: state mismatch"), ErrorCategory::Validation);
    }

    #[test]
    fn detail_text_is_matched() {
        let err = RemoteError::new("Request failed").with_detail("at fetchProposal (api.ts:12)");
        assert_eq!(classify(&err).category, ErrorCategory::Network);
    }

    #[test]
    fn structured_code_wins_over_text() {
        let err = RemoteError::new("network timeout").with_code(ErrorCategory::Permission);
        assert_eq!(classify(&err).category, ErrorCategory::Permission);
        assert_eq!(
            classify(&RemoteError::timed_out(45_000)).category,
            ErrorCategory::Timeout
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let err = RemoteError::new("Network request failed");
        assert_eq!(classify(&err), classify(&err));
    }

    #[test]
    fn user_message_never_echoes_raw_text() {
        let c = classify(&RemoteError::new("SQLSTATE 40001 at db-7.internal"));
        assert!(!c.user_message.contains("db-7"));
        assert_eq!(c.user_message, ErrorCategory::Unknown.user_message());
    }

    #[test]
    fn category_parse() {
        assert_eq!("network".parse::<ErrorCategory>().unwrap(), ErrorCategory::Network);
        assert!("disk".parse::<ErrorCategory>().is_err());
    }
}
