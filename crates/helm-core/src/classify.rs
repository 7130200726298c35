//! Provider error classification.
//!
//! Every predicate walks the `source()` chain of the error it is given and
//! looks for an embedded [`ProviderError`] or [`RetryError`], either directly
//! or inside a [`GatewayError`]. Errors that carry neither are fatal.

use std::error::Error as StdError;

use crate::errors::{GatewayError, ProviderError, RetryError};

/// Message fragments (lower-case) that mean the request overflowed the
/// model's context window. Status code is not consulted.
pub const INPUT_TOO_LONG_PATTERNS: &[&str] = &[
    "input is too long",
    "context_length_exceeded",
    "maximum context length",
    "token limit",
    "exceeds the model's maximum",
    "prompt is too long",
    "request too large",
];

/// Message fragments (lower-case) that mean the provider is throttling us.
pub const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "too many requests",
    "too many tokens",
    "quota exceeded",
    "exceeded your quota",
    "exceeded quota",
    "throttled",
    "capacity",
    "overloaded",
    "try again later",
    "request limit",
    "requests per minute",
    "tokens per minute",
];

/// Status codes retried regardless of message.
pub const RETRYABLE_STATUS_CODES: &[u16] = &[408, 409, 429];

/// Coarse outcome of classification, in precedence order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    InputTooLong,
    RateLimited,
    Retryable,
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputTooLong => "input_too_long",
            Self::RateLimited => "rate_limited",
            Self::Retryable => "retryable",
            Self::Fatal => "fatal",
        }
    }
}

enum Embedded<'a> {
    Provider(&'a ProviderError),
    Retry(&'a RetryError),
}

fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

fn find_embedded<'a>(err: &'a (dyn StdError + 'static)) -> Option<Embedded<'a>> {
    for e in chain(err) {
        if let Some(pe) = e.downcast_ref::<ProviderError>() {
            return Some(Embedded::Provider(pe));
        }
        if let Some(re) = e.downcast_ref::<RetryError>() {
            return Some(Embedded::Retry(re));
        }
        if let Some(ge) = e.downcast_ref::<GatewayError>() {
            match ge {
                GatewayError::Provider(pe) => return Some(Embedded::Provider(pe)),
                GatewayError::RetriesExhausted(re) => return Some(Embedded::Retry(re)),
                _ => {}
            }
        }
    }
    None
}

/// The first `ProviderError` reachable from `err`. A `RetryError` yields its
/// most recent attempt.
pub fn provider_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a ProviderError> {
    match find_embedded(err)? {
        Embedded::Provider(pe) => Some(pe),
        Embedded::Retry(re) => re.last(),
    }
}

fn contains_any(message: &str, patterns: &[&str]) -> bool {
    let folded = message.to_lowercase();
    patterns.iter().any(|p| folded.contains(p))
}

/// True when an embedded provider message matches a context-overflow pattern.
pub fn is_input_too_long_error(err: &(dyn StdError + 'static)) -> bool {
    provider_error(err).is_some_and(|pe| contains_any(&pe.message, INPUT_TOO_LONG_PATTERNS))
}

/// True for status 429 or a throttling message.
pub fn is_rate_limit_error(err: &(dyn StdError + 'static)) -> bool {
    provider_error(err)
        .is_some_and(|pe| pe.status_code == 429 || contains_any(&pe.message, RATE_LIMIT_PATTERNS))
}

/// True for any `RetryError`, for statuses 408/409/429, and for throttling
/// messages. A bare 500 is not retryable.
pub fn is_retryable_error(err: &(dyn StdError + 'static)) -> bool {
    match find_embedded(err) {
        Some(Embedded::Retry(_)) => true,
        Some(Embedded::Provider(pe)) => {
            RETRYABLE_STATUS_CODES.contains(&pe.status_code) || is_rate_limit_error(err)
        }
        None => false,
    }
}

/// Classify `err` into a single bucket. Input-too-long wins over rate limits
/// because it has its own recovery path.
pub fn classify(err: &(dyn StdError + 'static)) -> ErrorClass {
    if is_input_too_long_error(err) {
        ErrorClass::InputTooLong
    } else if is_rate_limit_error(err) {
        ErrorClass::RateLimited
    } else if is_retryable_error(err) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer: {inner}")]
    struct Wrapper {
        #[source]
        inner: GatewayError,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("plain failure")]
    struct Plain;

    fn pe(status: u16, msg: &str) -> ProviderError {
        ProviderError::new(status, msg)
    }

    #[test]
    fn every_input_too_long_pattern_matches_any_status() {
        for pattern in INPUT_TOO_LONG_PATTERNS {
            for status in [0u16, 400, 413, 500] {
                let err = pe(status, &format!("Error: {}!", pattern.to_uppercase()));
                assert!(is_input_too_long_error(&err), "pattern {pattern} status {status}");
            }
        }
    }

    #[test]
    fn rate_limit_messages_are_not_input_too_long() {
        for pattern in RATE_LIMIT_PATTERNS {
            let err = pe(400, pattern);
            assert!(!is_input_too_long_error(&err), "pattern {pattern}");
        }
    }

    #[test]
    fn status_429_is_rate_limited_regardless_of_message() {
        for msg in ["", "something odd", "input is too long"] {
            assert!(is_rate_limit_error(&pe(429, msg)));
        }
    }

    #[test]
    fn rate_limit_patterns_case_insensitive() {
        assert!(is_rate_limit_error(&pe(503, "Server OVERLOADED, Try Again Later")));
        assert!(!is_rate_limit_error(&pe(503, "service unavailable")));
    }

    #[test]
    fn retryable_status_set() {
        for status in RETRYABLE_STATUS_CODES {
            assert!(is_retryable_error(&pe(*status, "x")), "status {status}");
        }
        assert!(!is_retryable_error(&pe(500, "internal server error")));
        assert!(!is_retryable_error(&pe(400, "bad request")));
    }

    #[test]
    fn retry_error_always_retryable() {
        let err = RetryError::new(vec![pe(500, "boom"), pe(400, "bad")]);
        assert!(is_retryable_error(&err));
        let empty = RetryError::new(vec![]);
        assert!(is_retryable_error(&empty));
        let wrapped = GatewayError::from(RetryError::new(vec![pe(401, "no")]));
        assert!(is_retryable_error(&wrapped));
    }

    #[test]
    fn rate_limit_message_makes_other_status_retryable() {
        assert!(is_retryable_error(&pe(500, "model overloaded")));
    }

    #[test]
    fn finds_provider_error_through_wrapping() {
        let err = Wrapper {
            inner: GatewayError::from(pe(400, "prompt is too long: 210000 tokens")),
        };
        assert!(is_input_too_long_error(&err));
        assert_eq!(classify(&err), ErrorClass::InputTooLong);
    }

    #[test]
    fn walks_several_wrapping_levels() {
        #[derive(Debug, thiserror::Error)]
        #[error("run failed")]
        struct Outer {
            #[source]
            inner: Wrapper,
        }

        let err = Outer {
            inner: Wrapper {
                inner: GatewayError::from(pe(429, "slow down")),
            },
        };
        let found = provider_error(&err).map(|p| p.status_code);
        assert_eq!(found, Some(429));
        assert!(is_rate_limit_error(&err));
        assert_eq!(classify(&err), ErrorClass::RateLimited);
    }

    #[test]
    fn errors_without_provider_error_are_fatal() {
        assert_eq!(classify(&Plain), ErrorClass::Fatal);
        assert_eq!(classify(&GatewayError::Network("reset".into())), ErrorClass::Fatal);
        assert!(!is_retryable_error(&Plain));
    }

    #[test]
    fn classification_precedence() {
        assert_eq!(classify(&pe(429, "input is too long")), ErrorClass::InputTooLong);
        assert_eq!(classify(&pe(429, "")), ErrorClass::RateLimited);
        assert_eq!(classify(&pe(408, "timeout")), ErrorClass::Retryable);
        assert_eq!(classify(&pe(500, "")), ErrorClass::Fatal);
    }
}
