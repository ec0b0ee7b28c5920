//! Parsing of the provider throttling headers.

use http::HeaderValue;
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum RetryAfterParseError {
    #[error("Unable to parse value '{0}'")]
    ValueError(String),

    #[error("Header value contains invalid chars")]
    HeaderValueError,
}

/// Parse a `Retry-After` value, either delay-seconds or an HTTP-date
/// ([RFC 9110 section 10.2.3](https://www.rfc-editor.org/rfc/rfc9110#section-10.2.3)).
///
/// Dates in the past yield [`Duration::ZERO`].
pub(crate) fn parse_retry_after(value: &HeaderValue) -> Result<Duration, RetryAfterParseError> {
    let value = value
        .to_str()
        .map_err(|_| RetryAfterParseError::HeaderValueError)?
        .trim();

    value.parse::<u64>().map(Duration::from_secs).or_else(|_| {
        httpdate::parse_http_date(value)
            .map(|at| at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
            .map_err(|_| RetryAfterParseError::ValueError(value.into()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn value(v: &str) -> HeaderValue {
        HeaderValue::from_str(v).unwrap()
    }

    #[rstest]
    #[case("2", Duration::from_secs(2))]
    #[case(" 30 ", Duration::from_secs(30))]
    #[case("0", Duration::ZERO)]
    #[case("Fri, 15 May 2015 15:34:21 GMT", Duration::ZERO)]
    fn test_retry_after(#[case] header: &str, #[case] expected: Duration) {
        assert_eq!(parse_retry_after(&value(header)), Ok(expected));
    }

    #[test]
    fn test_retry_after_future_date() {
        let result = parse_retry_after(&value("Fri, 15 May 4099 15:34:21 GMT"));
        assert!(matches!(result, Ok(d) if d.as_secs() > 0));
    }

    #[test]
    fn test_retry_after_invalid() {
        assert_eq!(
            parse_retry_after(&value("-1")),
            Err(RetryAfterParseError::ValueError("-1".into()))
        );
        assert_eq!(
            parse_retry_after(&value("soon")),
            Err(RetryAfterParseError::ValueError("soon".into()))
        );
    }
}
