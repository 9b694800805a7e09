//! Wire error codes and their classification.

use crate::error::ApiErrorKind;

// Generic protocol block
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Application block
pub const NOT_AUTHENTICATED: i64 = 1;
pub const NOT_AUTHORIZED: i64 = 2;
pub const NOT_FOUND: i64 = 3;
pub const VALIDATION: i64 = 4;

/// Detail markers the appliance uses when it reports a missing object
/// through INVALID_PARAMS instead of NOT_FOUND.
const MISSING_OBJECT_MARKERS: [&str; 2] = ["InstanceNotFound", "does not exist"];

/// Map a wire code and optional detail text onto an error kind
pub fn classify(code: i64, details: Option<&str>) -> ApiErrorKind {
    match code {
        NOT_FOUND => ApiErrorKind::NotFound,
        NOT_AUTHENTICATED | NOT_AUTHORIZED => ApiErrorKind::Auth,
        VALIDATION => ApiErrorKind::Validation,
        INVALID_PARAMS if details.is_some_and(reports_missing_object) => ApiErrorKind::NotFound,
        _ => ApiErrorKind::Generic,
    }
}

fn reports_missing_object(details: &str) -> bool {
    MISSING_OBJECT_MARKERS.iter().any(|m| details.contains(m))
}

/// Short name of a code, for logs
pub fn name(code: i64) -> &'static str {
    match code {
        PARSE_ERROR => "parse_error",
        INVALID_REQUEST => "invalid_request",
        METHOD_NOT_FOUND => "method_not_found",
        INVALID_PARAMS => "invalid_params",
        INTERNAL_ERROR => "internal_error",
        NOT_AUTHENTICATED => "not_authenticated",
        NOT_AUTHORIZED => "not_authorized",
        NOT_FOUND => "not_found",
        VALIDATION => "validation",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(NOT_FOUND, None), ApiErrorKind::NotFound);
        assert_eq!(classify(NOT_AUTHENTICATED, None), ApiErrorKind::Auth);
        assert_eq!(classify(NOT_AUTHORIZED, None), ApiErrorKind::Auth);
        assert_eq!(classify(VALIDATION, None), ApiErrorKind::Validation);
        assert_eq!(classify(INTERNAL_ERROR, None), ApiErrorKind::Generic);
    }

    #[test]
    fn test_invalid_params_missing_object() {
        assert_eq!(
            classify(INVALID_PARAMS, Some("[EINVAL] InstanceNotFound: 42")),
            ApiErrorKind::NotFound
        );
        assert_eq!(
            classify(INVALID_PARAMS, Some("dataset tank/x does not exist")),
            ApiErrorKind::NotFound
        );
        assert_eq!(
            classify(INVALID_PARAMS, Some("name: field required")),
            ApiErrorKind::Generic
        );
        assert_eq!(classify(INVALID_PARAMS, None), ApiErrorKind::Generic);
    }

    #[test]
    fn test_marker_only_applies_to_invalid_params() {
        assert_eq!(
            classify(INTERNAL_ERROR, Some("InstanceNotFound")),
            ApiErrorKind::Generic
        );
        assert_eq!(
            classify(VALIDATION, Some("does not exist")),
            ApiErrorKind::Validation
        );
    }
}
