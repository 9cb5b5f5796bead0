//! JSON-RPC error codes and reserved method names.

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist or is not routed.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;
/// The request was cancelled through `$/cancelRequest`.
pub const REQUEST_CANCELLED: i64 = -32800;

/// Notification method used by either peer to cancel an in-flight request.
pub const CANCEL_REQUEST_METHOD: &str = "$/cancelRequest";

/// Short machine-readable name for a code, used in logs and metrics labels.
pub fn code_name(code: i64) -> &'static str {
    match code {
        PARSE_ERROR => "parse_error",
        INVALID_REQUEST => "invalid_request",
        METHOD_NOT_FOUND => "method_not_found",
        INVALID_PARAMS => "invalid_params",
        INTERNAL_ERROR => "internal_error",
        REQUEST_CANCELLED => "request_cancelled",
        _ => "custom",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_codes_have_names() {
        assert_eq!(code_name(METHOD_NOT_FOUND), "method_not_found");
        assert_eq!(code_name(INTERNAL_ERROR), "internal_error");
        assert_eq!(code_name(REQUEST_CANCELLED), "request_cancelled");
        assert_eq!(code_name(PARSE_ERROR), "parse_error");
    }

    #[test]
    fn unknown_code_is_custom() {
        assert_eq!(code_name(-1), "custom");
        assert_eq!(code_name(-32001), "custom");
    }
}
