/// API path prefix
pub const API_PREFIX: &str = "/v1";
