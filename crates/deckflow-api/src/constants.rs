/// API version prefix for all routes.
pub const API_PREFIX: &str = "/api/v1";
