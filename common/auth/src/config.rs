/// Runtime configuration for JWT verification and issuance.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Allowable clock skew in seconds when validating exp/iat/nbf.
    pub leeway_seconds: u32,
    /// Access token lifetime in seconds.
    pub access_ttl_seconds: i64,
    /// Refresh token lifetime in seconds.
    pub refresh_ttl_seconds: i64,
}

impl JwtConfig {
    /// Defaults: 30 second leeway, 1 hour access, 7 day refresh.
    pub fn new() -> Self {
        Self {
            leeway_seconds: 30,
            access_ttl_seconds: 3600,
            refresh_ttl_seconds: 7 * 24 * 3600,
        }
    }

    pub fn with_leeway(mut self, seconds: u32) -> Self {
        self.leeway_seconds = seconds;
        self
    }

    pub fn with_access_ttl(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    pub fn with_refresh_ttl(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self::new()
    }
}
