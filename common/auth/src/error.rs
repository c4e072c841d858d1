use common_http_errors::ApiError;
use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential presented")]
    MissingCredential,
    #[error("credential malformed")]
    MalformedCredential,
    #[error("token missing kid header")]
    MissingKeyId,
    #[error("no decoding secret registered for kid '{0}'")]
    UnknownKeyId(String),
    #[error("token verification failed: {0}")]
    Verification(String),
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("credential revoked")]
    Revoked,
    #[error("invalid claim '{0}' with value '{1}'")]
    InvalidClaim(&'static str, String),
    #[error("malformed claim payload: {0}")]
    InvalidJson(String),
    #[error("invalid secret specification: {0}")]
    KeySpec(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match value.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            _ => Self::Verification(value.to_string()),
        }
    }
}

// Credential failures collapse to `unauthenticated` so the response does not
// reveal whether the credential was a JWT or an API key, or why it failed.
// Expiry is the one distinction the taxonomy surfaces.
impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        match value {
            AuthError::Expired => ApiError::CredentialExpired,
            _ => ApiError::Unauthenticated,
        }
    }
}
