//! Bearer credential contract for incoming agent sessions

use crate::error::AuthenticationError;

const BEARER_PREFIX: &str = "Bearer ";

/// Extract the token from a `Bearer <token>` credential
pub fn parse_bearer(credential: Option<&str>) -> Result<&str, AuthenticationError> {
    let credential = credential
        .map(str::trim_start)
        .filter(|c| !c.is_empty())
        .ok_or(AuthenticationError::Missing)?;

    let token = credential
        .strip_prefix(BEARER_PREFIX)
        .ok_or(AuthenticationError::NotBearer)?
        .trim();

    if token.is_empty() {
        return Err(AuthenticationError::EmptyToken);
    }
    Ok(token)
}

/// Whether the credential has the expected bearer shape
pub fn authenticate_connection(credential: Option<&str>) -> bool {
    match parse_bearer(credential) {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("Rejected credential: {}", e);
            false
        }
    }
}
