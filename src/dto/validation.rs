//! Validation helpers for DTOs.

use std::net::IpAddr;

use validator::ValidationError;

/// Longest `User-Agent` accepted from the transport.
pub const MAX_USER_AGENT_LEN: usize = 512;

/// Validates that an identifier is strictly positive.
pub fn validate_positive_id(id: i64) -> Result<(), ValidationError> {
    if id <= 0 {
        let mut err = ValidationError::new("id_range");
        err.message = Some(format!("Identifier must be a positive integer (got {id})").into());
        return Err(err);
    }
    Ok(())
}

/// Validates that a reported client address is a textual IPv4 or IPv6 address.
///
/// # Examples
///
/// ```ignore
/// validate_ip_address("10.0.0.8")    // Ok
/// validate_ip_address("::1")         // Ok
/// validate_ip_address("10.0.0.256")  // Err
/// ```
pub fn validate_ip_address(ip: &str) -> Result<(), ValidationError> {
    if ip.parse::<IpAddr>().is_err() {
        let mut err = ValidationError::new("ip_format");
        err.message = Some(format!("'{ip}' is not a valid IP address").into());
        return Err(err);
    }
    Ok(())
}

/// Validates the length of a reported `User-Agent`.
pub fn validate_user_agent(user_agent: &str) -> Result<(), ValidationError> {
    if user_agent.len() > MAX_USER_AGENT_LEN {
        let mut err = ValidationError::new("user_agent_length");
        err.message = Some(
            format!(
                "User-Agent must be at most {MAX_USER_AGENT_LEN} bytes (got {})",
                user_agent.len()
            )
            .into(),
        );
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_positive_id() {
        assert!(validate_positive_id(1).is_ok());
        assert!(validate_positive_id(0).is_err());
        assert!(validate_positive_id(-4).is_err());
    }

    #[test]
    fn test_validate_ip_address() {
        assert!(validate_ip_address("10.0.0.8").is_ok());
        assert!(validate_ip_address("2001:db8::1").is_ok());
        assert!(validate_ip_address("10.0.0.256").is_err());
        assert!(validate_ip_address("localhost").is_err());
    }

    #[test]
    fn test_validate_user_agent() {
        assert!(validate_user_agent("Mozilla/5.0").is_ok());
        assert!(validate_user_agent(&"a".repeat(MAX_USER_AGENT_LEN + 1)).is_err());
    }
}
