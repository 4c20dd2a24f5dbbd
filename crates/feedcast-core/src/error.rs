use thiserror::Error;

/// Errors from core primitive operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Peer address is not a usable relay URL.
    #[error("invalid relay address {address}: {reason}")]
    InvalidAddress { address: String, reason: &'static str },
}

#[cfg(test)]
mod tests {
    use super::CoreError;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            CoreError::InvalidAddress {
                address: "ftp://x".to_string(),
                reason: "unsupported scheme",
            }
            .to_string(),
            "invalid relay address ftp://x: unsupported scheme"
        );
    }
}
