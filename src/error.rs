use thiserror::Error;

/// Errors returned by the exchange layer.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("incorrect state")]
    IncorrectState,

    #[error("send throttled by peer")]
    SendThrottled,

    #[error("wrong message version for exchange")]
    WrongMessageVersionForExchange,

    #[error("not connected")]
    NotConnected,

    #[error("invalid ack id {0}")]
    InvalidAckId(u32),

    #[error("no memory")]
    NoMemory,

    #[error("message not acknowledged")]
    MessageNotAcknowledged,

    #[error("message incomplete")]
    MessageIncomplete,

    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid address")]
    InvalidAddress,

    #[error("host unreachable")]
    HostUnreachable,

    #[error("network unreachable")]
    NetworkUnreachable,

    #[error("sending blocked")]
    SendingBlocked,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExchangeError {
    /// Map socket level errors onto the exchange taxonomy.
    pub fn from_io(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::HostUnreachable => ExchangeError::HostUnreachable,
            std::io::ErrorKind::NetworkUnreachable => ExchangeError::NetworkUnreachable,
            std::io::ErrorKind::WouldBlock => ExchangeError::SendingBlocked,
            std::io::ErrorKind::AddrNotAvailable => ExchangeError::InvalidAddress,
            std::io::ErrorKind::UnexpectedEof => ExchangeError::MessageIncomplete,
            _ => ExchangeError::Io(e),
        }
    }

    /// Send failures that should not abort the surrounding flow.
    ///
    /// Standalone acks treat these as success and the retransmit table keeps
    /// entries alive so they are retried on the next tick.
    pub fn is_non_critical_send(&self) -> bool {
        matches!(
            self,
            ExchangeError::HostUnreachable
                | ExchangeError::NetworkUnreachable
                | ExchangeError::SendingBlocked
                | ExchangeError::NoMemory
        )
    }
}

pub type Result<T> = std::result::Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::ExchangeError;

    #[test]
    fn io_errors_map_to_taxonomy() {
        let e = ExchangeError::from_io(std::io::Error::from(std::io::ErrorKind::HostUnreachable));
        assert!(matches!(e, ExchangeError::HostUnreachable));
        assert!(e.is_non_critical_send());

        let e = ExchangeError::from_io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(matches!(e, ExchangeError::MessageIncomplete));

        let e = ExchangeError::from_io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(matches!(e, ExchangeError::Io(_)));
        assert!(!e.is_non_critical_send());
        assert!(!ExchangeError::NotConnected.is_non_critical_send());
    }
}
