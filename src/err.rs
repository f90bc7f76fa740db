use std::io;

use crate::tcp::Dual;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Tun error: {0}")]
    TunError(#[from] tidy_tuntap::error::Error),

    #[error("Port: {0} has been unexpectedly closed")]
    PortClosed(u16),

    #[error("Port: {0} already in use")]
    PortInUse(u16),

    #[error("Stream {0:?} has been closed")]
    StreamClosed(Dual),

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection reset by peer")]
    ConnectionReset,

    #[error("Connection timed out")]
    TimedOut,

    #[error("No route to host")]
    HostUnreachable,

    #[error("Socket is not connected")]
    NotConnected,

    #[error("Cannot send after transport endpoint shutdown")]
    Shutdown,

    #[error("Transport endpoint is already connected")]
    AlreadyConnected,

    #[error("Operation already in progress")]
    AlreadyInProgress,

    #[error("Operation would block")]
    WouldBlock,

    #[error("No data available")]
    NoData,
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::TunError(_) => io::ErrorKind::Other,
            Error::PortClosed(_) | Error::StreamClosed(_) => io::ErrorKind::NotConnected,
            Error::PortInUse(_) => io::ErrorKind::AddrInUse,
            Error::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            Error::ConnectionReset => io::ErrorKind::ConnectionReset,
            Error::TimedOut => io::ErrorKind::TimedOut,
            Error::HostUnreachable => io::ErrorKind::Other,
            Error::NotConnected => io::ErrorKind::NotConnected,
            Error::Shutdown => io::ErrorKind::NotConnected,
            Error::AlreadyConnected => io::ErrorKind::AlreadyExists,
            Error::AlreadyInProgress => io::ErrorKind::AlreadyExists,
            Error::WouldBlock => io::ErrorKind::WouldBlock,
            Error::NoData => io::ErrorKind::UnexpectedEof,
        };

        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_reset_maps_to_matching_io_error_kind() {
        let io_err: io::Error = Error::ConnectionReset.into();
        assert_eq!(io_err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn timed_out_maps_to_matching_io_error_kind() {
        let io_err: io::Error = Error::TimedOut.into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn would_block_maps_to_matching_io_error_kind() {
        let io_err: io::Error = Error::WouldBlock.into();
        assert_eq!(io_err.kind(), io::ErrorKind::WouldBlock);
    }
}
