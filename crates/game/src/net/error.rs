use std::io;

use super::protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt stream: declared length {0} is shorter than the header")]
    Corrupt(usize),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failure to bring up a listener, socket or poller at launch.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to bind {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: std::net::SocketAddr,
        source: io::Error,
    },
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        source: io::Error,
    },
    #[error("failed to set up event loop: {0}")]
    Poll(io::Error),
    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub(crate) fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// The peer went away, either by closing or by resetting the connection.
pub(crate) fn is_peer_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// Send buffer exhausted. Datagram sends treat this like would-block.
pub(crate) fn is_buffer_full(err: &io::Error) -> bool {
    is_would_block(err) || is_no_buffer_space(err)
}

#[cfg(unix)]
fn is_no_buffer_space(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOBUFS)
}

#[cfg(not(unix))]
fn is_no_buffer_space(_err: &io::Error) -> bool {
    false
}

/// The OS refused this one destination. Sends to other peers are unaffected.
pub(crate) fn is_destination_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidInput
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_no_buffer_space_counts_as_full() {
        let err = io::Error::from_raw_os_error(libc::ENOBUFS);
        assert!(is_buffer_full(&err));
        assert!(!is_destination_error(&err));
    }

    #[test]
    fn test_destination_errors_are_per_peer() {
        let invalid = io::Error::from(io::ErrorKind::InvalidInput);
        assert!(is_destination_error(&invalid));
        assert!(!is_buffer_full(&invalid));

        let unreachable = io::Error::from(io::ErrorKind::HostUnreachable);
        assert!(is_destination_error(&unreachable));

        let other = io::Error::other("socket gone");
        assert!(!is_destination_error(&other));
    }
}
