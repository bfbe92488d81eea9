use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::ProcessId;
use crate::proto::RefId;

/// A failure of a remote-reference operation. These errors have well-defined
/// meanings on both sides of the wire, so they survive the trip through a
/// [`RemoteException`] in a structured form.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ReferenceError {
    /// A `Future` can be set at most once; a second put fails with this.
    #[error("future can be set only once")]
    AlreadySet,
    /// The backing channel has been closed and is drained.
    #[error("channel is closed")]
    ChannelClosed,
    /// The cell backing the reference no longer exists on the owner.
    #[error("remote reference {0} has been destroyed")]
    Destroyed(RefId),
}

/// A failure captured on a remote worker and delivered as the value of a
/// `Result` message. This is the error envelope of the protocol: whatever the
/// invoked function raised is flattened into a message and a backtrace, with
/// reference-kind failures additionally preserved in structured form.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("error on worker {pid}: {exception}")]
pub struct RemoteException {
    /// The id of the worker where the failure happened.
    pub pid: ProcessId,
    /// Structured form of the failure, when it was a reference-kind error.
    pub reference: Option<ReferenceError>,
    /// Rendering of the failure chain.
    pub exception: String,
    /// Backtrace captured where the failure happened. May be empty if
    /// backtraces are disabled in the remote process.
    pub backtrace: String,
}

impl RemoteException {
    /// Capture an error into the wire envelope. An error that already is a
    /// wrapped remote failure passes through unchanged, so nesting calls does
    /// not wrap the exception twice.
    pub fn capture(pid: ProcessId, error: &anyhow::Error) -> RemoteException {
        if let Some(ClusterError::Remote(remote)) = error.downcast_ref::<ClusterError>() {
            return remote.clone();
        }
        let reference = match error.downcast_ref::<ClusterError>() {
            Some(ClusterError::Reference(r)) => Some(r.clone()),
            _ => error.downcast_ref::<ReferenceError>().cloned(),
        };
        RemoteException {
            pid,
            reference,
            exception: format!("{:#}", error),
            backtrace: format!("{}", error.backtrace()),
        }
    }
}

/// The error surface of the cluster runtime.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The connection to a worker is gone or was never established. These
    /// errors are not retried; later operations towards the same worker fail
    /// immediately.
    #[error("transport failure with worker {pid}: {reason}")]
    Transport {
        /// The peer the connection belongs to.
        pid: ProcessId,
        /// What went wrong.
        reason: String,
    },
    /// The peer violated the message protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A failure captured on a remote worker.
    #[error("{0}")]
    Remote(RemoteException),
    /// A local reference-kind failure.
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    /// A worker-pool operation failed.
    #[error("pool error: {0}")]
    Pool(String),
}

impl From<RemoteException> for ClusterError {
    fn from(e: RemoteException) -> ClusterError {
        ClusterError::Remote(e)
    }
}

impl ClusterError {
    /// The reference-kind failure behind this error, if any, looking through
    /// the remote envelope.
    pub fn reference_kind(&self) -> Option<&ReferenceError> {
        match self {
            ClusterError::Reference(r) => Some(r),
            ClusterError::Remote(remote) => remote.reference.as_ref(),
            _ => None,
        }
    }

    /// Whether this error means the channel is closed, locally or behind a
    /// remote envelope.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self.reference_kind(), Some(ReferenceError::ChannelClosed))
    }
}

/// Whether an error chain contains a closed-channel condition, local or
/// wrapped remote. Used to end channel iteration cleanly.
pub fn is_channel_closed(error: &anyhow::Error) -> bool {
    match error.downcast_ref::<ClusterError>() {
        Some(e) => e.is_channel_closed(),
        None => matches!(
            error.downcast_ref::<ReferenceError>(),
            Some(ReferenceError::ChannelClosed)
        ),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_capture_passes_through_remote() {
        let inner = RemoteException {
            pid: 3,
            reference: Some(ReferenceError::ChannelClosed),
            exception: "channel is closed".into(),
            backtrace: String::new(),
        };
        let err = anyhow::Error::from(ClusterError::Remote(inner.clone()));
        let captured = RemoteException::capture(2, &err);
        assert_eq!(captured.pid, 3);
        assert_eq!(captured.reference, Some(ReferenceError::ChannelClosed));
    }

    #[test]
    fn test_capture_preserves_reference_kind() {
        let err = anyhow::Error::from(ClusterError::Reference(ReferenceError::AlreadySet));
        let captured = RemoteException::capture(2, &err);
        assert_eq!(captured.reference, Some(ReferenceError::AlreadySet));
        assert!(captured.exception.contains("only once"));
    }

    #[test]
    fn test_is_channel_closed_through_envelope() {
        let remote = RemoteException {
            pid: 2,
            reference: Some(ReferenceError::ChannelClosed),
            exception: "channel is closed".into(),
            backtrace: String::new(),
        };
        let err = anyhow::Error::from(ClusterError::Remote(remote));
        assert!(is_channel_closed(&err));
        let err = anyhow::Error::from(ClusterError::Pool("empty".into()));
        assert!(!is_channel_closed(&err));
    }
}
