//! RPC correlation
//!
//! At most one RPC that expects feedback may be outstanding. The caller that
//! issues it holds the receiving half of a oneshot channel; the reader task
//! resolves or rejects it as RPC_RESULT and ERROR_STATE frames arrive.

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{ErrorCode, ProtocolError, RpcCommand};

/// Records delivered to the caller. Single-response calls deliver exactly one
/// record; streamed calls deliver every record before the terminator.
pub type RpcReply = Result<Vec<Vec<String>>, ProtocolError>;

/// Receiving half handed to the caller that issued the RPC
pub type RpcReceiver = oneshot::Receiver<RpcReply>;

/// Identifies one registered call, so a caller can only cancel or time out
/// its own call and never one registered after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(u64);

#[derive(Debug)]
enum PendingRpc {
    /// Resolves on the first matching result
    Single {
        id: CallId,
        command: RpcCommand,
        reply: oneshot::Sender<RpcReply>,
    },
    /// Collects results until one arrives with no fields
    Stream {
        id: CallId,
        command: RpcCommand,
        records: Vec<Vec<String>>,
        reply: oneshot::Sender<RpcReply>,
    },
}

impl PendingRpc {
    fn id(&self) -> CallId {
        match self {
            PendingRpc::Single { id, .. } | PendingRpc::Stream { id, .. } => *id,
        }
    }

    fn command(&self) -> RpcCommand {
        match self {
            PendingRpc::Single { command, .. } | PendingRpc::Stream { command, .. } => *command,
        }
    }

    fn fail(self, err: ProtocolError) {
        let reply = match self {
            PendingRpc::Single { reply, .. } | PendingRpc::Stream { reply, .. } => reply,
        };
        // The caller may have given up already
        let _ = reply.send(Err(err));
    }
}

/// What the correlator did with an incoming packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcOutcome {
    /// The pending call completed
    Resolved,
    /// A streamed record was stored; holds the count so far
    Accumulated(usize),
    /// The pending call failed with this code
    Rejected(ErrorCode),
    /// Nothing was pending, or the packet did not match
    Ignored,
}

/// The single pending-call slot
#[derive(Debug, Default)]
pub struct RpcCorrelator {
    pending: Option<PendingRpc>,
    next_id: u64,
}

impl RpcCorrelator {
    /// An empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a call is outstanding
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Command of the outstanding call, if any
    pub fn pending_command(&self) -> Option<RpcCommand> {
        self.pending.as_ref().map(PendingRpc::command)
    }

    /// Register a call for `command`.
    ///
    /// The response shape follows [`RpcCommand::is_streaming`]. Fails with
    /// [`ProtocolError::CallInProgress`] while another call is outstanding.
    pub fn begin(&mut self, command: RpcCommand) -> Result<(CallId, RpcReceiver), ProtocolError> {
        if let Some(pending) = &self.pending {
            debug!(pending = %pending.command(), requested = %command, "call already in progress");
            return Err(ProtocolError::CallInProgress);
        }

        let id = CallId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let (reply, rx) = oneshot::channel();
        self.pending = Some(if command.is_streaming() {
            PendingRpc::Stream {
                id,
                command,
                records: Vec::new(),
                reply,
            }
        } else {
            PendingRpc::Single { id, command, reply }
        });
        Ok((id, rx))
    }

    /// Route an RPC_RESULT.
    pub fn on_result(&mut self, command: RpcCommand, fields: Vec<String>) -> RpcOutcome {
        let Some(pending) = self.pending.take() else {
            debug!(%command, "result with no pending call");
            return RpcOutcome::Ignored;
        };

        if pending.command() != command {
            warn!(
                expected = %pending.command(),
                received = %command,
                "ignoring result for a different command"
            );
            self.pending = Some(pending);
            return RpcOutcome::Ignored;
        }

        match pending {
            PendingRpc::Single { reply, .. } => {
                let _ = reply.send(Ok(vec![fields]));
                RpcOutcome::Resolved
            }
            PendingRpc::Stream { reply, records, .. } if fields.is_empty() => {
                let _ = reply.send(Ok(records));
                RpcOutcome::Resolved
            }
            PendingRpc::Stream {
                id,
                command,
                mut records,
                reply,
            } => {
                records.push(fields);
                let count = records.len();
                self.pending = Some(PendingRpc::Stream {
                    id,
                    command,
                    records,
                    reply,
                });
                RpcOutcome::Accumulated(count)
            }
        }
    }

    /// Route an ERROR_STATE. `NoError` leaves the pending call alone.
    pub fn on_error(&mut self, code: ErrorCode) -> RpcOutcome {
        if !code.is_error() {
            return RpcOutcome::Ignored;
        }
        match self.pending.take() {
            Some(pending) => {
                debug!(command = %pending.command(), %code, "rejecting pending call");
                pending.fail(ProtocolError::Device(code));
                RpcOutcome::Rejected(code)
            }
            None => RpcOutcome::Ignored,
        }
    }

    /// Reject whatever is pending with `err`. Returns true if a call was dropped.
    pub fn abort(&mut self, err: ProtocolError) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.fail(err);
                true
            }
            None => false,
        }
    }

    /// Fail call `id` with `code` if it is still the pending one.
    pub fn reject(&mut self, id: CallId, code: ErrorCode) -> RpcOutcome {
        match self.take_if(id) {
            Some(pending) => {
                pending.fail(ProtocolError::Device(code));
                RpcOutcome::Rejected(code)
            }
            None => RpcOutcome::Ignored,
        }
    }

    /// Forget call `id` without resolving it. Returns false if it already
    /// completed.
    pub fn cancel(&mut self, id: CallId) -> bool {
        self.take_if(id).is_some()
    }

    fn take_if(&mut self, id: CallId) -> Option<PendingRpc> {
        if self.pending.as_ref().map(PendingRpc::id) == Some(id) {
            self.pending.take()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fields(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_single_resolves_on_matching_result() {
        let mut rpc = RpcCorrelator::new();
        let (_, mut rx) = rpc.begin(RpcCommand::RequestInfo).unwrap();

        let outcome = rpc.on_result(
            RpcCommand::RequestInfo,
            fields(&["ESPHome", "2024.6.0", "ESP32", "kitchen"]),
        );
        assert_eq!(outcome, RpcOutcome::Resolved);
        assert!(!rpc.is_pending());
        assert_eq!(
            rx.try_recv().unwrap().unwrap(),
            vec![fields(&["ESPHome", "2024.6.0", "ESP32", "kitchen"])]
        );
    }

    #[test]
    fn test_second_call_rejected() {
        let mut rpc = RpcCorrelator::new();
        let _rx = rpc.begin(RpcCommand::RequestWifiNetworks).unwrap();
        assert!(matches!(
            rpc.begin(RpcCommand::RequestInfo),
            Err(ProtocolError::CallInProgress)
        ));
        assert_eq!(rpc.pending_command(), Some(RpcCommand::RequestWifiNetworks));
    }

    #[test]
    fn test_stream_collects_until_terminator() {
        let mut rpc = RpcCorrelator::new();
        let (_, mut rx) = rpc.begin(RpcCommand::RequestWifiNetworks).unwrap();

        assert_eq!(
            rpc.on_result(RpcCommand::RequestWifiNetworks, fields(&["b", "-60", "YES"])),
            RpcOutcome::Accumulated(1)
        );
        assert_eq!(
            rpc.on_result(RpcCommand::RequestWifiNetworks, fields(&["a", "-70", "NO"])),
            RpcOutcome::Accumulated(2)
        );
        assert!(rx.try_recv().is_err());

        assert_eq!(
            rpc.on_result(RpcCommand::RequestWifiNetworks, Vec::new()),
            RpcOutcome::Resolved
        );
        assert_eq!(
            rx.try_recv().unwrap().unwrap(),
            vec![fields(&["b", "-60", "YES"]), fields(&["a", "-70", "NO"])]
        );
    }

    #[test]
    fn test_mismatched_result_ignored() {
        let mut rpc = RpcCorrelator::new();
        let (_, mut rx) = rpc.begin(RpcCommand::RequestInfo).unwrap();

        assert_eq!(
            rpc.on_result(RpcCommand::SendWifiSettings, fields(&["http://x"])),
            RpcOutcome::Ignored
        );
        assert!(rpc.is_pending());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_result_without_pending_call() {
        let mut rpc = RpcCorrelator::new();
        assert_eq!(
            rpc.on_result(RpcCommand::RequestInfo, Vec::new()),
            RpcOutcome::Ignored
        );
    }

    #[test]
    fn test_error_rejects_streaming_call() {
        let mut rpc = RpcCorrelator::new();
        let (_, mut rx) = rpc.begin(RpcCommand::RequestWifiNetworks).unwrap();
        rpc.on_result(RpcCommand::RequestWifiNetworks, fields(&["a", "-1", "NO"]));

        assert_eq!(
            rpc.on_error(ErrorCode::UnknownRpcCommand),
            RpcOutcome::Rejected(ErrorCode::UnknownRpcCommand)
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ProtocolError::Device(ErrorCode::UnknownRpcCommand))
        ));
    }

    #[test]
    fn test_no_error_keeps_call_pending() {
        let mut rpc = RpcCorrelator::new();
        let _rx = rpc.begin(RpcCommand::SendWifiSettings).unwrap();
        assert_eq!(rpc.on_error(ErrorCode::NoError), RpcOutcome::Ignored);
        assert!(rpc.is_pending());
    }

    #[test]
    fn test_abort_and_cancel() {
        let mut rpc = RpcCorrelator::new();
        let (_, mut rx) = rpc.begin(RpcCommand::RequestInfo).unwrap();
        assert!(rpc.abort(ProtocolError::Disconnected));
        assert!(matches!(rx.try_recv().unwrap(), Err(ProtocolError::Disconnected)));
        assert!(!rpc.abort(ProtocolError::Disconnected));

        let (id, _rx) = rpc.begin(RpcCommand::RequestCurrentState).unwrap();
        assert!(rpc.cancel(id));
        assert!(!rpc.cancel(id));
        assert!(rpc.begin(RpcCommand::RequestInfo).is_ok());
    }

    #[test]
    fn test_stale_id_leaves_newer_call_alone() {
        let mut rpc = RpcCorrelator::new();
        let (first, _rx) = rpc.begin(RpcCommand::RequestInfo).unwrap();
        rpc.on_result(RpcCommand::RequestInfo, fields(&["a", "b", "c", "d"]));

        let (second, mut rx) = rpc.begin(RpcCommand::RequestInfo).unwrap();
        assert_ne!(first, second);

        assert_eq!(rpc.reject(first, ErrorCode::Timeout), RpcOutcome::Ignored);
        assert!(!rpc.cancel(first));
        assert_eq!(rpc.pending_command(), Some(RpcCommand::RequestInfo));
        assert!(rx.try_recv().is_err());

        assert_eq!(
            rpc.reject(second, ErrorCode::Timeout),
            RpcOutcome::Rejected(ErrorCode::Timeout)
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ProtocolError::Device(ErrorCode::Timeout))
        ));
    }

    #[test]
    fn test_caller_gone_is_harmless() {
        let mut rpc = RpcCorrelator::new();
        drop(rpc.begin(RpcCommand::RequestInfo).unwrap());
        assert_eq!(
            rpc.on_result(RpcCommand::RequestInfo, Vec::new()),
            RpcOutcome::Resolved
        );
    }
}
