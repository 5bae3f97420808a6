use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// The four RPC interaction patterns.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    Unary,
    ServerStream,
    ClientStream,
    BidiStream,
}

impl CallShape {
    /// The client may send more than one request.
    #[must_use]
    pub fn client_streaming(self) -> bool {
        matches!(self, CallShape::ClientStream | CallShape::BidiStream)
    }

    /// The server may send more than one response.
    #[must_use]
    pub fn server_streaming(self) -> bool {
        matches!(self, CallShape::ServerStream | CallShape::BidiStream)
    }
}

impl std::fmt::Display for CallShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Created,
    Receiving,
    Sending,
    /// One direction has just been closed.
    HalfClosed,
    Completed,
    Failed,
}

/// Which end of the call a [`CallCore`] tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Per-call state machine.
///
/// Tracks message cardinality in both directions, half-close, and the
/// single terminal status. It performs no I/O: the connection layer reports
/// every frame it sends or receives and the core accepts or rejects it.
///
/// Inbound means requests on the server and responses on the client.
#[derive(Debug)]
pub struct CallCore {
    shape: CallShape,
    role: Role,
    state: CallState,
    received: u64,
    sent: u64,
    recv_closed: bool,
    send_closed: bool,
    status: Option<Result<()>>,
}

impl CallCore {
    #[must_use]
    pub fn new(shape: CallShape, role: Role) -> Self {
        Self {
            shape,
            role,
            state: CallState::Created,
            received: 0,
            sent: 0,
            recv_closed: false,
            send_closed: false,
            status: None,
        }
    }

    #[must_use]
    pub fn shape(&self) -> CallShape {
        self.shape
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }

    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent
    }

    #[must_use]
    pub fn recv_closed(&self) -> bool {
        self.recv_closed
    }

    #[must_use]
    pub fn send_closed(&self) -> bool {
        self.send_closed
    }

    /// The terminal status, once set.
    #[must_use]
    pub fn status(&self) -> Option<&Result<()>> {
        self.status.as_ref()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_some()
    }

    fn inbound_streaming(&self) -> bool {
        match self.role {
            Role::Server => self.shape.client_streaming(),
            Role::Client => self.shape.server_streaming(),
        }
    }

    fn outbound_streaming(&self) -> bool {
        match self.role {
            Role::Server => self.shape.server_streaming(),
            Role::Client => self.shape.client_streaming(),
        }
    }

    /// # Errors
    ///
    /// Returns `CallClosed` once a terminal status is set.
    pub fn ensure_open(&self) -> Result<()> {
        match self.status {
            Some(Ok(())) => Err(Error::new(ErrorKind::CallClosed, "call already completed")),
            Some(Err(ref e)) => Err(Error::new(
                ErrorKind::CallClosed,
                format!("call already failed: {e}"),
            )),
            None => Ok(()),
        }
    }

    /// Accepts one inbound message.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` for a message after end-of-stream or a second
    /// message on a non-streaming direction; the call is failed.
    pub fn on_recv(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.recv_closed {
            return Err(self.fail(Error::new(
                ErrorKind::Protocol,
                "message received after end of stream",
            )));
        }
        if !self.inbound_streaming() && self.received == 1 {
            return Err(self.fail(Error::new(
                ErrorKind::Protocol,
                format!("{} call received more than one message", self.shape),
            )));
        }
        self.received += 1;
        self.state = CallState::Receiving;
        Ok(())
    }

    /// Accepts the peer's end-of-stream marker.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` on a duplicate marker or when a non-streaming
    /// direction ends without its single message; the call is failed.
    pub fn on_recv_end(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.recv_closed {
            return Err(self.fail(Error::new(
                ErrorKind::Protocol,
                "duplicate end of stream",
            )));
        }
        if !self.inbound_streaming() && self.received != 1 {
            return Err(self.fail(Error::new(
                ErrorKind::Protocol,
                format!(
                    "{} call expects exactly one message, got {}",
                    self.shape, self.received
                ),
            )));
        }
        self.recv_closed = true;
        self.state = CallState::HalfClosed;
        Ok(())
    }

    /// Accepts one outbound message.
    ///
    /// # Errors
    ///
    /// Returns `CallClosed` after the terminal status and `Protocol` for a
    /// send after half-close or a second message on a non-streaming
    /// direction.
    pub fn on_send(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.send_closed {
            return Err(Error::new(
                ErrorKind::Protocol,
                "message sent after end of stream",
            ));
        }
        if !self.outbound_streaming() && self.sent == 1 {
            return Err(Error::new(
                ErrorKind::Protocol,
                format!("{} call cannot send more than one message", self.shape),
            ));
        }
        self.sent += 1;
        self.state = CallState::Sending;
        Ok(())
    }

    /// Half-closes the outbound direction. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` when a non-streaming direction closes without its
    /// single message.
    pub fn close_send(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.send_closed {
            return Ok(());
        }
        if !self.outbound_streaming() && self.sent != 1 {
            return Err(Error::new(
                ErrorKind::Protocol,
                format!("{} call must send exactly one message", self.shape),
            ));
        }
        self.send_closed = true;
        self.state = CallState::HalfClosed;
        Ok(())
    }

    /// Sets the terminal status.
    ///
    /// A successful status is downgraded to `Protocol` when the
    /// non-streaming direction did not carry exactly one message.
    ///
    /// # Errors
    ///
    /// Returns `CallClosed` if a terminal status was already set.
    pub fn finish(&mut self, status: Result<()>) -> Result<()> {
        self.ensure_open()?;
        let status = status.and_then(|()| {
            // responses flow out of the server and into the client.
            let (count, streaming) = match self.role {
                Role::Server => (self.sent, self.outbound_streaming()),
                Role::Client => (self.received, self.inbound_streaming()),
            };
            if streaming || count == 1 {
                Ok(())
            } else {
                Err(Error::new(
                    ErrorKind::Protocol,
                    format!("{} call completed with {count} responses", self.shape),
                ))
            }
        });
        self.recv_closed = true;
        self.send_closed = true;
        self.state = if status.is_ok() {
            CallState::Completed
        } else {
            CallState::Failed
        };
        self.status = Some(status);
        Ok(())
    }

    /// Fails the call unless it already ended and returns the error the
    /// caller should surface.
    pub fn fail(&mut self, err: Error) -> Error {
        match self.finish(Err(err.clone())) {
            Ok(()) => err,
            Err(closed) => closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unary_server() {
        let mut core = CallCore::new(CallShape::Unary, Role::Server);
        assert_eq!(core.state(), CallState::Created);
        core.on_recv().unwrap();
        assert_eq!(core.state(), CallState::Receiving);
        core.on_recv_end().unwrap();
        assert_eq!(core.state(), CallState::HalfClosed);
        core.on_send().unwrap();
        assert_eq!(core.state(), CallState::Sending);
        assert_eq!(core.on_send().unwrap_err().kind, ErrorKind::Protocol);
        core.finish(Ok(())).unwrap();
        assert_eq!(core.state(), CallState::Completed);
        assert_eq!(core.status(), Some(&Ok(())));

        assert_eq!(core.finish(Ok(())).unwrap_err().kind, ErrorKind::CallClosed);
        assert_eq!(core.on_send().unwrap_err().kind, ErrorKind::CallClosed);
        assert_eq!(core.on_recv().unwrap_err().kind, ErrorKind::CallClosed);
    }

    #[test]
    fn test_unary_cardinality() {
        let mut core = CallCore::new(CallShape::Unary, Role::Server);
        core.on_recv().unwrap();
        assert_eq!(core.on_recv().unwrap_err().kind, ErrorKind::Protocol);
        assert_eq!(core.state(), CallState::Failed);

        let mut core = CallCore::new(CallShape::Unary, Role::Server);
        assert_eq!(core.on_recv_end().unwrap_err().kind, ErrorKind::Protocol);
        assert_eq!(core.state(), CallState::Failed);

        // a handler that returns without responding.
        let mut core = CallCore::new(CallShape::Unary, Role::Server);
        core.on_recv().unwrap();
        core.on_recv_end().unwrap();
        core.finish(Ok(())).unwrap();
        assert_eq!(core.state(), CallState::Failed);
        assert_eq!(
            core.status().unwrap().as_ref().unwrap_err().kind,
            ErrorKind::Protocol
        );
    }

    #[test]
    fn test_server_stream() {
        let mut core = CallCore::new(CallShape::ServerStream, Role::Server);
        core.on_recv().unwrap();
        core.on_recv_end().unwrap();
        for _ in 0..7 {
            core.on_send().unwrap();
        }
        assert_eq!(core.sent(), 7);
        core.finish(Ok(())).unwrap();
        assert_eq!(core.state(), CallState::Completed);

        // zero responses is a valid stream.
        let mut core = CallCore::new(CallShape::ServerStream, Role::Server);
        core.on_recv().unwrap();
        core.on_recv_end().unwrap();
        core.finish(Ok(())).unwrap();
        assert_eq!(core.state(), CallState::Completed);

        // failing mid-stream keeps the failure as the status.
        let mut core = CallCore::new(CallShape::ServerStream, Role::Server);
        core.on_recv().unwrap();
        core.on_recv_end().unwrap();
        core.on_send().unwrap();
        core.finish(Err(Error::new(ErrorKind::Internal, "boom"))).unwrap();
        assert_eq!(core.state(), CallState::Failed);
        assert_eq!(core.sent(), 1);
    }

    #[test]
    fn test_client_stream() {
        let mut core = CallCore::new(CallShape::ClientStream, Role::Server);
        for _ in 0..3 {
            core.on_recv().unwrap();
        }
        core.on_recv_end().unwrap();
        assert_eq!(core.state(), CallState::HalfClosed);
        assert_eq!(core.on_recv().unwrap_err().kind, ErrorKind::Protocol);

        let mut core = CallCore::new(CallShape::ClientStream, Role::Server);
        core.on_recv_end().unwrap();
        core.on_send().unwrap();
        core.finish(Ok(())).unwrap();
        assert_eq!(core.received(), 0);
        assert_eq!(core.state(), CallState::Completed);
    }

    #[test]
    fn test_bidi_stream() {
        let mut core = CallCore::new(CallShape::BidiStream, Role::Server);
        core.on_send().unwrap();
        core.on_recv().unwrap();
        core.on_send().unwrap();
        core.on_recv().unwrap();
        core.on_recv_end().unwrap();
        assert!(core.recv_closed());
        core.on_send().unwrap();
        assert_eq!(core.state(), CallState::Sending);
        core.finish(Ok(())).unwrap();
        assert_eq!(core.state(), CallState::Completed);
    }

    #[test]
    fn test_client_role() {
        let mut core = CallCore::new(CallShape::Unary, Role::Client);
        assert_eq!(core.close_send().unwrap_err().kind, ErrorKind::Protocol);
        core.on_send().unwrap();
        assert_eq!(core.on_send().unwrap_err().kind, ErrorKind::Protocol);
        core.close_send().unwrap();
        core.close_send().unwrap();
        core.on_recv().unwrap();
        core.finish(Ok(())).unwrap();
        assert_eq!(core.state(), CallState::Completed);
        assert_eq!(core.on_send().unwrap_err().kind, ErrorKind::CallClosed);

        // an OK status without the single response is a protocol error.
        let mut core = CallCore::new(CallShape::Unary, Role::Client);
        core.on_send().unwrap();
        core.finish(Ok(())).unwrap();
        assert_eq!(core.state(), CallState::Failed);

        let mut core = CallCore::new(CallShape::ClientStream, Role::Client);
        core.close_send().unwrap();
        assert_eq!(core.on_send().unwrap_err().kind, ErrorKind::Protocol);
    }

    #[test]
    fn test_fail_keeps_first_status() {
        let mut core = CallCore::new(CallShape::BidiStream, Role::Client);
        let err = core.fail(Error::kind(ErrorKind::Cancelled));
        assert_eq!(err.kind, ErrorKind::Cancelled);
        let err = core.fail(Error::kind(ErrorKind::Transport));
        assert_eq!(err.kind, ErrorKind::CallClosed);
        assert_eq!(
            core.status().unwrap().as_ref().unwrap_err().kind,
            ErrorKind::Cancelled
        );
    }
}
