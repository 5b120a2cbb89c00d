use std::sync::Arc;

use thiserror::Error;

use crate::session::{Session, SessionError};

/// Minimal transport for handing sealed session frames to a physical engine.
pub trait FrameTransport: Send + Sync {
    /// Sends the provided serialized frame.
    fn send_frame(&self, bytes: &[u8]) -> Result<(), String>;
}

impl<T: FrameTransport + ?Sized> FrameTransport for Arc<T> {
    fn send_frame(&self, bytes: &[u8]) -> Result<(), String> {
        (**self).send_frame(bytes)
    }
}

/// Errors emitted from the channel helper.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("session not established")]
    NotEstablished,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Binds an established session to a physical transport.
#[derive(Debug)]
pub struct SecureChannel<T: FrameTransport> {
    session: Arc<Session>,
    transport: T,
}

impl<T: FrameTransport> SecureChannel<T> {
    pub fn new(session: Arc<Session>, transport: T) -> Self {
        Self { session, transport }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Seals `plaintext` and hands every pending ciphertext frame to the transport.
    ///
    /// # Guarantees
    /// * Only sends when the session is already established.
    /// * Frames leave in counter order; a transport failure stops the pump and
    ///   the remaining frames are dropped, so the peer sees a counter gap rather
    ///   than a reordering.
    pub fn send(&self, plaintext: &[u8]) -> Result<usize, ChannelError> {
        if !self.session.state().is_established() {
            return Err(ChannelError::NotEstablished);
        }
        self.session.send_audio_data(plaintext)?;
        self.pump()
    }

    /// Flushes queued ciphertext frames to the transport.
    pub fn pump(&self) -> Result<usize, ChannelError> {
        let frames = self.session.drain_audio_outbound();
        let mut sent = 0;
        for frame in frames {
            self.transport
                .send_frame(&frame)
                .map_err(ChannelError::Transport)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Queues an inbound ciphertext frame for [`SecureChannel::recv`].
    pub fn accept(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        self.session.deliver_audio_frame(frame)?;
        Ok(())
    }

    /// Pops and opens the next inbound frame, `None` when nothing is queued.
    pub fn recv(&self) -> Result<Option<Vec<u8>>, ChannelError> {
        Ok(self.session.receive_audio_data()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::e2e_common::establish_pair;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl FrameTransport for RecordingTransport {
        fn send_frame(&self, bytes: &[u8]) -> Result<(), String> {
            self.frames.lock().push(bytes.to_vec());
            Ok(())
        }
    }

    struct BrokenTransport;

    impl FrameTransport for BrokenTransport {
        fn send_frame(&self, _bytes: &[u8]) -> Result<(), String> {
            Err("link down".into())
        }
    }

    #[test]
    fn frames_flow_between_established_peers() {
        let (a, b) = establish_pair().unwrap();
        let tx = SecureChannel::new(Arc::new(a), RecordingTransport::default());
        let rx = SecureChannel::new(Arc::new(b), RecordingTransport::default());

        assert_eq!(tx.send(b"first").unwrap(), 1);
        assert_eq!(tx.send(b"second").unwrap(), 1);
        for frame in tx.transport().frames.lock().drain(..) {
            rx.accept(frame).unwrap();
        }
        assert_eq!(rx.recv().unwrap().as_deref(), Some(&b"first"[..]));
        assert_eq!(rx.recv().unwrap().as_deref(), Some(&b"second"[..]));
        assert_eq!(rx.recv().unwrap(), None);
    }

    #[test]
    fn refuses_before_establishment() {
        let channel = SecureChannel::new(Arc::new(Session::new()), RecordingTransport::default());
        assert!(matches!(channel.send(b"x"), Err(ChannelError::NotEstablished)));
        assert!(channel.transport().frames.lock().is_empty());
    }

    #[test]
    fn transport_failure_is_reported() {
        let (a, _b) = establish_pair().unwrap();
        let channel = SecureChannel::new(Arc::new(a), BrokenTransport);
        assert!(matches!(
            channel.send(b"x"),
            Err(ChannelError::Transport(msg)) if msg == "link down"
        ));
    }
}
