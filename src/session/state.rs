//! Per-attempt negotiation state machine.

use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};

/// Phase of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Nothing has happened yet.
    Idle,
    /// The QUIC connection handshake is running.
    DialingTransport,
    /// The Noise handshake is running on the first stream.
    Handshaking,
    /// Both identities are proven and checked.
    Authenticated,
    /// The session is registered and usable for streams.
    Established,
    /// The attempt failed; nothing was registered.
    Failed,
}

impl NegotiationState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (Idle, DialingTransport)
            | (DialingTransport, Handshaking)
            | (Handshaking, Authenticated)
            | (Authenticated, Established) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// `Established` and `Failed` end the attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Established | NegotiationState::Failed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks one attempt through [`NegotiationState`].
#[derive(Debug)]
pub(crate) struct Negotiation {
    state: NegotiationState,
    label: String,
}

impl Negotiation {
    pub(crate) fn new(label: impl Into<String>) -> Self {
        Self {
            state: NegotiationState::Idle,
            label: label.into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> NegotiationState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: NegotiationState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::handshake(format!(
                "illegal transition {} -> {next}",
                self.state
            )));
        }
        debug!(attempt = %self.label, from = %self.state, to = %next, "negotiation");
        self.state = next;
        Ok(())
    }

    /// Move to `Failed` unless the attempt already ended.
    pub(crate) fn fail(&mut self, reason: &Error) {
        if self.state.is_terminal() {
            return;
        }
        debug!(attempt = %self.label, from = %self.state, error = %reason, "negotiation failed");
        self.state = NegotiationState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::NegotiationState::*;
    use super::*;

    #[test]
    fn happy_path_order() {
        let mut n = Negotiation::new("test");
        for next in [DialingTransport, Handshaking, Authenticated, Established] {
            n.advance(next).unwrap();
        }
        assert_eq!(n.state(), Established);
    }

    #[test]
    fn no_skipping_states() {
        let mut n = Negotiation::new("test");
        assert!(n.advance(Handshaking).is_err());
        n.advance(DialingTransport).unwrap();
        assert!(n.advance(Established).is_err());
        assert_eq!(n.state(), DialingTransport);
    }

    #[test]
    fn failure_from_any_non_terminal_state() {
        for from in [Idle, DialingTransport, Handshaking, Authenticated] {
            assert!(from.can_advance_to(Failed), "{from} -> Failed");
        }
        assert!(!Established.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(DialingTransport));
    }

    #[test]
    fn fail_is_sticky_after_terminal() {
        let mut n = Negotiation::new("test");
        n.advance(DialingTransport).unwrap();
        n.fail(&Error::Cancelled);
        assert_eq!(n.state(), Failed);
        assert!(n.advance(Handshaking).is_err());
        n.fail(&Error::Closed);
        assert_eq!(n.state(), Failed);
    }
}
