use serde::{Deserialize, Serialize};

/// Lifecycle of one peer-connection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Connection state as reported by the underlying WebRTC engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        self == PeerState::Closed
    }

    pub fn is_lost(self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed)
    }

    /// `new -> connecting` on an explicit connect call.
    pub fn begin_connect(self) -> Option<PeerState> {
        match self {
            PeerState::New => Some(PeerState::Connecting),
            _ => None,
        }
    }

    /// Next state for a transport report, or `None` when the report changes nothing.
    pub fn on_transport(self, reported: TransportState) -> Option<PeerState> {
        if self.is_terminal() {
            return None;
        }

        let next = match (self, reported) {
            (_, TransportState::Failed) => PeerState::Failed,
            // The engine closing on its own is a failure; only disconnect() closes cleanly.
            (_, TransportState::Closed) => PeerState::Failed,
            (PeerState::Connecting | PeerState::Disconnected, TransportState::Connected) => {
                PeerState::Connected
            }
            (PeerState::Connected | PeerState::Connecting, TransportState::Disconnected) => {
                PeerState::Disconnected
            }
            (PeerState::New, TransportState::Connecting) => PeerState::Connecting,
            _ => return None,
        };

        if next == self {
            None
        } else {
            Some(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let state = PeerState::New.begin_connect().unwrap();
        assert_eq!(state, PeerState::Connecting);
        let state = state.on_transport(TransportState::Connected).unwrap();
        assert_eq!(state, PeerState::Connected);
        let state = state.on_transport(TransportState::Disconnected).unwrap();
        assert_eq!(state, PeerState::Disconnected);
        assert!(state.is_lost());
    }

    #[test]
    fn test_any_state_can_fail_except_closed() {
        for state in [
            PeerState::New,
            PeerState::Connecting,
            PeerState::Connected,
            PeerState::Disconnected,
        ] {
            assert_eq!(
                state.on_transport(TransportState::Failed),
                Some(PeerState::Failed)
            );
        }
        assert_eq!(PeerState::Failed.on_transport(TransportState::Failed), None);
        assert_eq!(PeerState::Closed.on_transport(TransportState::Failed), None);
        assert_eq!(PeerState::Closed.on_transport(TransportState::Connected), None);
    }

    #[test]
    fn test_connect_only_from_new() {
        assert_eq!(PeerState::Connected.begin_connect(), None);
        assert_eq!(PeerState::Closed.begin_connect(), None);
    }
}
