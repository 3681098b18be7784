//! Pairing state machine
//!
//! Pure transition logic: inputs go in, a list of actions comes out. The
//! device actor performs the actions (sending packets, touching the trust
//! store, arming the timer), which keeps every transition testable without
//! sockets or clocks.
//!
//! | Input (state) | Actions | Next |
//! |---|---|---|
//! | request (NotPaired) | send request, start timer | RequestedByLocal |
//! | timer (RequestedByLocal) | send cancel, signal timeout | NotPaired |
//! | peer request (NotPaired) | signal request | RequestedByPeer |
//! | peer `pair:true` (RequestedByLocal) | stop timer, record trust | Paired |
//! | accept or request (RequestedByPeer) | send accept, record trust | Paired |
//! | reject (RequestedByPeer) | send reject | NotPaired |
//! | peer `pair:false` (RequestedByLocal) | stop timer, signal rejection | NotPaired |
//! | peer `pair:false` (RequestedByPeer) | signal rejection | NotPaired |
//! | peer `pair:false` (Paired) | clear trust, signal unpaired | NotPaired |
//! | peer request (Paired) | send accept | Paired |
//! | unpair (any) | send unpair, clear trust | NotPaired |

use crate::error::{ProtocolError, Result};
use crate::protocol::PairPacket;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Pairing status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PairState {
    #[default]
    NotPaired,
    /// We asked and wait for the peer
    RequestedByLocal,
    /// The peer asked and waits for the user
    RequestedByPeer,
    Paired,
}

impl PairState {
    pub fn is_paired(&self) -> bool {
        matches!(self, PairState::Paired)
    }
}

/// Something that can move the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingInput {
    RequestPairing,
    AcceptPairing,
    RejectPairing,
    Unpair,
    TimerExpired,
    PeerPacket(PairPacket),
}

/// Side effect the owner must carry out, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingAction {
    Send(PairPacket),
    StartTimer,
    CancelTimer,
    RecordTrust,
    ClearTrust,
    Notify(PairingSignal),
}

/// Outcome reported to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingSignal {
    /// The peer wants to pair; `timestamp` feeds the verification key
    RequestReceived { timestamp: Option<i64> },
    Timeout,
    Success,
    Rejected,
    Unpaired,
}

/// Pairing state of one device
#[derive(Debug, Clone, Default)]
pub struct PairingStateMachine {
    state: PairState,
}

impl PairingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a stored state; a pending request never survives a restart
    pub fn with_state(state: PairState) -> Self {
        let state = match state {
            PairState::Paired => PairState::Paired,
            _ => PairState::NotPaired,
        };
        Self { state }
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    /// Forget any pairing progress without side effects
    ///
    /// Used when the trust store no longer vouches for the peer.
    pub fn reset(&mut self) {
        self.state = PairState::NotPaired;
    }

    /// Mark as paired because the trust store already vouches for the peer
    pub fn restore_paired(&mut self) {
        self.state = PairState::Paired;
    }

    /// Apply one input
    ///
    /// Local inputs that make no sense in the current state fail with
    /// `ProtocolError::Pairing`. Peer packets and timer expiries that do
    /// not apply are ignored and produce no actions.
    pub fn handle(&mut self, input: PairingInput) -> Result<Vec<PairingAction>> {
        use PairState::*;
        use PairingAction::*;

        let previous = self.state;
        let (next, actions) = match (&input, previous) {
            (PairingInput::RequestPairing, NotPaired) => (
                RequestedByLocal,
                vec![Send(PairPacket::request()), StartTimer],
            ),
            (PairingInput::RequestPairing, RequestedByLocal) => {
                return Err(ProtocolError::pairing("pairing already requested"));
            }
            // Both users asked; the local request answers the peer's
            (PairingInput::RequestPairing, RequestedByPeer) => (
                Paired,
                vec![
                    Send(PairPacket::accept()),
                    RecordTrust,
                    Notify(PairingSignal::Success),
                ],
            ),
            (PairingInput::RequestPairing, Paired) => {
                return Err(ProtocolError::pairing("already paired"));
            }

            (PairingInput::AcceptPairing, RequestedByPeer) => (
                Paired,
                vec![
                    Send(PairPacket::accept()),
                    RecordTrust,
                    Notify(PairingSignal::Success),
                ],
            ),
            (PairingInput::RejectPairing, RequestedByPeer) => {
                (NotPaired, vec![Send(PairPacket::reject())])
            }
            (PairingInput::AcceptPairing | PairingInput::RejectPairing, state) => {
                return Err(ProtocolError::pairing(format!(
                    "no pending request from the peer ({:?})",
                    state
                )));
            }

            (PairingInput::Unpair, state) => {
                let mut actions = Vec::new();
                if state == RequestedByLocal {
                    actions.push(CancelTimer);
                }
                actions.push(Send(PairPacket::reject()));
                actions.push(ClearTrust);
                if state != NotPaired {
                    actions.push(Notify(PairingSignal::Unpaired));
                }
                (NotPaired, actions)
            }

            (PairingInput::TimerExpired, RequestedByLocal) => (
                NotPaired,
                vec![
                    Send(PairPacket::reject()),
                    Notify(PairingSignal::Timeout),
                ],
            ),
            (PairingInput::TimerExpired, state) => {
                debug!("Ignoring stale pairing timer in {:?}", state);
                (state, Vec::new())
            }

            (PairingInput::PeerPacket(packet), state) if packet.pair => match state {
                NotPaired => (
                    RequestedByPeer,
                    vec![Notify(PairingSignal::RequestReceived {
                        timestamp: packet.timestamp,
                    })],
                ),
                // Covers both the peer's answer and a simultaneous request
                RequestedByLocal => (
                    Paired,
                    vec![CancelTimer, RecordTrust, Notify(PairingSignal::Success)],
                ),
                RequestedByPeer => {
                    debug!("Repeated pair request while waiting for the user");
                    (RequestedByPeer, Vec::new())
                }
                // The peer lost its pairing; confirm ours. Accepts are not
                // answered so two paired devices cannot loop.
                Paired if packet.timestamp.is_some() => {
                    (Paired, vec![Send(PairPacket::accept())])
                }
                Paired => (Paired, Vec::new()),
            },

            (PairingInput::PeerPacket(_), state) => match state {
                NotPaired => (NotPaired, Vec::new()),
                RequestedByLocal => (
                    NotPaired,
                    vec![CancelTimer, Notify(PairingSignal::Rejected)],
                ),
                RequestedByPeer => (NotPaired, vec![Notify(PairingSignal::Rejected)]),
                Paired => (
                    NotPaired,
                    vec![ClearTrust, Notify(PairingSignal::Unpaired)],
                ),
            },
        };

        if next != previous {
            debug!("Pair state {:?} -> {:?} on {:?}", previous, next, input);
        }
        self.state = next;
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PairingAction::*;

    fn machine(state: PairState) -> PairingStateMachine {
        PairingStateMachine { state }
    }

    fn peer(pair: bool, timestamp: Option<i64>) -> PairingInput {
        PairingInput::PeerPacket(PairPacket { pair, timestamp })
    }

    #[test]
    fn test_local_request_then_accept() {
        let mut sm = PairingStateMachine::new();
        let actions = sm.handle(PairingInput::RequestPairing).unwrap();
        assert_eq!(sm.state(), PairState::RequestedByLocal);
        assert!(matches!(actions[0], Send(PairPacket { pair: true, timestamp: Some(_) })));
        assert_eq!(actions[1], StartTimer);

        let actions = sm.handle(peer(true, None)).unwrap();
        assert_eq!(sm.state(), PairState::Paired);
        assert_eq!(
            actions,
            vec![CancelTimer, RecordTrust, Notify(PairingSignal::Success)]
        );
    }

    #[test]
    fn test_mutual_request_pairs_without_accept() {
        let mut sm = PairingStateMachine::new();
        sm.handle(PairingInput::RequestPairing).unwrap();
        let actions = sm.handle(peer(true, Some(1_700_000_000))).unwrap();
        assert_eq!(sm.state(), PairState::Paired);
        assert!(actions.contains(&RecordTrust));
        assert!(!actions.iter().any(|a| matches!(a, Send(_))));
    }

    #[test]
    fn test_local_request_answers_pending_peer_request() {
        let mut sm = machine(PairState::RequestedByPeer);
        let actions = sm.handle(PairingInput::RequestPairing).unwrap();
        assert_eq!(sm.state(), PairState::Paired);
        assert_eq!(
            actions,
            vec![
                Send(PairPacket::accept()),
                RecordTrust,
                Notify(PairingSignal::Success)
            ]
        );
    }

    #[test]
    fn test_timeout_signals_once() {
        let mut sm = PairingStateMachine::new();
        sm.handle(PairingInput::RequestPairing).unwrap();

        let actions = sm.handle(PairingInput::TimerExpired).unwrap();
        assert_eq!(sm.state(), PairState::NotPaired);
        assert_eq!(
            actions,
            vec![Send(PairPacket::reject()), Notify(PairingSignal::Timeout)]
        );

        assert!(sm.handle(PairingInput::TimerExpired).unwrap().is_empty());
    }

    #[test]
    fn test_peer_request_accept_and_reject() {
        let mut sm = PairingStateMachine::new();
        let actions = sm.handle(peer(true, Some(42))).unwrap();
        assert_eq!(sm.state(), PairState::RequestedByPeer);
        assert_eq!(
            actions,
            vec![Notify(PairingSignal::RequestReceived { timestamp: Some(42) })]
        );

        let actions = sm.handle(PairingInput::AcceptPairing).unwrap();
        assert_eq!(sm.state(), PairState::Paired);
        assert_eq!(actions[0], Send(PairPacket::accept()));
        assert!(actions.contains(&RecordTrust));

        let mut sm = machine(PairState::RequestedByPeer);
        let actions = sm.handle(PairingInput::RejectPairing).unwrap();
        assert_eq!(sm.state(), PairState::NotPaired);
        assert_eq!(actions, vec![Send(PairPacket::reject())]);
    }

    #[test]
    fn test_peer_rejects_and_withdraws() {
        let mut sm = machine(PairState::RequestedByLocal);
        let actions = sm.handle(peer(false, None)).unwrap();
        assert_eq!(sm.state(), PairState::NotPaired);
        assert_eq!(actions, vec![CancelTimer, Notify(PairingSignal::Rejected)]);

        let mut sm = machine(PairState::RequestedByPeer);
        sm.handle(peer(false, None)).unwrap();
        assert_eq!(sm.state(), PairState::NotPaired);

        let mut sm = machine(PairState::Paired);
        let actions = sm.handle(peer(false, None)).unwrap();
        assert_eq!(sm.state(), PairState::NotPaired);
        assert_eq!(actions, vec![ClearTrust, Notify(PairingSignal::Unpaired)]);
    }

    #[test]
    fn test_paired_reaffirms_requests_only() {
        let mut sm = machine(PairState::Paired);
        assert_eq!(
            sm.handle(peer(true, Some(5))).unwrap(),
            vec![Send(PairPacket::accept())]
        );
        assert!(sm.handle(peer(true, None)).unwrap().is_empty());
        assert_eq!(sm.state(), PairState::Paired);
    }

    #[test]
    fn test_unpair_from_any_state() {
        for state in [
            PairState::NotPaired,
            PairState::RequestedByLocal,
            PairState::RequestedByPeer,
            PairState::Paired,
        ] {
            let mut sm = machine(state);
            let actions = sm.handle(PairingInput::Unpair).unwrap();
            assert_eq!(sm.state(), PairState::NotPaired);
            assert!(actions.contains(&Send(PairPacket::reject())));
            assert!(actions.contains(&ClearTrust));
            assert_eq!(
                actions.contains(&Notify(PairingSignal::Unpaired)),
                state != PairState::NotPaired
            );
            assert_eq!(
                actions.contains(&CancelTimer),
                state == PairState::RequestedByLocal
            );
        }
    }

    #[test]
    fn test_invalid_local_inputs() {
        let mut sm = machine(PairState::Paired);
        assert!(sm.handle(PairingInput::RequestPairing).is_err());
        assert!(sm.handle(PairingInput::AcceptPairing).is_err());
        assert_eq!(sm.state(), PairState::Paired);

        let mut sm = machine(PairState::RequestedByLocal);
        assert!(sm.handle(PairingInput::RequestPairing).is_err());
        assert!(sm.handle(PairingInput::RejectPairing).is_err());
        assert_eq!(sm.state(), PairState::RequestedByLocal);
    }

    #[test]
    fn test_restored_state_drops_pending_requests() {
        assert_eq!(
            PairingStateMachine::with_state(PairState::RequestedByLocal).state(),
            PairState::NotPaired
        );
        assert_eq!(
            PairingStateMachine::with_state(PairState::Paired).state(),
            PairState::Paired
        );
    }
}
