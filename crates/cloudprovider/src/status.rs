//! Network readiness state machine.
//!
//! Plugins never write a `NetworkStatus` directly. They report what they
//! observed about the external resource and [`converge`] derives the next
//! status from the previous one:
//!
//! | previous  | observation | next                         |
//! |-----------|-------------|------------------------------|
//! | none      | Pending     | Waiting                      |
//! | Waiting   | Pending     | Waiting                      |
//! | Ready     | Pending     | Ready (addresses kept)       |
//! | NotReady  | Pending     | Waiting                      |
//! | any       | Ready       | Ready                        |
//! | any       | Lost        | Waiting                      |
//! | any       | Disabled    | NotReady (addresses kept)    |
//!
//! A Ready pod only goes back to Waiting on an explicit `Lost`, so a slow or
//! failed poll of the load balancer never flaps a serving pod.
//! `lastTransitionTime` only moves when the state changes.

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use network_api::{NetworkAddress, NetworkState, NetworkStatus};

/// What a plugin saw when it checked the external resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Resource requested but not confirmed yet
    Pending,
    /// Resource serves traffic on these addresses
    Ready {
        /// In-cluster addresses
        internal: Vec<NetworkAddress>,
        /// Player-facing addresses
        external: Vec<NetworkAddress>,
    },
    /// Resource that used to exist is gone
    Lost,
    /// Network switched off for the pod
    Disabled,
}

/// Next status given the previous one and a fresh observation.
pub fn next_status(previous: Option<&NetworkStatus>, observation: Observation) -> NetworkStatus {
    let mut next = previous.cloned().unwrap_or_else(NetworkStatus::waiting);
    let previous_state = previous.map(|s| s.current_network_state);

    let state = match observation {
        Observation::Pending => {
            if previous_state == Some(NetworkState::Ready) {
                NetworkState::Ready
            } else {
                NetworkState::Waiting
            }
        }
        Observation::Ready { internal, external } => {
            next.internal_addresses = internal;
            next.external_addresses = external;
            NetworkState::Ready
        }
        Observation::Lost => {
            next.internal_addresses.clear();
            next.external_addresses.clear();
            NetworkState::Waiting
        }
        Observation::Disabled => NetworkState::NotReady,
    };

    let now = Utc::now();
    if next.create_time.is_none() {
        next.create_time = Some(now);
    }
    if previous_state != Some(state) || next.last_transition_time.is_none() {
        next.last_transition_time = Some(now);
    }
    next.current_network_state = state;
    next
}

/// Apply an observation to the pod's status annotation and return the new state.
///
/// A malformed existing annotation counts as no previous status.
pub fn converge(pod: &mut Pod, observation: Observation) -> NetworkState {
    let previous = NetworkStatus::from_pod(pod);
    let next = next_status(previous.as_ref(), observation);
    let state = next.current_network_state;
    next.write_to(pod);
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use network_api::{NetworkPort, Protocol, NETWORK_STATUS_ANNOTATION, set_pod_annotation};

    fn ready() -> Observation {
        Observation::Ready {
            internal: vec![NetworkAddress {
                ip: "10.0.0.5".to_string(),
                ports: vec![NetworkPort::new(7777, Protocol::Udp)],
                end_point: None,
            }],
            external: vec![NetworkAddress {
                ip: "47.1.2.3".to_string(),
                ports: vec![NetworkPort::new(501, Protocol::Udp)],
                end_point: None,
            }],
        }
    }

    #[test]
    fn test_waiting_waiting_ready() {
        let mut pod = Pod::default();
        assert_eq!(converge(&mut pod, Observation::Pending), NetworkState::Waiting);
        let first = NetworkStatus::from_pod(&pod).unwrap();

        assert_eq!(converge(&mut pod, Observation::Pending), NetworkState::Waiting);
        let second = NetworkStatus::from_pod(&pod).unwrap();
        assert_eq!(first.last_transition_time, second.last_transition_time);

        assert_eq!(converge(&mut pod, ready()), NetworkState::Ready);
        let third = NetworkStatus::from_pod(&pod).unwrap();
        assert_eq!(third.external_addresses[0].ip, "47.1.2.3");
        assert_eq!(third.create_time, first.create_time);
    }

    #[test]
    fn test_ready_never_regresses_on_pending() {
        let mut pod = Pod::default();
        converge(&mut pod, ready());
        let before = NetworkStatus::from_pod(&pod).unwrap();

        for _ in 0..3 {
            assert_eq!(converge(&mut pod, Observation::Pending), NetworkState::Ready);
        }
        assert_eq!(NetworkStatus::from_pod(&pod).unwrap(), before);
    }

    #[test]
    fn test_lost_resource_goes_back_to_waiting() {
        let mut pod = Pod::default();
        converge(&mut pod, ready());
        assert_eq!(converge(&mut pod, Observation::Lost), NetworkState::Waiting);
        let status = NetworkStatus::from_pod(&pod).unwrap();
        assert!(status.external_addresses.is_empty());
    }

    #[test]
    fn test_disabled_keeps_addresses() {
        let mut pod = Pod::default();
        converge(&mut pod, ready());
        assert_eq!(converge(&mut pod, Observation::Disabled), NetworkState::NotReady);
        assert_eq!(NetworkStatus::from_pod(&pod).unwrap().external_addresses.len(), 1);

        // re-enabled but not confirmed yet
        assert_eq!(converge(&mut pod, Observation::Pending), NetworkState::Waiting);
    }

    #[test]
    fn test_malformed_status_is_replaced() {
        let mut pod = Pod::default();
        set_pod_annotation(&mut pod, NETWORK_STATUS_ANNOTATION, "{not json".to_string());
        assert_eq!(converge(&mut pod, Observation::Pending), NetworkState::Waiting);
        assert!(NetworkStatus::from_pod(&pod).is_some());
    }
}
