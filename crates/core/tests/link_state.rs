//! Link state machine: the at-most-one-controller invariant under arbitrary
//! link/unlink sequences.

use ghostlink_core::link::{LinkDenied, LinkState};

#[test]
fn link_then_relink_is_refused_without_mutation() {
    let mut state = LinkState::default();
    assert!(state.try_link(1).is_ok());
    assert_eq!(state.controller(), Some(1));

    // The same client asking again is refused with the canonical message.
    let denied = state.try_link(1).unwrap_err();
    assert_eq!(denied, LinkDenied::AlreadyController);
    assert_eq!(denied.message(), "Already in control, cannot link!");
    assert_eq!(state.controller(), Some(1));

    // A different client is refused too, and the state is still untouched.
    assert_eq!(state.try_link(2).unwrap_err(), LinkDenied::OtherController);
    assert_eq!(state.controller(), Some(1));
}

#[test]
fn unlink_requires_the_controller() {
    let mut state = LinkState::default();
    state.try_link(1).unwrap();

    assert_eq!(state.try_unlink(Some(2)).unwrap_err(), LinkDenied::NotController);
    assert_eq!(state.controller(), Some(1));

    assert_eq!(state.try_unlink(Some(1)).unwrap(), Some(1));
    assert_eq!(state.controller(), None);

    // Unlinking again with an explicit client is a user error...
    assert_eq!(state.try_unlink(Some(1)).unwrap_err(), LinkDenied::NotLinked);
    // ...but the forced form is always a quiet no-op.
    assert_eq!(state.try_unlink(None).unwrap(), None);
}

#[test]
fn forced_unlink_skips_the_controller_check() {
    let mut state = LinkState::default();
    state.try_link(7).unwrap();
    assert_eq!(state.try_unlink(None).unwrap(), Some(7));
    assert!(!state.is_linked());
}

/// Drive the machine through a pseudo-random sequence of transitions from
/// several clients and check the invariant at every step.
#[test]
fn at_most_one_controller_always() {
    let mut state = LinkState::default();
    let mut linked: Option<u64> = None;

    // Simple LCG so the sequence is deterministic.
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    for _ in 0..10_000 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let client = (seed >> 33) % 5;
        let action = (seed >> 60) % 3;

        match action {
            0 => {
                let result = state.try_link(client);
                match linked {
                    None => {
                        assert!(result.is_ok());
                        linked = Some(client);
                    }
                    Some(_) => assert!(result.is_err()),
                }
            }
            1 => {
                let result = state.try_unlink(Some(client));
                if linked == Some(client) {
                    assert_eq!(result.unwrap(), Some(client));
                    linked = None;
                } else {
                    assert!(result.is_err());
                }
            }
            _ => {
                assert_eq!(state.try_unlink(None).unwrap(), linked.take());
            }
        }

        assert_eq!(state.controller(), linked);
    }
}
