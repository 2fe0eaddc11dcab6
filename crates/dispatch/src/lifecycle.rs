use model::order::{Actor, OrderStatus};

use crate::{DispatchError, DispatchResult};

/// Side effects a legal transition obliges the orchestrator to run. The
/// decision function returns them as data; nothing here touches state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Void the outstanding offers of the winning wave.
    ClearWaveOffers,
    /// Fill the acceptance columns of the wave's dispatch log row.
    RecordAcceptance,
    /// Pin the driver id onto the order.
    AssignDriver,
    DriverToOnTrip,
    NotifyPassenger,
    RecordArrivedAt,
    RecordStartedAt,
    /// Copy meter amount, distance, duration and photo onto the order.
    RecordSettlement,
    RecordCompletedAt,
    DriverToAvailable,
    /// Open the order for rating attachment.
    RatingsHook,
    IncrementStats,
    /// Ticket of the originating zone is spent for good.
    ConsumeZoneTicket,
    /// Ticket returns to the zone pool (cancellation before acceptance).
    ReleaseZoneTicket,
    NotifyCounterparty,
    ClearDriverAssignment,
}

/// Transition authority table. Total over
/// `(current, requested, actor)`; anything not listed is a BAD_TRANSITION
/// and must leave every piece of state untouched.
pub fn decide(
    current: OrderStatus,
    requested: OrderStatus,
    actor: Actor,
) -> DispatchResult<Vec<SideEffect>> {
    use OrderStatus::*;
    use SideEffect::*;

    let illegal = || {
        Err(DispatchError::BadTransition {
            from: current,
            to: requested,
        })
    };

    match (current, requested) {
        (Offered, Accepted) => match actor {
            Actor::Driver => Ok(vec![
                ClearWaveOffers,
                RecordAcceptance,
                AssignDriver,
                DriverToOnTrip,
                NotifyPassenger,
            ]),
            _ => illegal(),
        },
        (Accepted, Arrived) => match actor {
            Actor::Driver => Ok(vec![RecordArrivedAt, NotifyPassenger]),
            _ => illegal(),
        },
        (Arrived, OnTrip) => match actor {
            Actor::Driver => Ok(vec![RecordStartedAt, NotifyPassenger]),
            _ => illegal(),
        },
        (OnTrip, Settling) => match actor {
            Actor::Driver => Ok(vec![RecordSettlement, NotifyPassenger]),
            _ => illegal(),
        },
        (Settling, Done) => match actor {
            Actor::Driver => Ok(vec![
                RecordCompletedAt,
                DriverToAvailable,
                RatingsHook,
                IncrementStats,
                ConsumeZoneTicket,
                NotifyPassenger,
            ]),
            _ => illegal(),
        },
        (from, Cancelled) if from.cancellable() => {
            let mut effects = vec![NotifyCounterparty, ClearDriverAssignment];
            if from == Offered {
                effects.push(ReleaseZoneTicket);
                effects.push(ClearWaveOffers);
            }
            Ok(effects)
        }
        _ => illegal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderStatus::*;

    #[test]
    fn happy_path_edges_are_legal_for_the_driver() {
        for (from, to) in [
            (Offered, Accepted),
            (Accepted, Arrived),
            (Arrived, OnTrip),
            (OnTrip, Settling),
            (Settling, Done),
        ] {
            assert!(decide(from, to, Actor::Driver).is_ok(), "{} -> {}", from, to);
        }
    }

    #[test]
    fn skipping_a_phase_is_refused() {
        assert!(matches!(
            decide(Offered, Arrived, Actor::Driver),
            Err(DispatchError::BadTransition { .. })
        ));
        assert!(matches!(
            decide(Accepted, Settling, Actor::Driver),
            Err(DispatchError::BadTransition { .. })
        ));
    }

    #[test]
    fn regression_is_refused() {
        assert!(decide(OnTrip, Accepted, Actor::Driver).is_err());
        assert!(decide(Done, Cancelled, Actor::Admin).is_err());
    }

    #[test]
    fn only_the_driver_advances_the_trip() {
        assert!(decide(Accepted, Arrived, Actor::Passenger).is_err());
        assert!(decide(Offered, Accepted, Actor::System).is_err());
        assert!(decide(OnTrip, Settling, Actor::Admin).is_err());
    }

    #[test]
    fn cancellation_window_closes_at_on_trip() {
        for from in [Offered, Accepted, Arrived] {
            assert!(decide(from, Cancelled, Actor::Passenger).is_ok());
        }
        for from in [OnTrip, Settling, Done, Cancelled] {
            assert!(decide(from, Cancelled, Actor::Passenger).is_err());
        }
    }

    #[test]
    fn cancelling_an_offered_order_returns_its_zone_ticket() {
        let effects = decide(Offered, Cancelled, Actor::System).unwrap();
        assert!(effects.contains(&SideEffect::ReleaseZoneTicket));

        let effects = decide(Accepted, Cancelled, Actor::Passenger).unwrap();
        assert!(!effects.contains(&SideEffect::ReleaseZoneTicket));
    }

    #[test]
    fn completion_settles_the_zone_ticket_for_good() {
        let effects = decide(Settling, Done, Actor::Driver).unwrap();
        assert!(effects.contains(&SideEffect::ConsumeZoneTicket));
        assert!(effects.contains(&SideEffect::IncrementStats));
    }
}
