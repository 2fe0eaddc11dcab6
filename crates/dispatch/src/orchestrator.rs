use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use model::{
    dispatch_log::{DispatchLog, RankedCandidate, ScoreWeights, WaveAcceptance},
    driver::Driver,
    order::{
        Actor, DispatchMethod, Order, OrderStatus, PaymentKind, Settlement,
    },
    passenger::Passenger,
    rejection::{RejectionFeatures, RejectionReason, RejectionRecord},
    GeoPoint, Place,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use utility::{
    clock::Clock,
    id::{Id, IdMinter},
};

use crate::{
    config::DispatchConfig,
    eta::{EtaCache, RouteProvider},
    lifecycle::{self, SideEffect},
    predictor::{self, OfferFeatures, Predictor},
    presence::PresenceRegistry,
    scoring::{self, CandidateInput},
    storage::{
        AssignOutcome, Database, DispatchLogRepo, DriverRepo, OrderRepo,
        PassengerRepo, RejectionRepo, StatsRepo, StorageError,
    },
    transport::{DriverEvent, DriverGateway, PassengerEvent, PassengerGateway},
    zones::{Admission, ZoneEngine},
    DispatchError, DispatchResult,
};

const BOUNDED_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 50;

/// Ride request as it arrives from the outside. The passenger contact
/// snapshot lets a first-time caller be registered on the fly.
#[derive(Debug, Clone)]
pub struct SubmitRideRequest {
    pub passenger_id: Option<Id<Passenger>>,
    pub passenger_name: Option<String>,
    pub passenger_phone: String,
    pub pickup: Place,
    pub destination: Option<Place>,
    pub payment: PaymentKind,
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Dispatched {
        order: Order,
        offered_to: Vec<Id<Driver>>,
    },
    /// Zone at capacity with queueing enabled; dispatch starts at admission.
    Queued { order: Order, position: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted,
    /// Second accept of the winner; no state moves.
    AlreadyAcceptedByYou,
}

#[derive(Debug, Clone)]
pub struct NearbyDriverInfo {
    pub driver_id: Id<Driver>,
    pub name: String,
    pub plate: String,
    pub location: GeoPoint,
    pub rating: f64,
    pub distance_m: f64,
    pub eta_s: f64,
}

enum WaveSignal {
    Accepted,
    AllResponded,
}

/// Snapshot of what a recipient was offered, kept for the rejection record.
struct OfferSnapshot {
    features: OfferFeatures,
    offered_at: DateTime<Utc>,
}

struct WaveState {
    number: u32,
    recipients: Vec<Id<Driver>>,
    offered_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    responded: HashMap<Id<Driver>, RejectionReason>,
    offers: HashMap<Id<Driver>, OfferSnapshot>,
    signals: mpsc::Sender<WaveSignal>,
}

impl WaveState {
    fn all_responded(&self) -> bool {
        self.recipients
            .iter()
            .all(|driver| self.responded.contains_key(driver))
    }
}

struct LiveOrderState {
    order: Order,
    wave: Option<WaveState>,
    /// Drivers who rejected or timed out on any wave of this order; they
    /// never reappear in a later wave.
    attempted: HashSet<Id<Driver>>,
    holds_zone_ticket: bool,
}

struct LiveOrder {
    lock: Mutex<LiveOrderState>,
    abort: CancellationToken,
}

/// Everything a wave offer carries per recipient.
struct PreparedOffer {
    driver_id: Id<Driver>,
    score: f64,
    predicted_eta_s: f64,
    rejection_probability: f64,
    reason: String,
    auto_accept_score: f64,
    features: OfferFeatures,
}

/// Top-level owner of every non-terminal order. All mutations of one order
/// pass through its cell's mutex, which is what serializes the acceptance
/// race and keeps observers agreeing on transition order.
pub struct Dispatcher<D: Database> {
    database: D,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
    weights: ScoreWeights,
    minter: IdMinter,
    pub presence: Arc<PresenceRegistry>,
    pub zones: Arc<ZoneEngine<D>>,
    pub eta: Arc<EtaCache<D>>,
    pub predictor: Arc<Predictor<D>>,
    pub drivers: Arc<DriverGateway>,
    pub passengers: Arc<PassengerGateway>,
    live: RwLock<HashMap<Id<Order>, Arc<LiveOrder>>>,
    /// Terminal rows whose persist failed; retried on every sweep until
    /// storage takes them.
    dirty: Mutex<Vec<Order>>,
    last_now_ms: AtomicI64,
}

impl<D: Database> Dispatcher<D> {
    pub fn new(
        database: D,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
        route_provider: Option<Arc<dyn RouteProvider>>,
    ) -> Arc<Self> {
        let eta = Arc::new(EtaCache::new(
            database.clone(),
            route_provider,
            config.eta_cache_ttl,
            config.eta_quantization_deg,
            config.fallback_speed_kmh,
        ));
        let predictor = Arc::new(Predictor::new(
            database.clone(),
            config.predictor_prior,
            config.earnings_penalty,
        ));
        let zones = Arc::new(ZoneEngine::new(database.clone()));
        Arc::new(Self {
            database,
            clock,
            config,
            weights: ScoreWeights::default(),
            minter: IdMinter::new(),
            presence: Arc::new(PresenceRegistry::new()),
            zones,
            eta,
            predictor,
            drivers: Arc::new(DriverGateway::new()),
            passengers: Arc::new(PassengerGateway::new()),
            live: RwLock::new(HashMap::new()),
            dirty: Mutex::new(Vec::new()),
            last_now_ms: AtomicI64::new(i64::MIN),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Reads the clock and flags regressions. A backwards jump is a fatal
    /// condition; it is alerted and the highest observed instant is kept so
    /// deadline math never runs in reverse.
    fn now(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let millis = now.timestamp_millis();
        let previous = self.last_now_ms.fetch_max(millis, Ordering::SeqCst);
        if previous != i64::MIN && millis < previous {
            error!(
                "clock went backwards by {} ms; keeping monotonic reading",
                previous - millis
            );
            return DateTime::from_timestamp_millis(previous).unwrap_or(now);
        }
        now
    }

    // ------------------------------------------------------------------
    // submit
    // ------------------------------------------------------------------

    pub async fn submit_ride(
        self: &Arc<Self>,
        request: SubmitRideRequest,
    ) -> DispatchResult<SubmitOutcome> {
        let now = self.now();

        if request.passenger_phone.trim().is_empty() {
            return Err(DispatchError::Validation(
                "passenger phone is required".to_owned(),
            ));
        }
        if !request.pickup.point.in_valid_range() {
            return Err(DispatchError::Validation(
                "pickup coordinates out of range".to_owned(),
            ));
        }
        if let Some(destination) = &request.destination {
            if !destination.point.in_valid_range() {
                return Err(DispatchError::Validation(
                    "destination coordinates out of range".to_owned(),
                ));
            }
        }
        if !self.config.service_area.contains(&request.pickup.point) {
            return Err(DispatchError::Validation(
                "pickup outside service area".to_owned(),
            ));
        }

        let passenger = self.resolve_passenger(&request).await?;
        if passenger.is_blocked {
            return Err(DispatchError::PassengerBlocked);
        }

        // Zone admission gates and prices the request before any candidate
        // work is spent on it.
        let admission = self.zones.reserve(&request.pickup.point, now).await;
        let (zone_name, surge_multiplier, holds_ticket, queued_position) =
            match admission {
                Admission::Full { zone_name } => {
                    return Err(DispatchError::ZoneFull { zone: zone_name });
                }
                Admission::Outside => (None, 1.0, false, None),
                Admission::Admitted {
                    zone_name,
                    surge_multiplier,
                    ..
                } => (Some(zone_name), surge_multiplier, true, None),
                Admission::Queued {
                    zone_name,
                    position,
                    ..
                } => (Some(zone_name), 1.0, false, Some(position)),
            };

        let trip_distance_m = match &request.destination {
            Some(destination) => Some(
                self.eta
                    .lookup(request.pickup.point, destination.point, now)
                    .await
                    .distance_m,
            ),
            None => None,
        };
        let estimated_fare = self
            .config
            .fare
            .estimate(trip_distance_m.unwrap_or(0.0), surge_multiplier);

        let order = Order {
            id: self.minter.mint("ord"),
            passenger_id: passenger.id.clone(),
            driver_id: None,
            status: OrderStatus::Offered,
            pickup: request.pickup.clone(),
            destination: request.destination.clone(),
            payment: request.payment,
            meter_amount: None,
            estimated_fare,
            actual_distance_m: None,
            actual_duration_s: None,
            photo_url: None,
            created_at: now,
            offered_at: None,
            accepted_at: None,
            arrived_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            reject_count: 0,
            batch_number: 0,
            dispatch_method: if queued_position.is_some() {
                DispatchMethod::ZoneQueue
            } else if self.config.broadcast_fallback {
                DispatchMethod::Broadcast
            } else {
                DispatchMethod::Ranked
            },
            hour_of_day: now.hour() as u8,
            day_of_week: now.weekday().num_days_from_monday() as u8,
            cancel_reason: None,
            cancelled_by: None,
            surge_multiplier,
            zone_name: zone_name.clone(),
        };

        if let Err(why) = self.insert_order_with_retry(&order).await {
            // Give the ticket back; the order never existed.
            if holds_ticket {
                if let Some(zone) = &zone_name {
                    self.zones.release(zone, now).await;
                }
            }
            return Err(why);
        }

        let cell = Arc::new(LiveOrder {
            lock: Mutex::new(LiveOrderState {
                order: order.clone(),
                wave: None,
                attempted: HashSet::new(),
                holds_zone_ticket: holds_ticket,
            }),
            abort: CancellationToken::new(),
        });
        self.live
            .write()
            .await
            .insert(order.id.clone(), cell.clone());

        if let Some(position) = queued_position {
            self.zones
                .enqueue(
                    zone_name.as_deref().unwrap_or_default(),
                    order.id.clone(),
                    now,
                )
                .await;
            info!(
                "order {} queued at position {} in zone {:?}",
                order.id, position, zone_name
            );
            return Ok(SubmitOutcome::Queued { order, position });
        }

        let mut state = cell.lock.lock().await;
        let offered_to = self.launch_wave(&cell, &mut state, 1).await?;
        if offered_to.is_empty() {
            self.finish_no_driver(&cell, &mut state).await;
        }
        let order = state.order.clone();
        drop(state);
        Ok(SubmitOutcome::Dispatched { order, offered_to })
    }

    async fn resolve_passenger(
        &self,
        request: &SubmitRideRequest,
    ) -> DispatchResult<Passenger> {
        let mut handle = self.database.auto();
        if let Some(id) = &request.passenger_id {
            match handle.get_passenger(id).await {
                Ok(passenger) => return Ok(passenger),
                Err(StorageError::NotFound) => {}
                Err(why) => return Err(why.into()),
            }
        }
        // Phone is the identity anchor: a known number rebinds, an unknown
        // one registers on the fly.
        if let Some(passenger) =
            handle.passenger_by_phone(&request.passenger_phone).await?
        {
            return Ok(passenger);
        }
        let passenger = Passenger {
            id: self.minter.mint("pax"),
            phone: request.passenger_phone.clone(),
            name: request.passenger_name.clone(),
            email: None,
            is_blocked: false,
            rating: 5.0,
            total_trips: 0,
        };
        handle.insert_passenger(&passenger).await?;
        Ok(passenger)
    }

    // ------------------------------------------------------------------
    // waves
    // ------------------------------------------------------------------

    /// Ranks candidates, writes the dispatch log, pushes the offers and
    /// spawns the wave's race task. Returns the recipients actually offered.
    async fn launch_wave(
        self: &Arc<Self>,
        cell: &Arc<LiveOrder>,
        state: &mut LiveOrderState,
        wave_number: u32,
    ) -> DispatchResult<Vec<Id<Driver>>> {
        let now = self.now();
        let radius_m = self.config.radius_for_wave(wave_number);
        let prepared = self
            .prepare_offers(&state.order, radius_m, &state.attempted, now)
            .await?;

        let wave_size = if self.config.broadcast_fallback {
            prepared.len()
        } else {
            self.config.wave_size
        };
        let mut prepared: Vec<PreparedOffer> =
            prepared.into_iter().take(wave_size.max(1)).collect();

        // Heartbeats may have expired while features were gathered; drop
        // those drivers before anything is sent.
        let mut fresh = Vec::new();
        for offer in prepared.drain(..) {
            let alive = self
                .presence
                .get(&offer.driver_id)
                .await
                .map(|entry| {
                    entry.availability.dispatchable()
                        && now - entry.last_heartbeat
                            <= self.config.presence_freshness
                })
                .unwrap_or(false);
            if alive {
                fresh.push(offer);
            }
        }
        if fresh.is_empty() {
            return Ok(Vec::new());
        }

        state.order.batch_number = wave_number;
        if state.order.offered_at.is_none() {
            state.order.offered_at = Some(now);
        }

        let deadline = now
            + chrono::Duration::from_std(self.config.wave_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(20));

        let log = DispatchLog {
            id: self.minter.mint("dlg"),
            order_id: state.order.id.clone(),
            wave_number,
            logged_at: now,
            candidates: fresh
                .iter()
                .map(|offer| RankedCandidate {
                    driver_id: offer.driver_id.clone(),
                    score: offer.score,
                    predicted_eta_s: offer.predicted_eta_s,
                    rejection_probability: offer.rejection_probability,
                    reason: offer.reason.clone(),
                })
                .collect(),
            weights: self.weights,
            acceptance: None,
        };
        if let Err(why) = self.database.auto().append_dispatch_log(&log).await {
            // Log rows are analytics, not control flow.
            warn!("dispatch log write failed for {}: {:?}", state.order.id, why);
        }

        let (signal_tx, signal_rx) = mpsc::channel(8);
        let mut wave = WaveState {
            number: wave_number,
            recipients: fresh.iter().map(|o| o.driver_id.clone()).collect(),
            offered_at: now,
            deadline,
            responded: HashMap::new(),
            offers: HashMap::new(),
            signals: signal_tx,
        };

        for offer in &fresh {
            wave.offers.insert(
                offer.driver_id.clone(),
                OfferSnapshot {
                    features: offer.features.clone(),
                    offered_at: now,
                },
            );
        }

        let recipients = wave.recipients.clone();
        info!(
            "order {} wave {} offering to {:?} (deadline {})",
            state.order.id, wave_number, recipients, deadline
        );

        for offer in &fresh {
            let event = DriverEvent::OrderOffer {
                order: state.order.clone(),
                wave_number,
                wave_deadline: deadline,
                estimated_fare: state.order.estimated_fare,
                surge_multiplier: state.order.surge_multiplier,
                predicted_eta_s: offer.predicted_eta_s,
                auto_accept_score: offer.auto_accept_score,
            };
            let delivered = self.drivers.deliver(&offer.driver_id, event).await;
            if !delivered {
                // A dead connection counts as an instant timeout.
                debug!(
                    "offer to {} lost, treating as timeout",
                    offer.driver_id
                );
                wave.responded
                    .insert(offer.driver_id.clone(), RejectionReason::Timeout);
            }
        }

        let everyone_unreachable = wave.all_responded();
        state.wave = Some(wave);

        self.spawn_wave_task(cell.clone(), state.order.id.clone(), wave_number, signal_rx);

        if everyone_unreachable {
            // No point waiting out the timer on an empty room.
            if let Some(wave) = &state.wave {
                let _ = wave.signals.try_send(WaveSignal::AllResponded);
            }
        }

        if let Err(why) = self
            .persist_order_bounded(&state.order, OrderStatus::Offered)
            .await
        {
            warn!("wave bookkeeping for {} not persisted: {}", state.order.id, why);
        }

        Ok(recipients)
    }

    fn spawn_wave_task(
        self: &Arc<Self>,
        cell: Arc<LiveOrder>,
        order_id: Id<Order>,
        wave_number: u32,
        mut signals: mpsc::Receiver<WaveSignal>,
    ) {
        let dispatcher = self.clone();
        let timeout = self.config.wave_timeout;
        let abort = cell.abort.clone();
        tokio::spawn(async move {
            let ended_without_accept = tokio::select! {
                _ = abort.cancelled() => {
                    debug!("wave {} of {} aborted", wave_number, order_id);
                    false
                }
                signal = signals.recv() => match signal {
                    Some(WaveSignal::Accepted) | None => false,
                    Some(WaveSignal::AllResponded) => true,
                },
                _ = tokio::time::sleep(timeout) => true,
            };
            if ended_without_accept {
                dispatcher.end_wave(&cell, &order_id, wave_number).await;
            }
        });
    }

    /// Runs when a wave ends by deadline or by unanimous rejection: books
    /// timeouts, escalates to the next wave or finishes with no driver.
    async fn end_wave(
        self: &Arc<Self>,
        cell: &Arc<LiveOrder>,
        order_id: &Id<Order>,
        wave_number: u32,
    ) {
        let mut guard = cell.lock.lock().await;
        let state = &mut *guard;

        // The acceptance may have squeezed in before this lock; the wave
        // field is the authority.
        let Some(wave) = state.wave.as_ref() else { return };
        if wave.number != wave_number || state.order.status != OrderStatus::Offered
        {
            return;
        }

        let now = self.now();
        let wave = state.wave.take().unwrap();
        let mut rejections = Vec::new();
        for recipient in &wave.recipients {
            state.attempted.insert(recipient.clone());
            let reason = wave
                .responded
                .get(recipient)
                .copied()
                .unwrap_or(RejectionReason::Timeout);
            // Explicit rejections were recorded as they happened; book the
            // silent ones now.
            if !wave.responded.contains_key(recipient) {
                if let Some(snapshot) = wave.offers.get(recipient) {
                    rejections.push(self.rejection_record(
                        &state.order,
                        recipient,
                        reason,
                        &snapshot.features,
                        snapshot.offered_at,
                        wave.deadline,
                    ));
                }
                state.order.reject_count += 1;
            }
        }
        for record in rejections {
            self.append_rejection(record).await;
        }

        if wave_number >= self.config.max_waves {
            info!("order {} exhausted {} waves", order_id, wave_number);
            self.finish_no_driver(cell, state).await;
            return;
        }

        match self.launch_wave(cell, state, wave_number + 1).await {
            Ok(recipients) if recipients.is_empty() => {
                info!("order {} found no candidates for wave {}", order_id, wave_number + 1);
                self.finish_no_driver(cell, state).await;
            }
            Ok(_) => {}
            Err(why) => {
                error!("wave escalation for {} failed: {}", order_id, why);
                self.finish_no_driver(cell, state).await;
            }
        }
    }

    /// Gathers per-driver features concurrently and ranks the field.
    async fn prepare_offers(
        &self,
        order: &Order,
        radius_m: f64,
        exclude: &HashSet<Id<Driver>>,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<PreparedOffer>> {
        let available = self
            .presence
            .query_available(
                order.pickup.point,
                radius_m,
                now,
                self.config.presence_freshness,
            )
            .await;

        let candidates: Vec<_> = available
            .into_iter()
            .filter(|candidate| !exclude.contains(&candidate.driver_id))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let trip_distance_m = match &order.destination {
            Some(destination) => Some(
                self.eta
                    .lookup(order.pickup.point, destination.point, now)
                    .await
                    .distance_m,
            ),
            None => None,
        };
        let fleet_avg = self
            .database
            .auto()
            .fleet_avg_earnings(now.date_naive())
            .await
            .unwrap_or(0.0);

        let futures = candidates.into_iter().map(|candidate| {
            let order = order.clone();
            let trip_distance_m = trip_distance_m;
            async move {
                let mut handle = self.database.auto();
                let driver = match handle.get_driver(&candidate.driver_id).await {
                    Ok(driver) => driver,
                    Err(why) => {
                        debug!(
                            "skipping candidate {}: {:?}",
                            candidate.driver_id, why
                        );
                        return None;
                    }
                };
                if driver.is_blocked {
                    return None;
                }
                let today = handle
                    .driver_day_stats(&candidate.driver_id, now.date_naive())
                    .await
                    .unwrap_or_default();
                let filters = handle
                    .get_offer_filters(&candidate.driver_id)
                    .await
                    .unwrap_or_default();

                let eta = self
                    .eta
                    .lookup(candidate.point, order.pickup.point, now)
                    .await;
                let features = OfferFeatures {
                    pickup_distance_m: candidate.distance_m,
                    trip_distance_m,
                    estimated_fare: order.estimated_fare,
                    hour_of_day: order.hour_of_day,
                    day_of_week: order.day_of_week,
                    zone_name: order.zone_name.clone(),
                    today,
                };
                let pattern =
                    self.predictor.pattern_for(&candidate.driver_id, now).await;
                let probability = predictor::rejection_probability(
                    &pattern,
                    &features,
                    self.config.predictor_prior,
                    self.config.earnings_penalty,
                );
                let zone_preference = order
                    .zone_name
                    .as_ref()
                    .and_then(|zone| pattern.zone_acceptance.get(zone).copied())
                    .unwrap_or(0.5);
                let filters_pass =
                    predictor::rule_filters_pass(&filters, &features);

                Some((
                    CandidateInput {
                        driver_id: candidate.driver_id.clone(),
                        rating: driver.rating,
                        pickup_distance_m: candidate.distance_m,
                        predicted_eta_s: eta.duration_s,
                        rejection_probability: probability,
                        today_earnings: today.earnings,
                        fleet_avg_earnings: fleet_avg,
                        zone_preference,
                    },
                    features,
                    predictor::auto_accept_score(probability, filters_pass),
                ))
            }
        });

        let gathered: Vec<_> =
            join_all(futures).await.into_iter().flatten().collect();
        let inputs: Vec<CandidateInput> =
            gathered.iter().map(|(input, _, _)| input.clone()).collect();
        let by_driver: HashMap<String, (OfferFeatures, f64)> = gathered
            .into_iter()
            .map(|(input, features, auto)| {
                (input.driver_id.raw(), (features, auto))
            })
            .collect();

        let ranked = scoring::rank(&inputs, &self.weights);
        Ok(ranked
            .into_iter()
            .filter_map(|scored| {
                by_driver.get(&scored.driver_id.raw()).map(
                    |(features, auto_accept)| PreparedOffer {
                        driver_id: scored.driver_id.clone(),
                        score: scored.score,
                        predicted_eta_s: scored.predicted_eta_s,
                        rejection_probability: scored.rejection_probability,
                        reason: scored.reason.clone(),
                        auto_accept_score: *auto_accept,
                        features: features.clone(),
                    },
                )
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // accept / reject
    // ------------------------------------------------------------------

    pub async fn accept_offer(
        &self,
        order_id: &Id<Order>,
        driver_id: &Id<Driver>,
    ) -> DispatchResult<AcceptOutcome> {
        let cell = self.live_order(order_id).await?;
        let mut state = cell.lock.lock().await;
        let now = self.now();

        if state.order.status != OrderStatus::Offered {
            return if state.order.driver_id.as_ref() == Some(driver_id)
                && !state.order.status.is_terminal()
            {
                Ok(AcceptOutcome::AlreadyAcceptedByYou)
            } else if state.order.status == OrderStatus::Accepted {
                Err(DispatchError::AlreadyTaken)
            } else {
                Err(DispatchError::Stale)
            };
        }

        let Some(wave) = &state.wave else {
            return Err(DispatchError::Stale);
        };
        if !wave.recipients.contains(driver_id)
            || wave.responded.contains_key(driver_id)
        {
            return Err(DispatchError::Stale);
        }
        // The deadline is a hard boundary: at exactly T the wave is over.
        if now >= wave.deadline {
            return Err(DispatchError::Stale);
        }

        // One non-terminal order per driver, ever. A recipient who accepted
        // a competing order since this wave went out is refused here.
        if let Some(open) = self.presence.current_order(driver_id).await {
            warn!(
                "driver {} tried to accept {} while holding {}",
                driver_id, order_id, open
            );
            return Err(DispatchError::DriverBusy);
        }

        // The storage compare-and-set is the authority of the race, even
        // under the cell lock.
        match self
            .database
            .auto()
            .try_assign_driver(order_id, driver_id, now)
            .await?
        {
            AssignOutcome::Assigned => {}
            AssignOutcome::Lost { status, driver_id: holder } => {
                warn!(
                    "cas lost for {} ({} held by {:?})",
                    order_id, status, holder
                );
                return Err(DispatchError::AlreadyTaken);
            }
        }

        let effects = lifecycle::decide(
            OrderStatus::Offered,
            OrderStatus::Accepted,
            Actor::Driver,
        )?;
        let wave = state.wave.take().unwrap();
        let response_ms = (now - wave.offered_at).num_milliseconds();

        state.order.status = OrderStatus::Accepted;
        state.order.driver_id = Some(driver_id.clone());
        state.order.accepted_at = Some(now);

        for effect in effects {
            match effect {
                SideEffect::ClearWaveOffers => {
                    for recipient in &wave.recipients {
                        if recipient == driver_id
                            || wave.responded.contains_key(recipient)
                        {
                            continue;
                        }
                        let delivered = self
                            .drivers
                            .deliver(
                                recipient,
                                DriverEvent::OrderCancelled {
                                    order_id: order_id.clone(),
                                    reason: "taken".to_owned(),
                                },
                            )
                            .await;
                        if !delivered {
                            debug!("loser notice to {} lost", recipient);
                        }
                    }
                }
                SideEffect::RecordAcceptance => {
                    let acceptance = WaveAcceptance {
                        driver_id: driver_id.clone(),
                        accepted_at: now,
                        response_ms,
                    };
                    if let Err(why) = self
                        .database
                        .auto()
                        .record_wave_acceptance(order_id, wave.number, &acceptance)
                        .await
                    {
                        warn!(
                            "acceptance log write failed for {}: {:?}",
                            order_id, why
                        );
                    }
                }
                SideEffect::AssignDriver => {
                    // Done above, inside the CAS.
                }
                SideEffect::DriverToOnTrip => {
                    self.presence
                        .assign_order(driver_id, order_id.clone())
                        .await;
                }
                SideEffect::NotifyPassenger => {
                    self.notify_passenger_update(&state.order).await;
                }
                _ => {}
            }
        }

        // Wake the race task; the signal may find it already gone.
        let _ = wave.signals.try_send(WaveSignal::Accepted);

        info!(
            "order {} accepted by {} after {} ms (wave {})",
            order_id, driver_id, response_ms, wave.number
        );
        Ok(AcceptOutcome::Accepted)
    }

    pub async fn reject_offer(
        &self,
        order_id: &Id<Order>,
        driver_id: &Id<Driver>,
        reason: RejectionReason,
    ) -> DispatchResult<()> {
        let cell = self.live_order(order_id).await?;
        let mut guard = cell.lock.lock().await;
        let now = self.now();
        let state = &mut *guard;

        if state.order.status != OrderStatus::Offered {
            return Err(DispatchError::Stale);
        }
        let Some(wave) = state.wave.as_mut() else {
            return Err(DispatchError::Stale);
        };
        if !wave.recipients.contains(driver_id) {
            return Err(DispatchError::Stale);
        }
        if wave.responded.contains_key(driver_id) {
            // Double-tap; the first response stands.
            return Ok(());
        }

        wave.responded.insert(driver_id.clone(), reason);
        let record = wave.offers.get(driver_id).map(|snapshot| {
            self.rejection_record(
                &state.order,
                driver_id,
                reason,
                &snapshot.features,
                snapshot.offered_at,
                now,
            )
        });
        if wave.all_responded() {
            let _ = wave.signals.try_send(WaveSignal::AllResponded);
        }
        state.attempted.insert(driver_id.clone());
        state.order.reject_count += 1;

        drop(guard);
        if let Some(record) = record {
            self.append_rejection(record).await;
        }
        Ok(())
    }

    /// Session loss of a driver: presence drops them, and every wave they
    /// are currently part of treats them as timed out.
    pub async fn driver_disconnected(&self, driver_id: &Id<Driver>) {
        self.presence.on_disconnect(driver_id).await;

        let cells: Vec<Arc<LiveOrder>> =
            self.live.read().await.values().cloned().collect();
        for cell in cells {
            let mut guard = cell.lock.lock().await;
            let now = self.now();
            let state = &mut *guard;
            let Some(wave) = state.wave.as_mut() else { continue };
            if !wave.recipients.contains(driver_id)
                || wave.responded.contains_key(driver_id)
            {
                continue;
            }
            wave.responded
                .insert(driver_id.clone(), RejectionReason::Timeout);
            let record = wave.offers.get(driver_id).map(|snapshot| {
                self.rejection_record(
                    &state.order,
                    driver_id,
                    RejectionReason::Timeout,
                    &snapshot.features,
                    snapshot.offered_at,
                    now,
                )
            });
            if wave.all_responded() {
                let _ = wave.signals.try_send(WaveSignal::AllResponded);
            }
            state.attempted.insert(driver_id.clone());
            state.order.reject_count += 1;
            drop(guard);
            if let Some(record) = record {
                self.append_rejection(record).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // trip progress / cancellation
    // ------------------------------------------------------------------

    pub async fn advance_trip(
        &self,
        order_id: &Id<Order>,
        driver_id: &Id<Driver>,
        to: OrderStatus,
        settlement: Option<Settlement>,
    ) -> DispatchResult<Order> {
        let cell = self.live_order(order_id).await?;
        let mut state = cell.lock.lock().await;
        let now = self.now();

        if state.order.driver_id.as_ref() != Some(driver_id) {
            return Err(DispatchError::NotAssignee);
        }
        if to == OrderStatus::Cancelled {
            // Cancellation has its own entry point with counterparty rules.
            return Err(DispatchError::Validation(
                "use cancel for cancellations".to_owned(),
            ));
        }
        let from = state.order.status;
        let effects = lifecycle::decide(from, to, Actor::Driver)?;
        if effects.contains(&SideEffect::RecordSettlement) && settlement.is_none()
        {
            return Err(DispatchError::Validation(
                "settlement data required".to_owned(),
            ));
        }

        state.order.status = to;
        for effect in &effects {
            match effect {
                SideEffect::RecordArrivedAt => {
                    state.order.arrived_at = Some(now);
                }
                SideEffect::RecordStartedAt => {
                    state.order.started_at = Some(now);
                }
                SideEffect::RecordSettlement => {
                    let settlement = settlement.as_ref().ok_or_else(|| {
                        DispatchError::Validation(
                            "settlement data required".to_owned(),
                        )
                    })?;
                    state.order.meter_amount = Some(settlement.meter_amount);
                    state.order.actual_distance_m = Some(settlement.distance_m);
                    state.order.actual_duration_s = Some(settlement.duration_s);
                    state.order.photo_url = settlement.photo_url.clone();
                }
                SideEffect::RecordCompletedAt => {
                    state.order.completed_at = Some(now);
                }
                SideEffect::DriverToAvailable => {
                    self.presence.clear_order(driver_id, true).await;
                }
                SideEffect::IncrementStats => {
                    let earnings = state.order.meter_amount.unwrap_or(0.0);
                    let mut handle = self.database.auto();
                    if let Err(why) =
                        handle.add_driver_trip(driver_id, earnings).await
                    {
                        warn!("stats bump for {} failed: {:?}", driver_id, why);
                    }
                    if let Err(why) =
                        handle.add_passenger_trip(&state.order.passenger_id).await
                    {
                        warn!(
                            "stats bump for {} failed: {:?}",
                            state.order.passenger_id, why
                        );
                    }
                }
                SideEffect::RatingsHook => {
                    // Rating attachment arrives later through the rating
                    // collaborator; the completed order is now open for it.
                    debug!("order {} open for rating", order_id);
                }
                SideEffect::NotifyPassenger => {
                    self.notify_passenger_update(&state.order).await;
                }
                SideEffect::ConsumeZoneTicket => {
                    // The reservation simply stays counted.
                }
                _ => {}
            }
        }

        if to.is_terminal() {
            self.persist_terminal(&state.order, from).await;
            self.live.write().await.remove(order_id);
        } else {
            self.persist_order_bounded(&state.order, from).await?;
        }
        Ok(state.order.clone())
    }

    pub async fn cancel_order(
        &self,
        order_id: &Id<Order>,
        by: Actor,
        actor_id: Option<&str>,
        reason: &str,
    ) -> DispatchResult<()> {
        let cell = self.live_order(order_id).await?;
        let mut state = cell.lock.lock().await;
        let now = self.now();

        // The acting party must own its side of the order.
        match by {
            Actor::Passenger => {
                if actor_id.is_some()
                    && actor_id != Some(state.order.passenger_id.raw_ref::<str>())
                {
                    return Err(DispatchError::NotAssignee);
                }
            }
            Actor::Driver => {
                let assigned = state
                    .order
                    .driver_id
                    .as_ref()
                    .map(|id| Some(id.raw_ref::<str>()) == actor_id)
                    .unwrap_or(false);
                if !assigned {
                    return Err(DispatchError::NotAssignee);
                }
            }
            Actor::Admin | Actor::System => {}
        }

        let from = state.order.status;
        let effects = lifecycle::decide(from, OrderStatus::Cancelled, by)?;

        cell.abort.cancel();
        state.order.status = OrderStatus::Cancelled;
        state.order.cancelled_at = Some(now);
        state.order.cancel_reason = Some(reason.to_owned());
        state.order.cancelled_by = Some(by);

        let assigned_driver = state.order.driver_id.clone();
        let wave = state.wave.take();

        for effect in effects {
            match effect {
                SideEffect::NotifyCounterparty => {
                    if by != Actor::Passenger {
                        self.notify_passenger_update(&state.order).await;
                    }
                    if let Some(driver_id) = &assigned_driver {
                        if by != Actor::Driver {
                            let _ = self
                                .drivers
                                .deliver(
                                    driver_id,
                                    DriverEvent::OrderCancelled {
                                        order_id: order_id.clone(),
                                        reason: reason.to_owned(),
                                    },
                                )
                                .await;
                        }
                    }
                }
                SideEffect::ClearWaveOffers => {
                    if let Some(wave) = &wave {
                        for recipient in &wave.recipients {
                            if wave.responded.contains_key(recipient) {
                                continue;
                            }
                            let _ = self
                                .drivers
                                .deliver(
                                    recipient,
                                    DriverEvent::OrderCancelled {
                                        order_id: order_id.clone(),
                                        reason: reason.to_owned(),
                                    },
                                )
                                .await;
                        }
                    }
                }
                SideEffect::ClearDriverAssignment => {
                    if let Some(driver_id) = &assigned_driver {
                        self.presence.clear_order(driver_id, true).await;
                    }
                }
                SideEffect::ReleaseZoneTicket => {
                    if state.holds_zone_ticket {
                        if let Some(zone) = &state.order.zone_name {
                            self.zones.release(zone, state.order.created_at).await;
                        }
                        state.holds_zone_ticket = false;
                    }
                }
                _ => {}
            }
        }

        // A ride still parked in a zone queue leaves it on cancellation.
        if state.order.dispatch_method == DispatchMethod::ZoneQueue
            && wave.is_none()
        {
            if let Some(zone) = &state.order.zone_name {
                self.zones.remove_queued(zone, order_id).await;
            }
        }

        info!("order {} cancelled by {:?}: {}", order_id, by, reason);
        self.persist_terminal(&state.order, from).await;
        self.live.write().await.remove(order_id);
        Ok(())
    }

    /// All waves exhausted (or nobody to offer to): terminal no-driver
    /// cancellation plus the dedicated passenger event.
    async fn finish_no_driver(
        &self,
        cell: &Arc<LiveOrder>,
        state: &mut LiveOrderState,
    ) {
        let now = self.now();
        let from = state.order.status;
        cell.abort.cancel();
        state.wave = None;
        state.order.status = OrderStatus::Cancelled;
        state.order.cancelled_at = Some(now);
        state.order.cancel_reason = Some("no_driver".to_owned());
        state.order.cancelled_by = Some(Actor::System);

        if state.holds_zone_ticket {
            if let Some(zone) = &state.order.zone_name {
                self.zones.release(zone, state.order.created_at).await;
            }
            state.holds_zone_ticket = false;
        }

        let delivered = self
            .passengers
            .deliver(
                &state.order.passenger_id,
                PassengerEvent::NoDriver {
                    order_id: state.order.id.clone(),
                },
            )
            .await;
        if !delivered {
            debug!(
                "no-driver notice for {} not delivered",
                state.order.passenger_id
            );
        }
        self.notify_passenger_update(&state.order).await;

        self.persist_terminal(&state.order, from).await;
        self.live.write().await.remove(&state.order.id);
    }

    // ------------------------------------------------------------------
    // housekeeping
    // ------------------------------------------------------------------

    /// One housekeeping pass: flush dirty terminal rows, run the zone
    /// queues, refresh the pattern cache. Called periodically, and directly
    /// by tests.
    pub async fn sweep(self: &Arc<Self>) {
        let now = self.now();

        // Terminal rows that storage refused earlier.
        let pending: Vec<Order> = {
            let mut dirty = self.dirty.lock().await;
            dirty.drain(..).collect()
        };
        for order in pending {
            let mut handle = self.database.auto();
            let result = handle.update_order(&order, order.status).await;
            let result = match result {
                Err(StorageError::Conflict) | Err(StorageError::NotFound) => {
                    // Row drifted under us; overwrite by current status.
                    let stored = handle.get_order(&order.id).await;
                    match stored {
                        Ok(stored) => {
                            handle.update_order(&order, stored.status).await
                        }
                        Err(why) => Err(why),
                    }
                }
                other => other,
            };
            if let Err(why) = result {
                warn!("terminal flush for {} still failing: {:?}", order.id, why);
                self.dirty.lock().await.push(order);
            }
        }

        // OFFERED rows nobody is driving (typically left over from a crash)
        // are failed out once they are far past any possible wave horizon.
        let horizon = chrono::Duration::from_std(
            self.config.wave_timeout * (self.config.max_waves * 2).max(1),
        )
        .unwrap_or_else(|_| chrono::Duration::minutes(2));
        match self
            .database
            .auto()
            .orders_in_status(OrderStatus::Offered, now - horizon)
            .await
        {
            Ok(stale) => {
                for order in stale {
                    if self.live.read().await.contains_key(&order.id) {
                        continue;
                    }
                    warn!("sweeping orphaned offered order {}", order.id);
                    if let Ok(cell) = self.live_order(&order.id).await {
                        let mut state = cell.lock.lock().await;
                        if state.order.status == OrderStatus::Offered
                            && state.wave.is_none()
                        {
                            self.finish_no_driver(&cell, &mut state).await;
                        }
                    }
                }
            }
            Err(why) => debug!("stale order scan failed: {:?}", why),
        }

        // Queue admissions and expiries.
        let (admitted, timed_out) = self.zones.sweep_queues(now).await;
        for admission in admitted {
            if let Err(why) = self.dispatch_queued(&admission.order_id, admission.surge_multiplier).await
            {
                warn!(
                    "queued order {} failed to dispatch: {}",
                    admission.order_id, why
                );
            }
        }
        for order_id in timed_out {
            self.fail_queued(&order_id).await;
        }

        self.predictor.invalidate().await;
    }

    /// A queued order won a ticket: price it at this moment and launch
    /// wave 1.
    async fn dispatch_queued(
        self: &Arc<Self>,
        order_id: &Id<Order>,
        surge_multiplier: f64,
    ) -> DispatchResult<()> {
        let cell = self.live_order(order_id).await?;
        let mut state = cell.lock.lock().await;
        let now = self.now();
        if state.order.status != OrderStatus::Offered || state.wave.is_some() {
            // The sweep reserved a ticket for an entry that died meanwhile;
            // hand it back.
            if let Some(zone) = &state.order.zone_name {
                self.zones.release(zone, now).await;
            }
            return Ok(());
        }

        state.holds_zone_ticket = true;
        state.order.surge_multiplier = surge_multiplier;
        let trip_distance_m = match &state.order.destination {
            Some(destination) => Some(
                self.eta
                    .lookup(state.order.pickup.point, destination.point, now)
                    .await
                    .distance_m,
            ),
            None => None,
        };
        state.order.estimated_fare = self
            .config
            .fare
            .estimate(trip_distance_m.unwrap_or(0.0), surge_multiplier);

        self.notify_passenger_update(&state.order).await;
        let offered = self.launch_wave(&cell, &mut state, 1).await?;
        if offered.is_empty() {
            self.finish_no_driver(&cell, &mut state).await;
        }
        Ok(())
    }

    /// A queued order ran out its queue timeout without admission.
    async fn fail_queued(&self, order_id: &Id<Order>) {
        let Ok(cell) = self.live_order(order_id).await else {
            return;
        };
        let mut state = cell.lock.lock().await;
        if state.order.status != OrderStatus::Offered {
            return;
        }
        let now = self.now();
        let from = state.order.status;
        state.order.status = OrderStatus::Cancelled;
        state.order.cancelled_at = Some(now);
        state.order.cancel_reason = Some("QUEUE_TIMEOUT".to_owned());
        state.order.cancelled_by = Some(Actor::System);

        let delivered = self
            .passengers
            .deliver(
                &state.order.passenger_id,
                PassengerEvent::NoDriver {
                    order_id: state.order.id.clone(),
                },
            )
            .await;
        if !delivered {
            debug!("queue-timeout notice for {} lost", state.order.passenger_id);
        }
        self.notify_passenger_update(&state.order).await;
        self.persist_terminal(&state.order, from).await;
        self.live.write().await.remove(order_id);
    }

    // ------------------------------------------------------------------
    // session plumbing
    // ------------------------------------------------------------------

    /// `driver:online` — opens presence for a connected driver.
    pub async fn driver_online(&self, driver_id: Id<Driver>) {
        let now = self.now();
        self.presence.set_online(driver_id, now).await;
    }

    /// `driver:status` — availability change from the driver client.
    pub async fn driver_status(
        &self,
        driver_id: &Id<Driver>,
        availability: model::driver::Availability,
    ) -> DispatchResult<()> {
        let now = self.now();
        self.presence.set_status(driver_id, availability, now).await
    }

    /// `driver:location` — ~1 Hz location tick; also relays movement to the
    /// passenger of an in-flight trip.
    pub async fn driver_location(
        &self,
        driver_id: Id<Driver>,
        point: GeoPoint,
        speed: Option<f64>,
        bearing: Option<f64>,
    ) {
        let now = self.now();
        self.presence
            .update_location(driver_id.clone(), point, speed, bearing, now)
            .await;
        self.relay_driver_location(&driver_id, point).await;
    }

    /// Broadcast of the passenger-visible driver set.
    pub async fn announce_nearby(&self) {
        let now = self.now();
        let snapshot = self
            .presence
            .nearby_snapshot(now, self.config.presence_freshness)
            .await;
        let reached = self
            .passengers
            .broadcast(PassengerEvent::NearbyDrivers(snapshot))
            .await;
        debug!("nearby snapshot reached {} passengers", reached);
    }

    /// Relays an assigned driver's movement to the passenger of the trip.
    pub async fn relay_driver_location(
        &self,
        driver_id: &Id<Driver>,
        point: GeoPoint,
    ) {
        let Some(order_id) = self.presence.current_order(driver_id).await else {
            return;
        };
        let cell = self.live.read().await.get(&order_id).cloned();
        let Some(cell) = cell else { return };
        let passenger_id = {
            let state = cell.lock.lock().await;
            if state.order.status == OrderStatus::Offered {
                return;
            }
            state.order.passenger_id.clone()
        };
        let _ = self
            .passengers
            .deliver(
                &passenger_id,
                PassengerEvent::DriverLocation {
                    order_id,
                    latitude: point.latitude,
                    longitude: point.longitude,
                },
            )
            .await;
    }

    /// REST view of dispatchable drivers around a point.
    pub async fn nearby_drivers(
        &self,
        center: GeoPoint,
        radius_m: f64,
    ) -> DispatchResult<Vec<NearbyDriverInfo>> {
        let now = self.now();
        let available = self
            .presence
            .query_available(center, radius_m, now, self.config.presence_freshness)
            .await;
        let mut result = Vec::with_capacity(available.len());
        for candidate in available {
            let driver = match self
                .database
                .auto()
                .get_driver(&candidate.driver_id)
                .await
            {
                Ok(driver) => driver,
                Err(_) => continue,
            };
            let eta = self.eta.lookup(candidate.point, center, now).await;
            result.push(NearbyDriverInfo {
                driver_id: candidate.driver_id,
                name: driver.name,
                plate: driver.plate,
                location: candidate.point,
                rating: driver.rating,
                distance_m: candidate.distance_m,
                eta_s: eta.duration_s,
            });
        }
        result.sort_by(|a, b| {
            a.distance_m
                .partial_cmp(&b.distance_m)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(result)
    }

    /// Spawns the periodic machinery: presence flusher, sweeper, nearby
    /// announcer. Call once at startup.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let presence = self.presence.clone();
        let database = self.database.clone();
        let batch_interval = self.config.batch_interval;
        tokio::spawn(crate::presence::run_presence_flusher(
            presence,
            database,
            batch_interval,
        ));

        let dispatcher = self.clone();
        let sweep_interval = self.config.stale_ride_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                dispatcher.sweep().await;
            }
        });

        let dispatcher = self.clone();
        let announce_interval = self.config.nearby_announce_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(announce_interval);
            loop {
                ticker.tick().await;
                dispatcher.announce_nearby().await;
            }
        });
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    /// The cell of a non-terminal order, rehydrated from storage when the
    /// process does not hold it yet.
    async fn live_order(&self, order_id: &Id<Order>) -> DispatchResult<Arc<LiveOrder>> {
        if let Some(cell) = self.live.read().await.get(order_id) {
            return Ok(cell.clone());
        }
        let order = self.database.auto().get_order(order_id).await?;
        let terminal = order.status.is_terminal();
        let holds_ticket =
            order.zone_name.is_some() && order.status == OrderStatus::Offered;
        let cell = Arc::new(LiveOrder {
            lock: Mutex::new(LiveOrderState {
                order,
                wave: None,
                attempted: HashSet::new(),
                holds_zone_ticket: holds_ticket,
            }),
            abort: CancellationToken::new(),
        });
        if terminal {
            // Operations on a finished order fail their own status checks;
            // the cell is throwaway and never tracked.
            return Ok(cell);
        }
        let mut live = self.live.write().await;
        Ok(live.entry(order_id.clone()).or_insert(cell).clone())
    }

    fn rejection_record(
        &self,
        order: &Order,
        driver_id: &Id<Driver>,
        reason: RejectionReason,
        features: &OfferFeatures,
        offered_at: DateTime<Utc>,
        rejected_at: DateTime<Utc>,
    ) -> RejectionRecord {
        RejectionRecord {
            id: self.minter.mint("rej"),
            order_id: order.id.clone(),
            driver_id: driver_id.clone(),
            reason,
            features: RejectionFeatures {
                pickup_distance_m: features.pickup_distance_m,
                trip_distance_m: features.trip_distance_m,
                estimated_fare: features.estimated_fare,
                hour_of_day: features.hour_of_day,
                day_of_week: features.day_of_week,
                today_earnings: features.today.earnings,
                today_trips: features.today.trips,
                today_online_hours: features.today.online_hours,
            },
            offered_at,
            rejected_at,
            response_ms: (rejected_at - offered_at).num_milliseconds(),
        }
    }

    /// Rejection rows feed the trainer; losing one is logged and dropped.
    async fn append_rejection(&self, record: RejectionRecord) {
        if let Err(why) = self.database.auto().append_rejection(&record).await {
            warn!(
                "rejection record for {} dropped: {:?}",
                record.order_id, why
            );
        }
    }

    async fn notify_passenger_update(&self, order: &Order) {
        let delivered = self
            .passengers
            .deliver(
                &order.passenger_id,
                PassengerEvent::OrderUpdate {
                    order: order.clone(),
                },
            )
            .await;
        if !delivered {
            debug!("update for {} not delivered", order.passenger_id);
        }
    }


    async fn insert_order_with_retry(&self, order: &Order) -> DispatchResult<()> {
        let mut attempt = 0;
        loop {
            match self.database.auto().insert_order(order).await {
                Ok(()) => return Ok(()),
                Err(why) if attempt + 1 < BOUNDED_RETRIES => {
                    attempt += 1;
                    debug!(
                        "order insert retry {} for {}: {:?}",
                        attempt, order.id, why
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(
                        RETRY_BASE_MS << attempt,
                    ))
                    .await;
                }
                Err(why) => return Err(why.into()),
            }
        }
    }

    /// Bounded backoff for non-terminal state writes.
    async fn persist_order_bounded(
        &self,
        order: &Order,
        expected_status: OrderStatus,
    ) -> DispatchResult<()> {
        let mut attempt = 0;
        loop {
            match self
                .database
                .auto()
                .update_order(order, expected_status)
                .await
            {
                Ok(()) => return Ok(()),
                Err(StorageError::Conflict) => {
                    // The CAS already moved the row (acceptance path); the
                    // current status is what we are writing.
                    match self
                        .database
                        .auto()
                        .update_order(order, order.status)
                        .await
                    {
                        Ok(()) => return Ok(()),
                        Err(why) => {
                            warn!(
                                "non-terminal persist for {} failed: {:?}",
                                order.id, why
                            );
                            return Err(why.into());
                        }
                    }
                }
                Err(why) if attempt + 1 < BOUNDED_RETRIES => {
                    attempt += 1;
                    debug!(
                        "order persist retry {} for {}: {:?}",
                        attempt, order.id, why
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(
                        RETRY_BASE_MS << attempt,
                    ))
                    .await;
                }
                Err(why) => return Err(why.into()),
            }
        }
    }

    /// Terminal writes may not be dropped: after the bounded attempts the
    /// row goes to the dirty queue and the sweeper keeps retrying forever.
    async fn persist_terminal(&self, order: &Order, from: OrderStatus) {
        let mut attempt = 0;
        loop {
            let result = self
                .database
                .auto()
                .update_order(order, from)
                .await;
            let result = match result {
                Err(StorageError::Conflict) => {
                    self.database
                        .auto()
                        .update_order(order, order.status)
                        .await
                }
                other => other,
            };
            match result {
                Ok(()) => return,
                Err(why) if attempt + 1 < BOUNDED_RETRIES => {
                    attempt += 1;
                    debug!(
                        "terminal persist retry {} for {}: {:?}",
                        attempt, order.id, why
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(
                        RETRY_BASE_MS << attempt,
                    ))
                    .await;
                }
                Err(why) => {
                    error!(
                        "terminal persist for {} failed, parking dirty: {:?}",
                        order.id, why
                    );
                    self.dirty.lock().await.push(order.clone());
                    return;
                }
            }
        }
    }
}
