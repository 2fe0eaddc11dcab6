use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, on, post},
    Json, Router,
};
use dispatch::orchestrator::{
    AcceptOutcome, SubmitOutcome, SubmitRideRequest,
};
use model::{
    order::{Actor, Order, OrderStatus, PaymentKind, Settlement},
    GeoPoint, Place,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utility::id::Id;

use crate::{
    common::{route_not_found, schema, RouteErrorResponse, METHOD_FILTER_ALL},
    WebState,
};

pub(crate) fn routes(state: WebState) -> Router {
    Router::new()
        .route("/schema", get(schema::<Order>))
        .route("/", post(submit_ride))
        .route("/:id/accept", post(accept))
        .route("/:id/reject", post(reject))
        .route("/:id/advance", post(advance))
        .route("/:id/cancel", post(cancel))
        .with_state(state)
        .fallback_service(on(METHOD_FILTER_ALL, route_not_found))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceBody {
    lat: f64,
    lng: f64,
    address: Option<String>,
}

impl PlaceBody {
    fn into_place(self) -> Place {
        Place::new(GeoPoint::new(self.lat, self.lng), self.address)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRideBody {
    passenger_id: Option<String>,
    passenger_name: Option<String>,
    passenger_phone: Option<String>,
    pickup: Option<PlaceBody>,
    destination: Option<PlaceBody>,
    payment_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRideResponse {
    order: Order,
    offered_to: Vec<String>,
    batch_number: u32,
    message: String,
}

async fn submit_ride(
    State(WebState { dispatcher }): State<WebState>,
    Json(body): Json<SubmitRideBody>,
) -> Result<impl IntoResponse, RouteErrorResponse> {
    let (Some(phone), Some(pickup)) = (body.passenger_phone, body.pickup) else {
        return Err(RouteErrorResponse::new(
            StatusCode::BAD_REQUEST,
            "MISSING_FIELDS",
        )
        .with_message("passengerPhone and pickup are required"));
    };
    let payment = match body.payment_type.as_deref() {
        None => PaymentKind::Cash,
        Some(raw) => raw.parse().map_err(|_| {
            RouteErrorResponse::new(StatusCode::BAD_REQUEST, "MISSING_FIELDS")
                .with_message(format!("unknown payment type {}", raw))
        })?,
    };

    let request = SubmitRideRequest {
        passenger_id: body.passenger_id.map(Id::new),
        passenger_name: body.passenger_name,
        passenger_phone: phone,
        pickup: pickup.into_place(),
        destination: body.destination.map(PlaceBody::into_place),
        payment,
    };

    match dispatcher.submit_ride(request).await? {
        SubmitOutcome::Dispatched { order, offered_to } => {
            let response = SubmitRideResponse {
                batch_number: order.batch_number,
                offered_to: offered_to.iter().map(|id| id.raw()).collect(),
                message: if offered_to.is_empty() {
                    "no drivers available".to_owned()
                } else {
                    "dispatching".to_owned()
                },
                order,
            };
            Ok(Json(response).into_response())
        }
        SubmitOutcome::Queued { order, position } => {
            // The zone is full; the caller holds an order id but waits in
            // the zone queue for admission.
            let body = json!({
                "error": "QUEUED",
                "order": order,
                "position": position,
                "message": "zone at capacity, request queued",
            });
            Ok((StatusCode::CONFLICT, Json(body)).into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriverActionBody {
    driver_id: String,
    reason: Option<String>,
}

async fn accept(
    State(WebState { dispatcher }): State<WebState>,
    Path(id): Path<String>,
    Json(body): Json<DriverActionBody>,
) -> Result<impl IntoResponse, RouteErrorResponse> {
    let outcome = dispatcher
        .accept_offer(&Id::new(id), &Id::new(body.driver_id))
        .await?;
    let message = match outcome {
        AcceptOutcome::Accepted => "accepted",
        AcceptOutcome::AlreadyAcceptedByYou => "already_accepted_by_you",
    };
    Ok(Json(json!({ "ok": true, "message": message })))
}

async fn reject(
    State(WebState { dispatcher }): State<WebState>,
    Path(id): Path<String>,
    Json(body): Json<DriverActionBody>,
) -> Result<impl IntoResponse, RouteErrorResponse> {
    let reason = body
        .reason
        .as_deref()
        .unwrap_or("OTHER")
        .parse()
        .unwrap_or(model::rejection::RejectionReason::Other);
    dispatcher
        .reject_offer(&Id::new(id), &Id::new(body.driver_id), reason)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdvanceBody {
    driver_id: String,
    to: String,
    meter_amount: Option<f64>,
    distance: Option<f64>,
    duration: Option<f64>,
    photo_url: Option<String>,
}

async fn advance(
    State(WebState { dispatcher }): State<WebState>,
    Path(id): Path<String>,
    Json(body): Json<AdvanceBody>,
) -> Result<impl IntoResponse, RouteErrorResponse> {
    let to: OrderStatus = body.to.parse().map_err(|why: String| {
        RouteErrorResponse::new(StatusCode::BAD_REQUEST, "MISSING_FIELDS")
            .with_message(why)
    })?;
    let settlement = match (body.meter_amount, body.distance, body.duration) {
        (Some(meter_amount), Some(distance_m), Some(duration_s)) => {
            Some(Settlement {
                meter_amount,
                distance_m,
                duration_s,
                photo_url: body.photo_url,
            })
        }
        _ => None,
    };
    let order = dispatcher
        .advance_trip(&Id::new(id), &Id::new(body.driver_id), to, settlement)
        .await?;
    Ok(Json(json!({ "order": order })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody {
    by: Option<String>,
    actor_id: Option<String>,
    reason: Option<String>,
}

async fn cancel(
    State(WebState { dispatcher }): State<WebState>,
    Path(id): Path<String>,
    Json(body): Json<CancelBody>,
) -> Result<impl IntoResponse, RouteErrorResponse> {
    let by = match body.by.as_deref() {
        None => Actor::Passenger,
        Some(raw) => raw.parse().map_err(|why: String| {
            RouteErrorResponse::new(StatusCode::BAD_REQUEST, "MISSING_FIELDS")
                .with_message(why)
        })?,
    };
    dispatcher
        .cancel_order(
            &Id::new(id),
            by,
            body.actor_id.as_deref(),
            body.reason.as_deref().unwrap_or("cancelled"),
        )
        .await?;
    Ok(Json(json!({ "ok": true })))
}
