use axum::{
    extract::{Query, State},
    routing::{get, on},
    Json, Router,
};
use model::{driver::Driver, GeoPoint};
use serde::{Deserialize, Serialize};

use crate::{
    common::{route_not_found, schema, RouteErrorResponse, METHOD_FILTER_ALL},
    WebState,
};

pub(crate) fn routes(state: WebState) -> Router {
    Router::new()
        .route("/schema", get(schema::<Driver>))
        .route("/nearby", get(nearby))
        .with_state(state)
        .fallback_service(on(METHOD_FILTER_ALL, route_not_found))
}

#[derive(Debug, Deserialize)]
struct NearbyQuery {
    lat: f64,
    lng: f64,
    radius: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NearbyRow {
    driver_id: String,
    name: String,
    plate: String,
    location: GeoPoint,
    rating: f64,
    distance: f64,
    eta: f64,
}

async fn nearby(
    State(WebState { dispatcher }): State<WebState>,
    Query(params): Query<NearbyQuery>,
) -> Result<Json<Vec<NearbyRow>>, RouteErrorResponse> {
    let radius_m = params.radius.unwrap_or(5_000.0);
    let rows = dispatcher
        .nearby_drivers(GeoPoint::new(params.lat, params.lng), radius_m)
        .await?
        .into_iter()
        .map(|info| NearbyRow {
            driver_id: info.driver_id.raw(),
            name: info.name,
            plate: info.plate,
            location: info.location,
            rating: info.rating,
            distance: info.distance_m,
            eta: info.eta_s,
        })
        .collect();
    Ok(Json(rows))
}
