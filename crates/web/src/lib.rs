pub use crate::common::RouteResult;

use std::sync::Arc;

use axum::Router;
use database::PgDatabase;
use dispatch::Dispatcher;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod common;
pub mod ws;

#[derive(Clone)]
pub struct WebState {
    pub dispatcher: Arc<Dispatcher<PgDatabase>>,
}

pub async fn start_web_server(state: WebState, port: u16) -> std::io::Result<()> {
    let routes = Router::new()
        .nest_service("/api", api::routes(state.clone()))
        .nest_service("/ws", ws::routes(state))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("listening on 0.0.0.0:{}", port);
    axum::serve(listener, routes.into_make_service()).await?;

    Ok(())
}
