use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use dispatch::transport::{
    DriverClientMessage, DriverEvent, PassengerClientMessage, PassengerEvent,
};
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use model::GeoPoint;
use tokio::sync::mpsc;

use crate::WebState;

pub fn routes(state: WebState) -> Router {
    Router::new()
        .route("/driver", get(driver_session))
        .route("/passenger", get(passenger_session))
        .with_state(state)
}

async fn driver_session(
    ws: WebSocketUpgrade,
    State(state): State<WebState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| run_driver_session(socket, state))
}

async fn passenger_session(
    ws: WebSocketUpgrade,
    State(state): State<WebState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| run_passenger_session(socket, state))
}

/// Forwards push events onto the socket until either side goes away.
async fn pump<E: serde::Serialize>(
    mut events: mpsc::Receiver<E>,
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
) {
    while let Some(event) = events.recv().await {
        let frame = match serde_json::to_string(&event) {
            Ok(frame) => frame,
            Err(why) => {
                warn!("event serialization failed: {}", why);
                continue;
            }
        };
        if sink.send(Message::Text(frame)).await.is_err() {
            // Peer gone; the registry learns about it on the read side.
            break;
        }
    }
}

async fn run_driver_session(socket: WebSocket, state: WebState) {
    let (sink, mut stream) = socket.split();
    let dispatcher = state.dispatcher;

    // The first frame must announce who this is.
    let driver_id = loop {
        match stream.next().await {
            Some(Ok(Message::Text(frame))) => {
                match serde_json::from_str::<DriverClientMessage>(&frame) {
                    Ok(DriverClientMessage::Online { driver_id }) => {
                        break driver_id
                    }
                    Ok(_) => {
                        debug!("frame before driver:online, ignoring");
                    }
                    Err(why) => {
                        debug!("unreadable driver frame: {}", why);
                    }
                }
            }
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return,
        }
    };

    let (connection, events) =
        dispatcher.drivers.register(driver_id.clone()).await;
    dispatcher.driver_online(driver_id.clone()).await;
    let forward: tokio::task::JoinHandle<()> =
        tokio::spawn(pump::<DriverEvent>(events, sink));

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(Message::Text(frame)) => frame,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        match serde_json::from_str::<DriverClientMessage>(&frame) {
            Ok(DriverClientMessage::Online { driver_id }) => {
                dispatcher.driver_online(driver_id).await;
            }
            Ok(DriverClientMessage::Status { driver_id, status }) => {
                if let Err(why) =
                    dispatcher.driver_status(&driver_id, status).await
                {
                    warn!("status change for {} refused: {}", driver_id, why);
                }
            }
            Ok(DriverClientMessage::Location {
                driver_id,
                lat,
                lng,
                speed,
                bearing,
            }) => {
                dispatcher
                    .driver_location(
                        driver_id,
                        GeoPoint::new(lat, lng),
                        speed,
                        bearing,
                    )
                    .await;
            }
            Err(why) => debug!("unreadable driver frame: {}", why),
        }
    }

    // Session loss: presence drops the driver and open waves book the churn.
    dispatcher.driver_disconnected(&driver_id).await;
    dispatcher
        .drivers
        .drop_connection(&driver_id, connection)
        .await;
    forward.abort();
}

async fn run_passenger_session(socket: WebSocket, state: WebState) {
    let (sink, mut stream) = socket.split();
    let dispatcher = state.dispatcher;

    let passenger_id = loop {
        match stream.next().await {
            Some(Ok(Message::Text(frame))) => {
                match serde_json::from_str::<PassengerClientMessage>(&frame) {
                    Ok(PassengerClientMessage::Online { passenger_id }) => {
                        break passenger_id
                    }
                    Err(why) => {
                        debug!("unreadable passenger frame: {}", why);
                    }
                }
            }
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return,
        }
    };

    let (connection, events) =
        dispatcher.passengers.register(passenger_id.clone()).await;
    let forward: tokio::task::JoinHandle<()> =
        tokio::spawn(pump::<PassengerEvent>(events, sink));

    // Passengers only listen; the read side exists to observe the close.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        }
    }

    dispatcher
        .passengers
        .drop_connection(&passenger_id, connection)
        .await;
    forward.abort();
}
