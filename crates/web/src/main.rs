use std::{env, process::exit, sync::Arc};

use database::{DatabaseConnectionInfo, PgDatabase};
use dispatch::{
    eta::{HttpRouteProvider, RouteProvider},
    DispatchConfig, Dispatcher,
};
use utility::clock::SystemClock;
use web::{start_web_server, WebState};

#[tokio::main]
async fn main() {
    env_logger::init();

    let port: u16 = match env::var("PORT").as_deref() {
        Err(_) => 8080,
        Ok(raw) => match raw.parse() {
            Ok(port) => port,
            Err(_) => {
                eprintln!("invalid PORT value: {}", raw);
                exit(1);
            }
        },
    };

    // database
    let Some(connection_info) = DatabaseConnectionInfo::from_env() else {
        eprintln!("expected database connection info in env.");
        exit(1);
    };
    let database = match PgDatabase::connect(connection_info).await {
        Ok(database) => database,
        Err(why) => {
            eprintln!("could not connect to database: {}", why);
            exit(2);
        }
    };

    // dispatch core
    let mut config = DispatchConfig::default();
    if env::var("BROADCAST_FALLBACK").as_deref() == Ok("true") {
        log::warn!("running in degraded broadcast-dispatch mode");
        config.broadcast_fallback = true;
    }
    let route_provider: Option<Arc<dyn RouteProvider>> = env::var("OSRM_BASE_URL")
        .ok()
        .map(|base_url| {
            Arc::new(HttpRouteProvider::new(base_url)) as Arc<dyn RouteProvider>
        });

    let dispatcher = Dispatcher::new(
        database,
        Arc::new(SystemClock),
        config,
        route_provider,
    );
    if let Err(why) = dispatcher.zones.reload().await {
        log::error!("hot zone load failed: {}", why);
    }
    dispatcher.start_background_tasks();

    // web server
    let result = start_web_server(WebState { dispatcher }, port).await;
    if let Err(why) = result {
        if why.kind() == std::io::ErrorKind::AddrInUse {
            eprintln!("port {} already in use", port);
            exit(3);
        }
        eprintln!("server failed: {}", why);
        exit(1);
    }
}
