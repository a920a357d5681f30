use actix_web::{App, HttpServer};
use color_eyre::eyre::{Report, WrapErr};
use pollcast::{
    config::Config,
    db::{
        self,
        memory::MemoryPollStore,
        postgres::{self, PgChangeFeed, PgPollStore},
    },
    log,
    server::{self, AppState},
    services::identity::TrustedHeader,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[actix_rt::main]
async fn main() -> Result<(), Report> {
    log::init()?;
    let config = Config::from_env()?;

    let engine = match &config.database_url {
        Some(database_url) => {
            let pool = db::new_pool(database_url)
                .await
                .wrap_err("Unable to connect to database")?;
            postgres::migrate(&pool, Path::new("migrations"))
                .await
                .wrap_err("Unable to run migrations")?;
            let changes = PgChangeFeed::connect(&pool)
                .await
                .wrap_err("Unable to listen for store changes")?;
            server::start_engine(
                Arc::new(PgPollStore::new(pool)),
                changes.into_stream(),
                &config,
            )
        }
        None => {
            warn!("DATABASE_URL not set, polls are kept in memory");
            let store = Arc::new(MemoryPollStore::new());
            let changes = store.changes();
            server::start_engine(store, changes, &config)
        }
    };
    let state = AppState::new(engine, Arc::new(TrustedHeader::default()));

    info!(address = config.bind_address.as_str(), "Starting WS server");
    HttpServer::new(move || {
        let state = state.clone();
        App::new().configure(move |cfg| server::configure(cfg, state))
    })
    .bind(&config.bind_address)?
    .run()
    .await?;
    Ok(())
}
