mod auth;
mod config;
mod error;
mod handlers;
mod models;
mod store;
mod upload;
mod validation;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use auth::{issue_token, JwtKeys};
use chrono::Duration;
use config::{MongoConfig, Settings};
use std::{io, sync::Arc};
use store::{MongoStore, ProductStore, UserStore};
use tracing::{error, info, Level};
use tracing_subscriber::{self, EnvFilter};
use tracing_actix_web::TracingLogger;
use upload::UploadStorage;

const TOKEN_TTL_HOURS: i64 = 2;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("actix_web=info".parse().unwrap())
                .add_directive("product_catalog_api=debug".parse().unwrap())
        )
        .init();

    let settings = Settings::from_env().map_err(|e| {
        error!("Invalid configuration: {}", e);
        io::Error::new(io::ErrorKind::InvalidInput, e)
    })?;
    let keys = Arc::new(JwtKeys::from_secret(settings.jwt_secret.as_bytes()));

    // `issue-token <user-id>` prints a bearer token for that user and exits.
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let [command, user_id] = args.as_slice() {
        if command == "issue-token" {
            let token = issue_token(user_id, &keys, Duration::hours(TOKEN_TTL_HOURS))
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            println!("{}", token);
            return Ok(());
        }
    }

    info!("Starting product catalog server");

    let mongo_config = MongoConfig::init(&settings)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    info!("MongoDB connection established");

    let uploads = UploadStorage::new(&settings.upload_dir, settings.max_upload_bytes);
    uploads.prepare().await?;
    info!("Storing uploads in {}", settings.upload_dir.display());

    let store = Arc::new(MongoStore::new(mongo_config.database));
    let products: Arc<dyn ProductStore> = store.clone();
    let users: Arc<dyn UserStore> = store;
    let products = web::Data::from(products);
    let users = web::Data::from(users);
    let uploads = web::Data::new(uploads);

    HttpServer::new(move || {
        let keys = keys.clone();
        App::new()
            .wrap(Cors::permissive())
            .wrap(TracingLogger::default())
            .app_data(products.clone())
            .app_data(users.clone())
            .app_data(uploads.clone())
            .configure(|cfg| handlers::configure(cfg, keys))
    })
    .bind(&settings.bind_address)?
    .run()
    .await
}
