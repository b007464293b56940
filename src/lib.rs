use std::sync::Arc;

use actix_web::web::{
    self, Data, FormConfig, JsonConfig, PathConfig, PayloadConfig, QueryConfig, ServiceConfig,
};
use actix_web::{App, HttpResponse, HttpServer, ResponseError};
use mongodb::Client;
use tracing::info;
use tracing_actix_web::TracingLogger;

pub mod account;
pub mod assignment;
pub mod campaign;
pub mod config;
pub mod database;
pub mod earning;
pub mod error;
pub mod evidence;
pub mod gateway;
pub mod lifecycle;
pub mod notification;
pub mod proof;
pub mod retry;
#[cfg(test)]
mod testing;
pub mod typedid;
pub mod user;

use crate::config::{Config, DatabaseBackend, RetryConfig};
use crate::database::{Database, MemoryDatabase, MongoDatabase};
use crate::error::Error;
use crate::evidence::{EvidenceStore, LocalEvidenceStore};
use crate::gateway::{HttpPaymentGateway, PaymentGateway};
use crate::lifecycle::LifecycleSweeper;
use crate::notification::Notifications;

/// The collaborators every request handler may extract.
#[derive(Clone)]
pub struct Services {
    pub db: Arc<dyn Database>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub evidence: Arc<dyn EvidenceStore>,
    pub notifications: Arc<Notifications>,
    pub retry: RetryConfig,
    pub max_upload_bytes: usize,
}

impl Services {
    pub async fn from_config(config: &Config) -> Result<Services, Error> {
        let db: Arc<dyn Database> = match config.database.backend {
            DatabaseBackend::Mongo => {
                info!("connecting to db: {}", config.database.uri);
                let client = Client::with_uri_str(&config.database.uri).await?;
                Arc::new(MongoDatabase::initialize(client, &config.database.name).await?)
            }
            DatabaseBackend::Memory => {
                info!("using in-memory database");
                Arc::new(MemoryDatabase::new())
            }
        };

        let notifications = Notifications::from_config(
            &config.notifications,
            &config.gateway,
            config.retry.clone(),
        )?;

        Ok(Services {
            db,
            gateway: Arc::new(HttpPaymentGateway::new(&config.gateway)?),
            evidence: Arc::new(LocalEvidenceStore::new(&config.evidence)),
            notifications: Arc::new(notifications),
            retry: config.retry.clone(),
            max_upload_bytes: config.server.max_upload_bytes,
        })
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("retry", &self.retry)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish_non_exhaustive()
    }
}

/// Registers the shared state, extractor error formats and every endpoint.
pub fn configure(cfg: &mut ServiceConfig, services: &Services) {
    cfg.app_data(JsonConfig::default().error_handler(|err, _req| {
        // format json errors with custom format
        Error::InvalidJson(err).into()
    }))
    .app_data(PathConfig::default().error_handler(|err, _req| {
        // format path errors with custom format
        Error::InvalidPath(err).into()
    }))
    .app_data(FormConfig::default().error_handler(|err, _req| {
        // format form errors with custom format
        Error::InvalidForm(err).into()
    }))
    .app_data(QueryConfig::default().error_handler(|err, _req| {
        // format query errors with custom format
        Error::InvalidQuery(err).into()
    }))
    .app_data(PayloadConfig::new(services.max_upload_bytes))
    .app_data(Data::from(Arc::clone(&services.db)))
    .app_data(Data::from(Arc::clone(&services.gateway)))
    .app_data(Data::from(Arc::clone(&services.evidence)))
    .app_data(Data::from(Arc::clone(&services.notifications)))
    .app_data(Data::new(services.retry.clone()))
    .configure(account::configure)
    .configure(campaign::configure)
    .configure(assignment::configure)
    .configure(proof::configure)
    .configure(earning::configure);
}

pub async fn path_not_found() -> HttpResponse {
    Error::PathNotFound.error_response()
}

pub async fn run(config: Config) -> Result<(), Error> {
    let services = Services::from_config(&config).await?;

    LifecycleSweeper::new(
        Arc::clone(&services.db),
        Arc::clone(&services.notifications),
        &config.lifecycle,
    )
    .spawn();

    let address = (config.server.host.clone(), config.server.port);
    info!("listening on {}:{}", address.0, address.1);

    HttpServer::new(move || {
        let services = services.clone();
        App::new()
            .wrap(TracingLogger::default())
            .configure(move |cfg| configure(cfg, &services))
            .default_service(web::to(path_not_found))
    })
    .bind(address)?
    .run()
    .await?;

    Ok(())
}
