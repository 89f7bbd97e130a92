use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod capture;
mod clock;
mod config;
mod context;
mod dbus_interface;
mod engine;
mod events;
mod gate;
mod live;
mod views;

#[cfg(test)]
mod test_support;

use api::ApiClient;
use attendant_core::ScrfdDetector;
use attendant_hw::{CameraSession, StreamRegistry, V4lBackend};
use clock::SystemClock;
use config::Config;
use context::ViewContext;
use dbus_interface::{AttendantService, BUS_NAME, OBJECT_PATH};
use events::Notifier;
use live::{LiveFeed, SseTransport};
use views::{App, Services};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("attendantd starting");

    let config = Config::from_env();
    tracing::info!(server = %config.server_url, camera = %config.camera_device, "configuration loaded");

    let notifier = Notifier::new(64);
    tokio::spawn(events::log_events(notifier.subscribe()));

    let registry = Arc::new(StreamRegistry::new());
    let ctx = Arc::new(ViewContext::new(registry.clone()));
    let backend = Arc::new(V4lBackend::new(config.warmup_frames));
    let camera = Arc::new(CameraSession::new(registry, backend));

    let detector = ScrfdDetector::load(&config.scrfd_model_path())?;
    let engine = engine::spawn_engine(camera, Box::new(detector))?;

    let api = Arc::new(ApiClient::new(&config.server_url, config.csrf_token.clone(), notifier.clone())?);
    let feed = LiveFeed::new(Arc::new(SseTransport::new(api.clone())));

    let app = Arc::new(App::new(Services {
        config,
        ctx,
        engine,
        server: api,
        feed,
        notifier: notifier.clone(),
        wall: Arc::new(SystemClock),
    }));
    tokio::spawn(app.clone().watch_sign_out(notifier.subscribe()));

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendantService::new(app.clone()))?
        .build()
        .await?;

    tracing::info!("attendantd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("attendantd shutting down");

    let released = app.shutdown();
    tracing::info!(released, "camera streams released");

    Ok(())
}
