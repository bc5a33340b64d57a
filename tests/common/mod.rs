#![allow(dead_code)]

use duo_webrtc::testing::FakeTransportFactory;
use duo_webrtc::{Controller, InitArgs, LocalRelay, SessionConfig, SessionStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn fast_config() -> SessionConfig {
    SessionConfig {
        presence_interval_ms: 50,
        max_presence_announcements: 5,
        ice_servers: vec![],
        ..SessionConfig::default()
    }
}

pub fn controller(
    relay: &Arc<LocalRelay>,
    id: &str,
    transports: Arc<FakeTransportFactory>,
) -> Controller {
    controller_with(relay, id, transports, fast_config())
}

pub fn controller_with(
    relay: &Arc<LocalRelay>,
    id: &str,
    transports: Arc<FakeTransportFactory>,
    config: SessionConfig,
) -> Controller {
    Controller::init(InitArgs {
        id: Some(id.into()),
        config,
        channel: Arc::new(relay.channel()),
        transports,
    })
}

/// collects every status a controller reports
pub fn record_statuses(controller: &Controller) -> Arc<Mutex<Vec<SessionStatus>>> {
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    controller.on_connection_state_change(move |status| sink.lock().push(status));
    statuses
}

/// lets spawned session tasks drain their queues
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
