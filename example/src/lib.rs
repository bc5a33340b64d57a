use anyhow::{bail, Result};
use bytes::Bytes;
use duo_webrtc::{
    Controller, InitArgs, LocalRelay, Phase, RoomId, SessionConfig, WebRtcTransportFactory,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// file:line [LEVEL] HH:MM:SS.mmm - message
pub fn init_logger(level: log::LevelFilter) {
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} [{}] {} - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                chrono::Local::now().format("%H:%M:%S.%3f"),
                record.args()
            )
        })
        .filter(None, level)
        .init();
}

/// one participant of the demo plus the messages it received
pub struct Participant {
    pub name: &'static str,
    pub controller: Controller,
    pub inbox: mpsc::UnboundedReceiver<Bytes>,
}

impl Participant {
    pub fn new(name: &'static str, relay: &Arc<LocalRelay>, config: SessionConfig) -> Result<Self> {
        let transports = Arc::new(WebRtcTransportFactory::new(config.ice_servers.clone())?);
        let controller = Controller::init(InitArgs {
            id: None,
            config,
            channel: Arc::new(relay.channel()),
            transports,
        });

        controller.on_connection_state_change(move |status| {
            log::info!("{}: {}", name, status);
        });
        let (tx, inbox) = mpsc::unbounded_channel();
        controller.on_application_message(move |data| {
            if let Err(e) = tx.send(data) {
                log::error!("{}: failed to queue application message: {}", name, e);
            }
        });

        Ok(Self {
            name,
            controller,
            inbox,
        })
    }

    pub async fn join(&mut self, room: &RoomId) -> Result<()> {
        self.controller.join(room).await?;
        Ok(())
    }

    pub async fn await_connected(&self, timeout: Duration) -> Result<()> {
        if !self.controller.wait_for_phase(Phase::Connected, timeout).await {
            bail!(
                "{} did not connect (phase: {:?})",
                self.name,
                self.controller.phase()
            );
        }
        Ok(())
    }

    pub async fn receive(&mut self, timeout: Duration) -> Result<Bytes> {
        match tokio::time::timeout(timeout, self.inbox.recv()).await {
            Ok(Some(data)) => Ok(data),
            Ok(None) => bail!("{}: inbox closed", self.name),
            Err(_) => bail!("{}: nothing received within {:?}", self.name, timeout),
        }
    }
}
