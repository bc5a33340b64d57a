use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::{
    Candidate, Description, MediaTransport, Role, SessionError, TransportEvent, TransportFactory,
    TransportState,
};

/// label of the data channel carrying application messages
pub const APPLICATION_CHANNEL: &str = "app";

/// creates an RTCPeerConnection per session attempt
pub struct WebRtcTransportFactory {
    api: webrtc::api::API,
    ice_servers: Vec<String>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        Ok(Self {
            api: create_api()?,
            ice_servers,
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, SessionError> {
        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }
        let connection = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| SessionError::TransportFailure(e.to_string()))?;
        let transport = WebRtcTransport {
            connection: Arc::new(connection),
            data_channel: Arc::new(Mutex::new(None)),
            events,
        };
        transport.register_callbacks();
        Ok(Arc::new(transport))
    }
}

pub struct WebRtcTransport {
    connection: Arc<RTCPeerConnection>,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl WebRtcTransport {
    fn register_callbacks(&self) {
        // send discovered ice candidates (for self) to the remote peer
        let tx = self.events.clone();
        self.connection
            .on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let candidate = match c {
                        Some(c) => c,
                        // end of gathering
                        None => return,
                    };
                    let event = candidate
                        .to_json()
                        .map_err(anyhow::Error::from)
                        .and_then(|init| Ok(serde_json::to_value(init)?));
                    match event {
                        Ok(value) => {
                            if tx
                                .send(TransportEvent::LocalCandidate(Candidate::new(value)))
                                .is_err()
                            {
                                log::debug!("local candidate dropped: attempt is gone");
                            }
                        }
                        Err(e) => log::error!("failed to serialize ice candidate: {}", e),
                    }
                })
            }));

        let tx = self.events.clone();
        self.connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                log::info!("peer connection state has changed: {}", state);
                let mapped = match state {
                    RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                        TransportState::New
                    }
                    RTCPeerConnectionState::Connecting => TransportState::Connecting,
                    RTCPeerConnectionState::Connected => TransportState::Connected,
                    RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                    RTCPeerConnectionState::Failed => TransportState::Failed,
                    RTCPeerConnectionState::Closed => TransportState::Closed,
                };
                if tx.send(TransportEvent::StateChanged(mapped)).is_err() {
                    log::debug!("state change dropped: attempt is gone");
                }
                Box::pin(async {})
            }));

        // the responder learns about the application channel from the initiator
        let tx = self.events.clone();
        let slot = self.data_channel.clone();
        self.connection
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                log::debug!("data channel {} opened by peer", dc.label());
                attach_data_channel(&dc, tx.clone());
                *slot.lock() = Some(dc);
                Box::pin(async {})
            }));
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn create_local_description(&self, role: Role) -> Result<Description> {
        let local = match role {
            Role::Initiator => {
                // must exist before the offer so it is negotiated
                let dc = self
                    .connection
                    .create_data_channel(APPLICATION_CHANNEL, None)
                    .await?;
                attach_data_channel(&dc, self.events.clone());
                *self.data_channel.lock() = Some(dc);
                self.connection.create_offer(None).await?
            }
            Role::Responder => self.connection.create_answer(None).await?,
            Role::Undetermined => bail!("cannot describe a session without a role"),
        };
        // starts ice gathering
        self.connection.set_local_description(local.clone()).await?;
        Ok(Description::new(serde_json::to_value(&local)?))
    }

    async fn apply_remote_description(&self, description: Description) -> Result<()> {
        let remote: RTCSessionDescription = serde_json::from_value(description.into_value())?;
        let remote = match remote.sdp_type {
            RTCSdpType::Offer => RTCSessionDescription::offer(remote.sdp)?,
            RTCSdpType::Answer => RTCSessionDescription::answer(remote.sdp)?,
            other => bail!("unsupported remote description type: {}", other),
        };
        self.connection.set_remote_description(remote).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.into_value())?;
        self.connection.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn send_application_message(&self, data: Bytes) -> Result<()> {
        let dc = self.data_channel.lock().clone();
        match dc {
            Some(dc) => {
                dc.send(&data).await?;
                Ok(())
            }
            None => bail!("application channel is not open"),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            log::warn!("failed to close peer connection: {}", e);
        }
    }
}

fn attach_data_channel(dc: &Arc<RTCDataChannel>, tx: mpsc::UnboundedSender<TransportEvent>) {
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if tx
            .send(TransportEvent::ApplicationMessage(msg.data))
            .is_err()
        {
            log::debug!("application message dropped: attempt is gone");
        }
        Box::pin(async {})
    }));
}

// todo: make codecs configurable once media tracks are carried
fn create_api() -> Result<webrtc::api::API> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;

    // the RTP/RTCP pipeline. each RTCPeerConnection built from this API shares
    // the default interceptors (NACKs, RTCP reports)
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}
