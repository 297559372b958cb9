//! Device discovery and MUID tracking: `CiManager` wraps a `PEManager` +
//! `PEResponder` pair, owns the single consumer of the transport's receive
//! stream, and routes each inbound frame to whichever of the two actually
//! owns it — Discovery/Invalidate MUID here, PE replies/notifies to the
//! manager, PE inquiries to the responder.
//!
//! This is the "single-logical-owner per pending request" rule from §5
//! applied one level up: only one task may ever poll `transport.received()`,
//! so that task has to be the one place that knows how to fan a frame out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::{self, CiMessage, CiMessageType};
use crate::config::EngineConfig;
use crate::identity::{CategorySupport, DeviceIdentity};
use crate::manager::{DestinationResolver, PEManager};
use crate::muid::Muid;
use crate::responder::PEResponder;
use crate::transport::{DestinationId, Transport, TransportError};

/// A node seen via Discovery Reply. Created on first reply, refreshed on
/// every subsequent one, removed on Invalidate MUID or an explicit sweep.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub muid: Muid,
    pub identity: DeviceIdentity,
    pub category_support: CategorySupport,
    pub max_sysex: u32,
    pub last_seen: Instant,
    pub destination: DestinationId,
}

pub struct CiManager<T: Transport> {
    transport: Arc<T>,
    manager: Arc<PEManager<T>>,
    responder: PEResponder<T>,
    devices: Arc<Mutex<HashMap<Muid, DiscoveredDevice>>>,
    identity: DeviceIdentity,
    category_support: CategorySupport,
    source_muid: Muid,
    device_id: u8,
    max_sysex: u32,
    discovered_tx: broadcast::Sender<DiscoveredDevice>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> CiManager<T> {
    pub fn new(
        transport: Arc<T>,
        source_muid: Muid,
        device_id: u8,
        identity: DeviceIdentity,
        category_support: CategorySupport,
        max_sysex: u32,
        config: EngineConfig,
    ) -> Arc<Self> {
        let devices: Arc<Mutex<HashMap<Muid, DiscoveredDevice>>> = Arc::new(Mutex::new(HashMap::new()));
        let resolver_devices = devices.clone();
        let resolver: DestinationResolver = Arc::new(move |muid| resolver_devices.lock().unwrap().get(&muid).map(|d| d.destination));

        let manager = PEManager::new(transport.clone(), source_muid, device_id, resolver.clone(), config.clone());
        let responder = PEResponder::new(transport.clone(), source_muid, device_id, resolver, config);
        responder.start();

        let (discovered_tx, _) = broadcast::channel(64);

        let this = Arc::new(Self {
            transport,
            manager,
            responder,
            devices,
            identity,
            category_support,
            source_muid,
            device_id,
            max_sysex,
            discovered_tx,
            dispatch: Mutex::new(None),
        });

        let dispatch_target = this.clone();
        let handle = tokio::spawn(async move { Self::dispatch_loop(dispatch_target).await });
        *this.dispatch.lock().unwrap() = Some(handle);

        this
    }

    pub fn manager(&self) -> &Arc<PEManager<T>> {
        &self.manager
    }

    pub fn responder(&self) -> &PEResponder<T> {
        &self.responder
    }

    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.lock().unwrap().values().cloned().collect()
    }

    /// `maxSysExSize` is tracked per discovered device but never clamps
    /// outgoing frame size automatically; a caller wanting enforcement reads
    /// it here and applies its own limit at the transport boundary.
    pub fn max_sysex_size_for(&self, muid: Muid) -> Option<u32> {
        self.devices.lock().unwrap().get(&muid).map(|d| d.max_sysex)
    }

    pub fn device_discovered(&self) -> broadcast::Receiver<DiscoveredDevice> {
        self.discovered_tx.subscribe()
    }

    pub async fn discover(&self) -> Result<(), TransportError> {
        let inquiry = codec::discovery_inquiry(self.device_id, self.source_muid, &self.identity, self.category_support, self.max_sysex, 0);
        self.transport.broadcast(Bytes::from(inquiry)).await
    }

    /// Drops any Responder subscription whose initiator MUID is no longer a
    /// known device.
    pub fn sweep_stale_subscriptions(&self) {
        let active: Vec<Muid> = self.devices.lock().unwrap().keys().copied().collect();
        self.responder.remove_subscriptions_not_in(&active);
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        self.responder.stop();
        if let Some(handle) = self.dispatch.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn dispatch_loop(this: Arc<Self>) {
        let mut stream = this.transport.received();
        while let Some(frame) = stream.next().await {
            this.route(frame.source, &frame.bytes).await;
        }
    }

    async fn route(&self, transport_source: DestinationId, bytes: &[u8]) {
        let Some(message) = codec::parse_message(bytes) else {
            return;
        };
        match message.message_type {
            CiMessageType::DiscoveryInquiry => self.handle_discovery_inquiry(transport_source, &message).await,
            CiMessageType::DiscoveryReply => self.handle_discovery_reply(transport_source, bytes).await,
            CiMessageType::InvalidateMuid => self.handle_invalidate_muid(&message),
            CiMessageType::PeCapabilityInquiry
            | CiMessageType::PeGetInquiry
            | CiMessageType::PeSetInquiry
            | CiMessageType::PeSubscribeInquiry => self.responder.handle_frame(transport_source, bytes).await,
            CiMessageType::PeGetReply | CiMessageType::PeSetReply | CiMessageType::PeSubscribeReply => {
                self.manager.handle_reply_frame(message.source, message.payload).await
            }
            CiMessageType::PeNotify => self.manager.handle_notify_frame(message.source, message.payload).await,
            CiMessageType::Nak => debug!(source = %message.source, "received NAK"),
        }
    }

    async fn handle_discovery_inquiry(&self, transport_source: DestinationId, message: &CiMessage) {
        if message.source == self.source_muid {
            return;
        }
        let reply = codec::discovery_reply(
            self.device_id,
            self.source_muid,
            message.source,
            &self.identity,
            self.category_support,
            self.max_sysex,
            0,
            0,
        );
        if let Err(e) = self.transport.send(Bytes::from(reply), transport_source).await {
            warn!(%e, "failed to answer discovery inquiry");
        }
    }

    async fn handle_discovery_reply(&self, transport_source: DestinationId, bytes: &[u8]) {
        let Some(info) = codec::parse_discovery_reply(bytes) else {
            return;
        };
        let device = DiscoveredDevice {
            muid: info.source,
            identity: info.identity,
            category_support: info.category_support,
            max_sysex: info.max_sysex,
            last_seen: Instant::now(),
            destination: transport_source,
        };
        self.devices.lock().unwrap().insert(info.source, device.clone());
        let _ = self.discovered_tx.send(device);
    }

    fn handle_invalidate_muid(&self, message: &CiMessage) {
        if let [b0, b1, b2, b3, ..] = message.payload.as_slice() {
            let target = Muid::from_bytes([*b0, *b1, *b2, *b3]);
            self.devices.lock().unwrap().remove(&target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ManufacturerId;
    use crate::transport::Loopback;
    use tokio::time::{timeout, Duration};

    fn korg_identity() -> DeviceIdentity {
        DeviceIdentity::new(ManufacturerId::Standard(0x42), 0x6B, 0x01, 0x0102_0304)
    }

    #[tokio::test]
    async fn discovery_inquiry_is_answered_and_emits_a_discovered_device_event() {
        let (initiator_side, responder_side) = Loopback::pair();
        let initiator_muid = Muid::new(0x0ABC_DEF);
        let responder_muid = Muid::new(0x0123_456);

        let initiator = CiManager::new(
            Arc::new(initiator_side),
            initiator_muid,
            0x7F,
            DeviceIdentity::new(ManufacturerId::Standard(0x01), 1, 1, 1),
            CategorySupport::PROPERTY_EXCHANGE,
            512,
            EngineConfig::default(),
        );
        let _responder = CiManager::new(
            Arc::new(responder_side),
            responder_muid,
            0x7F,
            korg_identity(),
            CategorySupport::PROPERTY_EXCHANGE,
            4096,
            EngineConfig::default(),
        );

        let mut discovered = initiator.device_discovered();
        initiator.discover().await.unwrap();

        let device = timeout(Duration::from_millis(500), discovered.recv()).await.unwrap().unwrap();
        assert_eq!(device.muid, responder_muid);
        assert_eq!(device.identity, korg_identity());
        assert!(device.category_support.supports_property_exchange());
    }
}
