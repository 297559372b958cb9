//! Responder side: `PEResponder` owns a resource registry and subscription
//! map, and answers PE GET/SET/Subscribe inquiries.
//!
//! Unlike `PEManager`, this container has no dedicated task: dispatch never
//! suspends except for the final transport send, so a plain
//! `std::sync::Mutex` around the registry/subscriptions/reassembler is
//! enough to serialize access (the alternative shape §9's design notes call
//! out explicitly). Frames are fed in by whichever task owns the transport's
//! single receive stream — normally `CiManager` — via `handle_frame`, the
//! same external-feed shape `PEManager::handle_reply_frame` uses for the
//! same single-consumer reason.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::codec::{
    self, error_response_header, notify_header, pe_capability_reply, pe_get_reply, pe_notify, pe_set_reply,
    pe_subscribe_reply, subscribe_response_header, success_response_header, CiMessageType, ChunkReassembler,
};
use crate::config::EngineConfig;
use crate::error::CiError;
use crate::manager::DestinationResolver;
use crate::muid::Muid;
use crate::resource::Resource;
use crate::trace::{Direction, TraceBuffer};
use crate::transport::{DestinationId, Transport};

#[derive(Debug, Clone)]
struct Subscription {
    subscribe_id: String,
    resource: String,
    source: Muid,
}

struct ResponderState {
    resources: HashMap<String, Arc<dyn Resource>>,
    subscriptions: HashMap<String, Subscription>,
    subscription_index: HashMap<(String, Muid), String>,
    reassembler: ChunkReassembler,
    next_subscribe_id: u64,
    running: bool,
}

impl ResponderState {
    fn new() -> Self {
        Self {
            resources: HashMap::new(),
            subscriptions: HashMap::new(),
            subscription_index: HashMap::new(),
            reassembler: ChunkReassembler::new(),
            next_subscribe_id: 1,
            running: false,
        }
    }
}

/// Maps a `CiError` raised by a resource handler to the PE status code a
/// reply should carry.
fn status_for_error(e: &CiError) -> (u16, String) {
    match e {
        CiError::ReadOnly(msg) => (405, msg.clone()),
        CiError::ResourceNotFound(msg) => (404, msg.clone()),
        CiError::InvalidData(msg) => (400, msg.clone()),
        other => (500, other.to_string()),
    }
}

pub struct PEResponder<T: Transport> {
    transport: Arc<T>,
    state: Mutex<ResponderState>,
    resolver: DestinationResolver,
    trace: Option<Arc<Mutex<TraceBuffer>>>,
    config: EngineConfig,
    source_muid: Muid,
    device_id: u8,
}

impl<T: Transport> PEResponder<T> {
    pub fn new(transport: Arc<T>, source_muid: Muid, device_id: u8, resolver: DestinationResolver, config: EngineConfig) -> Self {
        Self {
            transport,
            state: Mutex::new(ResponderState::new()),
            resolver,
            trace: None,
            config,
            source_muid,
            device_id,
        }
    }

    pub fn with_trace(mut self, trace: Arc<Mutex<TraceBuffer>>) -> Self {
        self.trace = Some(trace);
        self
    }

    async fn record(&self, direction: Direction, endpoint: Muid, bytes: &[u8]) {
        if let Some(trace) = &self.trace {
            trace.lock().unwrap().record(direction, endpoint.value(), None, bytes.to_vec());
        }
    }

    pub fn register_resource(&self, name: impl Into<String>, resource: Arc<dyn Resource>) {
        self.state.lock().unwrap().resources.insert(name.into(), resource);
    }

    pub fn unregister_resource(&self, name: &str) {
        self.state.lock().unwrap().resources.remove(name);
    }

    pub fn start(&self) {
        self.state.lock().unwrap().running = true;
    }

    /// Stops answering inquiries. Existing subscriptions are left in place,
    /// per the rule that only `remove_subscriptions_not_in` or process end
    /// clears them.
    pub fn stop(&self) {
        self.state.lock().unwrap().running = false;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn subscriber_muids(&self) -> Vec<Muid> {
        self.state.lock().unwrap().subscriptions.values().map(|s| s.source).collect()
    }

    /// Drops any subscription whose initiator MUID is not in `active` —
    /// back-edges are held as MUIDs rather than pointers, so a restarted
    /// initiator is simply absent from this list.
    pub fn remove_subscriptions_not_in(&self, active: &[Muid]) {
        let keep: HashSet<Muid> = active.iter().copied().collect();
        let mut state = self.state.lock().unwrap();
        state.subscriptions.retain(|_, s| keep.contains(&s.source));
        state.subscription_index.retain(|(_, muid), _| keep.contains(muid));
    }

    async fn send_frame(&self, frame: Vec<u8>, destination: DestinationId, peer: Muid) -> bool {
        self.record(Direction::Send, peer, &frame).await;
        match self.transport.send(Bytes::from(frame), destination).await {
            Ok(()) => true,
            Err(e) => {
                warn!(%e, %peer, "responder send failed");
                false
            }
        }
    }

    /// Broadcasts a PE Notify to every subscriber of `resource` not in
    /// `exclude`. Best-effort, fire-and-forget, FIFO per subscriber (each
    /// send is awaited in turn). Returns how many deliveries were attempted
    /// successfully at the transport layer.
    pub async fn notify(&self, resource: &str, body: &[u8], exclude: &[Muid]) -> usize {
        let targets: Vec<(String, Muid)> = {
            let state = self.state.lock().unwrap();
            state
                .subscriptions
                .values()
                .filter(|s| s.resource == resource && !exclude.contains(&s.source))
                .map(|s| (s.subscribe_id.clone(), s.source))
                .collect()
        };

        let mut delivered = 0;
        for (subscribe_id, muid) in targets {
            let Some(destination) = (self.resolver)(muid) else {
                debug!(%muid, "dropping notify: no transport destination for subscriber");
                continue;
            };
            let header = notify_header(subscribe_id, resource);
            // Notify is unsolicited and always carries request id 0, never
            // allocated to a tracked GET/SET/Subscribe request, so an
            // initiator's reassembler can tell the two apart unambiguously.
            let frame = pe_notify(self.device_id, self.source_muid, muid, 0, &header, body);
            if self.send_frame(frame, destination, muid).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Feeds one inbound frame. The single consumer of the transport's
    /// receive stream (normally `CiManager`) calls this for every frame
    /// addressed here.
    pub async fn handle_frame(&self, transport_source: DestinationId, bytes: &[u8]) {
        if !self.is_running() {
            return;
        }
        let Some(header) = codec::parse(bytes) else {
            return;
        };
        if header.destination != self.source_muid && !header.destination.is_broadcast() {
            debug!(destination = %header.destination, own = %self.source_muid, "dropping frame addressed elsewhere");
            return;
        }
        self.record(Direction::Receive, header.source, bytes).await;

        match header.message_type {
            CiMessageType::PeCapabilityInquiry => self.handle_capability_inquiry(transport_source, header.source).await,
            CiMessageType::PeGetInquiry => self.handle_get(transport_source, header.source, bytes).await,
            CiMessageType::PeSetInquiry => self.handle_set(transport_source, header.source, bytes).await,
            CiMessageType::PeSubscribeInquiry => self.handle_subscribe(transport_source, header.source, bytes).await,
            CiMessageType::PeSubscribeReply => {
                debug!(source = %header.source, "ignoring subscribe reply acknowledgement");
            }
            _ => {
                // Discovery and other CI-level messages belong to CiManager.
            }
        }
    }

    async fn handle_capability_inquiry(&self, transport_source: DestinationId, ci_source: Muid) {
        let max_simultaneous = self.config.device_concurrency.min(0x7F) as u8;
        let reply = pe_capability_reply(
            self.device_id,
            self.source_muid,
            ci_source,
            max_simultaneous,
            self.config.pe_version_major,
            self.config.pe_version_minor,
        );
        self.send_frame(reply, transport_source, ci_source).await;
    }

    async fn handle_get(&self, transport_source: DestinationId, ci_source: Muid, bytes: &[u8]) {
        let reply = {
            let mut state = self.state.lock().unwrap();
            let Some(inquiry) = codec::parse_full_pe_get_inquiry(bytes, &mut state.reassembler) else {
                return;
            };
            let resource_name = inquiry.resource.clone().unwrap_or_default();
            match state.resources.get(&resource_name) {
                None => pe_get_reply(
                    self.device_id,
                    self.source_muid,
                    ci_source,
                    inquiry.request_id,
                    &error_response_header(404, format!("resource not found: {resource_name}")),
                    &[],
                ),
                Some(resource) => match resource.get(&inquiry.header) {
                    Ok(body) => {
                        let header = resource.response_header(&inquiry.header, &body);
                        pe_get_reply(self.device_id, self.source_muid, ci_source, inquiry.request_id, &header, &body)
                    }
                    Err(e) => {
                        let (code, message) = status_for_error(&e);
                        pe_get_reply(
                            self.device_id,
                            self.source_muid,
                            ci_source,
                            inquiry.request_id,
                            &error_response_header(code, message),
                            &[],
                        )
                    }
                },
            }
        };
        self.send_frame(reply, transport_source, ci_source).await;
    }

    async fn handle_set(&self, transport_source: DestinationId, ci_source: Muid, bytes: &[u8]) {
        let reply = {
            let mut state = self.state.lock().unwrap();
            let Some(inquiry) = codec::parse_full_pe_set_inquiry(bytes, &mut state.reassembler) else {
                return;
            };
            let resource_name = inquiry.resource.clone().unwrap_or_default();
            let header = match state.resources.get(&resource_name) {
                None => error_response_header(404, format!("resource not found: {resource_name}")),
                Some(resource) => match resource.set(&inquiry.header, &inquiry.body) {
                    Ok(_) => success_response_header(),
                    Err(e) => {
                        let (code, message) = status_for_error(&e);
                        error_response_header(code, message)
                    }
                },
            };
            pe_set_reply(self.device_id, self.source_muid, ci_source, inquiry.request_id, &header)
        };
        self.send_frame(reply, transport_source, ci_source).await;
    }

    async fn handle_subscribe(&self, transport_source: DestinationId, ci_source: Muid, bytes: &[u8]) {
        let reply = {
            let mut state = self.state.lock().unwrap();
            let Some(inquiry) = codec::parse_full_pe_subscribe_inquiry(bytes, &mut state.reassembler) else {
                return;
            };
            let resource_name = inquiry.resource.clone().unwrap_or_default();
            let command = inquiry.header.command.clone().unwrap_or_default();

            let header = match command.as_str() {
                "start" => {
                    let dedup_key = (resource_name.clone(), ci_source);
                    if let Some(existing_id) = state.subscription_index.get(&dedup_key).cloned() {
                        subscribe_response_header(200, existing_id)
                    } else {
                        match state.resources.get(&resource_name) {
                            None => error_response_header(404, format!("resource not found: {resource_name}")),
                            Some(resource) if !resource.supports_subscription() => {
                                error_response_header(405, format!("{resource_name} does not support subscription"))
                            }
                            Some(_) => {
                                let subscribe_id = format!("sub-{}", state.next_subscribe_id);
                                state.next_subscribe_id += 1;
                                state.subscriptions.insert(
                                    subscribe_id.clone(),
                                    Subscription {
                                        subscribe_id: subscribe_id.clone(),
                                        resource: resource_name.clone(),
                                        source: ci_source,
                                    },
                                );
                                state.subscription_index.insert(dedup_key, subscribe_id.clone());
                                subscribe_response_header(200, subscribe_id)
                            }
                        }
                    }
                }
                "end" => match inquiry.header.subscribe_id.clone() {
                    Some(subscribe_id) => match state.subscriptions.remove(&subscribe_id) {
                        Some(sub) => {
                            state.subscription_index.remove(&(sub.resource, sub.source));
                            subscribe_response_header(200, subscribe_id)
                        }
                        None => error_response_header(404, format!("unknown subscribeId: {subscribe_id}")),
                    },
                    None => error_response_header(400, "subscribe end missing subscribeId"),
                },
                other => error_response_header(400, format!("unsupported subscribe command: {other}")),
            };
            pe_subscribe_reply(self.device_id, self.source_muid, ci_source, inquiry.request_id, &header)
        };
        self.send_frame(reply, transport_source, ci_source).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{InMemoryResource, StaticResource};
    use crate::transport::Loopback;

    fn responder_over(side: Loopback, responder_muid: Muid, peer_id: DestinationId) -> PEResponder<Loopback> {
        let resolver: DestinationResolver = Arc::new(move |_muid| Some(peer_id));
        PEResponder::new(Arc::new(side), responder_muid, 0x7F, resolver, EngineConfig::default())
    }

    #[tokio::test]
    async fn unknown_resource_get_replies_404() {
        let (a, b) = Loopback::pair();
        let responder_muid = Muid::new(1);
        let initiator_muid = Muid::new(2);
        let responder = responder_over(a, responder_muid, b.id());
        responder.start();

        let frame = codec::pe_get_inquiry(
            0x7F,
            initiator_muid,
            responder_muid,
            5,
            &codec::PeHeader::default().with_resource("Missing"),
        );
        responder.handle_frame(b.id(), &frame).await;

        use futures::StreamExt;
        let received = b.received().next().await.unwrap();
        let mut reassembler = ChunkReassembler::new();
        let envelope = codec::parse_full_pe_reply(&received.bytes, &mut reassembler).unwrap();
        assert_eq!(envelope.header.status, Some(404));
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_in_memory_resource() {
        let (a, b) = Loopback::pair();
        let responder_muid = Muid::new(1);
        let initiator_muid = Muid::new(2);
        let responder = responder_over(a, responder_muid, b.id());
        responder.start();
        responder.register_resource("Volume", Arc::new(InMemoryResource::new(b"{\"level\":10}".to_vec())));

        let set_frame = codec::pe_set_inquiry(
            0x7F,
            initiator_muid,
            responder_muid,
            1,
            &codec::PeHeader::default().with_resource("Volume"),
            b"{\"level\":50}",
        );
        responder.handle_frame(b.id(), &set_frame).await;

        use futures::StreamExt;
        let set_reply = b.received().next().await.unwrap();
        let mut reassembler = ChunkReassembler::new();
        let envelope = codec::parse_full_pe_reply(&set_reply.bytes, &mut reassembler).unwrap();
        assert_eq!(envelope.header.status, Some(200));

        let get_frame = codec::pe_get_inquiry(
            0x7F,
            initiator_muid,
            responder_muid,
            2,
            &codec::PeHeader::default().with_resource("Volume"),
        );
        responder.handle_frame(b.id(), &get_frame).await;
        let get_reply = b.received().next().await.unwrap();
        let envelope = codec::parse_full_pe_reply(&get_reply.bytes, &mut reassembler).unwrap();
        assert_eq!(envelope.body, b"{\"level\":50}");
    }

    #[tokio::test]
    async fn subscribe_start_is_idempotent_per_resource_and_source() {
        let (a, b) = Loopback::pair();
        let responder_muid = Muid::new(1);
        let initiator_muid = Muid::new(2);
        let responder = responder_over(a, responder_muid, b.id());
        responder.start();
        responder.register_resource("Patch", Arc::new(StaticResource::new(b"x".to_vec()).with_subscription(true)));

        let sub_frame = codec::pe_subscribe_inquiry(
            0x7F,
            initiator_muid,
            responder_muid,
            1,
            &codec::PeHeader::default().with_resource("Patch").with_command("start"),
        );
        use futures::StreamExt;
        let mut stream = b.received();

        responder.handle_frame(b.id(), &sub_frame).await;
        let first = stream.next().await.unwrap();
        let mut reassembler = ChunkReassembler::new();
        let first_envelope = codec::parse_full_pe_reply(&first.bytes, &mut reassembler).unwrap();
        let first_id = first_envelope.header.subscribe_id.clone().unwrap();

        responder.handle_frame(b.id(), &sub_frame).await;
        let second = stream.next().await.unwrap();
        let second_envelope = codec::parse_full_pe_reply(&second.bytes, &mut reassembler).unwrap();
        assert_eq!(second_envelope.header.subscribe_id.as_deref(), Some(first_id.as_str()));
        assert_eq!(responder.subscriber_muids(), vec![initiator_muid]);
    }

    #[tokio::test]
    async fn notify_skips_excluded_muids() {
        let (a, b) = Loopback::pair();
        let responder_muid = Muid::new(1);
        let subscriber = Muid::new(2);
        let responder = responder_over(a, responder_muid, b.id());
        responder.start();
        responder.register_resource("Patch", Arc::new(StaticResource::new(b"x".to_vec()).with_subscription(true)));

        let sub_frame = codec::pe_subscribe_inquiry(
            0x7F,
            subscriber,
            responder_muid,
            1,
            &codec::PeHeader::default().with_resource("Patch").with_command("start"),
        );
        responder.handle_frame(b.id(), &sub_frame).await;

        use futures::StreamExt;
        let mut stream = b.received();
        stream.next().await.unwrap(); // subscribe reply

        let delivered = responder.notify("Patch", b"{\"name\":\"Lead\"}", &[subscriber]).await;
        assert_eq!(delivered, 0);

        let delivered = responder.notify("Patch", b"{\"name\":\"Lead\"}", &[]).await;
        assert_eq!(delivered, 1);
        let notify_frame = stream.next().await.unwrap();
        let mut reassembler = ChunkReassembler::new();
        let envelope = codec::parse_full_pe_reply(&notify_frame.bytes, &mut reassembler).unwrap();
        assert_eq!(envelope.body, b"{\"name\":\"Lead\"}");
    }
}
