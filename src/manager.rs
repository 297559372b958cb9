//! Initiator side: `PEManager` correlates requests with replies, enforces
//! per-device concurrency, and exposes the GET/SET/Subscribe API.
//!
//! The correlation table, request-ID allocator, and chunk reassembler for
//! inbound replies are all owned by a single reactor task, the same shape
//! as `reactor_task` elsewhere in this crate: callers talk to it over an
//! `mpsc` channel and get their answer back on a `oneshot`. Sending itself
//! happens directly from the calling task (the transport is required to
//! tolerate concurrent `send`/`broadcast`), so the reactor here only ever
//! touches its own private state — no lock is needed around it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Semaphore};
use tracing::{debug, trace, warn};

use crate::codec::{
    pe_get_inquiry, pe_set_inquiry, pe_subscribe_inquiry, ChunkReassembler, PeEnvelope, PeHeader,
};
use crate::config::EngineConfig;
use crate::error::{CiError, CiResult};
use crate::muid::Muid;
use crate::trace::{Direction, TraceBuffer};
use crate::transport::{DestinationId, Transport};

/// A completed PE response, decoded but left as raw body bytes for the
/// caller to interpret (or decode as JSON via the `*_json` helpers).
#[derive(Debug, Clone)]
pub struct PeResponse {
    pub status: u16,
    pub header: PeHeader,
    pub body: Vec<u8>,
}

impl PeResponse {
    fn from_envelope(envelope: PeEnvelope) -> CiResult<Self> {
        let status = envelope
            .header
            .status
            .ok_or_else(|| CiError::MalformedReply("missing status in PE header".to_string()))?;
        if !(200..300).contains(&status) {
            return Err(CiError::PeStatus {
                code: status,
                message: envelope.header.message.clone().unwrap_or_default(),
            });
        }
        Ok(PeResponse {
            status,
            header: envelope.header,
            body: envelope.body,
        })
    }

    pub fn json<T: DeserializeOwned>(&self) -> CiResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| CiError::MalformedReply(e.to_string()))
    }
}

/// Lightweight per-device health: consecutive failures and last success,
/// exposed for diagnostics. Not required by the request/reply contract
/// itself, just a cheap companion given the correlation table already
/// tracks per-device pending state.
#[derive(Debug, Default)]
pub struct DeviceHealth {
    consecutive_failures: AtomicU32,
    last_success_millis: AtomicU64,
}

impl DeviceHealth {
    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_success_millis.store(now, Ordering::Relaxed);
    }

    fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn has_ever_succeeded(&self) -> bool {
        self.last_success_millis.load(Ordering::Relaxed) != 0
    }
}

/// Allocates request IDs 1..127 for a single device, refusing to hand out
/// one already in use.
#[derive(Default)]
struct RequestIdAllocator {
    in_use: u128,
}

impl RequestIdAllocator {
    fn allocate(&mut self) -> Option<u8> {
        for id in 1u8..=127 {
            let bit = 1u128 << id;
            if self.in_use & bit == 0 {
                self.in_use |= bit;
                return Some(id);
            }
        }
        None
    }

    fn release(&mut self, id: u8) {
        self.in_use &= !(1u128 << id);
    }
}

struct PendingRequest {
    response_tx: oneshot::Sender<CiResult<PeEnvelope>>,
    deadline: Instant,
}

enum ManagerCommand {
    /// Reserves the next free request ID for `device`. Answered
    /// immediately from the reactor's in-memory allocator — no wire I/O.
    Allocate {
        device: Muid,
        response_tx: oneshot::Sender<Option<u8>>,
    },
    Request {
        destination: Muid,
        request_id: u8,
        deadline: Instant,
        response_tx: oneshot::Sender<CiResult<PeEnvelope>>,
    },
    /// Fed by the owning `CiManager`'s single dispatch loop whenever a PE
    /// reply frame arrives (GET/SET/Subscribe Reply).
    Reply { source: Muid, payload: Vec<u8> },
    /// Fed whenever a PE Notify frame arrives. Routed by `subscribeId`
    /// rather than request ID, since Notify is unsolicited and always
    /// carries request ID 0.
    Notify { source: Muid, payload: Vec<u8> },
    Cancel { destination: Muid, request_id: u8 },
    Shutdown,
}

async fn reactor_task<T: Transport>(
    transport: Arc<T>,
    mut cmd_rx: mpsc::Receiver<ManagerCommand>,
    health: Arc<AsyncMutex<HashMap<Muid, Arc<DeviceHealth>>>>,
    subscriptions: Arc<AsyncMutex<HashMap<String, mpsc::UnboundedSender<PeResponse>>>>,
) {
    let mut pending: HashMap<(Muid, u8), PendingRequest> = HashMap::new();
    let mut allocators: HashMap<Muid, RequestIdAllocator> = HashMap::new();
    let mut reassembler = ChunkReassembler::new();
    let mut cleanup = tokio::time::interval(Duration::from_millis(100));
    cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let _ = &transport; // transport is only used by callers' own send(); kept alive here via Arc clone.

    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ManagerCommand::Allocate { device, response_tx }) => {
                        let id = allocators.entry(device).or_default().allocate();
                        let _ = response_tx.send(id);
                    }
                    Some(ManagerCommand::Request { destination, request_id, deadline, response_tx }) => {
                        pending.insert((destination, request_id), PendingRequest { response_tx, deadline });
                        trace!(%destination, request_id, "registered pending PE request");
                    }
                    Some(ManagerCommand::Reply { source, payload }) => {
                        match reassembler.push(source, &payload) {
                            Some(envelope) => {
                                let key = (source, envelope.request_id);
                                if let Some(req) = pending.remove(&key) {
                                    if let Some(allocator) = allocators.get_mut(&source) {
                                        allocator.release(envelope.request_id);
                                    }
                                    let mut guard = health.lock().await;
                                    guard.entry(source).or_default().record_success();
                                    drop(guard);
                                    let _ = req.response_tx.send(Ok(envelope));
                                } else {
                                    debug!(%source, request_id = envelope.request_id, "discarding reply for no longer pending request");
                                }
                            }
                            None => trace!(%source, "buffered partial PE chunk"),
                        }
                    }
                    Some(ManagerCommand::Notify { source, payload }) => {
                        if let Some(envelope) = reassembler.push(source, &payload) {
                            match envelope.header.subscribe_id.clone() {
                                Some(subscribe_id) => {
                                    let guard = subscriptions.lock().await;
                                    if let Some(tx) = guard.get(&subscribe_id) {
                                        let response = PeResponse {
                                            status: envelope.header.status.unwrap_or(200),
                                            header: envelope.header,
                                            body: envelope.body,
                                        };
                                        let _ = tx.send(response);
                                    } else {
                                        debug!(%source, subscribe_id, "dropping Notify for unknown subscription");
                                    }
                                }
                                None => debug!(%source, "dropping Notify with no subscribeId"),
                            }
                        }
                    }
                    Some(ManagerCommand::Cancel { destination, request_id }) => {
                        if pending.remove(&(destination, request_id)).is_some() {
                            if let Some(allocator) = allocators.get_mut(&destination) {
                                allocator.release(request_id);
                            }
                            reassembler.discard(destination, request_id);
                            trace!(%destination, request_id, "cancelled pending PE request");
                        }
                    }
                    Some(ManagerCommand::Shutdown) | None => {
                        for (_, req) in pending.drain() {
                            let _ = req.response_tx.send(Err(CiError::Timeout));
                        }
                        break;
                    }
                }
            }

            _ = cleanup.tick() => {
                let now = Instant::now();
                let expired: Vec<(Muid, u8)> = pending
                    .iter()
                    .filter(|(_, req)| now > req.deadline)
                    .map(|(key, _)| *key)
                    .collect();
                for key in expired {
                    if let Some(req) = pending.remove(&key) {
                        if let Some(allocator) = allocators.get_mut(&key.0) {
                            allocator.release(key.1);
                        }
                        reassembler.discard(key.0, key.1);
                        let mut guard = health.lock().await;
                        guard.entry(key.0).or_default().record_failure();
                        drop(guard);
                        let _ = req.response_tx.send(Err(CiError::Timeout));
                        warn!(destination = %key.0, request_id = key.1, "PE request timed out");
                    }
                }
            }
        }
    }
}

/// Resolves a known MUID to the transport-level address to send frames to.
pub type DestinationResolver = Arc<dyn Fn(Muid) -> Option<DestinationId> + Send + Sync>;

/// Releases a pending request's slot in the reactor if the future holding
/// it is dropped before completion, per the no-abort-message cancellation
/// contract.
struct CancelGuard {
    cmd_tx: mpsc::Sender<ManagerCommand>,
    destination: Muid,
    request_id: u8,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.cmd_tx.try_send(ManagerCommand::Cancel {
                destination: self.destination,
                request_id: self.request_id,
            });
        }
    }
}

pub struct PEManager<T: Transport> {
    transport: Arc<T>,
    cmd_tx: mpsc::Sender<ManagerCommand>,
    device_semaphores: AsyncMutex<HashMap<Muid, Arc<Semaphore>>>,
    health: Arc<AsyncMutex<HashMap<Muid, Arc<DeviceHealth>>>>,
    subscriptions: Arc<AsyncMutex<HashMap<String, mpsc::UnboundedSender<PeResponse>>>>,
    resolver: DestinationResolver,
    trace: Option<Arc<std::sync::Mutex<TraceBuffer>>>,
    on_error: Option<Arc<dyn Fn(&CiError) + Send + Sync>>,
    config: EngineConfig,
    source_muid: Muid,
    device_id: u8,
}

impl<T: Transport> PEManager<T> {
    pub fn new(
        transport: Arc<T>,
        source_muid: Muid,
        device_id: u8,
        resolver: DestinationResolver,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let health: Arc<AsyncMutex<HashMap<Muid, Arc<DeviceHealth>>>> = Arc::new(AsyncMutex::new(HashMap::new()));
        let subscriptions: Arc<AsyncMutex<HashMap<String, mpsc::UnboundedSender<PeResponse>>>> =
            Arc::new(AsyncMutex::new(HashMap::new()));

        let reactor_transport = transport.clone();
        let reactor_health = health.clone();
        let reactor_subscriptions = subscriptions.clone();
        tokio::spawn(async move {
            reactor_task(reactor_transport, cmd_rx, reactor_health, reactor_subscriptions).await;
        });

        Arc::new(Self {
            transport,
            cmd_tx,
            device_semaphores: AsyncMutex::new(HashMap::new()),
            health,
            subscriptions,
            resolver,
            trace: None,
            on_error: None,
            config,
            source_muid,
            device_id,
        })
    }

    pub fn with_trace(mut self, trace: Arc<std::sync::Mutex<TraceBuffer>>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn with_on_error(mut self, on_error: Arc<dyn Fn(&CiError) + Send + Sync>) -> Self {
        self.on_error = Some(on_error);
        self
    }

    fn fail<R>(&self, err: CiError) -> CiResult<R> {
        if let Some(cb) = &self.on_error {
            cb(&err);
        }
        Err(err)
    }

    async fn record(&self, direction: Direction, endpoint: Muid, bytes: &[u8]) {
        if let Some(trace) = &self.trace {
            trace.lock().unwrap().record(direction, endpoint.value(), None, bytes.to_vec());
        }
    }

    /// Reserves the next free request ID for `device` from the reactor's
    /// allocator. Returns `None` (surfaced as `tooManyInFlight`) when all
    /// 127 IDs are currently pending for that device.
    async fn allocate_request_id(&self, device: Muid) -> Option<u8> {
        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx.send(ManagerCommand::Allocate { device, response_tx }).await.ok()?;
        response_rx.await.ok().flatten()
    }

    async fn semaphore_for(&self, device: Muid) -> Arc<Semaphore> {
        let mut guard = self.device_semaphores.lock().await;
        guard
            .entry(device)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.device_concurrency)))
            .clone()
    }

    /// Sends a pre-built PE frame to `device` and awaits its correlated
    /// reply, honoring the per-device concurrency cap and the configured
    /// timeout.
    async fn send_and_await(&self, device: Muid, request_id: u8, frame: Vec<u8>) -> CiResult<PeEnvelope> {
        let destination = (self.resolver)(device).ok_or(CiError::DeviceNotFound(device.value()))?;
        let semaphore = self.semaphore_for(device).await;
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| CiError::TransportError("semaphore closed".to_string()))?;

        let deadline = Instant::now() + self.config.request_timeout;
        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerCommand::Request {
                destination: device,
                request_id,
                deadline,
                response_tx,
            })
            .await
            .map_err(|_| CiError::TransportError("reactor channel closed".to_string()))?;

        let mut guard = CancelGuard {
            cmd_tx: self.cmd_tx.clone(),
            destination: device,
            request_id,
            armed: true,
        };

        self.record(Direction::Send, device, &frame).await;
        self.transport
            .send(Bytes::from(frame), destination)
            .await
            .map_err(|e| CiError::TransportError(e.to_string()))?;

        let result = response_rx.await.map_err(|_| CiError::TransportError("reactor dropped response".to_string()));
        guard.armed = false;

        match result {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(e),
        }
    }

    /// Routes an inbound PE GET/SET/Subscribe reply frame to the reactor
    /// for correlation. Called by the owning `CiManager`'s single dispatch
    /// loop, never directly by application code.
    pub async fn handle_reply_frame(&self, source: Muid, payload: Vec<u8>) {
        self.record(Direction::Receive, source, &payload).await;
        let _ = self.cmd_tx.send(ManagerCommand::Reply { source, payload }).await;
    }

    /// Routes an inbound PE Notify frame to the reactor, which forwards it
    /// to the subscription channel registered under its `subscribeId`.
    pub async fn handle_notify_frame(&self, source: Muid, payload: Vec<u8>) {
        self.record(Direction::Receive, source, &payload).await;
        let _ = self.cmd_tx.send(ManagerCommand::Notify { source, payload }).await;
    }

    pub async fn get(&self, resource: &str, device: Muid) -> CiResult<PeResponse> {
        self.get_with_header(resource, device, PeHeader::default().with_resource(resource))
            .await
    }

    pub async fn get_channel(&self, resource: &str, channel: u8, device: Muid) -> CiResult<PeResponse> {
        let mut header = PeHeader::default().with_resource(resource);
        header.extra.insert("channel".to_string(), serde_json::json!(channel));
        self.get_with_header(resource, device, header).await
    }

    async fn get_with_header(&self, _resource: &str, device: Muid, header: PeHeader) -> CiResult<PeResponse> {
        let request_id = self.allocate_request_id(device)
            .await
            .ok_or(CiError::TooManyInFlight)?;
        let frame = pe_get_inquiry(self.device_id, self.source_muid, device, request_id, &header);
        let envelope = self.send_and_await(device, request_id, frame).await;
        match envelope {
            Ok(envelope) => PeResponse::from_envelope(envelope).or_else(|e| self.fail(e)),
            Err(e) => self.fail(e),
        }
    }

    pub async fn get_json<V: DeserializeOwned>(&self, resource: &str, device: Muid) -> CiResult<V> {
        self.get(resource, device).await?.json()
    }

    pub async fn set(&self, resource: &str, data: &[u8], device: Muid) -> CiResult<PeResponse> {
        self.set_with_header(device, PeHeader::default().with_resource(resource), data)
            .await
    }

    pub async fn set_channel(&self, resource: &str, channel: u8, data: &[u8], device: Muid) -> CiResult<PeResponse> {
        let mut header = PeHeader::default().with_resource(resource);
        header.extra.insert("channel".to_string(), serde_json::json!(channel));
        self.set_with_header(device, header, data).await
    }

    async fn set_with_header(&self, device: Muid, header: PeHeader, data: &[u8]) -> CiResult<PeResponse> {
        let request_id = self.allocate_request_id(device)
            .await
            .ok_or(CiError::TooManyInFlight)?;
        let frame = pe_set_inquiry(self.device_id, self.source_muid, device, request_id, &header, data);
        let envelope = self.send_and_await(device, request_id, frame).await;
        match envelope {
            Ok(envelope) => PeResponse::from_envelope(envelope).or_else(|e| self.fail(e)),
            Err(e) => self.fail(e),
        }
    }

    pub async fn set_json<V: Serialize>(&self, resource: &str, data: &V, device: Muid) -> CiResult<PeResponse> {
        let bytes = serde_json::to_vec(data).map_err(|e| CiError::InvalidData(e.to_string()))?;
        self.set(resource, &bytes, device).await
    }

    /// Starts a subscription. On success, registers a channel under the
    /// Responder-issued `subscribeId` and returns it alongside the reply —
    /// `Notify` frames for this subscription arrive on that channel until
    /// `unsubscribe` is called.
    pub async fn subscribe(&self, resource: &str, device: Muid) -> CiResult<(PeResponse, mpsc::UnboundedReceiver<PeResponse>)> {
        let header = PeHeader::default().with_resource(resource).with_command("start");
        let request_id = self.allocate_request_id(device)
            .await
            .ok_or(CiError::TooManyInFlight)?;
        let frame = pe_subscribe_inquiry(self.device_id, self.source_muid, device, request_id, &header);
        let envelope = self.send_and_await(device, request_id, frame).await;
        let response = match envelope {
            Ok(envelope) => match PeResponse::from_envelope(envelope) {
                Ok(r) => Ok(r),
                Err(e) => self.fail(e),
            },
            Err(e) => self.fail(e),
        }?;

        let subscribe_id = response
            .header
            .subscribe_id
            .clone()
            .ok_or_else(|| CiError::MalformedReply("Subscribe Reply missing subscribeId".to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.lock().await.insert(subscribe_id, tx);
        Ok((response, rx))
    }

    pub async fn unsubscribe(&self, subscribe_id: &str, device: Muid) -> CiResult<PeResponse> {
        let header = PeHeader::default()
            .with_subscribe_id(subscribe_id)
            .with_command("end");
        let request_id = self.allocate_request_id(device)
            .await
            .ok_or(CiError::TooManyInFlight)?;
        let frame = pe_subscribe_inquiry(self.device_id, self.source_muid, device, request_id, &header);
        let envelope = self.send_and_await(device, request_id, frame).await;
        let result = match envelope {
            Ok(envelope) => PeResponse::from_envelope(envelope).or_else(|e| self.fail(e)),
            Err(e) => self.fail(e),
        };
        if result.is_ok() {
            self.subscriptions.lock().await.remove(subscribe_id);
        }
        result
    }

    pub async fn device_health(&self, device: Muid) -> Option<(u32, bool)> {
        let guard = self.health.lock().await;
        guard.get(&device).map(|h| (h.consecutive_failures(), h.has_ever_succeeded()))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ManagerCommand::Shutdown).await;
    }
}
