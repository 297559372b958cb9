//! Batch GET/SET, pipelines, and conditional SET — orchestration built
//! entirely on top of `PEManager`'s GET/SET/JSON API, the same way a
//! higher-level client wraps a lower-level request/reply primitive
//! elsewhere in this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;

use crate::config::EngineConfig;
use crate::error::CiError;
use crate::manager::{PEManager, PeResponse};
use crate::muid::Muid;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_concurrency: usize,
    pub continue_on_failure: bool,
    pub stop_on_first_failure: bool,
    pub validate_payloads: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            continue_on_failure: true,
            stop_on_first_failure: false,
            validate_payloads: false,
        }
    }
}

impl BatchOptions {
    /// Starts from `EngineConfig.batch_concurrency` rather than the bare
    /// default of 4, so a manager's configured batch width actually reaches
    /// `batch_get`/`batch_set`/`batch_get_channel` instead of being shadowed
    /// by a caller who just writes `BatchOptions::default()`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_concurrency: config.batch_concurrency.max(1),
            ..Self::default()
        }
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn with_continue_on_failure(mut self, v: bool) -> Self {
        self.continue_on_failure = v;
        self
    }

    pub fn with_stop_on_first_failure(mut self, v: bool) -> Self {
        self.stop_on_first_failure = v;
        self
    }

    pub fn with_validate_payloads(mut self, v: bool) -> Self {
        self.validate_payloads = v;
        self
    }
}

pub type Validator = Arc<dyn Fn(&[u8]) -> Result<(), CiError> + Send + Sync>;

/// Maps resource name to a payload validator, consulted by `batch_set` when
/// `BatchOptions::validate_payloads` is set.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Validator>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource: impl Into<String>, validator: Validator) {
        self.validators.insert(resource.into(), validator);
    }

    fn validate(&self, resource: &str, body: &[u8]) -> Result<(), CiError> {
        match self.validators.get(resource) {
            Some(validator) => validator(body),
            None => Ok(()),
        }
    }
}

/// Outcome of a batch GET or SET: one result per resource key, keyed the
/// same way the caller supplied it (channel-specific variants use
/// `"<resource>[<channel>]"`).
#[derive(Debug, Default)]
pub struct BatchResult {
    pub results: HashMap<String, Result<PeResponse, CiError>>,
}

impl BatchResult {
    pub fn success_count(&self) -> usize {
        self.results.values().filter(|r| r.is_ok()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.results.values().filter(|r| r.is_err()).count()
    }
}

/// Runs `batchGet(names, device, options)`: one GET per resource, gated by a
/// semaphore of width `options.max_concurrency`.
pub async fn batch_get<T: Transport>(
    manager: &PEManager<T>,
    resources: &[&str],
    device: Muid,
    options: &BatchOptions,
) -> BatchResult {
    let semaphore = Semaphore::new(options.max_concurrency);
    let stop = AtomicBool::new(false);

    let futures = resources.iter().map(|resource| {
        let semaphore = &semaphore;
        let stop = &stop;
        async move {
            if !options.continue_on_failure && stop.load(Ordering::Relaxed) {
                return None;
            }
            let _permit = semaphore.acquire().await.expect("batch semaphore never closed");
            let result = manager.get(resource, device).await;
            if result.is_err() && !options.continue_on_failure {
                stop.store(true, Ordering::Relaxed);
            }
            Some((resource.to_string(), result))
        }
    });

    let results = futures::future::join_all(futures)
        .await
        .into_iter()
        .flatten()
        .collect();

    BatchResult { results }
}

/// Runs `batchSet(items, device, options)`: one SET per `(resource, body)`
/// pair, gated by `options.max_concurrency`. When `validate_payloads` is
/// set, `registry` is consulted before any wire send and a failing item is
/// never sent.
pub async fn batch_set<T: Transport>(
    manager: &PEManager<T>,
    items: &[(String, Vec<u8>)],
    device: Muid,
    options: &BatchOptions,
    registry: Option<&ValidatorRegistry>,
) -> BatchResult {
    let semaphore = Semaphore::new(options.max_concurrency);
    let stop = AtomicBool::new(false);

    let futures = items.iter().map(|(resource, body)| {
        let semaphore = &semaphore;
        let stop = &stop;
        async move {
            if stop.load(Ordering::Relaxed) {
                return None;
            }
            let _permit = semaphore.acquire().await.expect("batch semaphore never closed");

            if options.validate_payloads {
                if let Some(registry) = registry {
                    if let Err(e) = registry.validate(resource, body) {
                        if options.stop_on_first_failure {
                            stop.store(true, Ordering::Relaxed);
                        }
                        return Some((resource.clone(), Err(e)));
                    }
                }
            }

            let result = manager.set(resource, body, device).await;
            if result.is_err() && options.stop_on_first_failure {
                stop.store(true, Ordering::Relaxed);
            }
            Some((resource.clone(), result))
        }
    });

    let results = futures::future::join_all(futures)
        .await
        .into_iter()
        .flatten()
        .collect();

    BatchResult { results }
}

fn channel_key(resource: &str, channel: u8) -> String {
    format!("{resource}[{channel}]")
}

/// Channel-specific variant of `batch_get`, keying results as
/// `"<resource>[<channel>]"`.
pub async fn batch_get_channel<T: Transport>(
    manager: &PEManager<T>,
    resources: &[(&str, u8)],
    device: Muid,
    options: &BatchOptions,
) -> BatchResult {
    let semaphore = Semaphore::new(options.max_concurrency);
    let futures = resources.iter().map(|(resource, channel)| {
        let semaphore = &semaphore;
        async move {
            let _permit = semaphore.acquire().await.expect("batch semaphore never closed");
            let result = manager.get_channel(resource, *channel, device).await;
            (channel_key(resource, *channel), result)
        }
    });
    let results = futures::future::join_all(futures).await.into_iter().collect();
    BatchResult { results }
}

/// One step in a lazily-evaluated GET → transform → SET pipeline.
enum PipelineStep {
    Get(String),
    GetJson(String),
    Transform(Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>),
    Map(Arc<dyn Fn(Value) -> Value + Send + Sync>),
    SetJson(String),
    Where(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
}

/// Fluent builder over a chain of GET/transform/SET steps. Nothing runs
/// until `execute()` is called.
pub struct Pipeline<'a, T: Transport> {
    manager: &'a PEManager<T>,
    device: Muid,
    steps: Vec<PipelineStep>,
}

impl<'a, T: Transport> Pipeline<'a, T> {
    pub fn new(manager: &'a PEManager<T>, device: Muid) -> Self {
        Self {
            manager,
            device,
            steps: Vec::new(),
        }
    }

    pub fn get(mut self, resource: impl Into<String>) -> Self {
        self.steps.push(PipelineStep::Get(resource.into()));
        self
    }

    pub fn get_json(mut self, resource: impl Into<String>) -> Self {
        self.steps.push(PipelineStep::GetJson(resource.into()));
        self
    }

    pub fn transform(mut self, f: impl Fn(Value) -> Result<Value, String> + Send + Sync + 'static) -> Self {
        self.steps.push(PipelineStep::Transform(Arc::new(f)));
        self
    }

    pub fn map(mut self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.steps.push(PipelineStep::Map(Arc::new(f)));
        self
    }

    pub fn set_json(mut self, resource: impl Into<String>) -> Self {
        self.steps.push(PipelineStep::SetJson(resource.into()));
        self
    }

    /// Gates the remaining steps on `predicate(current_value)`; a failing
    /// predicate ends the pipeline with `pipelineConditionNotMet`.
    pub fn where_cond(mut self, predicate: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.steps.push(PipelineStep::Where(Arc::new(predicate)));
        self
    }

    pub async fn execute(self) -> Result<Value, CiError> {
        let mut value = Value::Null;
        for step in self.steps {
            match step {
                PipelineStep::Get(resource) => {
                    let response = self.manager.get(&resource, self.device).await?;
                    value = serde_json::from_slice(&response.body).unwrap_or(Value::Null);
                }
                PipelineStep::GetJson(resource) => {
                    value = self.manager.get_json(&resource, self.device).await?;
                }
                PipelineStep::Transform(f) => {
                    value = f(value).map_err(CiError::PipelineTransformFailed)?;
                }
                PipelineStep::Map(f) => {
                    value = f(value);
                }
                PipelineStep::SetJson(resource) => {
                    let response = self.manager.set_json(&resource, &value, self.device).await?;
                    value = serde_json::from_slice(&response.body).unwrap_or(value);
                }
                PipelineStep::Where(predicate) => {
                    if !predicate(&value) {
                        return Err(CiError::PipelineConditionNotMet);
                    }
                }
            }
        }
        Ok(value)
    }
}

/// Result of a `ConditionalSet::set_if` call.
#[derive(Debug)]
pub enum ConditionalOutcome {
    Updated {
        response: PeResponse,
        old: Value,
        new: Value,
    },
    Skipped(Value),
    Failed(CiError),
}

/// `conditionalSet(resource, device).setIf(predicate, transform)`:
/// GET → test predicate → if true, SET `transform(current)`. Atomicity is
/// best-effort — there is no compare-and-swap on the wire, so the predicate
/// runs once against a freshly-read value and a concurrent writer can still
/// race with the subsequent SET.
pub struct ConditionalSet<'a, T: Transport> {
    manager: &'a PEManager<T>,
    resource: String,
    device: Muid,
}

impl<'a, T: Transport> ConditionalSet<'a, T> {
    pub fn new(manager: &'a PEManager<T>, resource: impl Into<String>, device: Muid) -> Self {
        Self {
            manager,
            resource: resource.into(),
            device,
        }
    }

    pub async fn set_if(
        self,
        predicate: impl Fn(&Value) -> bool,
        transform: impl Fn(&Value) -> Value,
    ) -> ConditionalOutcome {
        let current = match self.manager.get_json::<Value>(&self.resource, self.device).await {
            Ok(v) => v,
            Err(e) => return ConditionalOutcome::Failed(e),
        };
        if !predicate(&current) {
            return ConditionalOutcome::Skipped(current);
        }
        let new_value = transform(&current);
        match self.manager.set_json(&self.resource, &new_value, self.device).await {
            Ok(response) => ConditionalOutcome::Updated {
                response,
                old: current,
                new: new_value,
            },
            Err(e) => ConditionalOutcome::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::config::EngineConfig;
    use crate::transport::Loopback;
    use std::sync::Arc as StdArc;

    /// Spawns a bare-bones responder that answers every GET/SET with a
    /// canned body, without pulling in the full `PEResponder` machinery —
    /// enough to exercise `PEManager`'s client-facing API in isolation.
    async fn spawn_echo_responder(
        loopback: Loopback,
        device_id: u8,
        source: Muid,
        reply_destination: crate::transport::DestinationId,
        known: Vec<(&'static str, &'static str)>,
    ) {
        use futures::StreamExt;
        let known: HashMap<&'static str, &'static str> = known.into_iter().collect();
        tokio::spawn(async move {
            let mut reassembler = codec::ChunkReassembler::new();
            let mut stream = loopback.received();
            while let Some(frame) = stream.next().await {
                if let Some(inquiry) = codec::parse_full_pe_get_inquiry(&frame.bytes, &mut reassembler) {
                    let resource = inquiry.resource.as_deref().unwrap_or("");
                    let reply = match known.get(resource) {
                        Some(body) => codec::pe_get_reply(
                            device_id,
                            source,
                            inquiry.source,
                            inquiry.request_id,
                            &codec::success_response_header(),
                            body.as_bytes(),
                        ),
                        None => codec::pe_get_reply(
                            device_id,
                            source,
                            inquiry.source,
                            inquiry.request_id,
                            &codec::error_response_header(404, "not found"),
                            &[],
                        ),
                    };
                    let _ = loopback.send(bytes::Bytes::from(reply), reply_destination).await;
                } else if let Some(inquiry) = codec::parse_full_pe_set_inquiry(&frame.bytes, &mut reassembler) {
                    let reply = codec::pe_set_reply(
                        device_id,
                        source,
                        inquiry.source,
                        inquiry.request_id,
                        &codec::success_response_header(),
                    );
                    let _ = loopback.send(bytes::Bytes::from(reply), reply_destination).await;
                }
            }
        });
    }

    async fn build_pair(known: Vec<(&'static str, &'static str)>) -> (StdArc<PEManager<Loopback>>, Muid) {
        use futures::StreamExt;

        let (initiator_side, responder_side) = Loopback::pair();
        let initiator_muid = Muid::new(1);
        let responder_muid = Muid::new(2);
        let initiator_id = initiator_side.id();
        let responder_id = responder_side.id();
        spawn_echo_responder(responder_side, 0x7F, responder_muid, initiator_id, known).await;

        let resolver: crate::manager::DestinationResolver =
            StdArc::new(move |m: Muid| if m == responder_muid { Some(responder_id) } else { None });

        let transport = StdArc::new(initiator_side);
        let dispatch_transport = transport.clone();
        let manager = PEManager::new(transport, initiator_muid, 0x7F, resolver, EngineConfig::default());

        // Stands in for the `CiManager` dispatch loop: the single consumer of
        // this side's inbound stream, routing PE replies to the manager.
        let dispatch_manager = manager.clone();
        tokio::spawn(async move {
            let mut stream = dispatch_transport.received();
            while let Some(frame) = stream.next().await {
                let Some(parsed) = codec::parse(&frame.bytes) else { continue };
                let is_pe_reply = matches!(
                    parsed.message_type,
                    codec::CiMessageType::PeGetReply
                        | codec::CiMessageType::PeSetReply
                        | codec::CiMessageType::PeSubscribeReply
                        | codec::CiMessageType::PeNotify
                );
                if is_pe_reply {
                    let payload = frame.bytes[parsed.remainder_start..frame.bytes.len() - 1].to_vec();
                    dispatch_manager.handle_reply_frame(parsed.source, payload).await;
                }
            }
        });

        (manager, responder_muid)
    }

    #[test]
    fn from_config_carries_batch_concurrency_into_max_concurrency() {
        let config = EngineConfig::default().with_batch_concurrency(9);
        let options = BatchOptions::from_config(&config);
        assert_eq!(options.max_concurrency, 9);
        assert!(options.continue_on_failure, "the rest of the defaults should be untouched");
    }

    #[tokio::test]
    async fn batch_get_reports_partial_failure() {
        let (manager, device) = build_pair(vec![("A", "a-body"), ("B", "b-body")]).await;
        let result = batch_get(&manager, &["A", "B", "C"], device, &BatchOptions::default()).await;
        assert_eq!(result.success_count(), 2);
        assert_eq!(result.failure_count(), 1);
        assert!(matches!(result.results["C"], Err(CiError::PeStatus { code: 404, .. })));
    }

    #[tokio::test]
    async fn conditional_set_skips_when_predicate_fails() {
        let (manager, device) = build_pair(vec![("Volume", r#"{"level":80}"#)]).await;
        let outcome = ConditionalSet::new(&manager, "Volume", device)
            .set_if(|v| v["level"].as_i64().unwrap_or(0) < 50, |v| {
                let mut v = v.clone();
                v["level"] = serde_json::json!(100);
                v
            })
            .await;
        assert!(matches!(outcome, ConditionalOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn pipeline_where_cond_short_circuits() {
        let (manager, device) = build_pair(vec![("Volume", r#"{"level":80}"#)]).await;
        let result = Pipeline::new(&manager, device)
            .get_json("Volume")
            .where_cond(|v| v["level"].as_i64().unwrap_or(0) > 100)
            .execute()
            .await;
        assert!(matches!(result, Err(CiError::PipelineConditionNotMet)));
    }
}
