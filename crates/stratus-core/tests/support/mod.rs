//! Recording doubles for the session engine's external seams.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;

use stratus_core::{
    CallContext, Claims, ClaimsVerifier, CommandService, ConfirmDeviceMetadataUpdateRequest,
    ConfirmKind, ConfirmResourceRequest, DeviceEventHandler, DeviceFeedEvent, DeviceFeedStream,
    DeviceFeedSubscriptionRequest, DeviceMetadata, LivenessTracker,
    NotifyResourceChangedRequest, OwnerCache, ResourceLink, ServiceError, ShadowSynchronization,
    UnpublishResourceLinksRequest, UnpublishResourceLinksResponse, Unsubscribe,
    UpdateDeviceMetadataRequest, ConnectionStatus,
};
use stratus_proto::{
    Code, DeviceRequest, DeviceTransport, Href, Message, NotificationHandler, Observation,
    ProtoError,
};

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Poll until `predicate` holds; panic after ~2s.
pub async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    for _ in 0..400 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

// ── Transport ────────────────────────────────────────────────────────

struct MockObservation {
    cancels: Arc<AtomicU32>,
}

#[async_trait]
impl Observation for MockObservation {
    async fn cancel(&self) -> Result<(), ProtoError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockTransport {
    pub requests: StdMutex<Vec<DeviceRequest>>,
    responses: StdMutex<HashMap<Href, VecDeque<Result<Message, ProtoError>>>>,
    handlers: StdMutex<HashMap<Href, NotificationHandler>>,
    pub observe_cancels: Arc<AtomicU32>,
    pub written: StdMutex<Vec<Message>>,
    discovery_observable: bool,
    closed: AtomicBool,
    sequence: AtomicU64,
}

impl MockTransport {
    pub fn new(discovery_observable: bool) -> Arc<Self> {
        Arc::new(Self {
            requests: StdMutex::new(Vec::new()),
            responses: StdMutex::new(HashMap::new()),
            handlers: StdMutex::new(HashMap::new()),
            observe_cancels: Arc::new(AtomicU32::new(0)),
            written: StdMutex::new(Vec::new()),
            discovery_observable,
            closed: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
        })
    }

    /// Script the next response for requests to `href`.
    pub fn push_response(&self, href: &str, response: Result<Message, ProtoError>) {
        lock(&self.responses)
            .entry(href.to_owned())
            .or_default()
            .push_back(response);
    }

    pub fn handler_for(&self, href: &str) -> Option<NotificationHandler> {
        lock(&self.handlers).get(href).cloned()
    }

    pub fn observed_hrefs(&self) -> Vec<Href> {
        lock(&self.handlers).keys().cloned().collect()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn written_codes(&self) -> Vec<Code> {
        lock(&self.written).iter().map(|m| m.code).collect()
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    async fn request(&self, request: DeviceRequest) -> Result<Message, ProtoError> {
        let href = request.href.clone();
        lock(&self.requests).push(request);
        let scripted = lock(&self.responses)
            .get_mut(&href)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(Message::new(Code::Changed)))
    }

    async fn observe(
        &self,
        href: &Href,
        handler: NotificationHandler,
    ) -> Result<Box<dyn Observation>, ProtoError> {
        if href == stratus_proto::DISCOVERY_HREF && !self.discovery_observable {
            return Err(ProtoError::NotObservable(href.clone()));
        }
        lock(&self.handlers).insert(href.clone(), handler);
        Ok(Box::new(MockObservation {
            cancels: Arc::clone(&self.observe_cancels),
        }))
    }

    fn write_message(&self, message: Message) {
        lock(&self.written).push(message);
    }

    fn remote_addr(&self) -> String {
        "203.0.113.7:56001".to_owned()
    }

    fn sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ── Backend ──────────────────────────────────────────────────────────

/// Flattened record of one backend call, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Notify {
        href: Href,
        code: Code,
    },
    Confirm {
        kind: ConfirmKind,
        correlation_id: String,
        code: Code,
        body: Vec<u8>,
    },
    UpdateMetadata {
        device_id: String,
        status: ConnectionStatus,
    },
    ConfirmMetadata {
        correlation_id: String,
        shadow: ShadowSynchronization,
    },
    Unpublish {
        hrefs: Vec<Href>,
    },
    GetLinks,
    GetMetadata,
    Subscribe,
}

struct ChannelStream {
    rx: mpsc::Receiver<DeviceFeedEvent>,
}

#[async_trait]
impl DeviceFeedStream for ChannelStream {
    async fn recv(&mut self) -> Result<Option<DeviceFeedEvent>, ServiceError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

pub struct MockBackend {
    calls: StdMutex<Vec<BackendCall>>,
    pub fail_notify: AtomicBool,
    pub fail_update_metadata: AtomicBool,
    pub fail_confirm_metadata: AtomicBool,
    shadow: StdMutex<ShadowSynchronization>,
    links: StdMutex<Vec<ResourceLink>>,
    feed_senders: StdMutex<Vec<mpsc::Sender<DeviceFeedEvent>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: StdMutex::new(Vec::new()),
            fail_notify: AtomicBool::new(false),
            fail_update_metadata: AtomicBool::new(false),
            fail_confirm_metadata: AtomicBool::new(false),
            shadow: StdMutex::new(ShadowSynchronization::Enabled),
            links: StdMutex::new(Vec::new()),
            feed_senders: StdMutex::new(Vec::new()),
        })
    }

    pub fn set_shadow(&self, shadow: ShadowSynchronization) {
        *lock(&self.shadow) = shadow;
    }

    pub fn set_links(&self, links: Vec<ResourceLink>) {
        *lock(&self.links) = links;
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn count(&self, predicate: impl Fn(&BackendCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|call| predicate(call)).count()
    }

    /// Push an event down the most recent device feed.
    pub fn feed(&self, event: DeviceFeedEvent) {
        let sender = lock(&self.feed_senders)
            .last()
            .cloned()
            .expect("no live device feed");
        sender.try_send(event).expect("device feed full");
    }

    fn record(&self, call: BackendCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl CommandService for MockBackend {
    async fn notify_resource_changed(
        &self,
        _ctx: &CallContext,
        request: NotifyResourceChangedRequest,
    ) -> Result<(), ServiceError> {
        self.record(BackendCall::Notify {
            href: request.resource_id.href.clone(),
            code: request.code,
        });
        if self.fail_notify.load(Ordering::SeqCst) {
            Err(ServiceError::Backend("notify refused".into()))
        } else {
            Ok(())
        }
    }

    async fn confirm_resource(
        &self,
        _ctx: &CallContext,
        request: ConfirmResourceRequest,
    ) -> Result<(), ServiceError> {
        self.record(BackendCall::Confirm {
            kind: request.kind,
            correlation_id: request.correlation_id,
            code: request.code,
            body: request.content.data.to_vec(),
        });
        Ok(())
    }

    async fn update_device_metadata(
        &self,
        _ctx: &CallContext,
        request: UpdateDeviceMetadataRequest,
    ) -> Result<(), ServiceError> {
        self.record(BackendCall::UpdateMetadata {
            device_id: request.device_id,
            status: request.status,
        });
        if self.fail_update_metadata.load(Ordering::SeqCst) {
            Err(ServiceError::Backend("metadata update refused".into()))
        } else {
            Ok(())
        }
    }

    async fn confirm_device_metadata_update(
        &self,
        _ctx: &CallContext,
        request: ConfirmDeviceMetadataUpdateRequest,
    ) -> Result<(), ServiceError> {
        self.record(BackendCall::ConfirmMetadata {
            correlation_id: request.correlation_id,
            shadow: request.shadow_synchronization,
        });
        if self.fail_confirm_metadata.load(Ordering::SeqCst) {
            Err(ServiceError::Backend("metadata confirm refused".into()))
        } else {
            Ok(())
        }
    }

    async fn unpublish_resource_links(
        &self,
        _ctx: &CallContext,
        request: UnpublishResourceLinksRequest,
    ) -> Result<UnpublishResourceLinksResponse, ServiceError> {
        self.record(BackendCall::Unpublish {
            hrefs: request.hrefs.clone(),
        });
        Ok(UnpublishResourceLinksResponse {
            unpublished_hrefs: request.hrefs,
        })
    }

    async fn get_resource_links(
        &self,
        _ctx: &CallContext,
        _device_id: &str,
    ) -> Result<Vec<ResourceLink>, ServiceError> {
        self.record(BackendCall::GetLinks);
        Ok(lock(&self.links).clone())
    }

    async fn get_device_metadata(
        &self,
        _ctx: &CallContext,
        device_id: &str,
    ) -> Result<DeviceMetadata, ServiceError> {
        self.record(BackendCall::GetMetadata);
        Ok(DeviceMetadata {
            device_id: device_id.to_owned(),
            status: ConnectionStatus::Online,
            shadow_synchronization: *lock(&self.shadow),
        })
    }

    async fn subscribe_device_feed(
        &self,
        _ctx: &CallContext,
        _request: DeviceFeedSubscriptionRequest,
    ) -> Result<Box<dyn DeviceFeedStream>, ServiceError> {
        self.record(BackendCall::Subscribe);
        let (tx, rx) = mpsc::channel(16);
        lock(&self.feed_senders).push(tx);
        Ok(Box::new(ChannelStream { rx }))
    }
}

// ── Identity service ─────────────────────────────────────────────────

/// Verifier that accepts tokens of the form `tok-<user>` and returns
/// claims asserting that user, never expiring.
pub struct MockVerifier {
    extra: StdMutex<HashMap<String, Claims>>,
}

impl MockVerifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            extra: StdMutex::new(HashMap::new()),
        })
    }

    pub fn insert(&self, token: &str, claims: Claims) {
        lock(&self.extra).insert(token.to_owned(), claims);
    }
}

#[async_trait]
impl ClaimsVerifier for MockVerifier {
    async fn validate(&self, token: &SecretString) -> Result<Claims, ServiceError> {
        let token = token.expose_secret();
        if let Some(claims) = lock(&self.extra).get(token) {
            return Ok(claims.clone());
        }
        if let Some(user) = token.strip_prefix("tok-") {
            let mut map = serde_json::Map::new();
            map.insert("sub".into(), serde_json::Value::String(user.to_owned()));
            return Ok(Claims::new(map));
        }
        Err(ServiceError::TokenValidation("unknown token".into()))
    }
}

pub struct MockOwners {
    owned: StdMutex<HashSet<String>>,
    pub order: StdMutex<Vec<&'static str>>,
    pub unsubscribes: Arc<AtomicU32>,
    handlers: StdMutex<Vec<DeviceEventHandler>>,
}

impl MockOwners {
    pub fn new(owned: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            owned: StdMutex::new(owned.iter().map(|s| (*s).to_owned()).collect()),
            order: StdMutex::new(Vec::new()),
            unsubscribes: Arc::new(AtomicU32::new(0)),
            handlers: StdMutex::new(Vec::new()),
        })
    }

    pub fn fire(&self, event: &stratus_core::DeviceEvent) {
        for handler in lock(&self.handlers).iter() {
            handler(event);
        }
    }

    pub fn call_order(&self) -> Vec<&'static str> {
        lock(&self.order).clone()
    }
}

#[async_trait]
impl OwnerCache for MockOwners {
    async fn owns_device(
        &self,
        _ctx: &CallContext,
        device_id: &str,
    ) -> Result<bool, ServiceError> {
        lock(&self.order).push("owns_device");
        Ok(lock(&self.owned).contains(device_id))
    }

    async fn subscribe(
        &self,
        _owner: &str,
        handler: DeviceEventHandler,
    ) -> Result<Unsubscribe, ServiceError> {
        lock(&self.order).push("subscribe");
        lock(&self.handlers).push(handler);
        let unsubscribes = Arc::clone(&self.unsubscribes);
        Ok(Box::new(move || {
            unsubscribes.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

pub struct MockLiveness {
    pub adds: StdMutex<Vec<(String, String)>>,
    pub removes: StdMutex<Vec<String>>,
}

impl MockLiveness {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            adds: StdMutex::new(Vec::new()),
            removes: StdMutex::new(Vec::new()),
        })
    }

    pub fn add_count(&self) -> usize {
        lock(&self.adds).len()
    }

    pub fn remove_count(&self) -> usize {
        lock(&self.removes).len()
    }
}

#[async_trait]
impl LivenessTracker for MockLiveness {
    async fn add(&self, device_id: &str, connection_id: &str) -> Result<(), ServiceError> {
        lock(&self.adds).push((device_id.to_owned(), connection_id.to_owned()));
        Ok(())
    }

    async fn remove(&self, connection_id: &str) -> Result<(), ServiceError> {
        lock(&self.removes).push(connection_id.to_owned());
        Ok(())
    }
}
