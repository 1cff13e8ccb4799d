//! Analysis orchestration: one request lifecycle across the local cache,
//! the inference gateway, the cost calculator and the ledger.
//!
//! ```text
//! Start -> ResolveVersion -> CacheCheck -> CacheHit -> Return
//!                                       -> CacheMiss -> Infer -> PersistAndLog -> Return
//!                                                             -> InferFailed -> Classify -> ReturnError
//! ```
//!
//! Concurrent misses for the same key share one in-flight inference. The
//! inference and its persistence run on a spawned task, so a caller that goes
//! away never cancels a call that is already being paid for.

use crate::cache::{AnalysisRecord, CacheKey, Store};
use crate::cost::{Money, TokenUsage};
use crate::diagnostics::{DiagnosticEntry, DiagnosticsFilter, DiagnosticsPage};
use crate::error::AnalysisError;
use crate::gateway::parse::is_parse_failure;
use crate::gateway::InferenceGateway;
use crate::item::Item;
use crate::ledger::{CostLogEntry, SessionCosts, TotalCosts};
use crate::models::Mode;
use crate::profile::{Profile, ProfileVersion};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::Instrument;
use uuid::Uuid;

/// Largest diagnostics batch accepted per report.
pub const MAX_DIAGNOSTICS_BATCH: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub item: Item,
    #[serde(default)]
    pub profile: Option<Profile>,
    pub mode: Mode,
    pub session_id: String,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

fn default_use_cache() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub result: Value,
    pub tokens_used: TokenUsage,
    pub cost_usd: Money,
    pub model_used: String,
    pub cached: bool,
    pub profile_version: Option<ProfileVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: ConnectionState,
    pub provider: String,
    pub message: String,
}

type SharedInference = Shared<BoxFuture<'static, Result<AnalysisRecord, AnalysisError>>>;

pub struct AnalysisOrchestrator<G, S> {
    gateway: Arc<G>,
    store: Arc<S>,
    inflight: Arc<Mutex<HashMap<CacheKey, SharedInference>>>,
}

impl<G, S> Clone for AnalysisOrchestrator<G, S> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            store: Arc::clone(&self.store),
            inflight: Arc::clone(&self.inflight),
        }
    }
}

/// Validated request with its cache key resolved.
struct Prepared {
    key: CacheKey,
    item: Item,
    profile: Option<Profile>,
    session_id: String,
}

enum Flight {
    Leader(SharedInference),
    Joiner(SharedInference),
}

impl<G: InferenceGateway, S: Store> AnalysisOrchestrator<G, S> {
    pub fn new(gateway: Arc<G>, store: Arc<S>) -> Self {
        Self {
            gateway,
            store,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one analysis request through the cache-first lifecycle.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse, AnalysisError> {
        let use_cache = request.use_cache;
        let prepared = prepare(request)?;
        let span = tracing::info_span!(
            "analyze",
            item = %prepared.key.item_id,
            mode = %prepared.key.mode,
            profile_version = prepared.key.profile_version.as_ref().map(|v| v.as_str()).unwrap_or("none"),
        );
        self.resolve(prepared, use_cache).instrument(span).await
    }

    async fn resolve(&self, prepared: Prepared, use_cache: bool) -> Result<AnalysisResponse, AnalysisError> {
        if use_cache {
            match self.store.lookup(&prepared.key).await {
                Ok(Some(record)) => {
                    tracing::info!(record = %record.id, "analysis cache hit");
                    return Ok(self.reuse(&prepared, record).await);
                }
                Ok(None) => tracing::debug!("analysis cache miss"),
                Err(err) => tracing::warn!(error = %err, "analysis cache lookup failed; treating as miss"),
            }
        }

        let flight = if use_cache {
            self.join_or_start(&prepared)
        } else {
            Flight::Leader(self.start_inference(&prepared, false))
        };

        match flight {
            Flight::Leader(shared) => {
                let record = shared.await.inspect_err(|err| {
                    tracing::warn!(kind = %err.kind(), error = %err, "analysis failed");
                })?;
                Ok(AnalysisResponse {
                    result: record.result,
                    tokens_used: record.tokens,
                    cost_usd: record.cost,
                    model_used: record.model,
                    cached: false,
                    profile_version: record.profile_version,
                })
            }
            Flight::Joiner(shared) => {
                let record = shared.await?;
                tracing::info!(record = %record.id, "joined in-flight analysis");
                Ok(self.reuse(&prepared, record).await)
            }
        }
    }

    /// Answer from an existing record: zero spend, one zero-cost ledger line.
    async fn reuse(&self, prepared: &Prepared, record: AnalysisRecord) -> AnalysisResponse {
        let entry = CostLogEntry {
            session_id: prepared.session_id.clone(),
            model: record.model.clone(),
            mode: record.mode,
            tokens: TokenUsage::ZERO,
            cost: Money::ZERO,
            cached: true,
            avoided_cost: record.cost,
            prompt_cache_savings: Money::ZERO,
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.append_cost(entry).await {
            tracing::warn!(error = %err, "failed to append cost ledger entry");
        }
        AnalysisResponse {
            result: record.result,
            tokens_used: TokenUsage::ZERO,
            cost_usd: Money::ZERO,
            model_used: record.model,
            cached: true,
            profile_version: record.profile_version,
        }
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<CacheKey, SharedInference>> {
        match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn join_or_start(&self, prepared: &Prepared) -> Flight {
        let mut inflight = self.inflight();
        if let Some(existing) = inflight.get(&prepared.key) {
            return Flight::Joiner(existing.clone());
        }
        let shared = self.start_inference(prepared, true);
        inflight.insert(prepared.key.clone(), shared.clone());
        Flight::Leader(shared)
    }

    /// Spawn infer -> cost -> persist -> log. When `register` is set the
    /// task removes its own in-flight entry once done.
    fn start_inference(&self, prepared: &Prepared, register: bool) -> SharedInference {
        let gateway = Arc::clone(&self.gateway);
        let store = Arc::clone(&self.store);
        let inflight = register.then(|| Arc::clone(&self.inflight));
        let key = prepared.key.clone();
        let item = prepared.item.clone();
        let profile = prepared.profile.clone();
        let session_id = prepared.session_id.clone();

        let task = tokio::spawn(async move {
            let outcome = run_inference(&*gateway, &*store, &key, &item, profile.as_ref(), session_id).await;
            if let Some(inflight) = inflight {
                let mut guard = match inflight.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.remove(&key);
            }
            outcome
        }
        .instrument(tracing::Span::current()));

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => Err(AnalysisError::Unknown(format!("analysis task failed: {}", err))),
            }
        }
        .boxed()
        .shared()
    }

    pub async fn test_connection(&self) -> ConnectionStatus {
        let provider = self.gateway.provider().to_string();
        match self.gateway.check_connection().await {
            Ok(()) => ConnectionStatus {
                status: ConnectionState::Ok,
                message: format!("Connected to {}", provider),
                provider,
            },
            Err(err) => {
                tracing::warn!(kind = %err.kind(), error = %err, "connection test failed");
                ConnectionStatus {
                    status: ConnectionState::Error,
                    message: err.to_string(),
                    provider,
                }
            }
        }
    }

    pub async fn session_costs(&self, session_id: &str) -> Result<SessionCosts, AnalysisError> {
        if session_id.trim().is_empty() {
            return Err(AnalysisError::Validation("session_id is required".to_string()));
        }
        Ok(self.store.session_costs(session_id).await?)
    }

    pub async fn total_costs(&self) -> Result<TotalCosts, AnalysisError> {
        Ok(self.store.total_costs().await?)
    }

    pub async fn report_diagnostics(&self, entries: Vec<DiagnosticEntry>) -> Result<usize, AnalysisError> {
        if entries.len() > MAX_DIAGNOSTICS_BATCH {
            return Err(AnalysisError::Validation(format!(
                "at most {} diagnostics per report",
                MAX_DIAGNOSTICS_BATCH
            )));
        }
        let accepted = entries.len();
        self.store.append_diagnostics(entries).await?;
        Ok(accepted)
    }

    pub async fn diagnostics(&self, filter: DiagnosticsFilter) -> Result<DiagnosticsPage, AnalysisError> {
        Ok(self.store.recent_diagnostics(filter).await?)
    }
}

fn prepare(request: AnalysisRequest) -> Result<Prepared, AnalysisError> {
    let AnalysisRequest {
        item,
        profile,
        mode,
        session_id,
        ..
    } = request;

    if session_id.trim().is_empty() {
        return Err(AnalysisError::Validation("session_id is required".to_string()));
    }
    let item_id = item.id()?;
    let profile = match mode {
        Mode::Full => Some(profile.ok_or_else(|| {
            AnalysisError::Validation("full analysis requires a profile".to_string())
        })?),
        Mode::Basic => None,
    };
    if !item.has_usable_data() {
        return Err(AnalysisError::Extraction(
            "item has no title or description to analyze".to_string(),
        ));
    }

    let version = profile.as_ref().map(Profile::version);
    Ok(Prepared {
        key: CacheKey::new(item_id, version, mode),
        item,
        profile,
        session_id,
    })
}

async fn run_inference<G: InferenceGateway, S: Store>(
    gateway: &G,
    store: &S,
    key: &CacheKey,
    item: &Item,
    profile: Option<&Profile>,
    session_id: String,
) -> Result<AnalysisRecord, AnalysisError> {
    let completion = gateway.run(item, profile, key.mode).await?;
    if is_parse_failure(&completion.result) {
        tracing::warn!(model = %completion.model, "model output was not valid JSON; storing the fallback result");
    }
    let cost = gateway.cost(&completion.usage, &completion.model)?;
    let savings = gateway
        .prompt_cache_savings(&completion.usage, &completion.model)
        .unwrap_or(Money::ZERO);

    let record = AnalysisRecord {
        id: Uuid::new_v4(),
        item_id: key.item_id.clone(),
        profile_version: key.profile_version.clone(),
        mode: key.mode,
        model: completion.model.clone(),
        tokens: completion.usage,
        cost,
        result: completion.result,
        created_at: Utc::now(),
    };
    if let Err(err) = store.store(record.clone()).await {
        tracing::error!(error = %err, record = %record.id, "failed to persist analysis record");
    }

    let entry = CostLogEntry {
        session_id,
        model: record.model.clone(),
        mode: record.mode,
        tokens: record.tokens,
        cost,
        cached: false,
        avoided_cost: Money::ZERO,
        prompt_cache_savings: savings,
        created_at: record.created_at,
    };
    if let Err(err) = store.append_cost(entry).await {
        tracing::warn!(error = %err, "failed to append cost ledger entry");
    }

    tracing::info!(record = %record.id, cost = %cost, "analysis stored");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AnalysisCache, CostLedger, DiagnosticsLog, MemoryStore, StoreError, StoreFuture};
    use crate::cost::{CostError, PriceTable};
    use crate::diagnostics::DiagnosticLevel;
    use crate::error::ErrorKind;
    use crate::gateway::{Completion, GatewayFuture};
    use crate::models::{HAIKU_MODEL_ID, SONNET_MODEL_ID};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Gateway that replays scripted outcomes and counts calls.
    struct ScriptedGateway {
        calls: AtomicUsize,
        script: Mutex<VecDeque<Result<(), AnalysisError>>>,
        delay: Duration,
        prices: PriceTable,
    }

    impl ScriptedGateway {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(VecDeque::new()),
                delay: Duration::ZERO,
                prices: PriceTable::default(),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn then_fail(self, err: AnalysisError) -> Self {
            self.script.lock().unwrap().push_back(Err(err));
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn respond<'a>(&'a self, model: &'static str, marker: String) -> GatewayFuture<'a, Completion> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                if let Some(Err(err)) = self.script.lock().unwrap().pop_front() {
                    return Err(err);
                }
                Ok(Completion {
                    raw_output: String::new(),
                    result: json!({"marker": marker, "call": n}),
                    model: model.to_string(),
                    usage: TokenUsage {
                        input: 100,
                        output: 200,
                        cache_read: 1000,
                        cache_write: 0,
                    },
                })
            })
        }
    }

    impl InferenceGateway for ScriptedGateway {
        fn provider(&self) -> &'static str {
            "scripted"
        }

        fn run_full<'a>(&'a self, item: &'a Item, profile: &'a Profile) -> GatewayFuture<'a, Completion> {
            self.respond(SONNET_MODEL_ID, format!("{}|{}", item.url, profile.version()))
        }

        fn run_basic<'a>(&'a self, item: &'a Item) -> GatewayFuture<'a, Completion> {
            self.respond(HAIKU_MODEL_ID, item.url.clone())
        }

        fn check_connection(&self) -> GatewayFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn cost(&self, usage: &TokenUsage, model: &str) -> Result<Money, CostError> {
            self.prices.cost(usage, model)
        }

        fn prompt_cache_savings(&self, usage: &TokenUsage, model: &str) -> Result<Money, CostError> {
            self.prices.prompt_cache_savings(usage, model)
        }
    }

    /// Memory store whose analysis writes always fail.
    #[derive(Default)]
    struct FailingWrites(MemoryStore);

    impl AnalysisCache for FailingWrites {
        fn lookup<'a>(&'a self, key: &'a CacheKey) -> StoreFuture<'a, Option<AnalysisRecord>> {
            self.0.lookup(key)
        }

        fn store<'a>(&'a self, _record: AnalysisRecord) -> StoreFuture<'a, ()> {
            Box::pin(async { Err(StoreError::LockTimeout(5)) })
        }
    }

    impl CostLedger for FailingWrites {
        fn append_cost<'a>(&'a self, entry: CostLogEntry) -> StoreFuture<'a, ()> {
            self.0.append_cost(entry)
        }

        fn cost_entries<'a>(&'a self, session_id: Option<&'a str>) -> StoreFuture<'a, Vec<CostLogEntry>> {
            self.0.cost_entries(session_id)
        }
    }

    impl DiagnosticsLog for FailingWrites {
        fn append_diagnostics<'a>(&'a self, entries: Vec<DiagnosticEntry>) -> StoreFuture<'a, ()> {
            self.0.append_diagnostics(entries)
        }

        fn recent_diagnostics<'a>(&'a self, filter: DiagnosticsFilter) -> StoreFuture<'a, DiagnosticsPage> {
            self.0.recent_diagnostics(filter)
        }
    }

    fn item(url: &str) -> Item {
        Item {
            title: Some("Relaxed Chino".to_string()),
            description: Some("Cotton twill".to_string()),
            ..Item::new(url)
        }
    }

    fn profile(fit: &str) -> Profile {
        Profile::from_value(json!({"fit_preferences": [fit], "body_type": "athletic"})).unwrap()
    }

    fn full_request(url: &str, fit: &str) -> AnalysisRequest {
        AnalysisRequest {
            item: item(url),
            profile: Some(profile(fit)),
            mode: Mode::Full,
            session_id: "session-1".to_string(),
            use_cache: true,
        }
    }

    fn setup(gateway: ScriptedGateway) -> (AnalysisOrchestrator<ScriptedGateway, MemoryStore>, Arc<ScriptedGateway>, Arc<MemoryStore>) {
        let gateway = Arc::new(gateway);
        let store = Arc::new(MemoryStore::new());
        (AnalysisOrchestrator::new(Arc::clone(&gateway), Arc::clone(&store)), gateway, store)
    }

    const URL: &str = "https://shop.example.com/p/chino";

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (orch, gateway, store) = setup(ScriptedGateway::new());

        let first = orch.analyze(full_request(URL, "relaxed")).await.unwrap();
        assert!(!first.cached);
        assert_eq!(gateway.calls(), 1);
        // 100*3 + 200*15 + 1000*0.30
        assert_eq!(first.cost_usd.micros(), 3_600);
        assert_eq!(first.model_used, SONNET_MODEL_ID);
        assert_eq!(store.records().len(), 1);

        let second = orch.analyze(full_request(URL, "relaxed")).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.cost_usd, Money::ZERO);
        assert_eq!(second.tokens_used, TokenUsage::ZERO);
        assert_eq!(second.result, first.result);
        assert_eq!(second.profile_version, first.profile_version);
        assert_eq!(gateway.calls(), 1, "hit makes no gateway call");
        assert_eq!(store.records().len(), 1);

        let entries = store.cost_entries(None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].cached);
        assert_eq!(entries[0].cost.micros(), 3_600);
        assert_eq!(entries[0].prompt_cache_savings.micros(), 2_700);
        assert!(entries[1].cached);
        assert_eq!(entries[1].cost, Money::ZERO);
        assert_eq!(entries[1].avoided_cost.micros(), 3_600);
    }

    #[tokio::test]
    async fn test_profile_change_is_a_miss() {
        let (orch, gateway, _store) = setup(ScriptedGateway::new());
        let a = orch.analyze(full_request(URL, "relaxed")).await.unwrap();
        let b = orch.analyze(full_request(URL, "slim")).await.unwrap();
        assert!(!b.cached);
        assert_ne!(a.profile_version, b.profile_version);
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_basic_mode_ignores_profile() {
        let (orch, gateway, _store) = setup(ScriptedGateway::new());
        let mut request = full_request(URL, "relaxed");
        request.mode = Mode::Basic;
        let a = orch.analyze(request.clone()).await.unwrap();
        assert_eq!(a.profile_version, None);
        assert_eq!(a.model_used, HAIKU_MODEL_ID);

        request.profile = Some(profile("slim"));
        let b = orch.analyze(request).await.unwrap();
        assert!(b.cached);
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test]
    async fn test_modes_do_not_share_entries() {
        let (orch, gateway, _store) = setup(ScriptedGateway::new());
        orch.analyze(full_request(URL, "relaxed")).await.unwrap();
        let mut basic = full_request(URL, "relaxed");
        basic.mode = Mode::Basic;
        assert!(!orch.analyze(basic).await.unwrap().cached);
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_writes_nothing() {
        let gateway = ScriptedGateway::new().then_fail(AnalysisError::RateLimited {
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(12)),
        });
        let (orch, gateway, store) = setup(gateway);

        let err = orch.analyze(full_request(URL, "relaxed")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        assert_eq!(gateway.calls(), 1);
        assert!(store.records().is_empty());
        assert!(store.cost_entries(None).await.unwrap().is_empty());

        // the failure is not cached; the next call retries the gateway
        let ok = orch.analyze(full_request(URL, "relaxed")).await.unwrap();
        assert!(!ok.cached);
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_full_without_profile_is_validation() {
        let (orch, gateway, _store) = setup(ScriptedGateway::new());
        let mut request = full_request(URL, "relaxed");
        request.profile = None;
        let err = orch.analyze(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_url_and_empty_payload() {
        let (orch, gateway, _store) = setup(ScriptedGateway::new());
        let mut request = full_request("", "relaxed");
        assert_eq!(orch.analyze(request.clone()).await.unwrap_err().kind(), ErrorKind::Validation);

        request.item = Item::new(URL);
        assert_eq!(orch.analyze(request).await.unwrap_err().kind(), ErrorKind::Extraction);
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_use_cache_false_always_infers() {
        let (orch, gateway, store) = setup(ScriptedGateway::new());
        orch.analyze(full_request(URL, "relaxed")).await.unwrap();
        let mut request = full_request(URL, "relaxed");
        request.use_cache = false;
        let fresh = orch.analyze(request).await.unwrap();
        assert!(!fresh.cached);
        assert_eq!(gateway.calls(), 2);
        assert_eq!(store.records().len(), 2);

        // the newest record is now current
        let hit = orch.analyze(full_request(URL, "relaxed")).await.unwrap();
        assert_eq!(hit.result["call"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_inference() {
        let (orch, gateway, store) = setup(ScriptedGateway::new().with_delay(Duration::from_millis(200)));

        let (a, b) = tokio::join!(
            orch.analyze(full_request(URL, "relaxed")),
            orch.analyze(full_request(URL, "relaxed")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(gateway.calls(), 1);
        assert_eq!(store.records().len(), 1);
        assert_eq!(a.result, b.result);
        assert!(!a.cached);
        assert!(b.cached);
        assert_eq!(b.cost_usd, Money::ZERO);

        let entries = store.cost_entries(None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.iter().filter(|e| e.cost.is_zero()).count(), 1);
        assert!(orch.inflight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_still_persists() {
        let (orch, gateway, store) = setup(ScriptedGateway::new().with_delay(Duration::from_millis(500)));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            orch.analyze(full_request(URL, "relaxed")),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(gateway.calls(), 1);
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.cost_entries(None).await.unwrap().len(), 1);

        let hit = orch.analyze(full_request(URL, "relaxed")).await.unwrap();
        assert!(hit.cached);
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_fail_response() {
        let gateway = Arc::new(ScriptedGateway::new());
        let store = Arc::new(FailingWrites::default());
        let orch = AnalysisOrchestrator::new(Arc::clone(&gateway), Arc::clone(&store));

        let response = orch.analyze(full_request(URL, "relaxed")).await.unwrap();
        assert!(!response.cached);
        assert_eq!(store.0.cost_entries(None).await.unwrap().len(), 1);

        // nothing was cached, so the next call pays again
        let again = orch.analyze(full_request(URL, "relaxed")).await.unwrap();
        assert!(!again.cached);
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_session_costs_and_totals() {
        let (orch, _gateway, _store) = setup(ScriptedGateway::new());
        orch.analyze(full_request(URL, "relaxed")).await.unwrap();
        orch.analyze(full_request(URL, "relaxed")).await.unwrap();
        let mut other = full_request("https://shop.example.com/p/other", "relaxed");
        other.session_id = "session-2".to_string();
        orch.analyze(other).await.unwrap();

        let session = orch.session_costs("session-1").await.unwrap();
        assert_eq!(session.request_count, 2);
        assert_eq!(session.cache_hits, 1);
        assert_eq!(session.total_cost.micros(), 3_600);
        // prompt-cache savings on the miss plus the avoided cost of the hit
        assert_eq!(session.cached_savings.micros(), 2_700 + 3_600);
        assert_eq!(session.per_mode["full"].micros(), 3_600);

        let totals = orch.total_costs().await.unwrap();
        assert_eq!(totals.total_requests, 3);
        assert_eq!(totals.total_cost.micros(), 7_200);

        assert_eq!(orch.session_costs(" ").await.unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_diagnostics_report_and_query() {
        let (orch, _gateway, _store) = setup(ScriptedGateway::new());
        let accepted = orch
            .report_diagnostics(vec![DiagnosticEntry::new(DiagnosticLevel::Error, "boom")
                .with_kind(ErrorKind::Connectivity)])
            .await
            .unwrap();
        assert_eq!(accepted, 1);
        let page = orch.diagnostics(DiagnosticsFilter::default()).await.unwrap();
        assert_eq!(page.entries[0].kind, Some(ErrorKind::Connectivity));

        let too_many = vec![DiagnosticEntry::new(DiagnosticLevel::Info, "x"); MAX_DIAGNOSTICS_BATCH + 1];
        assert_eq!(orch.report_diagnostics(too_many).await.unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_connection_status() {
        let (orch, _gateway, _store) = setup(ScriptedGateway::new());
        let status = orch.test_connection().await;
        assert_eq!(status.status, ConnectionState::Ok);
        assert_eq!(status.provider, "scripted");
    }
}
