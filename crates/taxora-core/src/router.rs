//! Provider router: backend registry, active selection and single-hop fallback
//!
//! `dispatch` never fails. Every outcome, including unknown backends,
//! upstream failures and caller timeouts, comes back as a [`DispatchResult`]
//! so the chat handler always has a string to show.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RouterError;
use crate::providers::descriptor::{Availability, BackendDescriptor};
use crate::providers::failure::{BackendFailure, FailureKind};
use crate::providers::rate_limit::RateLimitStatus;
use crate::providers::soft_failure::is_quota_notice;
use crate::providers::types::{Backend, ChatMessage};

/// Adapter request timeout used when a backend has no explicit one
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const PROBE_PROMPT: &str =
    "Hello, this is a connectivity test. Please respond with 'OK' if you can read this.";

/// Static routing configuration, read once at startup
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub default_backend: String,
    pub switching_enabled: bool,
    /// Fallback used for every backend without an override
    pub fallback_backend: Option<String>,
    /// Per-backend fallback, keyed by the failing backend's id
    pub fallback_overrides: HashMap<String, String>,
    pub request_timeouts: HashMap<String, Duration>,
    pub default_request_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_backend: "local".to_string(),
            switching_enabled: true,
            fallback_backend: Some("local".to_string()),
            fallback_overrides: HashMap::new(),
            request_timeouts: HashMap::new(),
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Why a fallback hop happened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    QuotaExceeded,
    RateLimited,
    TransientError,
    #[default]
    None,
}

impl FallbackReason {
    fn from_failure(kind: FailureKind) -> Self {
        match kind {
            FailureKind::RateLimited => Self::RateLimited,
            FailureKind::Transient | FailureKind::Auth | FailureKind::Malformed => {
                Self::TransientError
            }
        }
    }

    /// Phrase used in the disclosure prefix
    fn phrase(self) -> &'static str {
        match self {
            Self::QuotaExceeded => "quota exhaustion",
            Self::RateLimited => "rate limiting",
            Self::TransientError | Self::None => "an upstream error",
        }
    }
}

/// Machine-readable reason a dispatch did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchFailure {
    UnknownBackend,
    BackendUnavailable,
    RateLimited,
    Transient,
    Auth,
    Malformed,
    QuotaExceeded,
    Timeout,
    AllBackendsFailed,
}

impl From<FailureKind> for DispatchFailure {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::RateLimited => Self::RateLimited,
            FailureKind::Transient => Self::Transient,
            FailureKind::Auth => Self::Auth,
            FailureKind::Malformed => Self::Malformed,
        }
    }
}

/// Outcome of one dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub success: bool,
    /// The reply, or a short user-facing explanation when `success` is false
    pub text: String,
    pub backend_used: String,
    pub fallback_used: bool,
    pub fallback_reason: FallbackReason,
    /// The backend the request resolved to before any fallback
    pub requested_backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<DispatchFailure>,
}

impl DispatchResult {
    fn answered(backend: &str, text: String) -> Self {
        Self {
            success: true,
            text,
            backend_used: backend.to_string(),
            fallback_used: false,
            fallback_reason: FallbackReason::None,
            requested_backend: backend.to_string(),
            failure: None,
        }
    }

    fn failed(backend: &str, failure: DispatchFailure, text: String) -> Self {
        Self {
            success: false,
            text,
            backend_used: backend.to_string(),
            fallback_used: false,
            fallback_reason: FallbackReason::None,
            requested_backend: backend.to_string(),
            failure: Some(failure),
        }
    }

    fn timed_out(backend: &str) -> Self {
        Self::failed(
            backend,
            DispatchFailure::Timeout,
            "The request timed out before the AI provider answered. Please try again.".to_string(),
        )
    }

    fn rejected(backend: &str, err: &RouterError) -> Self {
        let failure = match err {
            RouterError::UnknownBackend(_) => DispatchFailure::UnknownBackend,
            _ => DispatchFailure::BackendUnavailable,
        };
        Self::failed(backend, failure, format!("Sorry, {}.", err))
    }
}

/// Per-call dispatch options
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// One-off backend override; the active backend is used when `None`
    pub requested_id: Option<String>,
    pub allow_fallback: bool,
    /// Caller deadline for the whole dispatch, including any fallback hop
    pub timeout: Option<Duration>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            requested_id: None,
            allow_fallback: true,
            timeout: None,
        }
    }
}

impl DispatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, id: impl Into<String>) -> Self {
        self.requested_id = Some(id.into());
        self
    }

    pub fn without_fallback(mut self) -> Self {
        self.allow_fallback = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a successful `select`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub previous: String,
    pub current: String,
}

/// One backend in the status listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    #[serde(flatten)]
    pub descriptor: BackendDescriptor,
    pub model: String,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitStatus>,
}

/// Snapshot returned by `list_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStatus {
    pub active_id: String,
    pub switching_enabled: bool,
    pub fallback_id: Option<String>,
    pub backends: Vec<BackendStatus>,
    pub available_count: usize,
}

/// Result of sending a test conversation to one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub id: String,
    pub working: bool,
    pub status: Availability,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_length: Option<usize>,
}

struct Entry {
    descriptor: BackendDescriptor,
    adapter: Arc<dyn Backend>,
}

struct RouterState {
    registry: HashMap<String, Entry>,
    active_id: String,
    switching_enabled: bool,
}

/// A resolved backend, cloned out of the lock before any network call
#[derive(Clone)]
struct Resolved {
    id: String,
    display_name: String,
    adapter: Arc<dyn Backend>,
    timeout: Duration,
}

enum Invocation {
    Done(Result<String, BackendFailure>),
    Cancelled,
}

/// Routes conversations to named backends with at most one fallback hop
pub struct ProviderRouter {
    state: RwLock<RouterState>,
    config: RouterConfig,
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("config", &self.config)
            .finish()
    }
}

impl ProviderRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            state: RwLock::new(RouterState {
                registry: HashMap::new(),
                active_id: config.default_backend.clone(),
                switching_enabled: config.switching_enabled,
            }),
            config,
        }
    }

    /// Add a backend, replacing any existing entry with the same id
    pub async fn register(&self, descriptor: BackendDescriptor, adapter: Arc<dyn Backend>) {
        let mut state = self.state.write().await;
        debug!(
            "Registering backend {} ({}) as {}",
            descriptor.id,
            adapter.model(),
            descriptor.availability
        );
        if state.registry.contains_key(&descriptor.id) {
            warn!("Backend {} registered twice, replacing", descriptor.id);
        }
        state
            .registry
            .insert(descriptor.id.clone(), Entry { descriptor, adapter });
    }

    pub async fn active_id(&self) -> String {
        self.state.read().await.active_id.clone()
    }

    pub async fn list_status(&self) -> RouterStatus {
        let state = self.state.read().await;
        let mut backends: Vec<BackendStatus> = state
            .registry
            .values()
            .map(|entry| BackendStatus {
                descriptor: entry.descriptor.clone(),
                model: entry.adapter.model().to_string(),
                is_active: entry.descriptor.id == state.active_id,
                rate_limit: entry.adapter.rate_limit_status(),
            })
            .collect();
        backends.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));

        RouterStatus {
            active_id: state.active_id.clone(),
            switching_enabled: state.switching_enabled,
            fallback_id: self.config.fallback_backend.clone(),
            available_count: backends.iter().filter(|b| b.descriptor.is_available()).count(),
            backends,
        }
    }

    /// Make `id` the active backend
    pub async fn select(&self, id: &str) -> Result<Selection, RouterError> {
        let mut state = self.state.write().await;
        if !state.switching_enabled {
            return Err(RouterError::SwitchingDisabled);
        }
        Self::check(&state, id)?;

        let previous = std::mem::replace(&mut state.active_id, id.to_string());
        info!("Active AI provider switched from {} to {}", previous, id);
        Ok(Selection {
            previous,
            current: id.to_string(),
        })
    }

    /// Re-run every adapter's credential probe. Never changes the active backend.
    pub async fn refresh_availability(&self) -> usize {
        let mut state = self.state.write().await;
        let mut available = 0;
        for entry in state.registry.values_mut() {
            let before = entry.descriptor.availability;
            entry.descriptor = entry
                .descriptor
                .clone()
                .with_availability(entry.adapter.probe());
            if before != entry.descriptor.availability {
                info!(
                    "Backend {} availability changed: {} -> {}",
                    entry.descriptor.id, before, entry.descriptor.availability
                );
            }
            if entry.descriptor.is_available() {
                available += 1;
            }
        }
        available
    }

    pub async fn dispatch(&self, messages: &[ChatMessage], options: DispatchOptions) -> DispatchResult {
        self.dispatch_with_cancel(messages, options, &CancellationToken::new())
            .await
    }

    /// Dispatch, stopping the in-flight adapter call when `cancel` fires or
    /// the caller's timeout elapses. Cancellation never triggers fallback.
    pub async fn dispatch_with_cancel(
        &self,
        messages: &[ChatMessage],
        options: DispatchOptions,
        cancel: &CancellationToken,
    ) -> DispatchResult {
        let deadline = options.timeout.map(|t| Instant::now() + t);

        let (target, fallback) = {
            let state = self.state.read().await;
            let target_id = options
                .requested_id
                .clone()
                .unwrap_or_else(|| state.active_id.clone());
            let target = match self.resolve(&state, &target_id) {
                Ok(target) => target,
                Err(err) => {
                    warn!("Dispatch rejected: {}", err);
                    return DispatchResult::rejected(&target_id, &err);
                }
            };
            let fallback = if options.allow_fallback {
                self.fallback_for(&state, &target.id)
            } else {
                None
            };
            (target, fallback)
        };

        debug!(
            "Dispatching {} messages to {} (fallback: {})",
            messages.len(),
            target.id,
            fallback.as_ref().map(|f| f.id.as_str()).unwrap_or("none")
        );

        let (reason, failure) = match Self::invoke(&target, messages, deadline, cancel).await {
            Invocation::Cancelled => {
                warn!("Dispatch to {} cancelled or timed out", target.id);
                return DispatchResult::timed_out(&target.id);
            }
            Invocation::Done(Ok(text)) => {
                if !is_quota_notice(&text) {
                    return DispatchResult::answered(&target.id, text);
                }
                warn!("Backend {} answered with a quota notice", target.id);
                (FallbackReason::QuotaExceeded, None)
            }
            Invocation::Done(Err(failure)) => {
                warn!("Backend {} failed: {}", target.id, failure);
                (FallbackReason::from_failure(failure.kind), Some(failure))
            }
        };

        let Some(fallback) = fallback else {
            return Self::unrecovered(&target, failure.as_ref());
        };

        info!(
            "Falling back from {} to {} due to {}",
            target.id,
            fallback.id,
            reason.phrase()
        );

        match Self::invoke(&fallback, messages, deadline, cancel).await {
            Invocation::Cancelled => {
                let mut result = DispatchResult::timed_out(&fallback.id);
                result.requested_backend = target.id.clone();
                result
            }
            Invocation::Done(Ok(text)) if !is_quota_notice(&text) => DispatchResult {
                success: true,
                text: format!(
                    "[switched from {} to {} due to {}] {}",
                    target.id,
                    fallback.id,
                    reason.phrase(),
                    text
                ),
                backend_used: fallback.id.clone(),
                fallback_used: true,
                fallback_reason: reason,
                requested_backend: target.id.clone(),
                failure: None,
            },
            Invocation::Done(outcome) => {
                if let Err(err) = &outcome {
                    warn!("Fallback backend {} also failed: {}", fallback.id, err);
                } else {
                    warn!("Fallback backend {} also answered with a quota notice", fallback.id);
                }
                DispatchResult {
                    success: false,
                    text: format!(
                        "Both {} and {} are unavailable right now. Please try again in a few minutes.",
                        target.display_name, fallback.display_name
                    ),
                    backend_used: fallback.id.clone(),
                    fallback_used: true,
                    fallback_reason: reason,
                    requested_backend: target.id.clone(),
                    failure: Some(DispatchFailure::AllBackendsFailed),
                }
            }
        }
    }

    /// Send a short test conversation to every available backend, without fallback
    pub async fn probe_all(&self) -> Vec<ProbeReport> {
        let entries: Vec<(BackendDescriptor, Resolved)> = {
            let state = self.state.read().await;
            state
                .registry
                .values()
                .map(|entry| {
                    (
                        entry.descriptor.clone(),
                        Resolved {
                            id: entry.descriptor.id.clone(),
                            display_name: entry.descriptor.display_name.clone(),
                            adapter: Arc::clone(&entry.adapter),
                            timeout: self.timeout_for(&entry.descriptor.id),
                        },
                    )
                })
                .collect()
        };

        let messages = [ChatMessage::user(PROBE_PROMPT)];
        let mut reports = Vec::with_capacity(entries.len());
        for (descriptor, backend) in entries {
            if !descriptor.is_available() {
                reports.push(ProbeReport {
                    id: descriptor.id.clone(),
                    working: false,
                    status: descriptor.availability,
                    message: descriptor
                        .detail
                        .clone()
                        .unwrap_or_else(|| format!("{} is not available", descriptor.display_name)),
                    response_length: None,
                });
                continue;
            }

            info!("Probing backend {}", backend.id);
            let report = match backend
                .adapter
                .generate_unreviewed(&messages, backend.timeout)
                .await
            {
                Ok(text) if is_quota_notice(&text) => ProbeReport {
                    id: backend.id.clone(),
                    working: false,
                    status: descriptor.availability,
                    message: "answered with a quota notice".to_string(),
                    response_length: Some(text.chars().count()),
                },
                Ok(text) => ProbeReport {
                    id: backend.id.clone(),
                    working: true,
                    status: descriptor.availability,
                    message: "responding".to_string(),
                    response_length: Some(text.chars().count()),
                },
                Err(failure) => ProbeReport {
                    id: backend.id.clone(),
                    working: false,
                    status: descriptor.availability,
                    message: failure.to_string(),
                    response_length: None,
                },
            };
            reports.push(report);
        }
        reports.sort_by(|a, b| a.id.cmp(&b.id));
        reports
    }

    fn check<'a>(state: &'a RouterState, id: &str) -> Result<&'a Entry, RouterError> {
        let entry = state
            .registry
            .get(id)
            .ok_or_else(|| RouterError::UnknownBackend(id.to_string()))?;
        if !entry.descriptor.is_available() {
            return Err(RouterError::BackendUnavailable {
                id: id.to_string(),
                detail: entry
                    .descriptor
                    .detail
                    .clone()
                    .unwrap_or_else(|| entry.descriptor.availability.to_string()),
            });
        }
        Ok(entry)
    }

    fn resolve(&self, state: &RouterState, id: &str) -> Result<Resolved, RouterError> {
        let entry = Self::check(state, id)?;
        Ok(Resolved {
            id: id.to_string(),
            display_name: entry.descriptor.display_name.clone(),
            adapter: Arc::clone(&entry.adapter),
            timeout: self.timeout_for(id),
        })
    }

    /// The designated fallback for `target`, if it is registered and available
    fn fallback_for(&self, state: &RouterState, target: &str) -> Option<Resolved> {
        let id = self
            .config
            .fallback_overrides
            .get(target)
            .or(self.config.fallback_backend.as_ref())?;
        if id == target {
            return None;
        }
        match self.resolve(state, id) {
            Ok(resolved) => Some(resolved),
            Err(err) => {
                debug!("No usable fallback for {}: {}", target, err);
                None
            }
        }
    }

    fn timeout_for(&self, id: &str) -> Duration {
        self.config
            .request_timeouts
            .get(id)
            .copied()
            .unwrap_or(self.config.default_request_timeout)
    }

    async fn invoke(
        backend: &Resolved,
        messages: &[ChatMessage],
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Invocation {
        let call = backend.adapter.generate(messages, backend.timeout);
        let bounded = async {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, call)
                    .await
                    .map_or(Invocation::Cancelled, Invocation::Done),
                None => Invocation::Done(call.await),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Invocation::Cancelled,
            outcome = bounded => outcome,
        }
    }

    /// User-facing message when the target failed and no fallback could run
    fn unrecovered(target: &Resolved, failure: Option<&BackendFailure>) -> DispatchResult {
        let name = &target.display_name;
        let Some(failure) = failure else {
            return DispatchResult::failed(
                &target.id,
                DispatchFailure::QuotaExceeded,
                format!(
                    "{} has used up its quota. Please try again later or switch to another AI provider.",
                    name
                ),
            );
        };

        let text = match failure.kind {
            FailureKind::RateLimited => {
                let wait = failure
                    .retry_after
                    .map(|d| format!("about {} seconds", d.as_secs().max(1)))
                    .unwrap_or_else(|| "a minute".to_string());
                format!(
                    "{} is receiving too many requests right now. Please try again in {}.",
                    name, wait
                )
            }
            FailureKind::Auth => format!(
                "{} rejected its API key. Please check the provider configuration.",
                name
            ),
            FailureKind::Transient => format!(
                "{} is temporarily unavailable. Please try again shortly.",
                name
            ),
            FailureKind::Malformed => format!(
                "{} returned a response that could not be read. Please try again.",
                name
            ),
        };
        DispatchResult::failed(&target.id, failure.kind.into(), text)
    }
}
