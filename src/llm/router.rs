//! Model Router: profile resolution, exponential backoff, failover.
//!
//! A router is resolved once per run from the run's `model_profile` into an
//! ordered route list (primary, then optional secondary). Each route gets
//! `1 + max_retries` attempts with exponential backoff before the next route
//! is tried. Consecutive failures are counted across routes and calls for the
//! whole run; reaching `max_consecutive_failures` (or running out of routes)
//! yields `ModelError::Unavailable`. Any success resets the count.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{ModelProvider, ModelRequest, ModelResponse, ProviderRegistry};
use crate::config::{ModelTarget, ModelsSection, RetrySection};
use crate::engine::event_log::EventSink;
use crate::engine::models::{EventKind, Phase};
use crate::errors::ModelError;

/// What a phase asks the model for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub json: bool,
}

impl Prompt {
    pub fn json(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            json: true,
        }
    }
}

struct Route {
    provider: Arc<dyn ModelProvider>,
    target: ModelTarget,
}

impl Route {
    fn model_for(&self, phase: Phase) -> &str {
        match (phase, &self.target.execute_model) {
            (Phase::Execute, Some(model)) => model,
            _ => &self.target.model,
        }
    }
}

pub struct ModelRouter {
    profile: String,
    routes: Vec<Route>,
    retry: RetrySection,
    consecutive_failures: AtomicU32,
}

impl ModelRouter {
    pub fn resolve(
        profile: &str,
        models: &ModelsSection,
        providers: &ProviderRegistry,
    ) -> Result<Self, ModelError> {
        let spec = models
            .profiles
            .get(profile)
            .ok_or_else(|| ModelError::UnknownProfile(profile.to_string()))?;

        let mut routes = Vec::with_capacity(2);
        for target in std::iter::once(&spec.primary).chain(spec.secondary.as_ref()) {
            let provider = providers
                .get(&target.provider)
                .cloned()
                .ok_or_else(|| ModelError::Provider {
                    provider: target.provider.clone(),
                    message: "provider is not configured".into(),
                })?;
            routes.push(Route {
                provider,
                target: target.clone(),
            });
        }

        Ok(Self {
            profile: profile.to_string(),
            routes,
            retry: models.retry.clone(),
            consecutive_failures: AtomicU32::new(0),
        })
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .retry
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.retry.max_backoff_ms);
        Duration::from_millis(ms)
    }

    fn max_tokens(phase: Phase) -> u32 {
        match phase {
            Phase::Execute => 8192,
            _ => 4096,
        }
    }

    /// Complete `prompt` for `phase`, recording every attempt on `sink`.
    pub async fn complete(
        &self,
        phase: Phase,
        prompt: &Prompt,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ModelError> {
        let sink = sink.for_phase(phase);

        for (index, route) in self.routes.iter().enumerate() {
            let request = ModelRequest {
                model: route.model_for(phase).to_string(),
                system: prompt.system.clone(),
                prompt: prompt.user.clone(),
                json: prompt.json,
                temperature: 0.2,
                max_tokens: Self::max_tokens(phase),
            };
            let provider = route.provider.name().to_string();

            for attempt in 0..=self.retry.max_retries {
                if cancel.is_cancelled() {
                    return Err(ModelError::Cancelled);
                }
                let started = Instant::now();
                let result = tokio::select! {
                    result = route.provider.complete(&request) => result,
                    _ = cancel.cancelled() => Err(ModelError::Cancelled),
                };
                let latency_ms = started.elapsed().as_millis() as u64;

                let error = match result {
                    Ok(response) => {
                        self.consecutive_failures.store(0, Ordering::Relaxed);
                        sink.emit(
                            EventKind::ModelCall,
                            json!({
                                "provider": provider,
                                "model": request.model,
                                "ok": true,
                                "latency_ms": latency_ms,
                                "usage": response.usage,
                                "attempt": attempt + 1,
                                "fallback": index > 0,
                            }),
                        )
                        .await;
                        tracing::debug!(%provider, model = %request.model, latency_ms, "model call succeeded");
                        return Ok(response);
                    }
                    Err(ModelError::Cancelled) => return Err(ModelError::Cancelled),
                    Err(e) => e,
                };

                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(%provider, model = %request.model, attempt = attempt + 1, error = %error, "model call failed");
                sink.emit(
                    EventKind::ModelCall,
                    json!({
                        "provider": provider,
                        "model": request.model,
                        "ok": false,
                        "latency_ms": latency_ms,
                        "error": error.to_string(),
                        "attempt": attempt + 1,
                        "fallback": index > 0,
                    }),
                )
                .await;

                if failures >= self.retry.max_consecutive_failures {
                    return Err(ModelError::Unavailable { attempts: failures });
                }
                if attempt < self.retry.max_retries {
                    let delay = self.backoff(attempt);
                    sink.emit(
                        EventKind::Retry,
                        json!({
                            "provider": provider,
                            "attempt": attempt + 2,
                            "delay_ms": delay.as_millis() as u64,
                            "error": error.to_string(),
                        }),
                    )
                    .await;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                    }
                }
            }

            if let Some(next) = self.routes.get(index + 1) {
                sink.emit(
                    EventKind::Retry,
                    json!({
                        "failover": {"from": provider, "to": next.provider.name()},
                    }),
                )
                .await;
            }
        }

        Err(ModelError::Unavailable {
            attempts: self.consecutive_failures.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::config::ProfileSpec;
    use crate::engine::db::DbHandle;
    use crate::engine::event_log::EventLog;
    use crate::engine::models::{NewRun, Run};
    use crate::llm::TokenUsage;

    /// Replays queued results; `None` entries fail.
    struct Scripted {
        name: String,
        script: Mutex<VecDeque<Option<&'static str>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(name: &str, script: &[Option<&'static str>]) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                script: Mutex::new(script.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelProvider for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
            self.calls.lock().unwrap().push(request.model.clone());
            match self.script.lock().unwrap().pop_front().flatten() {
                Some(content) => Ok(ModelResponse {
                    content: content.into(),
                    usage: TokenUsage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                    },
                }),
                None => Err(ModelError::Provider {
                    provider: self.name.clone(),
                    message: "503".into(),
                }),
            }
        }
    }

    fn models(max_retries: u32, max_consecutive_failures: u32) -> ModelsSection {
        let mut models = ModelsSection::default();
        models.profiles.insert(
            "test".into(),
            ProfileSpec {
                primary: ModelTarget {
                    execute_model: Some("reasoner".into()),
                    ..ModelTarget::new("primary", "chat")
                },
                secondary: Some(ModelTarget::new("secondary", "backup")),
            },
        );
        models.retry = RetrySection {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            max_consecutive_failures,
        };
        models
    }

    fn registry(primary: Arc<Scripted>, secondary: Arc<Scripted>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.insert("primary".into(), primary);
        registry.insert("secondary".into(), secondary);
        registry
    }

    async fn sink() -> (EventLog, EventSink, String) {
        let db = DbHandle::in_memory().unwrap();
        let run = Run::new(NewRun {
            feature_request: "x".into(),
            repo_path: "/tmp".into(),
            base_branch: "main".into(),
            model_profile: "test".into(),
        });
        let insert = run.clone();
        db.call(move |db| db.insert_run(&insert)).await.unwrap();
        let log = EventLog::new(db);
        let sink = log.sink(&run.id);
        (log, sink, run.id)
    }

    fn prompt() -> Prompt {
        Prompt::json("system", "user")
    }

    #[test]
    fn test_resolve_unknown_profile() {
        let result = ModelRouter::resolve("nope", &models(1, 6), &ProviderRegistry::new());
        assert!(matches!(result, Err(ModelError::UnknownProfile(_))));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let primary = Scripted::new("primary", &[]);
        let secondary = Scripted::new("secondary", &[]);
        let mut section = models(3, 6);
        section.retry.initial_backoff_ms = 100;
        section.retry.max_backoff_ms = 350;
        let router = ModelRouter::resolve("test", &section, &registry(primary, secondary)).unwrap();
        assert_eq!(router.backoff(0), Duration::from_millis(100));
        assert_eq!(router.backoff(1), Duration::from_millis(200));
        assert_eq!(router.backoff(2), Duration::from_millis(350));
        assert_eq!(router.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retries_primary_then_succeeds() {
        let primary = Scripted::new("primary", &[None, Some("ok")]);
        let secondary = Scripted::new("secondary", &[]);
        let router =
            ModelRouter::resolve("test", &models(2, 6), &registry(primary.clone(), secondary.clone()))
                .unwrap();
        let (log, sink, run_id) = sink().await;

        let response = router
            .complete(Phase::Plan, &prompt(), &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(primary.calls().len(), 2);
        assert!(secondary.calls().is_empty());

        let events = log.artifacts(&run_id).await.unwrap().raw_events;
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, [EventKind::ModelCall, EventKind::Retry, EventKind::ModelCall]);
        assert_eq!(events[2].payload["usage"]["prompt_tokens"], 10);
        assert_eq!(events[2].payload["provider"], "primary");
    }

    #[tokio::test]
    async fn test_fails_over_to_secondary() {
        let primary = Scripted::new("primary", &[None, None]);
        let secondary = Scripted::new("secondary", &[Some("from backup")]);
        let router =
            ModelRouter::resolve("test", &models(1, 6), &registry(primary.clone(), secondary.clone()))
                .unwrap();
        let (_log, sink, _) = sink().await;

        let response = router
            .complete(Phase::Checklist, &prompt(), &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.content, "from backup");
        assert_eq!(primary.calls().len(), 2);
        assert_eq!(secondary.calls(), ["backup"]);
    }

    #[tokio::test]
    async fn test_execute_phase_uses_execute_model() {
        let primary = Scripted::new("primary", &[Some("code")]);
        let secondary = Scripted::new("secondary", &[]);
        let router =
            ModelRouter::resolve("test", &models(0, 6), &registry(primary.clone(), secondary)).unwrap();
        let (_log, sink, _) = sink().await;
        router
            .complete(Phase::Execute, &prompt(), &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(primary.calls(), ["reasoner"]);
    }

    #[tokio::test]
    async fn test_exhausting_both_providers_is_unavailable() {
        let primary = Scripted::new("primary", &[None, None]);
        let secondary = Scripted::new("secondary", &[None, None]);
        let router =
            ModelRouter::resolve("test", &models(1, 10), &registry(primary, secondary)).unwrap();
        let (_log, sink, _) = sink().await;
        let err = router
            .complete(Phase::Plan, &prompt(), &sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Unavailable { attempts: 4 }));
    }

    #[tokio::test]
    async fn test_consecutive_failure_limit_spans_calls() {
        let primary = Scripted::new("primary", &[None, None, None, None]);
        let secondary = Scripted::new("secondary", &[None, None, None, None]);
        let router =
            ModelRouter::resolve("test", &models(0, 3), &registry(primary.clone(), secondary)).unwrap();
        let (_log, sink, _) = sink().await;
        let cancel = CancellationToken::new();

        // First call: two failures (primary, secondary), below the limit.
        let first = router.complete(Phase::Plan, &prompt(), &sink, &cancel).await;
        assert!(matches!(first, Err(ModelError::Unavailable { attempts: 2 })));
        // Second call trips the limit on its first attempt.
        let second = router.complete(Phase::Plan, &prompt(), &sink, &cancel).await;
        assert!(matches!(second, Err(ModelError::Unavailable { attempts: 3 })));
        assert_eq!(primary.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let primary = Scripted::new("primary", &[Some("never")]);
        let secondary = Scripted::new("secondary", &[]);
        let router =
            ModelRouter::resolve("test", &models(0, 6), &registry(primary.clone(), secondary)).unwrap();
        let (_log, sink, _) = sink().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = router
            .complete(Phase::Plan, &prompt(), &sink, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Cancelled));
        assert!(primary.calls().is_empty());
    }
}
