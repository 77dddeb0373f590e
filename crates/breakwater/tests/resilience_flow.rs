//! End-to-end flows through the composed resilience pipeline.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use breakwater::{
    services, CallError, CircuitBreakerConfig, CircuitBreakerManager, DefaultValueStrategy,
    FallbackConfig, FallbackHandler, FallbackManager, RateLimitAlgorithm, RateLimitConfig,
    RateLimitManager, ResilienceConfig, ResilienceError, ResilienceManager,
    ResilienceManagerBuilder, RetryManager,
};

#[tokio::test(start_paused = true)]
async fn token_bucket_admits_five_per_minute_then_denies() {
    let manager = RateLimitManager::new();
    manager
        .add_limiter(
            services::LLM,
            RateLimitConfig::per_minute(RateLimitAlgorithm::TokenBucket, 5),
        )
        .unwrap();

    // First five calls are admitted with decreasing remaining counts.
    let mut previous_remaining = u32::MAX;
    for _ in 0..5 {
        let decision = manager.consume(services::LLM, "user_123", 1);
        assert!(decision.allowed);
        assert!(decision.remaining < previous_remaining);
        previous_remaining = decision.remaining;
    }

    // Calls six through eight are denied with a positive retry hint.
    for _ in 0..3 {
        let decision = manager.consume(services::LLM, "user_123", 1);
        assert!(!decision.allowed);
        assert!(decision.retry_after.unwrap() > Duration::ZERO);
    }
}

#[tokio::test(start_paused = true)]
async fn breaker_trips_on_third_failure_and_rejects_the_fourth() {
    let mut config = ResilienceConfig::default();
    config
        .services
        .get_mut(services::DATABASE)
        .unwrap()
        .circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout: Duration::from_secs(60),
        success_threshold: 2,
        half_open_max_calls: 2,
    };

    let manager = CircuitBreakerManager::from_config(config);
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        let result = manager
            .call(services::DATABASE, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(CallError::permanent("invalid value"))
            })
            .await;
        // The operation error is re-raised unchanged.
        assert!(matches!(
            result,
            Err(breakwater::CircuitBreakerError::Operation(
                CallError::Permanent(_)
            ))
        ));
    }

    let breaker = manager.get_breaker(services::DATABASE);
    assert_eq!(breaker.state(), breakwater::CircuitState::Open);

    // No recovery timeout has elapsed: rejected without invoking.
    let result = manager
        .call(services::DATABASE, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!("unreachable"))
        })
        .await;
    assert!(matches!(
        result,
        Err(breakwater::CircuitBreakerError::Open { .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failing_mcp_call_returns_the_default_value() {
    let fallbacks: FallbackManager<Value> = FallbackManager::new();
    let handler = FallbackHandler::new(FallbackConfig::default())
        .unwrap()
        .with_strategy(Arc::new(DefaultValueStrategy::new(
            json!({"error": "unavailable"}),
        )));
    fallbacks.register_handler(services::MCP, handler);

    let value = fallbacks
        .handle_service_call(services::MCP, || async {
            Err::<Value, _>(CallError::transport("tool server unreachable"))
        })
        .await
        .unwrap();
    assert_eq!(value, json!({"error": "unavailable"}));
}

#[tokio::test(start_paused = true)]
async fn guard_applies_stages_in_order() {
    let mut config = ResilienceConfig::default();
    {
        let policy = config.services.get_mut(services::LLM).unwrap();
        policy.rate_limit = Some(RateLimitConfig::per_minute(
            RateLimitAlgorithm::TokenBucket,
            2,
        ));
        policy.circuit_breaker.failure_threshold = 1;
        policy.retry.max_attempts = 1;
    }

    let fallbacks: FallbackManager<Value> = FallbackManager::new();
    let handler = FallbackHandler::new(FallbackConfig::default())
        .unwrap()
        .with_strategy(Arc::new(DefaultValueStrategy::new(json!("degraded"))));
    fallbacks.register_handler(services::LLM, handler);

    let manager: ResilienceManager<Value> = ResilienceManagerBuilder::new()
        .config(config.clone())
        .rate_limits(Arc::new(RateLimitManager::new()))
        .circuit_breakers(Arc::new(CircuitBreakerManager::from_config(config.clone())))
        .retries(Arc::new(RetryManager::from_config(&config)))
        .fallbacks(Arc::new(fallbacks))
        .build()
        .unwrap();
    let guard = manager.llm_guard();

    // Call 1: fails, is caught by the fallback, and trips the breaker
    // (failure_threshold is 1).
    let degraded = guard
        .execute("user_123", || async {
            Err::<Value, _>(CallError::transport("provider down"))
        })
        .await
        .unwrap();
    assert_eq!(degraded, json!("degraded"));

    // Call 2: the breaker now rejects before the operation runs.
    let calls = Arc::new(AtomicU32::new(0));
    let call_counter = calls.clone();
    let rejected = guard
        .execute("user_123", move || {
            call_counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!("ok")) }
        })
        .await;
    assert!(matches!(rejected, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Call 3: the rate limit (2/min) is now spent and outranks the
    // breaker in the pipeline.
    let limited = guard
        .execute("user_123", || async { Ok(json!("ok")) })
        .await;
    assert!(matches!(limited, Err(ResilienceError::RateLimited { .. })));
}

#[tokio::test(start_paused = true)]
async fn defaults_round_trip_with_health_report() {
    let manager: ResilienceManager<Value> = ResilienceManager::with_defaults().unwrap();

    let value = manager
        .database_guard()
        .execute("tenant_7", || async { Ok(json!({"rows": 3})) })
        .await
        .unwrap();
    assert_eq!(value, json!({"rows": 3}));

    let report = manager.health_report().unwrap();
    assert_eq!(report.version, env!("CARGO_PKG_VERSION"));
    assert!(report.services.is_empty());
}
