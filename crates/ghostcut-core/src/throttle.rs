//! # Throttle evaluation
//!
//! External pollers collect raw observations (status variables, throttle
//! query result, HTTP probe status, flag files) and hand them to
//! [`ThrottleEvaluator::evaluate`], which turns them into the verdict stored
//! in the [`MigrationContext`]. Row-copy and applier workers only ever read
//! that verdict.
//!
//! Evaluation happens in two stages:
//!
//! 1. **General checks** (stored as the general check result): hibernation
//!    exit, user command, flag files, `--max-load`, throttle query, HTTP probe.
//! 2. **Final verdict**: active hibernation, the general result, heartbeat lag
//!    and control-replica lag.
//!
//! [`CriticalLoadBreaker`] handles `--critical-load`, which does not throttle
//! but hibernates or aborts the migration.

use crate::context::MigrationContext;
use crate::error::{OscError, Result};
use crate::utils::file_exists;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// HTTP status the throttle endpoint returns when work may proceed.
pub const HTTP_STATUS_OK: u16 = 200;

/// Extra context attached to a throttle decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleReasonHint {
    #[default]
    NoHint,
    UserCommand,
    LeavingHibernation,
}

impl fmt::Display for ThrottleReasonHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoHint => "NoThrottleReasonHint",
            Self::UserCommand => "UserCommandThrottleReasonHint",
            Self::LeavingHibernation => "LeavingHibernationThrottleReasonHint",
        };
        f.write_str(s)
    }
}

/// One throttle decision. Replaced wholesale on each evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleCheckResult {
    pub should_throttle: bool,
    pub reason: String,
    pub reason_hint: ThrottleReasonHint,
}

impl ThrottleCheckResult {
    pub fn new(should_throttle: bool, reason: impl Into<String>, hint: ThrottleReasonHint) -> Self {
        Self {
            should_throttle,
            reason: reason.into(),
            reason_hint: hint,
        }
    }

    /// Throttle with no hint.
    pub fn throttle(reason: impl Into<String>) -> Self {
        Self::new(true, reason, ThrottleReasonHint::NoHint)
    }

    /// Proceed.
    pub fn proceed() -> Self {
        Self::default()
    }
}

/// Outcome of the HTTP throttle probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpCheck {
    /// The endpoint answered with this status
    Status(u16),
    /// The request failed before a status was received
    TransportError(String),
}

/// Raw measurements from one polling round.
#[derive(Debug, Clone, Default)]
pub struct ThrottleObservations {
    pub flag_file_exists: bool,
    pub additional_flag_file_exists: bool,
    /// Heartbeat lag on the inspected server; written to the context when set
    pub lag: Option<Duration>,
    /// `SHOW GLOBAL STATUS` values by variable name
    pub status_values: HashMap<String, i64>,
    /// First column of the throttle query, when one is configured
    pub throttle_query_result: Option<i64>,
    pub http_status: Option<HttpCheck>,
}

impl ThrottleObservations {
    /// Observations with flag-file presence filled from the context's paths.
    pub fn with_flag_files(ctx: &MigrationContext) -> Self {
        Self {
            flag_file_exists: ctx.throttle_flag_file.as_ref().is_some_and(|p| file_exists(p)),
            additional_flag_file_exists: ctx
                .throttle_additional_flag_file
                .as_ref()
                .is_some_and(|p| file_exists(p)),
            ..Default::default()
        }
    }
}

/// Turns observations into the stored throttle verdict.
pub struct ThrottleEvaluator;

impl ThrottleEvaluator {
    /// Evaluate one round, store both results in `ctx`, return the final one.
    pub fn evaluate(ctx: &MigrationContext, obs: &ThrottleObservations) -> ThrottleCheckResult {
        if let Some(lag) = obs.lag {
            ctx.set_current_lag(lag);
        }

        let general = Self::general_check(ctx, obs);
        ctx.set_throttle_general_check_result(general.clone());

        let verdict = Self::final_check(ctx, &general);
        if verdict.should_throttle {
            debug!(reason = %verdict.reason, hint = %verdict.reason_hint, "Throttling");
        }
        ctx.set_throttled(verdict.should_throttle, &verdict.reason, verdict.reason_hint);
        verdict
    }

    fn general_check(ctx: &MigrationContext, obs: &ThrottleObservations) -> ThrottleCheckResult {
        let hibernate_until = ctx.hibernate_until();
        if hibernate_until > 0 && Utc::now().timestamp() >= hibernate_until {
            ctx.set_hibernate_until(0);
            return ThrottleCheckResult::new(
                true,
                "leaving hibernation",
                ThrottleReasonHint::LeavingHibernation,
            );
        }

        if ctx.throttle_commanded_by_user() {
            return ThrottleCheckResult::new(
                true,
                "commanded by user",
                ThrottleReasonHint::UserCommand,
            );
        }

        if obs.flag_file_exists || obs.additional_flag_file_exists {
            return ThrottleCheckResult::throttle("flag-file");
        }

        let max_load = ctx.max_load();
        let mut names: Vec<(&str, i64)> = max_load.iter().collect();
        names.sort();
        for (name, threshold) in names {
            match obs.status_values.get(name) {
                None => {
                    return ThrottleCheckResult::throttle(format!("{} not reported", name));
                }
                Some(&value) if value >= threshold => {
                    return ThrottleCheckResult::throttle(format!(
                        "max-load {}={} >= {}",
                        name, value, threshold
                    ));
                }
                Some(_) => {}
            }
        }

        if !ctx.throttle_query().is_empty() {
            if let Some(result) = obs.throttle_query_result {
                if result > 0 {
                    return ThrottleCheckResult::throttle("throttle-query");
                }
            }
        }

        if !ctx.throttle_http().is_empty() {
            match &obs.http_status {
                Some(HttpCheck::Status(status)) => {
                    ctx.set_throttle_http_status_code(i64::from(*status));
                    if *status != HTTP_STATUS_OK {
                        return ThrottleCheckResult::throttle(format!("http={}", status));
                    }
                }
                Some(HttpCheck::TransportError(e)) => {
                    ctx.set_throttle_http_status_code(0);
                    if !ctx.ignore_http_errors() {
                        return ThrottleCheckResult::throttle(format!("http error: {}", e));
                    }
                    warn!(error = %e, "Ignoring throttle-http error");
                }
                None => {}
            }
        }

        ThrottleCheckResult::proceed()
    }

    fn final_check(ctx: &MigrationContext, general: &ThrottleCheckResult) -> ThrottleCheckResult {
        let hibernate_until = ctx.hibernate_until();
        if hibernate_until > 0 {
            let until = DateTime::<Utc>::from_timestamp(hibernate_until, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| hibernate_until.to_string());
            return ThrottleCheckResult::throttle(format!("critical-load-hibernate until {}", until));
        }

        if general.should_throttle {
            return general.clone();
        }

        let threshold = Duration::from_millis(
            u64::try_from(ctx.max_lag_milliseconds_throttle_threshold()).unwrap_or(0),
        );
        let lag = ctx.current_lag();
        if lag > threshold {
            return ThrottleCheckResult::throttle(format!("lag={:.6}s", lag.as_secs_f64()));
        }

        let on_replica = ctx.test_on_replica || ctx.migrate_on_replica;
        if !(on_replica && ctx.is_all_events_up_to_lock_processed()) {
            let lag_result = ctx.control_replicas_lag_result();
            if let Some(err) = &lag_result.error {
                return ThrottleCheckResult::throttle(format!("{} {}", lag_result.key, err));
            }
            if lag_result.lag > threshold {
                return ThrottleCheckResult::throttle(format!(
                    "{} replica-lag={:.6}s",
                    lag_result.key,
                    lag_result.lag.as_secs_f64()
                ));
            }
        }

        ThrottleCheckResult::proceed()
    }
}

/// Error when the panic flag file exists.
pub fn check_panic_flag_file(ctx: &MigrationContext) -> Result<()> {
    match &ctx.panic_flag_file {
        Some(path) if file_exists(path) => Err(OscError::aborted(format!(
            "Found panic-file {}. Aborting without cleanup",
            path.display()
        ))),
        _ => Ok(()),
    }
}

/// What to do about `--critical-load`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CriticalLoadVerdict {
    /// No threshold met
    Clear,
    /// Threshold met for the first time; check again after the given delay
    Recheck(Duration),
    /// Stop all work until the given unix timestamp (seconds)
    Hibernate(i64),
    /// Abort the migration
    Abort(String),
}

/// Escalation state for `--critical-load`.
#[derive(Debug, Default)]
pub struct CriticalLoadBreaker {
    first_breach: Option<Instant>,
}

impl CriticalLoadBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate status values against `ctx.critical_load()`.
    ///
    /// On `Hibernate` the context's hibernate-until is set, so the next
    /// throttle evaluation blocks all work.
    pub fn check(
        &mut self,
        ctx: &MigrationContext,
        status_values: &HashMap<String, i64>,
        now: Instant,
    ) -> CriticalLoadVerdict {
        let critical_load = ctx.critical_load();
        let mut names: Vec<(&str, i64)> = critical_load.iter().collect();
        names.sort();

        let breach = names.into_iter().find_map(|(name, threshold)| {
            status_values
                .get(name)
                .filter(|&&value| value >= threshold)
                .map(|&value| (name.to_string(), value, threshold))
        });

        let Some((name, value, threshold)) = breach else {
            self.first_breach = None;
            return CriticalLoadVerdict::Clear;
        };

        let hibernate_seconds = ctx.critical_load_hibernate_seconds;
        if hibernate_seconds > 0 {
            let until = Utc::now().timestamp().saturating_add(hibernate_seconds);
            ctx.set_hibernate_until(until);
            self.first_breach = None;
            error!(
                "critical-load met: {}={}, >={}. Will hibernate for {}s",
                name, value, threshold, hibernate_seconds
            );
            return CriticalLoadVerdict::Hibernate(until);
        }

        let interval_ms = ctx.critical_load_interval_milliseconds;
        if interval_ms == 0 {
            return CriticalLoadVerdict::Abort(format!(
                "critical-load met: {}={}, >={}",
                name, value, threshold
            ));
        }

        let interval = Duration::from_millis(interval_ms);
        match self.first_breach {
            None => {
                self.first_breach = Some(now);
                error!(
                    "critical-load met once: {}={}, >={}. Will check again in {} millis",
                    name, value, threshold, interval_ms
                );
                CriticalLoadVerdict::Recheck(interval)
            }
            Some(first) => {
                let elapsed = now.saturating_duration_since(first);
                if elapsed >= interval {
                    CriticalLoadVerdict::Abort(format!(
                        "critical-load met again after {} millis: {}={}, >={}",
                        interval_ms, name, value, threshold
                    ))
                } else {
                    CriticalLoadVerdict::Recheck(interval - elapsed)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance_key::InstanceKey;
    use crate::replication::ReplicationLagResult;

    fn status(pairs: &[(&str, i64)]) -> HashMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_no_throttle_by_default() {
        let ctx = MigrationContext::new();
        let verdict = ThrottleEvaluator::evaluate(&ctx, &ThrottleObservations::default());
        assert_eq!(verdict, ThrottleCheckResult::proceed());
        assert!(!ctx.is_throttled().0);
    }

    #[test]
    fn test_user_command() {
        let ctx = MigrationContext::new();
        ctx.set_throttle_commanded_by_user(true);
        let verdict = ThrottleEvaluator::evaluate(&ctx, &ThrottleObservations::default());
        assert!(verdict.should_throttle);
        assert_eq!(verdict.reason, "commanded by user");
        assert_eq!(verdict.reason_hint, ThrottleReasonHint::UserCommand);
        assert_eq!(ctx.throttle_general_check_result(), verdict);
    }

    #[test]
    fn test_flag_file() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("throttle.flag");
        let mut ctx = MigrationContext::new();
        ctx.throttle_flag_file = Some(flag.clone());

        let obs = ThrottleObservations::with_flag_files(&ctx);
        assert!(!ThrottleEvaluator::evaluate(&ctx, &obs).should_throttle);

        crate::utils::touch_file(&flag).unwrap();
        let obs = ThrottleObservations::with_flag_files(&ctx);
        let verdict = ThrottleEvaluator::evaluate(&ctx, &obs);
        assert_eq!(verdict.reason, "flag-file");
    }

    #[test]
    fn test_max_load() {
        let ctx = MigrationContext::new();
        ctx.read_max_load("Threads_running=20").unwrap();

        let obs = ThrottleObservations {
            status_values: status(&[("Threads_running", 5)]),
            ..Default::default()
        };
        assert!(!ThrottleEvaluator::evaluate(&ctx, &obs).should_throttle);

        let obs = ThrottleObservations {
            status_values: status(&[("Threads_running", 20)]),
            ..Default::default()
        };
        let verdict = ThrottleEvaluator::evaluate(&ctx, &obs);
        assert_eq!(verdict.reason, "max-load Threads_running=20 >= 20");

        let verdict = ThrottleEvaluator::evaluate(&ctx, &ThrottleObservations::default());
        assert_eq!(verdict.reason, "Threads_running not reported");
    }

    #[test]
    fn test_throttle_query() {
        let ctx = MigrationContext::new();
        let obs = ThrottleObservations {
            throttle_query_result: Some(1),
            ..Default::default()
        };
        // ignored while no query is configured
        assert!(!ThrottleEvaluator::evaluate(&ctx, &obs).should_throttle);

        ctx.set_throttle_query("select 1");
        assert_eq!(ThrottleEvaluator::evaluate(&ctx, &obs).reason, "throttle-query");
    }

    #[test]
    fn test_http_status() {
        let ctx = MigrationContext::new();
        ctx.set_throttle_http("http://throttler.local/check");

        let obs = ThrottleObservations {
            http_status: Some(HttpCheck::Status(429)),
            ..Default::default()
        };
        assert_eq!(ThrottleEvaluator::evaluate(&ctx, &obs).reason, "http=429");
        assert_eq!(ctx.throttle_http_status_code(), 429);

        let obs = ThrottleObservations {
            http_status: Some(HttpCheck::Status(200)),
            ..Default::default()
        };
        assert!(!ThrottleEvaluator::evaluate(&ctx, &obs).should_throttle);
    }

    #[test]
    fn test_http_transport_error() {
        let ctx = MigrationContext::new();
        ctx.set_throttle_http("http://throttler.local/check");
        let obs = ThrottleObservations {
            http_status: Some(HttpCheck::TransportError("connection refused".into())),
            ..Default::default()
        };
        assert!(ThrottleEvaluator::evaluate(&ctx, &obs).should_throttle);

        ctx.set_ignore_http_errors(true);
        assert!(!ThrottleEvaluator::evaluate(&ctx, &obs).should_throttle);
    }

    #[test]
    fn test_lag() {
        let ctx = MigrationContext::new();
        ctx.set_max_lag_milliseconds_throttle_threshold(1000);

        let obs = ThrottleObservations {
            lag: Some(Duration::from_millis(1500)),
            ..Default::default()
        };
        let verdict = ThrottleEvaluator::evaluate(&ctx, &obs);
        assert_eq!(verdict.reason, "lag=1.500000s");
        assert_eq!(ctx.current_lag(), Duration::from_millis(1500));
        // lag is not a general check
        assert!(!ctx.throttle_general_check_result().should_throttle);
    }

    #[test]
    fn test_control_replica_lag() {
        let ctx = MigrationContext::new();
        let key = InstanceKey::new("replica-2", 3306);
        ctx.set_control_replicas_lag_result(Some(ReplicationLagResult::new(
            key.clone(),
            Duration::from_secs(3),
        )));
        let verdict = ThrottleEvaluator::evaluate(&ctx, &ThrottleObservations::default());
        assert_eq!(verdict.reason, "replica-2:3306 replica-lag=3.000000s");

        ctx.set_control_replicas_lag_result(Some(ReplicationLagResult::failed(key, "timeout")));
        let verdict = ThrottleEvaluator::evaluate(&ctx, &ThrottleObservations::default());
        assert_eq!(verdict.reason, "replica-2:3306 timeout");

        ctx.set_control_replicas_lag_result(None);
        assert!(!ThrottleEvaluator::evaluate(&ctx, &ThrottleObservations::default()).should_throttle);
    }

    #[test]
    fn test_hibernation_and_exit() {
        let ctx = MigrationContext::new();
        ctx.set_hibernate_until(Utc::now().timestamp() + 3600);
        let verdict = ThrottleEvaluator::evaluate(&ctx, &ThrottleObservations::default());
        assert!(verdict.reason.starts_with("critical-load-hibernate until"));

        ctx.set_hibernate_until(Utc::now().timestamp() - 1);
        let verdict = ThrottleEvaluator::evaluate(&ctx, &ThrottleObservations::default());
        assert_eq!(verdict.reason, "leaving hibernation");
        assert_eq!(verdict.reason_hint, ThrottleReasonHint::LeavingHibernation);
        assert_eq!(ctx.hibernate_until(), 0);

        assert!(!ThrottleEvaluator::evaluate(&ctx, &ThrottleObservations::default()).should_throttle);
    }

    #[test]
    fn test_critical_section_overrides_verdict() {
        let ctx = MigrationContext::new();
        ctx.set_throttle_commanded_by_user(true);
        ThrottleEvaluator::evaluate(&ctx, &ThrottleObservations::default());
        ctx.set_in_cut_over_critical_section(true);

        let (throttled, reason, hint) = ctx.is_throttled();
        assert!(!throttled);
        assert_eq!(reason, "critical section");
        assert_eq!(hint, ThrottleReasonHint::NoHint);
    }

    #[test]
    fn test_panic_flag_file() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("panic.flag");
        let mut ctx = MigrationContext::new();
        assert!(check_panic_flag_file(&ctx).is_ok());

        ctx.panic_flag_file = Some(flag.clone());
        assert!(check_panic_flag_file(&ctx).is_ok());

        crate::utils::touch_file(&flag).unwrap();
        let err = check_panic_flag_file(&ctx).unwrap_err();
        assert!(err.to_string().contains("Found panic-file"));
    }

    // ========================================================================
    // Critical load
    // ========================================================================

    #[test]
    fn test_critical_load_clear() {
        let ctx = MigrationContext::new();
        ctx.read_critical_load("Threads_running=100").unwrap();
        let mut breaker = CriticalLoadBreaker::new();
        let verdict = breaker.check(&ctx, &status(&[("Threads_running", 3)]), Instant::now());
        assert_eq!(verdict, CriticalLoadVerdict::Clear);
    }

    #[test]
    fn test_critical_load_immediate_abort() {
        let ctx = MigrationContext::new();
        ctx.read_critical_load("Threads_running=100").unwrap();
        let mut breaker = CriticalLoadBreaker::new();
        let verdict = breaker.check(&ctx, &status(&[("Threads_running", 150)]), Instant::now());
        assert_eq!(
            verdict,
            CriticalLoadVerdict::Abort("critical-load met: Threads_running=150, >=100".into())
        );
    }

    #[test]
    fn test_critical_load_grace_interval() {
        let mut ctx = MigrationContext::new();
        ctx.critical_load_interval_milliseconds = 500;
        ctx.read_critical_load("Threads_running=100").unwrap();
        let mut breaker = CriticalLoadBreaker::new();
        let high = status(&[("Threads_running", 150)]);
        let t0 = Instant::now();

        assert_eq!(
            breaker.check(&ctx, &high, t0),
            CriticalLoadVerdict::Recheck(Duration::from_millis(500))
        );
        assert_eq!(
            breaker.check(&ctx, &high, t0 + Duration::from_millis(200)),
            CriticalLoadVerdict::Recheck(Duration::from_millis(300))
        );
        match breaker.check(&ctx, &high, t0 + Duration::from_millis(500)) {
            CriticalLoadVerdict::Abort(reason) => {
                assert!(reason.starts_with("critical-load met again after 500 millis"))
            }
            other => panic!("unexpected verdict: {:?}", other),
        }
    }

    #[test]
    fn test_critical_load_recovery_resets() {
        let mut ctx = MigrationContext::new();
        ctx.critical_load_interval_milliseconds = 500;
        ctx.read_critical_load("Threads_running=100").unwrap();
        let mut breaker = CriticalLoadBreaker::new();
        let t0 = Instant::now();

        breaker.check(&ctx, &status(&[("Threads_running", 150)]), t0);
        breaker.check(&ctx, &status(&[("Threads_running", 10)]), t0);
        assert_eq!(
            breaker.check(
                &ctx,
                &status(&[("Threads_running", 150)]),
                t0 + Duration::from_secs(1)
            ),
            CriticalLoadVerdict::Recheck(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_critical_load_hibernate() {
        let mut ctx = MigrationContext::new();
        ctx.critical_load_hibernate_seconds = 60;
        ctx.read_critical_load("Threads_running=100").unwrap();
        let mut breaker = CriticalLoadBreaker::new();

        match breaker.check(&ctx, &status(&[("Threads_running", 150)]), Instant::now()) {
            CriticalLoadVerdict::Hibernate(until) => {
                assert_eq!(ctx.hibernate_until(), until);
                assert!(until > Utc::now().timestamp());
            }
            other => panic!("unexpected verdict: {:?}", other),
        }
        let verdict = ThrottleEvaluator::evaluate(&ctx, &ThrottleObservations::default());
        assert!(verdict.reason.starts_with("critical-load-hibernate until"));
    }

    #[test]
    fn test_critical_load_hibernate_huge_duration() {
        let mut ctx = MigrationContext::new();
        ctx.critical_load_hibernate_seconds = i64::MAX;
        ctx.read_critical_load("Threads_running=10").unwrap();
        let mut breaker = CriticalLoadBreaker::new();

        let verdict = breaker.check(&ctx, &status(&[("Threads_running", 50)]), Instant::now());
        assert_eq!(verdict, CriticalLoadVerdict::Hibernate(i64::MAX));
        assert_eq!(ctx.hibernate_until(), i64::MAX);

        let verdict = ThrottleEvaluator::evaluate(&ctx, &ThrottleObservations::default());
        assert!(verdict.should_throttle);
        assert!(verdict.reason.starts_with("critical-load-hibernate until"));
    }
}
