//! Runtime-override setters for named policies, mirroring the source's `opts.go`.
//!
//! Every setter here replaces a single [`crate::adaptive::Adaptive`]-backed field on a named
//! policy, so it is safe to call at any point after [`crate::manager::PolicyManager::from_config`]
//! without serializing against in-flight traffic. "Set-all" variants apply the same change to
//! every policy of that kind currently registered.

use std::sync::Arc;

use crate::backoff::Backoff;
use crate::manager::{PolicyManager, PolicyNotFound};
use crate::observability::{Emitter, Logger};
use crate::policy::{ErrorPredicate, HedgingDelayFn, LogCondition, ResponseValidator};

impl<Rsp, E> PolicyManager<Rsp, E>
where
    Rsp: Send + 'static,
    E: std::error::Error + Clone + Send + Sync + 'static,
{
    /// Replace the hedging-delay function for the named hedging policy.
    pub fn set_hedging_dynamic_delay(
        &self,
        name: &str,
        delay: HedgingDelayFn,
    ) -> Result<(), PolicyNotFound> {
        let policy = self.hedging_policy(name).ok_or_else(|| PolicyNotFound(name.to_string()))?;
        policy.hedging_delay.set(delay);
        Ok(())
    }

    /// Replace the hedging-delay function for every registered hedging policy.
    pub fn set_all_hedging_dynamic_delay(&self, delay: HedgingDelayFn) {
        for name in self.hedging_names().map(str::to_string).collect::<Vec<_>>() {
            let _ = self.set_hedging_dynamic_delay(&name, delay.clone());
        }
    }

    /// Replace the non-fatal-error predicate for the named hedging policy.
    pub fn set_hedging_non_fatal_error(
        &self,
        name: &str,
        non_fatal: ErrorPredicate<E>,
    ) -> Result<(), PolicyNotFound> {
        let policy = self.hedging_policy(name).ok_or_else(|| PolicyNotFound(name.to_string()))?;
        policy.non_fatal.set_predicate(non_fatal);
        Ok(())
    }

    /// Replace the non-fatal-error predicate for every registered hedging policy.
    pub fn set_all_hedging_non_fatal_error(&self, non_fatal: ErrorPredicate<E>) {
        for name in self.hedging_names().map(str::to_string).collect::<Vec<_>>() {
            let _ = self.set_hedging_non_fatal_error(&name, non_fatal.clone());
        }
    }

    /// Replace the response validator for the named hedging policy.
    pub fn set_hedging_response_validator(
        &self,
        name: &str,
        validator: ResponseValidator<Rsp, E>,
    ) -> Result<(), PolicyNotFound> {
        let policy = self.hedging_policy(name).ok_or_else(|| PolicyNotFound(name.to_string()))?;
        policy.response_validator.set(Some(validator));
        Ok(())
    }

    /// Replace the response validator for every registered hedging policy.
    pub fn set_all_hedging_response_validator(&self, validator: ResponseValidator<Rsp, E>) {
        for name in self.hedging_names().map(str::to_string).collect::<Vec<_>>() {
            let _ = self.set_hedging_response_validator(&name, validator.clone());
        }
    }

    /// Replace the conditional log sink and flush condition for the named hedging policy.
    pub fn set_hedging_conditional_log(
        &self,
        name: &str,
        sink: Arc<dyn Logger>,
        condition: LogCondition,
    ) -> Result<(), PolicyNotFound> {
        let policy = self.hedging_policy(name).ok_or_else(|| PolicyNotFound(name.to_string()))?;
        policy.log_sink.set(sink);
        policy.log_condition.set(condition);
        Ok(())
    }

    /// Replace the conditional log sink and flush condition for every registered hedging policy.
    pub fn set_all_hedging_conditional_log(&self, sink: Arc<dyn Logger>, condition: LogCondition) {
        for name in self.hedging_names().map(str::to_string).collect::<Vec<_>>() {
            let _ = self.set_hedging_conditional_log(&name, sink.clone(), condition.clone());
        }
    }

    /// Replace the metric emitter for the named hedging policy.
    pub fn set_hedging_emitter(&self, name: &str, emitter: Arc<dyn Emitter>) -> Result<(), PolicyNotFound> {
        let policy = self.hedging_policy(name).ok_or_else(|| PolicyNotFound(name.to_string()))?;
        policy.emitter.set(emitter);
        Ok(())
    }

    /// Replace the metric emitter for every registered hedging policy.
    pub fn set_all_hedging_emitter(&self, emitter: Arc<dyn Emitter>) {
        for name in self.hedging_names().map(str::to_string).collect::<Vec<_>>() {
            let _ = self.set_hedging_emitter(&name, emitter.clone());
        }
    }

    /// Replace the backoff strategy for the named retry policy.
    pub fn set_retry_backoff(&self, name: &str, backoff: Backoff) -> Result<(), PolicyNotFound> {
        let policy = self.retry_policy(name).ok_or_else(|| PolicyNotFound(name.to_string()))?;
        policy.backoff.set(backoff);
        Ok(())
    }

    /// Replace the backoff strategy for every registered retry policy.
    pub fn set_all_retry_backoff(&self, backoff: Backoff) {
        for name in self.retry_names().map(str::to_string).collect::<Vec<_>>() {
            let _ = self.set_retry_backoff(&name, backoff.clone());
        }
    }

    /// Replace the retryable-error predicate for the named retry policy.
    pub fn set_retry_retryable_error(
        &self,
        name: &str,
        retryable: ErrorPredicate<E>,
    ) -> Result<(), PolicyNotFound> {
        let policy = self.retry_policy(name).ok_or_else(|| PolicyNotFound(name.to_string()))?;
        policy.classifier.set_predicate(retryable);
        Ok(())
    }

    /// Replace the retryable-error predicate for every registered retry policy.
    pub fn set_all_retry_retryable_error(&self, retryable: ErrorPredicate<E>) {
        for name in self.retry_names().map(str::to_string).collect::<Vec<_>>() {
            let _ = self.set_retry_retryable_error(&name, retryable.clone());
        }
    }

    /// Replace the response validator for the named retry policy.
    pub fn set_retry_response_validator(
        &self,
        name: &str,
        validator: ResponseValidator<Rsp, E>,
    ) -> Result<(), PolicyNotFound> {
        let policy = self.retry_policy(name).ok_or_else(|| PolicyNotFound(name.to_string()))?;
        policy.response_validator.set(Some(validator));
        Ok(())
    }

    /// Replace the response validator for every registered retry policy.
    pub fn set_all_retry_response_validator(&self, validator: ResponseValidator<Rsp, E>) {
        for name in self.retry_names().map(str::to_string).collect::<Vec<_>>() {
            let _ = self.set_retry_response_validator(&name, validator.clone());
        }
    }

    /// Replace the conditional log sink and flush condition for the named retry policy.
    pub fn set_retry_conditional_log(
        &self,
        name: &str,
        sink: Arc<dyn Logger>,
        condition: LogCondition,
    ) -> Result<(), PolicyNotFound> {
        let policy = self.retry_policy(name).ok_or_else(|| PolicyNotFound(name.to_string()))?;
        policy.log_sink.set(sink);
        policy.log_condition.set(condition);
        Ok(())
    }

    /// Replace the conditional log sink and flush condition for every registered retry policy.
    pub fn set_all_retry_conditional_log(&self, sink: Arc<dyn Logger>, condition: LogCondition) {
        for name in self.retry_names().map(str::to_string).collect::<Vec<_>>() {
            let _ = self.set_retry_conditional_log(&name, sink.clone(), condition.clone());
        }
    }

    /// Replace the metric emitter for the named retry policy.
    pub fn set_retry_emitter(&self, name: &str, emitter: Arc<dyn Emitter>) -> Result<(), PolicyNotFound> {
        let policy = self.retry_policy(name).ok_or_else(|| PolicyNotFound(name.to_string()))?;
        policy.emitter.set(emitter);
        Ok(())
    }

    /// Replace the metric emitter for every registered retry policy.
    pub fn set_all_retry_emitter(&self, emitter: Arc<dyn Emitter>) {
        for name in self.retry_names().map(str::to_string).collect::<Vec<_>>() {
            let _ = self.set_retry_emitter(&name, emitter.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::fmt;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(i32);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "error {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn code_of(e: &TestError) -> i32 {
        e.0
    }

    const DOC: &str = r#"
services:
  - name: svc
    retry_hedging:
      retry:
        name: r1
        max_attempts: 2
        backoff: { linear: ["10ms"] }
        retryable_error_codes: [1]
"#;

    #[test]
    fn set_retry_backoff_replaces_live_policy_value() {
        let config = EngineConfig::from_yaml(DOC).unwrap();
        let manager: PolicyManager<u32, TestError> =
            PolicyManager::from_config(&config, Arc::new(code_of)).unwrap();
        let policy = manager.retry_policy("r1").unwrap();
        assert_eq!(policy.backoff.get().delay(0), Duration::ZERO);

        let new_backoff = Backoff::customized(|_| Duration::from_millis(42));
        manager.set_retry_backoff("r1", new_backoff).unwrap();
        assert_eq!(policy.backoff.get().delay(5), Duration::from_millis(42));
    }

    #[test]
    fn set_retry_backoff_on_unknown_name_errors() {
        let config = EngineConfig::from_yaml(DOC).unwrap();
        let manager: PolicyManager<u32, TestError> =
            PolicyManager::from_config(&config, Arc::new(code_of)).unwrap();
        let err = manager
            .set_retry_backoff("nonexistent", Backoff::customized(|_| Duration::ZERO))
            .unwrap_err();
        assert_eq!(err, PolicyNotFound("nonexistent".to_string()));
    }
}
