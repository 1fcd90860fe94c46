//! Deterministic in-memory backend for dry runs and tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::backend::{BackendError, BackendResult, EntityState, HomeBackend, ServiceCall};
use crate::types::BoxFuture;

#[derive(Debug, Default)]
struct MockState {
    states: BTreeMap<String, EntityState>,
    read_delays: BTreeMap<String, Duration>,
    write_failures: VecDeque<BackendError>,
    calls: Vec<ServiceCall>,
}

#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    inner: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_state(&self, entity_id: &str, state: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .states
            .insert(entity_id.to_string(), EntityState::new(entity_id, state));
    }

    pub async fn set_numeric(&self, entity_id: &str, value: f64) {
        self.set_state(entity_id, &value.to_string()).await;
    }

    pub async fn remove(&self, entity_id: &str) {
        self.inner.lock().await.states.remove(entity_id);
    }

    pub async fn state_of(&self, entity_id: &str) -> Option<EntityState> {
        self.inner.lock().await.states.get(entity_id).cloned()
    }

    /// Reads of `entity_id` sleep for `delay` before answering.
    pub async fn set_read_delay(&self, entity_id: &str, delay: Duration) {
        self.inner
            .lock()
            .await
            .read_delays
            .insert(entity_id.to_string(), delay);
    }

    /// Queue errors returned by the next service calls, in order.
    pub async fn push_write_failures(&self, failures: impl IntoIterator<Item = BackendError>) {
        self.inner.lock().await.write_failures.extend(failures);
    }

    /// Successful service calls, in order.
    pub async fn calls(&self) -> Vec<ServiceCall> {
        self.inner.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    async fn read(&self, entity_id: &str) -> BackendResult<EntityState> {
        let delay = self.inner.lock().await.read_delays.get(entity_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner
            .lock()
            .await
            .states
            .get(entity_id)
            .cloned()
            .ok_or_else(|| BackendError::not_found(format!("entity {entity_id} not found")))
    }

    async fn write(&self, call: ServiceCall) -> BackendResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.write_failures.pop_front() {
            return Err(err);
        }
        if let Some(entity_id) = call.entity_id().map(str::to_string) {
            let new_state = match call.service.as_str() {
                "turn_on" => Some("on".to_string()),
                "turn_off" => Some("off".to_string()),
                _ => call
                    .data
                    .get("value")
                    .or_else(|| call.data.get("temperature"))
                    .and_then(|v| v.as_f64())
                    .map(|v| v.to_string()),
            };
            if let Some(state) = new_state {
                inner
                    .states
                    .insert(entity_id.clone(), EntityState::new(entity_id, state));
            }
        }
        inner.calls.push(call);
        Ok(())
    }
}

impl HomeBackend for MockBackend {
    fn get_state<'a>(&'a self, entity_id: &'a str) -> BoxFuture<'a, BackendResult<EntityState>> {
        Box::pin(self.read(entity_id))
    }

    fn call_service(&self, call: ServiceCall) -> BoxFuture<'_, BackendResult<()>> {
        Box::pin(self.write(call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_update_state_and_are_recorded() {
        let mock = MockBackend::new();
        mock.call_service(ServiceCall::for_entity("input_number.sp", 21.0, None))
            .await
            .unwrap();
        mock.call_service(ServiceCall::for_entity("switch.pump", 1.0, None))
            .await
            .unwrap();
        assert_eq!(mock.get_state("input_number.sp").await.unwrap().numeric(), Some(21.0));
        assert!(mock.get_state("switch.pump").await.unwrap().is_on());
        assert_eq!(mock.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn queued_failures_come_first() {
        let mock = MockBackend::new();
        mock.push_write_failures([BackendError::retryable("busy")]).await;
        let call = ServiceCall::for_entity("input_number.sp", 20.0, None);
        assert!(mock.call_service(call.clone()).await.is_err());
        assert!(mock.call_service(call).await.is_ok());
        assert_eq!(mock.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_entity_is_not_found() {
        let mock = MockBackend::new();
        let err = mock.get_state("sensor.nope").await.unwrap_err();
        assert_eq!(err.reason_label(), "not_found");
    }
}
