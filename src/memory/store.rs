use crate::store::{CallStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use ringcore::types::{Call, CallId, CallUpdate, NewCall};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct StoreState {
    calls: HashMap<CallId, Call>,
    fail_creates: bool,
    fail_reads: bool,
    fail_updates: bool,
}

/// Call records kept in a shared map.
#[derive(Default, Clone)]
pub struct MemoryCallStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("Mutex should not be poisoned")
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.lock().fail_creates = fail;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn set_fail_updates(&self, fail: bool) {
        self.lock().fail_updates = fail;
    }

    /// Current copy of a record, bypassing the async trait.
    pub fn snapshot(&self, id: &CallId) -> Option<Call> {
        self.lock().calls.get(id).cloned()
    }

    /// Overwrite a record directly.
    pub fn put(&self, call: Call) {
        self.lock().calls.insert(call.id.clone(), call);
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn create(&self, new_call: NewCall) -> Result<Call, StoreError> {
        let mut state = self.lock();
        if state.fail_creates {
            return Err(StoreError::Backend("create rejected".to_string()));
        }
        let call = Call::ringing(CallId::generate(), new_call, Utc::now());
        state.calls.insert(call.id.clone(), call.clone());
        Ok(call)
    }

    async fn get(&self, id: &CallId) -> Result<Option<Call>, StoreError> {
        let state = self.lock();
        if state.fail_reads {
            return Err(StoreError::Backend("read rejected".to_string()));
        }
        Ok(state.calls.get(id).cloned())
    }

    async fn update(&self, id: &CallId, update: CallUpdate) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.fail_updates {
            return Err(StoreError::Backend("update rejected".to_string()));
        }
        let call = state
            .calls
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        call.merge(&update);
        Ok(())
    }
}
