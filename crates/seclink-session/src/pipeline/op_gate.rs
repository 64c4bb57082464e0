use std::collections::HashMap;
use std::sync::{
    Arc,
    Mutex as StdMutex,
};

use tokio::sync::{
    Mutex,
    OwnedMutexGuard,
};

/// Keyed single-permit gates serializing the encrypt→send→decrypt sequence
/// of one logical operation. Entries are removed lazily: a gate disappears
/// when the last holder releases it and nobody is queued, so the map never
/// grows with dead keys.
pub struct OperationGateMap {
    gates: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OperationGateMap {
    pub fn new() -> Self {
        Self {
            gates: StdMutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, key: &str) -> OperationGateGuard<'_> {
        let gate = {
            let mut gates = self.gates.lock().expect("gate map lock poisoned");
            gates
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let permit = gate.lock_owned().await;
        OperationGateGuard {
            map: self,
            key: key.to_string(),
            permit: Some(permit),
        }
    }

    pub fn len(&self) -> usize {
        self.gates.lock().expect("gate map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str) {
        let mut gates = self.gates.lock().expect("gate map lock poisoned");
        if let Some(gate) = gates.get(key) {
            // Strong count 1 means only the map holds the gate: no permit is
            // out and no acquirer is queued on a clone.
            if Arc::strong_count(gate) == 1 {
                gates.remove(key);
            }
        }
    }
}

impl Default for OperationGateMap {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OperationGateGuard<'a> {
    map: &'a OperationGateMap,
    key: String,
    permit: Option<OwnedMutexGuard<()>>,
}

impl Drop for OperationGateGuard<'_> {
    fn drop(&mut self) {
        // Release the permit before inspecting the refcount, otherwise the
        // guard's own handle keeps the gate alive.
        self.permit.take();
        self.map.release(&self.key);
    }
}
