use crate::subscription::{DeviceEvent, EventReceiver};
use crate::types::{FunctionDescriptor, FunctionId, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};
use tokio::sync::broadcast;

/// Snapshot of every known function value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    values: BTreeMap<FunctionId, Value>,
}

impl DeviceState {
    pub fn get(&self, function: &FunctionId) -> Option<&Value> {
        self.values.get(function)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FunctionId, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Last known device state plus the descriptors it is checked against
///
/// Every accepted update is published on the event channel before `apply`
/// returns, so subscribers see changes in the order they were applied.
pub(crate) struct StateStore {
    descriptors: RwLock<BTreeMap<FunctionId, FunctionDescriptor>>,
    values: Mutex<BTreeMap<FunctionId, Value>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl StateStore {
    pub fn new(events: broadcast::Sender<DeviceEvent>) -> Self {
        Self {
            descriptors: RwLock::new(BTreeMap::new()),
            values: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    /// Replace the descriptor set after a discovery
    ///
    /// Values of functions the device no longer reports are dropped.
    pub fn install_descriptors(&self, descriptors: Vec<FunctionDescriptor>) {
        let map: BTreeMap<FunctionId, FunctionDescriptor> = descriptors
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();

        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.retain(|id, _| map.contains_key(id));
        *self.descriptors.write().unwrap_or_else(|e| e.into_inner()) = map;
    }

    /// Apply a raw value received from the device
    ///
    /// Returns the interpreted value, or `None` when the update was ignored.
    pub fn apply(&self, function: &FunctionId, raw: &str) -> Option<Value> {
        let value = {
            let descriptors = self.descriptors.read().unwrap_or_else(|e| e.into_inner());
            let Some(descriptor) = descriptors.get(function) else {
                tracing::warn!("Ignoring update for undiscovered function {}: {:?}", function, raw);
                return None;
            };
            match descriptor.parse_value(raw) {
                Some(value) => value,
                None => {
                    tracing::warn!("Ignoring unparseable value for {}: {:?}", function, raw);
                    return None;
                }
            }
        };

        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let old = values.insert(function.clone(), value.clone());
        if old.as_ref() != Some(&value) {
            tracing::debug!("{} changed: {:?} -> {:?}", function, old, value);
            let _ = self.events.send(DeviceEvent::StateChanged {
                function: function.clone(),
                old,
                new: value.clone(),
            });
        }

        Some(value)
    }

    pub fn get(&self, function: &FunctionId) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(function)
            .cloned()
    }

    pub fn snapshot(&self) -> DeviceState {
        DeviceState {
            values: self.values.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }

    pub fn descriptor(&self, function: &FunctionId) -> Option<FunctionDescriptor> {
        self.descriptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(function)
            .cloned()
    }

    pub fn descriptors(&self) -> Vec<FunctionDescriptor> {
        self.descriptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, FUNCTION_AMBTEMP, FUNCTION_MODE, FUNCTION_SETPOINT};

    fn store() -> StateStore {
        let (tx, _) = broadcast::channel(16);
        let store = StateStore::new(tx);
        store.install_descriptors(vec![
            FunctionDescriptor::from_limits(
                1,
                FUNCTION_MODE,
                &["AUTO".to_string(), "COOL".to_string()],
            )
            .unwrap(),
            FunctionDescriptor::from_limits(
                1,
                FUNCTION_SETPOINT,
                &["160".to_string(), "300".to_string()],
            )
            .unwrap(),
            FunctionDescriptor::read_only(1, FUNCTION_AMBTEMP, DataType::Integer),
        ]);
        store
    }

    #[test]
    fn apply_publishes_old_and_new_values() {
        let store = store();
        let mut rx = store.subscribe();
        let mode = FunctionId::new(1, FUNCTION_MODE);

        store.apply(&mode, "AUTO");
        store.apply(&mode, "COOL");

        assert_eq!(
            rx.try_recv().unwrap(),
            Some(DeviceEvent::StateChanged {
                function: mode.clone(),
                old: None,
                new: Value::Enumerated("AUTO".into()),
            })
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Some(DeviceEvent::StateChanged {
                function: mode.clone(),
                old: Some(Value::Enumerated("AUTO".into())),
                new: Value::Enumerated("COOL".into()),
            })
        );
    }

    #[test]
    fn unchanged_values_are_not_republished() {
        let store = store();
        let setpoint = FunctionId::new(1, FUNCTION_SETPOINT);
        store.apply(&setpoint, "220");
        let mut rx = store.subscribe();

        assert_eq!(store.apply(&setpoint, "220"), Some(Value::Integer(220)));
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[test]
    fn undiscovered_functions_are_ignored() {
        let store = store();
        let mut rx = store.subscribe();

        assert_eq!(store.apply(&FunctionId::new(1, "1"), "SETPTEMP,220"), None);
        assert_eq!(store.apply(&FunctionId::new(2, FUNCTION_MODE), "COOL"), None);
        assert!(store.snapshot().is_empty());
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[test]
    fn unparseable_integers_are_ignored() {
        let store = store();
        assert_eq!(store.apply(&FunctionId::new(1, FUNCTION_AMBTEMP), "warm"), None);
        assert!(store.get(&FunctionId::new(1, FUNCTION_AMBTEMP)).is_none());
    }

    #[test]
    fn null_sentinel_marks_value_unavailable() {
        let store = store();
        let ambient = FunctionId::new(1, FUNCTION_AMBTEMP);
        store.apply(&ambient, "215");
        store.apply(&ambient, "-32768");
        assert_eq!(store.get(&ambient), Some(Value::Unavailable));
    }

    #[test]
    fn reinstalling_descriptors_prunes_stale_values() {
        let store = store();
        let mode = FunctionId::new(1, FUNCTION_MODE);
        let ambient = FunctionId::new(1, FUNCTION_AMBTEMP);
        store.apply(&mode, "COOL");
        store.apply(&ambient, "200");

        store.install_descriptors(vec![FunctionDescriptor::read_only(
            1,
            FUNCTION_AMBTEMP,
            DataType::Integer,
        )]);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(&mode).is_none());
        assert_eq!(snapshot.get(&ambient), Some(&Value::Integer(200)));
    }
}
