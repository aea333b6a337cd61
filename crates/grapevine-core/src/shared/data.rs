//! Local shared data replica

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{GrapevineError, GrapevineResult};
use crate::shared::value::Value;
use crate::types::{Contact, SharedDataId};

/// Invoked with the changed key after a mutation is applied
pub type ChangeCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Result of a mutation on one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationOutcome {
    Applied,
    /// The key does not exist; nothing changed
    KeyNotFound,
    /// The key is owned by another role; nothing changed
    NotOwner,
}

impl MutationOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MutationOutcome::Applied)
    }
}

/// The shape a key was created with. A key keeps its shape until it is
/// created again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryValue {
    Scalar(Value),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl EntryValue {
    pub fn shape(&self) -> &'static str {
        match self {
            EntryValue::Scalar(_) => "scalar",
            EntryValue::Array(_) => "array",
            EntryValue::Map(_) => "map",
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            EntryValue::Scalar(v) => v.clone(),
            EntryValue::Array(items) => Value::List(items.clone()),
            EntryValue::Map(map) => Value::Map(map.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub value: EntryValue,
    /// Role allowed to write this key
    pub owner: String,
    pub visibility: String,
}

/// A key/value table with per-key ownership
pub struct SharedData {
    id: SharedDataId,
    creator: Contact,
    me: Option<String>,
    entries: HashMap<String, Entry>,
    on_change: Option<ChangeCallback>,
}

impl fmt::Debug for SharedData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedData")
            .field("id", &self.id)
            .field("creator", &self.creator)
            .field("me", &self.me)
            .field("entries", &self.entries)
            .field("on_change", &self.on_change.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl SharedData {
    /// A new, empty instance with a fresh id
    pub fn new(creator: Contact) -> Self {
        Self::with_id(creator, SharedDataId::new())
    }

    pub fn with_id(creator: Contact, id: SharedDataId) -> Self {
        Self {
            id,
            creator,
            me: None,
            entries: HashMap::new(),
            on_change: None,
        }
    }

    pub fn id(&self) -> SharedDataId {
        self.id
    }

    pub fn creator(&self) -> &Contact {
        &self.creator
    }

    fn insert(&mut self, key: &str, value: EntryValue, owner: &str, visibility: &str) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                owner: owner.to_string(),
                visibility: visibility.to_string(),
            },
        );
    }

    /// Create (or overwrite) a scalar key
    pub fn create(&mut self, key: &str, value: impl Into<Value>, owner: &str, visibility: &str) {
        self.insert(key, EntryValue::Scalar(value.into()), owner, visibility);
    }

    pub fn create_array(&mut self, key: &str, values: Vec<Value>, owner: &str, visibility: &str) {
        self.insert(key, EntryValue::Array(values), owner, visibility);
    }

    pub fn create_map(
        &mut self,
        key: &str,
        map: BTreeMap<String, Value>,
        owner: &str,
        visibility: &str,
    ) {
        self.insert(key, EntryValue::Map(map), owner, visibility);
    }

    /// Restore a full entry, as received in a state sync
    pub fn restore(&mut self, key: &str, entry: Entry) {
        self.entries.insert(key.to_string(), entry);
    }

    /// Current value; [`Value::Null`] if the key is missing
    pub fn get(&self, key: &str) -> Value {
        self.entries
            .get(key)
            .map(|entry| entry.value.to_value())
            .unwrap_or_default()
    }

    pub fn entry(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Replace a scalar value, keeping owner and visibility
    pub fn set(
        &mut self,
        key: &str,
        value: impl Into<Value>,
    ) -> GrapevineResult<MutationOutcome> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(MutationOutcome::KeyNotFound);
        };
        match &mut entry.value {
            EntryValue::Scalar(current) => {
                *current = value.into();
                Ok(MutationOutcome::Applied)
            }
            _ => Err(shape_mismatch(key, "scalar")),
        }
    }

    /// Set one entry of a map-shaped key
    pub fn set_map(
        &mut self,
        key: &str,
        map_key: &str,
        value: impl Into<Value>,
    ) -> GrapevineResult<MutationOutcome> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(MutationOutcome::KeyNotFound);
        };
        match &mut entry.value {
            EntryValue::Map(map) => {
                map.insert(map_key.to_string(), value.into());
                Ok(MutationOutcome::Applied)
            }
            _ => Err(shape_mismatch(key, "map")),
        }
    }

    /// Append to an array-shaped key
    pub fn append(
        &mut self,
        key: &str,
        value: impl Into<Value>,
    ) -> GrapevineResult<MutationOutcome> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(MutationOutcome::KeyNotFound);
        };
        match &mut entry.value {
            EntryValue::Array(items) => {
                items.push(value.into());
                Ok(MutationOutcome::Applied)
            }
            _ => Err(shape_mismatch(key, "array")),
        }
    }

    pub fn change_data_owner(&mut self, key: &str, owner: &str) -> MutationOutcome {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.owner = owner.to_string();
                MutationOutcome::Applied
            }
            None => MutationOutcome::KeyNotFound,
        }
    }

    pub fn get_owner(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|entry| entry.owner.as_str())
    }

    /// Whether the local role owns `key`; `None` if the key is missing
    pub fn owned_by_me(&self, key: &str) -> Option<bool> {
        let owner = self.get_owner(key)?;
        Some(self.is_me(owner))
    }

    /// Assign the local role. Allowed once.
    pub fn set_me(&mut self, role: &str) -> GrapevineResult<()> {
        if let Some(existing) = &self.me {
            return Err(GrapevineError::RoleAlreadySet(existing.clone()));
        }
        self.me = Some(role.to_string());
        Ok(())
    }

    pub fn me(&self) -> Option<&str> {
        self.me.as_deref()
    }

    pub fn is_me(&self, role: &str) -> bool {
        self.me.as_deref() == Some(role)
    }

    /// Register the change callback, replacing any previous one
    pub fn on_data_change<F>(&mut self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(callback));
    }

    pub fn change_callback(&self) -> Option<ChangeCallback> {
        self.on_change.clone()
    }
}

fn shape_mismatch(key: &str, expected: &'static str) -> GrapevineError {
    GrapevineError::ShapeMismatch {
        key: key.to_string(),
        expected,
    }
}
