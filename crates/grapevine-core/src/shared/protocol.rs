//! Shared data wire messages

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::GrapevineResult;
use crate::shared::data::{Entry, MutationOutcome, SharedData};
use crate::shared::value::{TypeRegistry, Value};
use crate::transport::Route;
use crate::types::{Contact, SharedDataId};

/// Invitation to replicate a shared data instance under `as_role`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDataInvite {
    pub shared_data_id: SharedDataId,
    pub creator: Contact,
    pub inviter: Contact,
    pub as_role: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDataInviteResponse {
    pub accepted: bool,
}

/// Full state pushed to a newly accepted invitee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedDataSendState {
    pub shared_data_id: SharedDataId,
    pub originator: Contact,
    pub data: BTreeMap<String, Entry>,
    /// Every current participant, keyed by role
    pub listeners: BTreeMap<String, Contact>,
}

/// One mutation, applied identically on every replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Create {
        key: String,
        value: Value,
        owner: String,
        visibility: String,
    },
    CreateArray {
        key: String,
        values: Vec<Value>,
        owner: String,
        visibility: String,
    },
    CreateMap {
        key: String,
        entries: BTreeMap<String, Value>,
        owner: String,
        visibility: String,
    },
    Set {
        key: String,
        value: Value,
    },
    SetMap {
        key: String,
        map_key: String,
        value: Value,
    },
    Append {
        key: String,
        value: Value,
    },
    ChangeOwner {
        key: String,
        owner: String,
    },
}

impl Mutation {
    pub fn key(&self) -> &str {
        match self {
            Mutation::Create { key, .. }
            | Mutation::CreateArray { key, .. }
            | Mutation::CreateMap { key, .. }
            | Mutation::Set { key, .. }
            | Mutation::SetMap { key, .. }
            | Mutation::Append { key, .. }
            | Mutation::ChangeOwner { key, .. } => key,
        }
    }

    pub fn route(&self) -> Route {
        match self {
            Mutation::Create { .. } => Route::Create,
            Mutation::CreateArray { .. } => Route::CreateArray,
            Mutation::CreateMap { .. } => Route::CreateMap,
            Mutation::Set { .. } => Route::Set,
            Mutation::SetMap { .. } => Route::SetMap,
            Mutation::Append { .. } => Route::Append,
            Mutation::ChangeOwner { .. } => Route::ChangeOwner,
        }
    }

    /// Whether the writer must own the key; creates may be issued by anyone
    pub fn writes_existing_key(&self) -> bool {
        !matches!(
            self,
            Mutation::Create { .. } | Mutation::CreateArray { .. } | Mutation::CreateMap { .. }
        )
    }

    pub fn apply(&self, data: &mut SharedData) -> GrapevineResult<MutationOutcome> {
        match self {
            Mutation::Create {
                key,
                value,
                owner,
                visibility,
            } => {
                data.create(key, value.clone(), owner, visibility);
                Ok(MutationOutcome::Applied)
            }
            Mutation::CreateArray {
                key,
                values,
                owner,
                visibility,
            } => {
                data.create_array(key, values.clone(), owner, visibility);
                Ok(MutationOutcome::Applied)
            }
            Mutation::CreateMap {
                key,
                entries,
                owner,
                visibility,
            } => {
                data.create_map(key, entries.clone(), owner, visibility);
                Ok(MutationOutcome::Applied)
            }
            Mutation::Set { key, value } => data.set(key, value.clone()),
            Mutation::SetMap {
                key,
                map_key,
                value,
            } => data.set_map(key, map_key, value.clone()),
            Mutation::Append { key, value } => data.append(key, value.clone()),
            Mutation::ChangeOwner { key, owner } => Ok(data.change_data_owner(key, owner)),
        }
    }

    /// Check every record value carried by this mutation
    pub fn validate(&self, registry: &TypeRegistry) -> GrapevineResult<()> {
        match self {
            Mutation::Create { value, .. }
            | Mutation::Set { value, .. }
            | Mutation::SetMap { value, .. }
            | Mutation::Append { value, .. } => registry.validate(value),
            Mutation::CreateArray { values, .. } => {
                values.iter().try_for_each(|v| registry.validate(v))
            }
            Mutation::CreateMap { entries, .. } => {
                entries.values().try_for_each(|v| registry.validate(v))
            }
            Mutation::ChangeOwner { .. } => Ok(()),
        }
    }
}

/// A mutation addressed to one shared data instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedDataMutation {
    pub shared_data_id: SharedDataId,
    pub originator: Contact,
    pub mutation: Mutation,
}

/// Reply to a mutation: what it did on the receiving replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDataMutationResponse {
    pub outcome: MutationOutcome,
}

/// Announces that `contact` now replicates the instance as `role`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDataJoin {
    pub shared_data_id: SharedDataId,
    pub role: String,
    pub contact: Contact,
}

/// Announces that `role` stopped replicating the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDataLeave {
    pub shared_data_id: SharedDataId,
    pub role: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GrapevineError;
    use crate::shared::value::SharedType;
    use crate::types::{AccountId, Address};

    fn data() -> SharedData {
        SharedData::new(Contact::new(AccountId::new("a"), Address::localhost(1)))
    }

    #[test]
    fn test_mutation_routes() {
        let set = Mutation::Set {
            key: "k".into(),
            value: Value::Int(1),
        };
        assert_eq!(set.route(), Route::Set);
        assert_eq!(set.key(), "k");
        assert!(set.writes_existing_key());

        let create = Mutation::CreateMap {
            key: "m".into(),
            entries: BTreeMap::new(),
            owner: "p1".into(),
            visibility: "public".into(),
        };
        assert_eq!(create.route(), Route::CreateMap);
        assert!(!create.writes_existing_key());
    }

    #[test]
    fn test_apply_sequence() {
        let mut sd = data();
        let ops = [
            Mutation::CreateArray {
                key: "log".into(),
                values: vec![],
                owner: "p1".into(),
                visibility: "public".into(),
            },
            Mutation::Append {
                key: "log".into(),
                value: Value::from("hi"),
            },
            Mutation::ChangeOwner {
                key: "log".into(),
                owner: "p2".into(),
            },
        ];
        for op in &ops {
            assert_eq!(op.apply(&mut sd).unwrap(), MutationOutcome::Applied);
        }
        assert_eq!(sd.get("log"), Value::List(vec![Value::from("hi")]));
        assert_eq!(sd.get_owner("log"), Some("p2"));
    }

    #[test]
    fn test_validate_rejects_unregistered_record() {
        #[derive(Serialize, Deserialize)]
        struct Card(u8);
        impl SharedType for Card {
            const TYPE_TAG: &'static str = "card";
        }

        let registry = TypeRegistry::new();
        let op = Mutation::CreateArray {
            key: "hand".into(),
            values: vec![Value::record(&Card(3)).unwrap()],
            owner: "p1".into(),
            visibility: "private".into(),
        };
        assert!(matches!(
            op.validate(&registry),
            Err(GrapevineError::UnknownRecordType(_))
        ));
        registry.register::<Card>();
        op.validate(&registry).unwrap();
    }
}
