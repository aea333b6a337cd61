//! Account service interface
//!
//! Account storage and authentication run as separate services; a node
//! only needs the resulting [`AccountId`] to fill in its local contact.

use std::future::Future;

use crate::error::GrapevineResult;
use crate::types::{AccountId, Address};

pub trait AccountService: Send + Sync {
    fn create_account(
        &self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = GrapevineResult<AccountId>> + Send;

    /// Authenticate and register `address` as the account's current location
    fn authenticate(
        &self,
        username: &str,
        password: &str,
        address: Address,
    ) -> impl Future<Output = GrapevineResult<AccountId>> + Send;
}
