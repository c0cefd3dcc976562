//! Authentication module - Provider key lookup
//!
//! Keys given on the command line, in the environment or in the config file
//! win; anything still missing is looked up in the system keyring.

mod credential_store;

pub use credential_store::{CredentialKey, CredentialStore, CredentialStoreError};
