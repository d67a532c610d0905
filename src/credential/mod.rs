//! Access-token lifecycle: issuance, caching, expiry, and the bounded
//! refresh-and-replay used when the platform rejects a token.

pub mod cache;
pub mod executor;
pub mod keeper;
pub mod source;

pub use cache::{CachePhase, CachePolicy, CacheStatus, Credential, CredentialCache};
pub use executor::{ExecuteError, RequestExecutor};
pub use keeper::spawn_token_keeper;
pub use source::{AcquireError, AcquiredCredential, CredentialSource, HttpTokenSource};
