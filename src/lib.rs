pub mod annotation;
pub mod auth_results;
pub mod authentication;
pub mod config;
pub mod domain_utils;
pub mod error;
pub mod ignore_list;
pub mod milter;
pub mod pipeline;
pub mod relay;
pub mod store;
pub mod transaction;

pub use annotation::{AuthMethod, TransactionAnnotation};
pub use config::Config;
pub use domain_utils::DomainUtils;
pub use error::{KnownSendersError, StoreError};
pub use ignore_list::{IgnoreList, IgnoreListHandle};
pub use milter::Milter;
pub use pipeline::KnownSenders;
pub use store::{MemoryStore, RedisStore, ReputationClient, ReputationStore};
pub use transaction::{Session, StageOutcome, StageReport, Transaction};
