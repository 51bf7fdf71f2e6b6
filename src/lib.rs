pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod query;
pub mod remote;
pub mod service;
pub mod store;
pub mod subscriptions;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use connection::{
    ConnectionMonitor, ConnectionNotice, ConnectionState, ConnectionStatus, ErrorOutcome,
    ListenerGuard,
};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use model::{ChangeBatch, ChangeKind, Document, DocumentChange, Query, Record};
pub use query::{LiveQuery, QueryCache, QueryOptions, QueryState};
pub use remote::{RemoteError, RemoteStore};
pub use service::SyncService;
pub use store::{CacheStore, DrainReport, LocalStore, PendingOperation};
pub use subscriptions::{CollectionSnapshot, SubscriptionKey, SubscriptionManager};
pub use sync::{SubmitOutcome, SyncEvent, WriteCoordinator};
