// Coordinator services: locking, wait/notify, transactions, roots, membership

pub mod lock_manager;
pub mod lock_table;
pub mod membership;
pub mod remote;
pub mod root_registry;
pub mod snapshot;
pub mod transaction;
pub mod wait_notify;

// Re-export commonly used types
pub use lock_manager::LockManager;
pub use membership::MembershipService;
pub use remote::PushRegistry;
pub use root_registry::RootRegistry;
pub use transaction::TransactionCoordinator;
pub use wait_notify::WaitNotify;
