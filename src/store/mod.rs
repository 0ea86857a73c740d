//! Persistence for the domain and task records. Every multi-row write goes
//! through a caller-owned transaction so enqueues and state transitions
//! commit together.

pub mod activity;
pub mod backups;
pub mod certificates;
pub mod checkouts;
pub mod credentials;
pub mod customers;
pub mod invoices;
pub mod servers;
pub mod subscriptions;
pub mod tasks;
pub mod websites;

pub use checkouts::CheckoutSession;
pub use checkouts::CheckoutStatus;
pub use customers::Customer;
pub use servers::ControlPanelKind;
pub use servers::Server;
pub use servers::ServerStatus;
pub use subscriptions::Subscription;
pub use subscriptions::SubscriptionStatus;
pub use tasks::ProvisioningTask;
pub use tasks::StepKind;
pub use tasks::StepRecord;
pub use tasks::StepStatus;
pub use tasks::TaskStatus;
pub use websites::Website;
pub use websites::WebsiteStatus;
