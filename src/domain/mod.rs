mod billing_period;
mod domain_name;
mod email_address;
mod hosting_username;
// allow external `use` statements to skip `domain_name` etc
pub use billing_period::BillingPeriod;
pub use domain_name::DomainName;
pub use email_address::EmailAddress;
pub use hosting_username::HostingUsername;
