mod expiry;
mod key;
mod persistence;

pub use expiry::init_expiry_worker;
pub use key::IdempotencyKey;
pub use persistence::forget;
pub use persistence::save_outcome;
pub use persistence::try_begin;
pub use persistence::IdempotencyError;
pub use persistence::NextAction;
