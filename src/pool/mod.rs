pub mod ratelimit;
pub mod selector;
pub mod store;
pub mod types;
