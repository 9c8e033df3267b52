pub mod convert;
pub mod handler;
pub mod stream;
pub mod types;
