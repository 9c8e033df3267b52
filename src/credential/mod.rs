pub mod oauth;
pub mod project;
pub mod token;
