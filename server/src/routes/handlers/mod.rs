pub mod auth;
pub mod batch;
pub mod email;
