pub mod common;
pub mod session;
