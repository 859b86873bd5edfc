//! User accounts in a single key-value table, with email kept unique through
//! paired index records and transactional writes.

pub mod app;
pub mod config;
pub mod error;
pub mod state;
pub mod storage;
pub mod users;

pub use error::StoreError;
pub use users::{User, UserStore};
