//! Concrete [`Gateway`](artisan_types::gateway::Gateway): SQLite tables from
//! `artisan-db` plus an in-process realtime broker.

pub mod backend;
pub mod convert;
pub mod dispatcher;

pub use backend::Backend;
pub use dispatcher::Dispatcher;
