pub mod api;
pub mod events;
pub mod gateway;
pub mod models;
