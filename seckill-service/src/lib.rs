pub mod api;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod id_worker;
pub mod lock;
pub mod models;
pub mod queue;
pub mod recovery;
pub mod repository;
pub mod schema;
pub mod stock;
