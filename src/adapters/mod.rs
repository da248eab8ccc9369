pub mod database;
pub mod member;
pub mod payment;
pub mod service_client;
