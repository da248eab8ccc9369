pub mod audit;
pub mod database;
pub mod member;
pub mod payment;
