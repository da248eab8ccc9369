//! Bubbles wallet ledger
//!
//! Balances, ledger entries, topups and promotional grants for the platform's internal currency.
//! The [`commands::DomainLogic`] entry point works over the traits in [`ports`], with concrete
//! implementations in [`adapters`].

pub mod adapters;
pub mod commands;
pub mod config;
pub mod domain;
pub mod ports;
