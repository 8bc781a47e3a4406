#![deny(clippy::dbg_macro)]

pub mod cache;
pub mod config;
pub mod controller;
pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod strategies;
pub mod types;

#[macro_export]
macro_rules! address {
    ($addr:expr) => {{
        use std::str::FromStr;
        $crate::types::Address::from_str($addr).expect(&format!("Invalid address {}", $addr))
    }};
}
