// Match core of a Discord ladder and tournament bot.

pub mod api;
pub mod bracket;
pub mod config;
pub mod db;
pub mod elo;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod progression;
pub mod queue;
pub mod tournament;
