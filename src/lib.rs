pub mod bar_utils;
pub mod commands;
pub mod config;
pub mod context;
pub mod data_context;
pub mod database;
pub mod error;
pub mod factors;
pub mod indicators;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod providers;
pub mod retry;
pub mod run_status;
pub mod scoring;
pub mod signals;
pub mod trading_rules;
