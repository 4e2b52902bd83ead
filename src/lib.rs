pub mod app;
pub mod catalog;
pub mod config;
pub mod detail;
pub mod error;
pub mod fetcher;
pub mod grid;
pub mod history;
pub mod home;
pub mod merge;
pub mod models;
pub mod overrides;
pub mod pages;
pub mod palette;
pub mod search;
pub mod slider;
pub mod source;
