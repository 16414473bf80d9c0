pub mod color;
pub mod error;
pub mod filter;
pub mod models;
pub mod settings;
