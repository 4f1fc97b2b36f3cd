//! Built-in tool implementations.

mod web;

pub use web::WebSearchTool;
