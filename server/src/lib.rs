pub mod api;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod evaluator;
pub mod loader;
pub mod materializer;
pub mod reconciler;
pub mod registry;
pub mod resolver;
pub mod state_file;
pub mod storage;
