// Request/response and server-push protocol models

pub mod model;

pub use model::*;
