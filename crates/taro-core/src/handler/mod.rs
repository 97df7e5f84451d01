// Request dispatch fronting the coordinator services

pub mod rpc;

pub use rpc::RequestHandler;
