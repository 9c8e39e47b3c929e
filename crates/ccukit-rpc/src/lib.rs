// ccukit-rpc: XML-RPC and BIN-RPC transports for the Homematic CCU bus

pub mod bin;
pub mod client;
pub mod error;
pub mod server;
pub mod value;
pub mod xml;

pub use client::{Protocol, RpcClient, XmlOptions};
pub use error::Error;
pub use server::{Fault, InboundCall, RpcServer, ServerConfig};
pub use value::Value;
