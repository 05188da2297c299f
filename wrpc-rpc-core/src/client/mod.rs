mod client;
mod factory;
mod proxy;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{create_client, Client};
pub use factory::{ConnectionFactory, RpcConnection};
pub use proxy::CallProxy;
