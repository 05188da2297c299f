mod app;
mod server;

pub use app::{App, AppBuilder, RunningApp};
pub use server::{FnService, Server, ServiceHandler};
