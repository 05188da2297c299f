mod load_balance;
mod provider;

#[cfg(feature = "server")]
mod registry;

pub use load_balance::{new_load_balance, LoadBalance, RandomLoad, RoundRobinLoad};
pub use provider::{AutoProvider, FixedProvider, PoolInvalidator, Provider};

#[cfg(feature = "server")]
pub use registry::{Registrar, RegistrarState};
