//! Backend connection pooling and external package sessions.

mod pool;
mod registry;

pub use pool::ConnectionPool;
pub use registry::{PackageSession, PackageSessionRegistry};

#[cfg(test)]
mod tests;
