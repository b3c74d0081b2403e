pub mod brain;
pub mod cobrowse;
pub mod config;
pub mod confirm;
pub mod dom;
pub mod error;
pub mod hands;
pub mod logging;
pub mod output;
pub mod policy;
pub mod rules;
pub mod session;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
