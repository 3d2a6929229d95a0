use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod mapper;
pub mod message;
pub mod performer;
pub mod processor;
pub mod pump;
pub mod subscription;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod utils;

pub use dispatcher::{Dispatcher, DispatcherState};
pub use error::{Error, Result};

/// Installs the global tracing subscriber, filtered by `ACTIVATOR_LOG`.
///
/// Pretty output in debug builds, JSON in release builds.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("ACTIVATOR_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}
