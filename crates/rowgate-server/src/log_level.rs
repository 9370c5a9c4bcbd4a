//! Runtime control of the process log filter.

use tracing::info;
use tracing_subscriber::{EnvFilter, Registry, reload};

use crate::error::{ServerError, ServerResult};

/// Handle onto the `EnvFilter` installed by the daemon.
#[derive(Clone)]
pub struct LogLevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelHandle {
    pub fn new(handle: reload::Handle<EnvFilter, Registry>) -> Self {
        Self { handle }
    }

    /// Current filter directives, e.g. `info,rowgate=debug`.
    pub fn current(&self) -> ServerResult<String> {
        self.handle
            .with_current(|filter| filter.to_string())
            .map_err(|e| ServerError::Unsupported(format!("log filter unavailable: {e}")))
    }

    /// Replace the filter. Accepts `EnvFilter` directive syntax.
    pub fn set(&self, directives: &str) -> ServerResult<()> {
        let filter = EnvFilter::try_new(directives).map_err(|e| {
            ServerError::InvalidConfiguration(format!("invalid log filter '{directives}': {e}"))
        })?;
        self.handle
            .reload(filter)
            .map_err(|e| ServerError::Unsupported(format!("log filter unavailable: {e}")))?;
        info!(filter = directives, "log level changed");
        Ok(())
    }
}

impl std::fmt::Debug for LogLevelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogLevelHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn reload_replaces_filter() {
        let (layer, handle) = reload::Layer::new(EnvFilter::new("info"));
        let _subscriber = tracing_subscriber::registry().with(layer);
        let levels = LogLevelHandle::new(handle);

        assert!(levels.current().unwrap().contains("info"));
        levels.set("warn,rowgate=trace").unwrap();
        let current = levels.current().unwrap();
        assert!(current.contains("rowgate=trace"));
        assert!(current.contains("warn"));
    }

    #[test]
    fn invalid_directives_rejected() {
        let (layer, handle) = reload::Layer::new(EnvFilter::new("info"));
        let _subscriber = tracing_subscriber::registry().with(layer);
        let levels = LogLevelHandle::new(handle);

        let err = levels.set("rowgate=loud").unwrap_err();
        assert_eq!(err.kind(), "invalid_configuration");
        assert!(levels.current().unwrap().contains("info"));
    }

    #[test]
    fn dropped_subscriber_is_unsupported() {
        let (layer, handle) = reload::Layer::new(EnvFilter::new("info"));
        drop(tracing_subscriber::registry().with(layer));
        let levels = LogLevelHandle::new(handle);
        assert_eq!(levels.current().unwrap_err().kind(), "unsupported");
    }
}
