//! Tracing setup shared by the server and embedding clients

use std::sync::Once;

use tracing_subscriber::filter::{Directive, ParseError};
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

/// Directives applied unless `RUST_LOG` overrides them
pub const DEFAULT_DIRECTIVES: &[&str] = &[
    "party_core=info",
    "party_server=info",
    "hyper_util=off",
    "hyper=off",
    "reqwest=off",
    "tungstenite=warn",
];

/// Build a filter from `RUST_LOG` plus the given directives
pub fn env_filter(directives: &[&str]) -> Result<EnvFilter, ParseError> {
    directives
        .iter()
        .try_fold(EnvFilter::from_default_env(), |filter, directive| {
            Ok(filter.add_directive(directive.parse::<Directive>()?))
        })
}

/// Install the global fmt subscriber; later calls are no-ops
pub fn init_tracing(directives: &[&str]) -> Result<(), ParseError> {
    let filter = env_filter(directives)?;
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .try_init();
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_parse() {
        assert!(env_filter(DEFAULT_DIRECTIVES).is_ok());
        assert!(env_filter(&["party_core=loud"]).is_err());
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(DEFAULT_DIRECTIVES).unwrap();
        init_tracing(&["party_core=debug"]).unwrap();
    }
}
