use std::net::AddrParseError;

/// Errors surfaced while loading and validating the router's configuration.
///
/// These are the only errors that ever abort the process: once a [`crate::config::Config`]
/// has been built successfully, the data plane absorbs every runtime failure locally
/// (see the module docs on [`crate::server`]) instead of propagating it.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("missing required config key `{0}`")]
    MissingKey(&'static str),
    #[error("config key `{key}` has invalid value `{value}`: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("downstream entry `{0}` is not in the form host:data_port:health_port")]
    MalformedDownstream(String),
    #[error("failed to resolve downstream host `{host}`: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("downstream host `{host}` resolved to no addresses")]
    NoAddress { host: String },
    #[error("invalid socket address: {0}")]
    Addr(#[from] AddrParseError),
    #[error(
        "file descriptor budget exhausted: rlimit={rlimit} downstreams={downstreams} workers={workers}"
    )]
    FdBudgetExhausted {
        rlimit: u64,
        downstreams: usize,
        workers: usize,
    },
}
