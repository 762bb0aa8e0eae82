use crate::server::service::HEALTH_METHOD;
use anyhow::{Context, bail};
use clap::Parser;
use core::{fmt, str::FromStr, time::Duration};
use switchyard::{DispatcherConfig, Principal, Role};

/// Runtime configuration for the `switchyard-tonic-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first when present), with defaults suitable for
/// local development.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "switchyard-tonic-server",
    version,
    about = "A gRPC server dispatching multiplexed calls through an interceptor chain"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/switchyard.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Deadline in milliseconds applied to calls that arrive without a
    /// `grpc-timeout`. `0` leaves such calls unbounded.
    ///
    /// Environment variable: `DEFAULT_TIMEOUT_MS`
    #[arg(long, env = "DEFAULT_TIMEOUT_MS", default_value_t = 0)]
    pub default_timeout_ms: u64,

    /// Calls served concurrently. Further calls are refused with
    /// `CANCELLED` until one finishes.
    ///
    /// Environment variable: `MAX_INFLIGHT_CALLS`
    #[arg(long, env = "MAX_INFLIGHT_CALLS", default_value_t = DispatcherConfig::DEFAULT_MAX_INFLIGHT_CALLS)]
    pub max_inflight_calls: usize,

    /// Seconds in-flight calls may run after a shutdown signal before they
    /// are cancelled.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,

    /// Capacity of the per-call response buffer between the dispatcher and
    /// the gRPC stream. Lower values apply backpressure sooner.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 8)]
    pub stream_buffer_size: usize,

    /// Accepted bearer tokens as comma separated `token:subject:role`
    /// triples.
    ///
    /// Environment variable: `AUTH_TOKENS`
    #[arg(long, env = "AUTH_TOKENS", value_delimiter = ',', hide_env_values = true)]
    pub auth_tokens: Vec<String>,

    /// Methods served without credentials, comma separated.
    ///
    /// Environment variable: `AUTH_BYPASS`
    #[arg(long, env = "AUTH_BYPASS", value_delimiter = ',', default_value = HEALTH_METHOD)]
    pub auth_bypass: Vec<String>,
}

/// One accepted bearer token and the caller it authenticates.
#[derive(Clone, PartialEq)]
pub struct TokenGrant {
    pub token: String,
    pub principal: Principal,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("token", &"<redacted>")
            .field("principal", &self.principal)
            .finish()
    }
}

impl FromStr for TokenGrant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, ':').map(str::trim);
        let (Some(token), Some(subject), Some(role)) = (parts.next(), parts.next(), parts.next())
        else {
            bail!("AUTH_TOKENS entries must look like `token:subject:role`");
        };
        if token.is_empty() || subject.is_empty() || role.is_empty() {
            bail!("AUTH_TOKENS entries must not have empty fields");
        }
        Ok(Self {
            token: token.to_string(),
            principal: Principal::new(subject, Role::new(role)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub dispatcher: DispatcherConfig,
    pub stream_buffer_size: usize,
    pub tokens: Vec<TokenGrant>,
    pub auth_bypass: Vec<String>,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_inflight_calls == 0 {
            bail!("MAX_INFLIGHT_CALLS must be greater than 0");
        }

        if args.shutdown_timeout == 0 {
            bail!("SHUTDOWN_TIMEOUT must be greater than 0");
        }

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        let mut dispatcher = DispatcherConfig::default()
            .with_max_inflight_calls(args.max_inflight_calls)
            .with_shutdown_timeout(Duration::from_secs(args.shutdown_timeout));
        if args.default_timeout_ms > 0 {
            dispatcher = dispatcher.with_default_timeout(Duration::from_millis(args.default_timeout_ms));
        }

        let tokens = args
            .auth_tokens
            .iter()
            .filter(|entry| !entry.trim().is_empty())
            .enumerate()
            .map(|(i, entry)| {
                entry
                    .parse::<TokenGrant>()
                    .with_context(|| format!("invalid AUTH_TOKENS entry #{}", i + 1))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let auth_bypass = args
            .auth_bypass
            .into_iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();

        Ok(Self {
            server_addr: args.server_addr,
            uds: args.uds,
            dispatcher,
            stream_buffer_size: args.stream_buffer_size,
            tokens,
            auth_bypass,
        })
    }
}
