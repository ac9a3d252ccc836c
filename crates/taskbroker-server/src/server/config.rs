use crate::{broker::tracker::ReplyOrder, server::telemetry::LogFormat};
use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use taskbroker_core::{TaskRegistry, endpoint::Endpoint, transport::DEFAULT_MAX_FRAME_BYTES};

/// Runtime configuration for the `taskbroker-server` binary.
///
/// Every value can be given as a CLI flag or an environment variable (a
/// `.env` file in the working directory is loaded first). Endpoints use the
/// `tcp://host:port`, `ipc://path` or `inproc://name` syntax; TCP endpoints
/// are bound on all interfaces.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "taskbroker-server",
    version,
    about = "A broker that load-balances client requests across per-task-type worker pools"
)]
pub struct CliArgs {
    /// Endpoint clients connect to and send requests on.
    ///
    /// Environment variable: `FRONTEND_ENDPOINT`
    #[arg(long, env = "FRONTEND_ENDPOINT", default_value = "tcp://localhost:15201")]
    pub frontend_endpoint: String,

    /// Endpoint workers connect to in order to receive work units.
    ///
    /// Environment variable: `BACKEND_ENDPOINT`
    #[arg(long, env = "BACKEND_ENDPOINT", default_value = "tcp://localhost:15202")]
    pub backend_endpoint: String,

    /// Endpoint workers announce their task type on.
    ///
    /// Environment variable: `REGISTRATION_ENDPOINT`
    #[arg(long, env = "REGISTRATION_ENDPOINT", default_value = "tcp://localhost:15203")]
    pub registration_endpoint: String,

    /// Endpoint workers send completed units to.
    ///
    /// Environment variable: `ACK_ENDPOINT`
    #[arg(long, env = "ACK_ENDPOINT", default_value = "tcp://localhost:15204")]
    pub ack_endpoint: String,

    /// Task types the broker accepts, comma separated.
    ///
    /// Requests and registrations for any other task type are rejected.
    ///
    /// Environment variable: `TASK_TYPES`
    #[arg(long, env = "TASK_TYPES", value_delimiter = ',', required = true)]
    pub task_types: Vec<String>,

    /// Capacity of each inbound channel between the socket readers and the
    /// broker. Readers wait when it is full.
    ///
    /// Environment variable: `CHANNEL_CAPACITY`
    #[arg(long, env = "CHANNEL_CAPACITY", default_value_t = 1024)]
    pub channel_capacity: usize,

    /// Largest accepted frame in bytes.
    ///
    /// Environment variable: `MAX_FRAME_BYTES`
    #[arg(long, env = "MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Order of the responses in a batch reply.
    ///
    /// `ack-arrival` returns responses as workers finish them; `fragment`
    /// returns them in request order.
    ///
    /// Environment variable: `REPLY_ORDER`
    #[arg(long, env = "REPLY_ORDER", value_enum, default_value_t = ReplyOrder::AckArrival)]
    pub reply_order: ReplyOrder,

    /// Seconds to wait for routers to flush on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    pub shutdown_timeout_secs: u64,

    /// Console log layout.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub frontend_endpoint: Endpoint,
    pub backend_endpoint: Endpoint,
    pub registration_endpoint: Endpoint,
    pub ack_endpoint: Endpoint,
    pub task_types: TaskRegistry,
    pub channel_capacity: usize,
    pub max_frame_bytes: usize,
    pub reply_order: ReplyOrder,
    pub shutdown_timeout: Duration,
    pub log_format: LogFormat,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let endpoint = |name: &str, raw: &str| -> anyhow::Result<Endpoint> {
            raw.parse().with_context(|| format!("invalid {name}"))
        };
        let frontend_endpoint = endpoint("FRONTEND_ENDPOINT", &args.frontend_endpoint)?;
        let backend_endpoint = endpoint("BACKEND_ENDPOINT", &args.backend_endpoint)?;
        let registration_endpoint =
            endpoint("REGISTRATION_ENDPOINT", &args.registration_endpoint)?;
        let ack_endpoint = endpoint("ACK_ENDPOINT", &args.ack_endpoint)?;

        // TCP endpoints bind every interface, so only the port has to differ.
        let bound = [
            frontend_endpoint.binding(),
            backend_endpoint.binding(),
            registration_endpoint.binding(),
            ack_endpoint.binding(),
        ];
        for (i, a) in bound.iter().enumerate() {
            if bound[i + 1..].contains(a) {
                bail!("endpoint {a} is configured for more than one channel");
            }
        }

        let mut task_types = TaskRegistry::new();
        for name in &args.task_types {
            let name = name.trim();
            if name.is_empty() {
                bail!("TASK_TYPES must not contain empty names");
            }
            task_types.register(name)?;
        }
        if task_types.is_empty() {
            bail!("TASK_TYPES must name at least one task type");
        }

        if args.channel_capacity == 0 {
            bail!("CHANNEL_CAPACITY must be greater than 0");
        }

        if args.max_frame_bytes == 0 {
            bail!("MAX_FRAME_BYTES must be greater than 0");
        }

        Ok(Self {
            frontend_endpoint,
            backend_endpoint,
            registration_endpoint,
            ack_endpoint,
            task_types,
            channel_capacity: args.channel_capacity,
            max_frame_bytes: args.max_frame_bytes,
            reply_order: args.reply_order,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            log_format: args.log_format,
        })
    }
}
