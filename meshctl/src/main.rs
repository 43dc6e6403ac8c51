//! Command-line client for the coordinator admin surface
//!
//! ```text
//! meshctl [--addr HOST:PORT] [--instance ID] <COMMAND>
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use meshcoord_shared::codec::{self, FrameDecoder};
use meshcoord_shared::defaults::ADMIN_LISTEN;
use meshcoord_shared::{
    AdminEnvelope, AdminReply, AdminRequest, AdminResponse, BindTarget, CommandRequest,
    JoinFilter,
};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const DEFAULT_INSTANCE: &str = "coordinator";

/// meshctl -- talk to a running mesh coordinator
#[derive(Debug, Parser)]
#[command(
    name = "meshctl",
    version,
    about = "Inspect and control a mesh coordinator over its admin port",
    subcommand_required = true,
    arg_required_else_help = true
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalOpts {
    /// Admin listener of the coordinator process
    #[arg(long, default_value = ADMIN_LISTEN, global = true)]
    addr: String,

    /// Coordinator instance to address
    #[arg(long = "instance", default_value = DEFAULT_INSTANCE, global = true)]
    instance_id: String,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List known devices
    Devices,

    /// Print the network topology as a DOT graph
    Graph,

    /// Show the coordinator lifecycle status
    Status,

    /// Seconds left in the current join window
    JoinTime,

    /// Give devices friendly names
    Rename {
        /// ADDRESS=NAME pairs
        #[arg(required = true, value_parser = parse_name)]
        names: Vec<(String, String)>,
    },

    /// Forget a device and ask it to leave
    Remove { address: String },

    /// Open the network for joining
    Join {
        seconds: u32,

        /// Which routers accept joins: all or coord
        #[arg(default_value = "all")]
        filter: JoinFilter,
    },

    /// Bind a device cluster to another endpoint or a group
    Bind(BindArgs),

    /// Remove a binding
    Unbind(BindArgs),

    /// Send a cluster command to a device endpoint
    Send(SendArgs),
}

#[derive(Debug, Args)]
#[command(group(
    clap::ArgGroup::new("target")
        .required(true)
        .args(["group", "dest"])
))]
struct BindArgs {
    source: String,
    endpoint: u8,
    cluster: String,

    /// Bind to a group id
    #[arg(long)]
    group: Option<u16>,

    /// Bind to this device address
    #[arg(long, requires = "dest_endpoint")]
    dest: Option<String>,

    #[arg(long, requires = "dest")]
    dest_endpoint: Option<u8>,
}

#[derive(Debug, Args)]
struct SendArgs {
    target: String,
    endpoint: u8,
    cluster: String,
    command: String,

    /// JSON object with the command fields
    #[arg(value_parser = parse_payload)]
    payload: Option<Map<String, Value>>,

    /// Send as a functional command
    #[arg(long)]
    functional: bool,

    /// Response wait in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Tell the device not to answer
    #[arg(long)]
    suppress_default_response: bool,

    /// Free the radio after the pacing gap instead of waiting for the answer
    #[arg(long)]
    non_blocking: bool,
}

fn parse_name(text: &str) -> Result<(String, String), String> {
    match text.split_once('=') {
        Some((address, name)) if !address.is_empty() => Ok((address.into(), name.into())),
        _ => Err(format!("expected ADDRESS=NAME, got '{}'", text)),
    }
}

fn parse_payload(text: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("payload must be a JSON object".into()),
        Err(e) => Err(format!("invalid payload: {}", e)),
    }
}

impl BindArgs {
    fn target(&self) -> Option<BindTarget> {
        match (self.group, &self.dest, self.dest_endpoint) {
            (Some(group), _, _) => Some(BindTarget::Group(group)),
            (None, Some(address), Some(endpoint)) => Some(BindTarget::Endpoint {
                address: address.clone(),
                endpoint,
            }),
            _ => None,
        }
    }
}

impl Command {
    fn into_request(self) -> Result<AdminRequest> {
        let request = match self {
            Command::Devices => AdminRequest::ListDevices,
            Command::Graph => AdminRequest::TopologyGraph,
            Command::Status => AdminRequest::Status,
            Command::JoinTime => AdminRequest::JoinTimeLeft,
            Command::Rename { names } => AdminRequest::RenameDevices {
                names: names.into_iter().collect(),
            },
            Command::Remove { address } => AdminRequest::RemoveDevice { address },
            Command::Join { seconds, filter } => AdminRequest::PermitJoin { seconds, filter },
            Command::Bind(args) => {
                let target = args.target().context("missing bind target")?;
                AdminRequest::Bind {
                    source: args.source,
                    source_endpoint: args.endpoint,
                    target,
                    cluster: args.cluster,
                }
            }
            Command::Unbind(args) => {
                let target = args.target().context("missing bind target")?;
                AdminRequest::Unbind {
                    source: args.source,
                    source_endpoint: args.endpoint,
                    target,
                    cluster: args.cluster,
                }
            }
            Command::Send(args) => AdminRequest::SendCommand(CommandRequest {
                target: args.target,
                endpoint: args.endpoint,
                kind: args.functional.then(|| "functional".to_string()),
                cluster: args.cluster,
                command: args.command,
                payload: args.payload.unwrap_or_default(),
                suppress_default_response: args.suppress_default_response,
                timeout_ms: args.timeout_ms,
                blocks_queue: !args.non_blocking,
            }),
        };
        Ok(request)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let envelope = AdminEnvelope {
        instance_id: cli.global.instance_id,
        request_id: 1,
        request: cli.command.into_request()?,
    };

    let reply = send(&cli.global.addr, &envelope).await?;
    match reply.response {
        AdminResponse::Graph(dot) => println!("{}", dot),
        AdminResponse::Error { message } => bail!("{}", message),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

async fn send(addr: &str, envelope: &AdminEnvelope) -> Result<AdminReply> {
    let mut socket = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;
    socket.write_all(&codec::encode(envelope)?).await?;

    let mut decoder = FrameDecoder::<AdminReply>::new();
    let mut buf = vec![0u8; 4096];
    loop {
        if let Some(reply) = decoder.decode_next()? {
            return Ok(reply);
        }
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            bail!("connection closed before a reply arrived");
        }
        decoder.extend(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Result<(GlobalOpts, AdminRequest)> {
        let cli = Cli::try_parse_from(std::iter::once("meshctl").chain(args.iter().copied()))?;
        Ok((cli.global, cli.command.into_request()?))
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let (global, request) = parse(&["devices"]).expect("parse");
        assert_eq!(global.addr, ADMIN_LISTEN);
        assert_eq!(global.instance_id, DEFAULT_INSTANCE);
        assert_eq!(request, AdminRequest::ListDevices);
    }

    #[test]
    fn test_join_with_filter() {
        let (global, request) = parse(&["join", "60", "coord", "--instance", "kitchen"]).expect("parse");
        assert_eq!(global.instance_id, "kitchen");
        assert_eq!(
            request,
            AdminRequest::PermitJoin {
                seconds: 60,
                filter: JoinFilter::Coord
            }
        );

        let (_, request) = parse(&["join", "30"]).expect("parse");
        assert_eq!(
            request,
            AdminRequest::PermitJoin {
                seconds: 30,
                filter: JoinFilter::All
            }
        );
    }

    #[test]
    fn test_rename_pairs() {
        let (_, request) = parse(&["rename", "0x01=hall", "0x02=porch light"]).expect("parse");
        match request {
            AdminRequest::RenameDevices { names } => {
                assert_eq!(names["0x01"], "hall");
                assert_eq!(names["0x02"], "porch light");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_bind_targets() {
        let (_, group) = parse(&["bind", "0x01", "1", "genOnOff", "--group", "5"]).expect("parse");
        assert!(matches!(
            group,
            AdminRequest::Bind {
                target: BindTarget::Group(5),
                ..
            }
        ));

        let (_, endpoint) = parse(&[
            "unbind",
            "0x01",
            "1",
            "genOnOff",
            "--dest",
            "0x02",
            "--dest-endpoint",
            "3",
        ])
        .expect("parse");
        assert!(matches!(
            endpoint,
            AdminRequest::Unbind {
                target: BindTarget::Endpoint { endpoint: 3, .. },
                ..
            }
        ));
    }

    #[test]
    fn test_send_with_options() {
        let (_, request) = parse(&[
            "send",
            "0x01",
            "1",
            "genLevelCtrl",
            "moveToLevel",
            r#"{"level":128}"#,
            "--functional",
            "--timeout-ms",
            "2500",
            "--non-blocking",
        ])
        .expect("parse");
        match request {
            AdminRequest::SendCommand(command) => {
                assert_eq!(command.kind.as_deref(), Some("functional"));
                assert_eq!(command.payload["level"], 128);
                assert_eq!(command.timeout_ms, Some(2500));
                assert!(!command.blocks_queue);
                assert!(!command.suppress_default_response);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_arguments() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["rename", "0x01"]).is_err());
        assert!(parse(&["join", "soon"]).is_err());
        assert!(parse(&["join", "10", "everyone"]).is_err());
        assert!(parse(&["bind", "0x01", "1", "genOnOff"]).is_err());
        assert!(parse(&["bind", "0x01", "1", "genOnOff", "--dest", "0x02"]).is_err());
        assert!(parse(&["send", "0x01", "1", "genOnOff", "toggle", "[1]"]).is_err());
    }
}
