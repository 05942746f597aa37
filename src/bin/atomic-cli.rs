//! Command-line access to a primitive: `<primitive> get|set|compareAndSet`.
//!
//! Prints one line per invocation. A compare-and-set that does not match prints
//! `false` and still exits 0; only failures to get an answer exit non-zero.

use std::process::ExitCode;
use std::time::Duration;

use atomic_raft::client::{AtomicValueClient, ClientConfig};
use atomic_raft::telemetry::{init_logging, LogFormat};
use atomic_raft::types::NodeId;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "atomic-cli", version)]
struct Args {
    /// A cluster node in the form ID=URL. Repeat for each node.
    #[arg(long = "node", env = "ATOMIC_NODES", value_delimiter = ',', required = true)]
    nodes: Vec<String>,

    /// Give up after retrying for this long.
    #[arg(long, env = "ATOMIC_TIMEOUT_MS", default_value_t = 5000)]
    timeout_ms: u64,

    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    /// Name of the atomic value.
    primitive: String,

    #[command(subcommand)]
    op: Op,
}

#[derive(Subcommand)]
enum Op {
    /// Print the current value, or `null` when unset.
    Get,
    /// Set the value and print the previous one.
    Set { value: String },
    /// Swap in `update` if the value equals `expected`; prints `true` or `false`.
    #[command(name = "compareAndSet")]
    CompareAndSet {
        /// `<expected> <update>`, or only `<update>` together with --unset.
        #[arg(num_args = 1..=2, required = true)]
        values: Vec<String>,
        /// Expect the value to be unset.
        #[arg(long)]
        unset: bool,
    },
}

/// Split compareAndSet arguments into the expected value and the update.
fn cas_arguments(mut values: Vec<String>, unset: bool) -> Result<(Option<String>, String), String> {
    match (values.len(), unset) {
        (1, true) => Ok((None, values.remove(0))),
        (2, false) => {
            let update = values.remove(1);
            Ok((Some(values.remove(0)), update))
        }
        (_, true) => Err("with --unset, compareAndSet takes only <update>".to_string()),
        (_, false) => Err("compareAndSet takes <expected> <update>".to_string()),
    }
}

fn parse_nodes(raw: &[String]) -> Result<Vec<(NodeId, String)>, String> {
    raw.iter()
        .map(|entry| {
            let (id, url) = entry
                .split_once('=')
                .ok_or_else(|| format!("--node must be ID=URL, got: {entry}"))?;
            let id: u64 = id
                .parse()
                .map_err(|_| format!("invalid node id: {id}"))?;
            Ok((NodeId::from(id), url.to_string()))
        })
        .collect()
}

fn render(value: Option<Vec<u8>>) -> String {
    value.map_or_else(
        || "null".to_string(),
        |v| String::from_utf8_lossy(&v).into_owned(),
    )
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    // Logging is diagnostics only; a second subscriber is not an error worth failing on.
    let _ = init_logging(args.log_format);

    let nodes = match parse_nodes(&args.nodes) {
        Ok(nodes) => nodes,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };
    let config = ClientConfig {
        retry_window: Duration::from_millis(args.timeout_ms),
        ..ClientConfig::default()
    };
    let mut client = match AtomicValueClient::new(nodes, config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    let outcome = match args.op {
        Op::Get => client.get(&args.primitive).await.map(render),
        Op::Set { value } => client.set(&args.primitive, value).await.map(render),
        Op::CompareAndSet { values, unset } => {
            let (expected, update) = match cas_arguments(values, unset) {
                Ok(parsed) => parsed,
                Err(e) => {
                    eprintln!("error: {e}");
                    return ExitCode::from(2);
                }
            };
            client
                .compare_and_set(&args.primitive, expected.as_deref().map(str::as_bytes), update)
                .await
                .map(|swapped| swapped.to_string())
        }
    };

    match outcome {
        Ok(line) => {
            println!("{line}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_list() {
        let nodes = parse_nodes(&["1=http://127.0.0.1:8001".to_string()]).unwrap();
        assert_eq!(nodes, vec![(NodeId::from(1), "http://127.0.0.1:8001".to_string())]);
        assert!(parse_nodes(&["http://x".to_string()]).is_err());
    }

    #[test]
    fn parses_compare_and_set_arguments() {
        let args = Args::try_parse_from([
            "atomic-cli", "--node", "1=http://a", "counter", "compareAndSet", "v0", "v1",
        ])
        .unwrap();
        let Op::CompareAndSet { values, unset } = args.op else {
            panic!("wrong subcommand");
        };
        assert_eq!(
            cas_arguments(values, unset).unwrap(),
            (Some("v0".to_string()), "v1".to_string())
        );

        let args = Args::try_parse_from([
            "atomic-cli", "--node", "1=http://a", "counter", "compareAndSet", "--unset", "v1",
        ])
        .unwrap();
        let Op::CompareAndSet { values, unset } = args.op else {
            panic!("wrong subcommand");
        };
        assert_eq!(cas_arguments(values, unset).unwrap(), (None, "v1".to_string()));
    }

    #[test]
    fn compare_and_set_argument_count_must_match_mode() {
        assert!(cas_arguments(vec!["v1".to_string()], false).is_err());
        assert!(cas_arguments(vec!["a".to_string(), "b".to_string()], true).is_err());
    }

    #[test]
    fn unset_values_render_as_null() {
        assert_eq!(render(None), "null");
        assert_eq!(render(Some(b"v0".to_vec())), "v0");
    }
}
