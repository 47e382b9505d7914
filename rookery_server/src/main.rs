//! Rookery node executable. Runs as a backend or as the balancer depending
//! on the `is_balancer` configuration key.

use std::fs;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::signal;
use tokio::sync::watch;

use rookery::{
    pf_error, BackendNode, BalancerNode, GenericNode, NodeConfig,
    RookeryError,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to the node's TOML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Inline TOML configuration string, applied over the file.
    #[arg(long)]
    config_str: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Reads and merges the configuration sources, then sanity-checks the
    /// resulting config.
    fn compose_config(&self) -> Result<NodeConfig, RookeryError> {
        let mut merged = String::new();
        if let Some(path) = &self.config {
            merged.push_str(&fs::read_to_string(path)?);
            merged.push('\n');
        }
        if let Some(inline) = &self.config_str {
            merged.push_str(inline);
        }
        let config_str =
            if merged.trim().is_empty() { None } else { Some(&merged[..]) };
        let config = NodeConfig::from_config_str(config_str)?;
        self.sanitize(&config)?;
        Ok(config)
    }

    fn sanitize(&self, config: &NodeConfig) -> Result<(), RookeryError> {
        if self.threads < 2 {
            return Err(RookeryError(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }
        if config.sync_port <= 1024 {
            return Err(RookeryError(format!(
                "invalid sync_port {}",
                config.sync_port
            )));
        }
        if config.is_balancer {
            if config.balancer_port <= 1024 {
                return Err(RookeryError(format!(
                    "invalid balancer_port {}",
                    config.balancer_port
                )));
            }
        } else {
            if config.service_port <= 1024 {
                return Err(RookeryError(format!(
                    "invalid service_port {}",
                    config.service_port
                )));
            }
            // the four services span service_port..service_port+300
            if config.sync_port >= config.service_port
                && config.sync_port <= config.service_port + 300
            {
                return Err(RookeryError(format!(
                    "sync_port {} collides with the service port range {}..{}",
                    config.sync_port,
                    config.service_port,
                    config.service_port + 300
                )));
            }
        }
        Ok(())
    }
}

// Node executable main entrance.
fn node_main() -> Result<(), RookeryError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let config = args.compose_config()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-{}", config.server_id))
        .build()?;

    // enter tokio runtime, set the node up, and run until a termination
    // signal arrives
    runtime.block_on(async move {
        let (tx_term, rx_term) = watch::channel(false);

        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                let _ = tx_term.send(true);
            }
        });

        if config.is_balancer {
            let mut node = BalancerNode::new_and_setup(config).await?;
            node.run(rx_term).await?;
        } else {
            let mut node = BackendNode::new_and_setup(config).await?;
            node.run(rx_term).await?;
        }

        Ok::<(), RookeryError>(())
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = node_main() {
        pf_error!("node_main exited: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod node_args_tests {
    use super::*;

    fn args_with(config_str: &str) -> CliArgs {
        CliArgs {
            config: None,
            config_str: Some(config_str.into()),
            threads: 4,
        }
    }

    #[test]
    fn compose_valid() -> Result<(), RookeryError> {
        let args = args_with(
            "server_id = 's1'\nservice_port = 5555\nsync_port = 6000",
        );
        let config = args.compose_config()?;
        assert_eq!(config.server_id, "s1");
        assert!(!config.is_balancer);
        Ok(())
    }

    #[test]
    fn reject_privileged_sync_port() {
        let args = args_with("sync_port = 80");
        assert!(args.compose_config().is_err());
    }

    #[test]
    fn reject_colliding_port_ranges() {
        let args = args_with("service_port = 5555\nsync_port = 5700");
        assert!(args.compose_config().is_err());
    }

    #[test]
    fn reject_too_few_threads() {
        let mut args = args_with("");
        args.threads = 1;
        assert!(args.compose_config().is_err());
    }

    #[test]
    fn balancer_skips_service_port_checks() -> Result<(), RookeryError> {
        let args = args_with(
            "server_id = 'balancer'\nis_balancer = true\n\
             balancer_port = 5000\nsync_port = 6000",
        );
        let config = args.compose_config()?;
        assert!(config.is_balancer);
        Ok(())
    }
}
