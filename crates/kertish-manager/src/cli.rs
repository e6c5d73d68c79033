use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::ManagerConfig;

#[derive(Parser, Debug)]
#[command(name = "kertish-manager")]
#[command(about = "Kertish DFS manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Runs the manager HTTP service and its background loops.
    Serve(ServeArgs),
    /// Prints the effective configuration as TOML.
    PrintConfig(ServeArgs),
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// TOML or JSON configuration file. Defaults apply when absent.
    #[arg(short, long, env = "KERTISH_MANAGER_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(short, long, env = "KERTISH_MANAGER_BIND")]
    pub bind: Option<SocketAddr>,

    #[arg(long, env = "KERTISH_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

impl ServeArgs {
    /// Loads the config file, then applies command line overrides.
    pub fn load(&self) -> Result<ManagerConfig> {
        let mut config = match &self.config {
            Some(path) if path.exists() => ManagerConfig::from_file(path)?,
            Some(path) => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                ManagerConfig::default()
            }
            None => ManagerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(token) = &self.admin_token {
            config.admin_token = Some(token.clone());
        }
        config.log_json |= self.log_json;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn serve_flags() {
        let cli = Cli::parse_from([
            "kertish-manager",
            "serve",
            "--bind",
            "127.0.0.1:9500",
            "--admin-token",
            "s3cret",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.load().unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9500".parse().unwrap());
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn file_then_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "bind_addr = \"0.0.0.0:9401\"\nadmin_token = \"from-file\"\n[balance]\nthreshold = 0.1"
        )
        .unwrap();
        let args = ServeArgs {
            config: Some(file.path().to_path_buf()),
            admin_token: Some("from-flag".into()),
            ..Default::default()
        };
        let config = args.load().unwrap();
        assert_eq!(config.bind_addr.port(), 9401);
        assert_eq!(config.admin_token.as_deref(), Some("from-flag"));
        assert_eq!(config.balance.threshold, 0.1);
        assert_eq!(config.balance.concurrency, 10);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let args = ServeArgs {
            config: Some(PathBuf::from("/nonexistent/manager.toml")),
            ..Default::default()
        };
        assert_eq!(args.load().unwrap().bind_addr.port(), 9400);
    }
}
