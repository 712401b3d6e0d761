//! Falcon CA - setup and diagnostics for the Falcon root certificate.
//!
//! Generates and removes the root CA, issues leaf certificates by hand,
//! clears the leaf cache, and reports whether the root is trusted.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use falcon_ca::{CertError, CertManager, CertManagerConfig};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Falcon CA - root certificate management for the Falcon proxy
#[derive(Parser, Debug)]
#[command(name = "falcon-ca", version, about)]
struct Args {
    /// Certificate root directory (defaults to ~/.falcon)
    #[arg(long, env = "FALCON_CA_DIR", global = true)]
    root_dir: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Generate the root CA
    Generate {
        /// Common name of the root certificate
        #[arg(long)]
        common_name: String,

        /// Replace an existing root CA (clears all leaf certificates)
        #[arg(long)]
        overwrite: bool,
    },
    /// Issue (or fetch the cached) certificate for a hostname
    Issue {
        /// Hostname to issue for
        hostname: String,
    },
    /// Delete all cached leaf certificates
    Clear,
    /// Delete the root CA and all leaf certificates
    RemoveRoot,
    /// Print the root CA certificate (PEM)
    Pem,
    /// Show root CA status
    Status {
        /// Also run the trust check
        #[arg(long)]
        check_trust: bool,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check whether the operating system trusts the root CA
    Trust,
}

/// Output of the `status` command.
#[derive(Debug, Serialize)]
struct Status {
    root_dir: PathBuf,
    root_ca_present: bool,
    root_ca_path: Option<PathBuf>,
    trusted: Option<bool>,
}

/// Initialize console logging.
fn init_logging(args: &Args) {
    let log_level = if args.debug {
        "debug"
    } else {
        args.log_level.as_str()
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("falcon_ca={},warn", log_level)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Builds the manager configuration from the config file and CLI flags.
fn load_config(args: &Args) -> anyhow::Result<CertManagerConfig> {
    let mut config = match &args.config {
        Some(path) => CertManagerConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CertManagerConfig::default(),
    };
    if let Some(root_dir) = &args.root_dir {
        config.root_dir = Some(root_dir.clone());
    }
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let manager = CertManager::new(load_config(&args)?);
    tracing::debug!("Using certificate directory {:?}", manager.root_dir());

    match args.command {
        Command::Generate {
            common_name,
            overwrite,
        } => {
            let (key_path, cert_path) = manager.generate_root_ca(&common_name, overwrite).await?;
            println!("Root CA key:         {}", key_path.display());
            println!("Root CA certificate: {}", cert_path.display());
            println!("Please trust {} to enable HTTPS interception.", cert_path.display());
        }
        Command::Issue { hostname } => {
            let leaf = manager.get_certificate(&hostname).await?;
            println!("Key:         {}", leaf.key_path.display());
            println!("Certificate: {}", leaf.cert_path.display());
        }
        Command::Clear => {
            manager.clear_certs().await?;
            println!("Leaf certificates cleared.");
        }
        Command::RemoveRoot => {
            manager.remove_root_ca().await?;
            println!("Root CA removed.");
        }
        Command::Pem => {
            print!("{}", manager.root_ca_pem().await?);
        }
        Command::Status { check_trust, json } => {
            let trusted = if check_trust && manager.is_root_ca_present() {
                Some(manager.is_root_ca_trusted().await?)
            } else {
                None
            };
            let status = Status {
                root_dir: manager.root_dir().to_path_buf(),
                root_ca_present: manager.is_root_ca_present(),
                root_ca_path: manager.root_ca_path(),
                trusted,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Command::Trust => match manager.is_root_ca_trusted().await {
            Ok(true) => println!("Root CA is trusted."),
            Ok(false) => {
                println!("Root CA is NOT trusted.");
                return Ok(ExitCode::FAILURE);
            }
            Err(CertError::RootCaNotExist) => {
                println!("No root CA found; run `falcon-ca generate` first.");
                return Ok(ExitCode::FAILURE);
            }
            Err(e) => return Err(e.into()),
        },
    }

    Ok(ExitCode::SUCCESS)
}

fn print_status(status: &Status) {
    println!("Root directory: {}", status.root_dir.display());
    match &status.root_ca_path {
        Some(path) => println!("Root CA:        {}", path.display()),
        None => println!("Root CA:        (not generated)"),
    }
    if let Some(trusted) = status.trusted {
        println!("Trusted:        {}", if trusted { "yes" } else { "no" });
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn parse_generate() {
        let args = Args::try_parse_from([
            "falcon-ca",
            "generate",
            "--common-name",
            "Falcon Root",
            "--overwrite",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Command::Generate {
                common_name: "Falcon Root".into(),
                overwrite: true,
            }
        );
    }

    #[test]
    fn generate_requires_common_name() {
        assert!(Args::try_parse_from(["falcon-ca", "generate"]).is_err());
    }

    #[test]
    fn global_root_dir_after_subcommand() {
        let args =
            Args::try_parse_from(["falcon-ca", "issue", "example.com", "--root-dir", "/srv/ca"])
                .unwrap();
        assert_eq!(args.root_dir, Some(PathBuf::from("/srv/ca")));
        assert_eq!(
            args.command,
            Command::Issue {
                hostname: "example.com".into()
            }
        );
    }

    #[test]
    fn root_dir_flag_overrides_config_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config_path = temp_dir.path().join("falcon.json");
        std::fs::write(&config_path, r#"{"root_dir": "/from/file", "probe_timeout_ms": 250}"#)
            .unwrap();

        let args = Args::try_parse_from([
            "falcon-ca",
            "--config",
            config_path.to_str().unwrap(),
            "--root-dir",
            "/from/flag",
            "status",
        ])
        .unwrap();
        let config = load_config(&args).unwrap();

        assert_eq!(config.root_dir, Some(PathBuf::from("/from/flag")));
        assert_eq!(config.probe_timeout_ms, 250);
    }

    #[test]
    fn status_serializes() {
        let status = Status {
            root_dir: PathBuf::from("/srv/ca"),
            root_ca_present: false,
            root_ca_path: None,
            trusted: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["root_ca_present"], false);
        assert!(json["root_ca_path"].is_null());
    }
}
