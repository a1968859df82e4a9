use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use keyring_bridge::config::{BACKEND_ENV, KEYSTORE_ENV};
use keyring_bridge::{Config, Keyring, KeyringError};
use rpassword::read_password;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

/// Store, read and delete passwords in the platform's secret store
#[derive(Parser, Debug)]
#[command(name = "keyring-bridge")]
#[command(version)]
struct Cli {
    /// Backend to bind instead of probing (see `backends`)
    #[arg(long, global = true, env = BACKEND_ENV)]
    backend: Option<String>,

    /// Key store file for backends that keep one
    #[arg(long, global = true, env = KEYSTORE_ENV)]
    keystore: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered backends in probe order
    Backends,
    /// Print the password for SERVICE and ACCOUNT
    Get { service: String, account: String },
    /// Store a password read from stdin
    Set {
        service: String,
        account: String,
        /// Prompt without echoing the input
        #[arg(short, long)]
        noecho: bool,
    },
    /// Delete the password for SERVICE and ACCOUNT
    Delete { service: String, account: String },
    /// Print shell completions
    Completions { shell: Shell },
}

impl Cli {
    fn config(&self) -> Config {
        Config {
            backend: self.backend.clone(),
            key_store_path: self.keystore.clone(),
        }
    }
}

fn read_secret(noecho: bool, service: &str, account: &str) -> io::Result<Zeroizing<String>> {
    if noecho {
        eprint!("{account}@{service} (noecho):");
        return read_password().map(Zeroizing::new);
    }

    eprint!("{account}@{service}: ");
    let mut buf = Zeroizing::new(String::new());
    io::stdin().lock().read_line(&mut buf)?;
    let trimmed = buf.trim_end_matches(['\n', '\r']).len();
    buf.truncate(trimmed);
    Ok(buf)
}

fn list_backends() {
    let bound = keyring_bridge::create().ok().map(|b| b.id());
    for id in keyring_bridge::registered_backends() {
        let marker = if Some(id) == bound { '*' } else { ' ' };
        println!("{marker} {id}");
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let config = cli.config();
    match cli.command {
        Commands::Backends => {
            list_backends();
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "keyring-bridge", &mut io::stdout());
            Ok(())
        }
        Commands::Get { service, account } => {
            let keyring = Keyring::from_config(&config).map_err(describe)?;
            let password = keyring
                .get_password(&service, &account)
                .map_err(describe)?;
            println!("{}", password.expose());
            Ok(())
        }
        Commands::Set {
            service,
            account,
            noecho,
        } => {
            let keyring = Keyring::from_config(&config).map_err(describe)?;
            let password = read_secret(noecho, &service, &account)
                .map_err(|e| format!("Failed to read password: {e}"))?;
            keyring
                .set_password(&service, &account, &password)
                .map_err(describe)
        }
        Commands::Delete { service, account } => {
            let keyring = Keyring::from_config(&config).map_err(describe)?;
            keyring
                .delete_password(&service, &account)
                .map_err(describe)
        }
    }
}

fn describe(e: KeyringError) -> String {
    match e {
        KeyringError::UnregisteredBackend(name) => {
            let known: Vec<_> = keyring_bridge::registered_backends()
                .iter()
                .map(|id| id.as_str())
                .collect();
            format!("Unregistered keyring backend: '{name}' (known: {})", known.join(", "))
        }
        other => other.to_string(),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
