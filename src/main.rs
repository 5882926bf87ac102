//! filevault - Main Entry Point
//!
//! One binary, both ends of the protocol: the `server` subcommand runs the
//! authenticated file transfer service, the per-operation subcommands act as
//! the client, and `cert generate` produces a self-signed certificate for
//! development setups.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use filevault::auth::CredentialFile;
use filevault::client::{Client, ClientConfig};
use filevault::server::{Server, ServerConfig};
use filevault::tls::{generate_self_signed_cert, save_cert_and_key, ClientTlsConfig, ServerTlsConfig};

/// Authenticated per-user file transfer over TLS
#[derive(Parser)]
#[command(name = "filevault")]
#[command(version = "0.1.0")]
#[command(about = "Authenticated per-user file transfer over TLS", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Connection and credential arguments shared by the client subcommands.
#[derive(Args)]
struct ClientOpts {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9001")]
    server: SocketAddr,

    /// Server hostname for TLS verification
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Path to CA certificate for server verification
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Skip certificate verification (INSECURE!)
    #[arg(long)]
    insecure: bool,

    /// Username to authenticate as
    #[arg(short, long)]
    username: String,

    /// Password for the username
    #[arg(short, long)]
    password: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Certificate management commands
    Cert {
        #[command(subcommand)]
        action: CertCommands,
    },

    /// Start the file transfer server
    Server {
        /// Address to bind to
        #[arg(short, long, default_value = "127.0.0.1:9001")]
        bind: SocketAddr,

        /// Path to the server certificate (PEM)
        #[arg(long)]
        cert: PathBuf,

        /// Path to the server private key (PEM)
        #[arg(long)]
        key: PathBuf,

        /// Root directory for per-user storage
        #[arg(long, default_value = "./server_storage")]
        storage: PathBuf,

        /// Path to the username:password credential file
        #[arg(long, default_value = "./id_passwd.txt")]
        auth_file: PathBuf,

        /// Maximum concurrent sessions
        #[arg(long, default_value = "100")]
        max_conns: usize,
    },

    /// Upload a file to your storage area
    Upload {
        #[command(flatten)]
        opts: ClientOpts,

        /// Local file to upload
        file: PathBuf,

        /// Remote filename (defaults to the local filename)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Download a file from your storage area
    Download {
        #[command(flatten)]
        opts: ClientOpts,

        /// Remote filename to download
        remote: String,

        /// Local path to save to (defaults to the remote filename)
        local: Option<PathBuf>,
    },

    /// Preview the start of a remote file
    View {
        #[command(flatten)]
        opts: ClientOpts,

        /// Remote filename to preview
        remote: String,
    },

    /// Delete a file from your storage area
    Delete {
        #[command(flatten)]
        opts: ClientOpts,

        /// Remote filename to delete
        remote: String,
    },

    /// List the files in your storage area
    List {
        #[command(flatten)]
        opts: ClientOpts,
    },
}

#[derive(Subcommand)]
enum CertCommands {
    /// Generate a self-signed certificate for testing
    Generate {
        /// Output directory for certificate and key
        #[arg(short, long, default_value = "./certs")]
        output: PathBuf,

        /// Common name for the certificate
        #[arg(long, default_value = "localhost")]
        cn: String,

        /// Additional DNS names (comma-separated)
        #[arg(long)]
        dns: Option<String>,

        /// Additional IP addresses (comma-separated)
        #[arg(long)]
        ip: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install the crypto provider (required by rustls)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Cert { action } => handle_cert_command(action),
        Commands::Server {
            bind,
            cert,
            key,
            storage,
            auth_file,
            max_conns,
        } => run_server(bind, cert, key, storage, auth_file, max_conns).await,
        Commands::Upload { opts, file, name } => {
            let remote_name = name.unwrap_or_else(|| {
                file.file_name()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "uploaded_file".to_string())
            });
            let mut session = open_session(&opts).await?;
            session.upload(&file, &remote_name).await?;
            session.quit().await
        }
        Commands::Download {
            opts,
            remote,
            local,
        } => {
            let local_path = local.unwrap_or_else(|| PathBuf::from(&remote));
            let mut session = open_session(&opts).await?;
            session.download(&remote, &local_path).await?;
            session.quit().await
        }
        Commands::View { opts, remote } => {
            let mut session = open_session(&opts).await?;
            let preview = session.view(&remote).await?;
            session.quit().await?;

            println!("\nFile Preview:");
            println!("{:-<50}", "");
            println!("{preview}");
            println!("{:-<50}", "");
            Ok(())
        }
        Commands::Delete { opts, remote } => {
            let mut session = open_session(&opts).await?;
            let response = session.delete(&remote).await?;
            session.quit().await?;

            println!("{response}");
            Ok(())
        }
        Commands::List { opts } => {
            let mut session = open_session(&opts).await?;
            let files = session.list().await?;
            session.quit().await?;

            if files.is_empty() {
                println!("No files found");
            } else {
                println!("\nFiles in your directory:");
                println!("{:-<50}", "");
                for file in files {
                    println!("{file}");
                }
                println!("{:-<50}", "");
            }
            Ok(())
        }
    }
}

fn handle_cert_command(action: CertCommands) -> Result<()> {
    match action {
        CertCommands::Generate {
            output,
            cn,
            dns,
            ip,
        } => {
            info!("🔐 Generating self-signed certificate...");

            let dns_names: Vec<String> = dns
                .as_deref()
                .map(|s| s.split(',').map(|x| x.trim().to_string()).collect())
                .unwrap_or_else(|| vec![cn.clone()]);
            let dns_refs: Vec<&str> = dns_names.iter().map(|s| s.as_str()).collect();

            let ip_addrs: Vec<std::net::IpAddr> = ip
                .as_deref()
                .map(|s| {
                    s.split(',')
                        .filter_map(|ip| ip.trim().parse().ok())
                        .collect()
                })
                .unwrap_or_else(|| vec!["127.0.0.1".parse().unwrap()]);

            let bundle = generate_self_signed_cert(&cn, &dns_refs, &ip_addrs)?;

            std::fs::create_dir_all(&output)?;
            let cert_path = output.join("cert.pem");
            let key_path = output.join("key.pem");
            save_cert_and_key(&bundle, &cert_path, &key_path)?;

            info!("✅ Certificate generated");
            info!("   Server: filevault server --cert {:?} --key {:?}", cert_path, key_path);
            info!("   Client: filevault list --ca {:?} -u <user> -p <pass>", cert_path);

            Ok(())
        }
    }
}

async fn run_server(
    bind: SocketAddr,
    cert: PathBuf,
    key: PathBuf,
    storage: PathBuf,
    auth_file: PathBuf,
    max_conns: usize,
) -> Result<()> {
    info!("🚀 Starting file transfer server...");

    let credentials = CredentialFile::load(&auth_file)?;
    if credentials.is_empty() {
        tracing::warn!("Credential file {:?} has no entries, all logins will fail", auth_file);
    }

    let tls_config = ServerTlsConfig::from_files(&cert, &key)?;
    let config = ServerConfig {
        bind_addr: bind,
        storage_root: storage,
        tls_config,
        max_conns,
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, shutting down gracefully...");
            signal_token.cancel();
        }
    });

    let server = Server::new(config, Arc::new(credentials));
    server.run(shutdown).await
}

async fn open_session(
    opts: &ClientOpts,
) -> Result<filevault::client::ClientSession<tokio_rustls::client::TlsStream<tokio::net::TcpStream>>>
{
    let tls_config = if opts.insecure {
        ClientTlsConfig::insecure(&opts.hostname)?
    } else {
        ClientTlsConfig::new(opts.ca.as_deref(), &opts.hostname)?
    };

    let client = Client::new(ClientConfig {
        server_addr: opts.server,
        tls_config,
    });

    let mut session = client.connect().await?;
    session.authenticate(&opts.username, &opts.password).await?;
    Ok(session)
}
