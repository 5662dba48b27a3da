//! Command-line SOAP caller.
//!
//! Run with: `zentinel-soap-call --config client.yaml --action GetData --body request.xml`

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_soap_client::parser::parse_document;
use zentinel_soap_client::{Binary, Client, ClientConfig, Envelope, UsernameToken, XmlElement};

/// Send one SOAP request and print the response envelope.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "client.yaml")]
    config: PathBuf,

    /// Endpoint URL, overrides the configuration file
    #[arg(short, long)]
    endpoint: Option<String>,

    /// SOAPAction header value
    #[arg(short, long)]
    action: String,

    /// XML file holding the Body payload element
    #[arg(short, long)]
    body: PathBuf,

    /// Attach a file as a new payload child element: NAME=PATH (repeatable)
    #[arg(long, value_name = "NAME=PATH")]
    attach: Vec<String>,

    /// Send attachments as MTOM
    #[arg(long)]
    mtom: bool,

    /// WS-Security username (PasswordText)
    #[arg(long, requires = "password")]
    username: Option<String>,

    #[arg(long, requires = "username")]
    password: Option<String>,

    /// Overall deadline for the call, in seconds
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout carries only the response
    let log_level = args.log_level.parse().unwrap_or(Level::WARN);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let mut config = if args.config.exists() {
        let content = tokio::fs::read_to_string(&args.config)
            .await
            .context("Failed to read config file")?;
        serde_yaml::from_str::<ClientConfig>(&content).context("Failed to parse config file")?
    } else {
        info!("Config file not found, using defaults");
        ClientConfig::default()
    };
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if args.mtom {
        config.mtom = true;
    }

    let payload = load_payload(&args.body, &args.attach).await?;

    let client = Client::from_config(config).context("Failed to create client")?;
    if let (Some(username), Some(password)) = (args.username, args.password) {
        client.add_header_entry(UsernameToken::new(username, password).with_created_now().header_entry()?);
    }

    info!(endpoint = %client.config().endpoint, action = %args.action, "Calling service");

    let response: Envelope = match args.deadline_secs {
        Some(secs) => {
            client
                .call_envelope_with_deadline(&args.action, &payload, Duration::from_secs(secs))
                .await?
        }
        None => client.call_envelope(&args.action, &payload).await?,
    };

    println!("{}", response.to_xml()?);
    Ok(())
}

async fn load_payload(path: &Path, attachments: &[String]) -> Result<XmlElement> {
    let xml = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let document = parse_document(&xml).context("Failed to parse body payload")?;
    if !document.references.is_empty() {
        bail!("body payload must not contain xop:Include elements");
    }

    let mut payload = document.root;
    for spec in attachments {
        let (name, file) = spec
            .split_once('=')
            .with_context(|| format!("Invalid --attach value {:?}, expected NAME=PATH", spec))?;
        let bytes = tokio::fs::read(file)
            .await
            .with_context(|| format!("Failed to read attachment {}", file))?;
        payload.push_child(XmlElement::new(name).with_binary(Binary::new(bytes)));
    }
    Ok(payload)
}
