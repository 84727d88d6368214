use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "lb-cli")]
#[command(about = "Management CLI for the load balancer admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8081", env = "LB_ADMIN_URL")]
    url: String,

    #[arg(short, long, env = "LB_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show overall status
    Status,
    /// List backends with health, weight, in-flight and circuit state
    Backends,
    /// Register a backend
    Add {
        host: String,
        port: u16,
        #[arg(short, long, default_value_t = 1)]
        weight: u32,
    },
    /// Deregister a backend (host:port)
    Remove { id: String },
    /// Stop sending new requests to a backend (host:port)
    Drain { id: String },
    /// Return a drained backend to rotation (host:port)
    Undrain { id: String },
    /// Run a health check round now
    Check,
    /// Show or change the selection strategy
    Strategy {
        /// round_robin, least_connections, weighted_random, random or consistent_hash
        name: Option<String>,
    },
    /// Per-backend request metrics
    Metrics,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", cli.key))?);

    let request = |method: Method, path: &str| -> RequestBuilder {
        client
            .request(method, format!("{}{}", cli.url.trim_end_matches('/'), path))
            .headers(headers.clone())
    };

    let builder = match &cli.command {
        Commands::Status => request(Method::GET, "/admin/status"),
        Commands::Backends => request(Method::GET, "/admin/backends"),
        Commands::Add { host, port, weight } => request(Method::POST, "/admin/backends")
            .json(&json!({ "host": host, "port": port, "weight": weight })),
        Commands::Remove { id } => request(Method::DELETE, &format!("/admin/backends/{}", id)),
        Commands::Drain { id } => request(Method::POST, &format!("/admin/backends/{}/drain", id)),
        Commands::Undrain { id } => request(Method::POST, &format!("/admin/backends/{}/undrain", id)),
        Commands::Check => request(Method::POST, "/admin/health-check"),
        Commands::Strategy { name: None } => request(Method::GET, "/admin/strategy"),
        Commands::Strategy { name: Some(name) } => {
            request(Method::PUT, "/admin/strategy").json(&json!({ "strategy": name }))
        }
        Commands::Metrics => request(Method::GET, "/admin/metrics"),
    };

    print_response(builder.send().await?).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;

    if !status.is_success() {
        eprintln!("Error: admin API returned status {}", status);
        if !text.is_empty() {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    if text.is_empty() {
        println!("{}", status);
        return Ok(());
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }
    Ok(())
}
