use clap::Parser;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[arg(long, env = "SPHERE_GATEWAY_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Path to the JSON file holding the service, ring, and route tables.
    #[arg(long, env = "SPHERE_GATEWAY_CONFIG", default_value = "gateway.json")]
    pub config: String,

    #[arg(long, env = "SPHERE_GATEWAY_MAX_BODY_BYTES", default_value_t = 2 * 1024 * 1024)]
    pub max_request_body_bytes: usize,

    /// OTLP endpoint for exporting traces.
    #[arg(long, env = "SPHERE_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP collector.
    #[arg(long, env = "SPHERE_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}
