use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use mcp_http_proxy::{ProxyConfig, logging, run_bridge};
use url::Url;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:9090";

/// Stdio-to-HTTP bridge for MCP servers.
///
/// Reads line-delimited JSON-RPC from stdin, posts each message to
/// `{base_url}/{server_identity}/message`, and relays replies back to
/// stdout, whether they come in the HTTP response or are pushed later over
/// `{base_url}/{server_identity}/sse`.
#[derive(Parser, Debug)]
#[command(name = "mcp_http_proxy")]
#[command(version, about)]
struct Args {
    /// Logical name of the remote server to bridge to.
    server_identity: String,

    /// HTTP origin of the centralized server. Falls back to the
    /// MCP_PROXY_BASE_URL environment variable, then to the built-in
    /// default.
    base_url: Option<String>,

    /// Answer requests left pending longer than this many seconds with a
    /// synthetic timeout error instead of keeping them until shutdown.
    #[arg(long)]
    request_timeout_secs: Option<u64>,

    /// Enable colored terminal echo of wire traffic (debug mode).
    #[arg(long)]
    colored_output: bool,

    /// Log to a daily rolling file instead of stderr.
    #[arg(long)]
    log_to_file: bool,

    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();

    logging::init_logging(&args.log_level, args.log_to_file)?;

    let config = proxy_config(args)?;

    // tokio's stdin reads on a blocking thread that cannot be canceled;
    // letting the runtime wind down naturally would wait on that read until
    // the client writes or closes the pipe. Exit explicitly so a
    // signal-triggered shutdown terminates right away.
    match run_bridge(config).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("mcp_http_proxy fatal error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Like `Args::parse()`, except a usage error exits with status 1 (clap's
/// default is 2) so supervisors see the same code for every startup
/// failure.
fn parse_args() -> Args {
    match Args::try_parse() {
        Ok(args) => args,
        Err(error) => {
            let requested = matches!(
                error.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            let _ = error.print();
            std::process::exit(if requested { 0 } else { 1 });
        }
    }
}

fn proxy_config(args: Args) -> anyhow::Result<ProxyConfig> {
    let raw_base_url = args
        .base_url
        .or_else(|| std::env::var("MCP_PROXY_BASE_URL").ok())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

    let base_url = Url::parse(&raw_base_url)
        .with_context(|| format!("invalid base URL '{raw_base_url}'"))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        anyhow::bail!("base URL must be http or https, got '{raw_base_url}'");
    }

    let mut config = ProxyConfig::new(args.server_identity, base_url);
    config.request_timeout = args.request_timeout_secs.map(Duration::from_secs);
    config.colored_output = args.colored_output || env_flag_enabled("MCP_PROXY_COLOR");
    Ok(config)
}

fn env_flag_enabled(name: &str) -> bool {
    std::env::var(name)
        .map(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return false;
            }

            matches!(
                trimmed.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::sync::{Mutex, OnceLock};

    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    /// Serializes tests that read or write `MCP_PROXY_*` environment
    /// variables; the process environment is shared state.
    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn identity_is_required() {
        assert!(Args::try_parse_from(["mcp_http_proxy"]).is_err());
    }

    #[test]
    fn base_url_argument_wins() {
        let config =
            proxy_config(args(&["mcp_http_proxy", "memory", "http://gateway:8080"])).unwrap();
        assert_eq!(config.base_url.as_str(), "http://gateway:8080/");
        assert_eq!(config.server_identity, "memory");
    }

    #[test]
    fn env_base_url_applies_when_argument_is_absent() {
        let _guard = env_guard().lock().unwrap();
        unsafe { env::set_var("MCP_PROXY_BASE_URL", "http://env-host:7070") };

        let config = proxy_config(args(&["mcp_http_proxy", "memory"])).unwrap();
        assert_eq!(config.base_url.as_str(), "http://env-host:7070/");

        unsafe { env::remove_var("MCP_PROXY_BASE_URL") };
    }

    #[test]
    fn base_url_argument_beats_environment() {
        let _guard = env_guard().lock().unwrap();
        unsafe { env::set_var("MCP_PROXY_BASE_URL", "http://env-host:7070") };

        let config =
            proxy_config(args(&["mcp_http_proxy", "memory", "http://arg-host:8080"])).unwrap();
        assert_eq!(config.base_url.as_str(), "http://arg-host:8080/");

        unsafe { env::remove_var("MCP_PROXY_BASE_URL") };
    }

    #[test]
    fn accepts_https_base_url() {
        let config =
            proxy_config(args(&["mcp_http_proxy", "memory", "https://gateway:8443"])).unwrap();
        assert_eq!(config.base_url.scheme(), "https");
    }

    #[test]
    fn defaults_apply_without_flags() {
        let _guard = env_guard().lock().unwrap();
        let config = proxy_config(args(&["mcp_http_proxy", "memory"])).unwrap();
        assert_eq!(config.base_url.as_str(), "http://127.0.0.1:9090/");
        assert!(config.request_timeout.is_none());
        assert!(!config.colored_output);
    }

    #[test]
    fn env_flag_enables_colored_output() {
        let _guard = env_guard().lock().unwrap();
        unsafe { env::set_var("MCP_PROXY_COLOR", "yes") };

        let config = proxy_config(args(&["mcp_http_proxy", "memory"])).unwrap();
        assert!(config.colored_output);

        unsafe { env::remove_var("MCP_PROXY_COLOR") };

        let config = proxy_config(args(&["mcp_http_proxy", "memory"])).unwrap();
        assert!(!config.colored_output);
    }

    #[test]
    fn timeout_flag_becomes_a_duration() {
        let _guard = env_guard().lock().unwrap();
        let config = proxy_config(args(&[
            "mcp_http_proxy",
            "memory",
            "--request-timeout-secs",
            "30",
        ]))
        .unwrap();
        assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn rejects_unparseable_base_url() {
        assert!(proxy_config(args(&["mcp_http_proxy", "memory", "not a url"])).is_err());
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert!(proxy_config(args(&["mcp_http_proxy", "memory", "ftp://host"])).is_err());
    }
}
