use clap::Parser;

/// AgentMail tools over the Model Context Protocol.
#[derive(Debug, Parser)]
#[command(name = "agentmail-mcp", version, about)]
pub struct Cli {
    /// Port for the HTTP transport (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Serve a single client over stdin/stdout instead of HTTP
    #[arg(long)]
    pub stdio: bool,
}
