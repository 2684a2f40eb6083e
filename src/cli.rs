use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "bindbox")]
#[command(about = "Asynchronous URL-binding engine CLI", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch a URL through the binding engine
    Fetch(FetchArgs),
}

#[derive(clap::Args, Debug)]
pub struct FetchArgs {
    /// Target URL (file://, http://, https://)
    pub url: String,

    /// Write the payload to this file instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Request verb
    #[arg(long, default_value = "GET")]
    pub verb: String,

    /// Extra header line, `Name: value`; repeatable
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,

    /// Preferred content type, sent as `Accept`
    #[arg(long)]
    pub accept: Option<String>,

    /// Report the transport-proposed content type without sniffing
    #[arg(long)]
    pub no_verify: bool,

    /// Redirect-hop limit override
    #[arg(long)]
    pub max_redirects: Option<u32>,

    /// Print a JSON summary to stdout (pair with --output)
    #[arg(long)]
    pub json: bool,
}
