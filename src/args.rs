use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
pub struct Args {
    /// Whether memoserve's clients connect to it over https.
    /// If so, the sessionid cookie is sent as a secure cookie.
    #[arg(short, long)]
    secure: bool,

    /// The address memoserve should listen on. By default
    /// memoserve will listen just on the IPv4 loopback.
    #[arg(short, long)]
    address: Option<String>,

    /// The port memoserve listens on.
    #[arg(short, long, default_value_t = 80)]
    port: u16,

    /// Where the sqlite database lives.
    #[arg(short, long, default_value = ".")]
    data_dir: PathBuf,

    /// Seconds of inactivity before a session expires.
    #[arg(long, default_value_t = 60 * 60 * 24 * 7)]
    session_ttl: i64,
}

impl Args {
    pub fn addr(&self) -> Result<SocketAddr, AddrParseError> {
        self.address
            .as_deref()
            .unwrap_or("127.0.0.1")
            .parse()
            .map(|addr: IpAddr| (addr, self.port).into())
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }

    pub fn session_ttl(&self) -> i64 {
        self.session_ttl
    }
}
