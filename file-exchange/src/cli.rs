use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::server::{DEFAULT_MESSAGE_PORT, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the file exchange server.
    Server(ServerArgs),
    /// Start an interactive client that reads `/commands` from stdin.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Host or address both endpoints bind to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port of the control endpoint. Use 0 for an ephemeral port.
    #[arg(long)]
    pub port: u16,

    /// Port of the message endpoint.
    #[arg(long, default_value_t = DEFAULT_MESSAGE_PORT)]
    pub message_port: u16,

    /// Directory holding the files served to clients.
    #[arg(long, default_value = "server_files")]
    pub files_dir: PathBuf,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            message_port: args.message_port,
            files_dir: args.files_dir,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Directory under which each registered handle gets its own folder.
    #[arg(long, default_value = "client_files")]
    pub files_dir: PathBuf,

    /// Port of the server's message endpoint.
    #[arg(long, default_value_t = DEFAULT_MESSAGE_PORT)]
    pub message_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let cli = Cli::parse_from(["file_exchange", "server", "--port", "4000"]);
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        let config = ServerConfig::from(args);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 4000);
        assert_eq!(config.message_port, 5555);
        assert_eq!(config.files_dir, PathBuf::from("server_files"));
    }

    #[test]
    fn client_overrides() {
        let cli = Cli::parse_from([
            "file_exchange",
            "client",
            "--files-dir",
            "/tmp/cf",
            "--message-port",
            "6000",
        ]);
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(args.files_dir, PathBuf::from("/tmp/cf"));
        assert_eq!(args.message_port, 6000);
    }

    #[test]
    fn server_requires_port() {
        assert!(Cli::try_parse_from(["file_exchange", "server"]).is_err());
    }
}
