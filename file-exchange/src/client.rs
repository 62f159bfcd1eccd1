use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    cli::ClientArgs,
    codec::{self, FrameError},
    input::Input,
    protocol::{Command, Reply, notice},
    store::FileStore,
};

/// Upper bound on each connection attempt made by `/join`.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECTION_TERMINATED: &str = "Error: Server connection has terminated.";
const MESSAGE_TOO_LONG: &str = "Error: Message is too long to deliver.";

pub const HELP: &str = "\
Available commands:
/?                                    Show this help text.
/join <server_ip_address> <port>      Connect to the server application.
/leave                                Disconnect from the server application.
/register <handle>                    Register a unique handle or alias.
/dir                                  Request directory list from the server.
/store <filename>                     Send file to the server.
/get <filename>                       Fetch a file from the server.
/msg <handle> <message>               Message a fellow user in the server.
/bc <message>                         Message all users in the server.";

/// Client side of the protocol.
///
/// Every operation returns the text to show the user. Notices pushed by the
/// server on the message channel are forwarded to the `notices` sender as
/// they arrive, independently of any command in progress.
pub struct Client {
    files_root: PathBuf,
    message_port: u16,
    notices: mpsc::UnboundedSender<String>,
    connection: Option<Connection>,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    listener: JoinHandle<()>,
    handle: Option<String>,
}

impl Client {
    pub fn new(
        files_root: impl Into<PathBuf>,
        message_port: u16,
        notices: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            files_root: files_root.into(),
            message_port,
            notices,
            connection: None,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_registered(&self) -> bool {
        self.handle().is_some()
    }

    pub fn handle(&self) -> Option<&str> {
        self.connection.as_ref()?.handle.as_deref()
    }

    pub fn help(&self) -> &'static str {
        HELP
    }

    /// Runs one parsed input line.
    pub async fn execute(&mut self, input: Input) -> String {
        match input {
            Input::Join { host, port } => self.join(&host, port).await,
            Input::Leave => self.leave().await,
            Input::Register { handle } => self.register(&handle).await,
            Input::Dir => self.dir().await,
            Input::Store { filename } => self.store(&filename).await,
            Input::Get { filename } => self.get(&filename).await,
            Input::Msg { handle, text } => self.msg(&handle, &text).await,
            Input::Broadcast { text } => self.broadcast(&text).await,
            Input::Help => self.help().to_string(),
        }
    }

    pub async fn join(&mut self, host: &str, port: u16) -> String {
        if self.is_joined() {
            return "Error: You are already connected to the server.".to_string();
        }

        let mut status = format!("Client: Connecting to server {host}:{port}\n");
        match self.connect(host, port).await {
            Ok(connection) => {
                self.connection = Some(connection);
                status.push_str(&format!("Client: Connected to server {host}:{port}\n"));
                status.push_str("Connection to the File Exchange Server is successful!");
            }
            Err(err) => {
                debug!(error = ?err, "join failed");
                status.push_str(
                    "Error: Connection to the server has failed! Please check IP and port number.",
                );
            }
        }
        status
    }

    async fn connect(&self, host: &str, port: u16) -> Result<Connection> {
        let control = connect_with_timeout(host, port).await?;
        let message = connect_with_timeout(host, self.message_port).await?;

        let (reader, writer) = control.into_split();
        let listener = tokio::spawn(forward_notices(message, self.notices.clone()));
        Ok(Connection {
            reader: BufReader::new(reader),
            writer,
            listener,
            handle: None,
        })
    }

    pub async fn leave(&mut self) -> String {
        let Some(connection) = self.connection.as_mut() else {
            return "Error: Disconnection failed. Please connect to the server first.".to_string();
        };

        let status = match Command::Disconnect.write_to(&mut connection.writer).await {
            Ok(()) => "Client: Connection closed: Thank you!".to_string(),
            Err(err) => {
                debug!(error = %err, "disconnect not delivered");
                CONNECTION_TERMINATED.to_string()
            }
        };
        self.terminate();
        status
    }

    pub async fn register(&mut self, handle: &str) -> String {
        let Some(connection) = self.connection.as_mut() else {
            return "Error: Registration failed. Please connect to the server first.".to_string();
        };
        if connection.handle.is_some() {
            return "Error: Registration failed. You already have a registered alias.".to_string();
        }

        let result = async {
            Command::Register {
                handle: handle.to_string(),
            }
            .write_to(&mut connection.writer)
            .await?;
            codec::read_string(&mut connection.reader).await
        }
        .await;
        let reply = match result {
            Ok(reply) => reply,
            Err(err) => return self.connection_lost(err),
        };

        match Reply::parse(&reply) {
            Some(Reply::RegistrationDone) => {
                connection.handle = Some(handle.to_string());
                match self.local_store(handle).ensure_dir().await {
                    Ok(()) => format!("Registered as {handle}."),
                    Err(err) => format!(
                        "Registered as {handle}, but the local directory could not be created: {err}"
                    ),
                }
            }
            Some(Reply::HandleExists) => {
                "Error: Registration failed. Handle or alias already exists.".to_string()
            }
            Some(Reply::AlreadyRegistered) => {
                "Error: Registration failed. You already have a registered alias.".to_string()
            }
            _ => format!("Error: Unexpected reply from the server: {reply}"),
        }
    }

    pub async fn dir(&mut self) -> String {
        let connection = match self.registered("Requesting directory file list failed") {
            Ok(connection) => connection,
            Err(status) => return status,
        };

        let result = async {
            Command::Dir.write_to(&mut connection.writer).await?;
            codec::read_string(&mut connection.reader).await
        }
        .await;
        self.finish(result)
    }

    pub async fn store(&mut self, filename: &str) -> String {
        let files = match self.registered_store("Sending file to server failed") {
            Ok(files) => files,
            Err(status) => return status,
        };
        let (mut file, length) = match files.open_for_read(filename).await {
            Ok(opened) => opened,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return "Error: File not found.".to_string();
            }
            Err(err) => return format!("Error: File could not be read: {err}"),
        };

        let Some(connection) = self.connection.as_mut() else {
            return CONNECTION_TERMINATED.to_string();
        };
        let result: Result<String, FrameError> = async {
            Command::Store {
                filename: filename.to_string(),
                length,
            }
            .write_to(&mut connection.writer)
            .await?;
            codec::write_bytes(&mut connection.writer, &mut file, length).await?;
            Ok(format!("File sent to Server: {filename}"))
        }
        .await;
        self.finish(result)
    }

    pub async fn get(&mut self, filename: &str) -> String {
        let files = match self.registered_store("Getting file from server failed") {
            Ok(files) => files,
            Err(status) => return status,
        };
        let Some(connection) = self.connection.as_mut() else {
            return CONNECTION_TERMINATED.to_string();
        };

        let result: Result<String, FrameError> = async {
            Command::Get {
                filename: filename.to_string(),
            }
            .write_to(&mut connection.writer)
            .await?;

            let reply = codec::read_string(&mut connection.reader).await?;
            if Reply::parse(&reply) != Some(Reply::FileExists) {
                return Ok("Error: File not found in the server.".to_string());
            }

            let length = codec::read_length(&mut connection.reader).await?;
            let saved = match files.open_for_write(filename).await {
                Ok(mut file) => codec::receive_bytes(&mut connection.reader, &mut file, length).await?,
                Err(err) => {
                    codec::discard_bytes(&mut connection.reader, length).await?;
                    Err(err)
                }
            };
            Ok(match saved {
                Ok(()) => format!("File received from Server: {filename}"),
                Err(err) => format!("Error: File could not be saved: {err}"),
            })
        }
        .await;
        self.finish(result)
    }

    /// Sends a direct message. The server reports the outcome on the
    /// message channel, so there is nothing to show here on success. Text
    /// that would not fit in the delivered notice is refused up front.
    pub async fn msg(&mut self, receiver: &str, text: &str) -> String {
        let connection = match self.registered("Unicast messaging failed") {
            Ok(connection) => connection,
            Err(status) => return status,
        };
        let sender = connection.handle.clone().unwrap_or_default();
        if notice::direct(&sender, text).len() > codec::MAX_STRING_LEN {
            return MESSAGE_TOO_LONG.to_string();
        }
        let command = Command::Message {
            receiver: receiver.to_string(),
            sender,
            text: text.to_string(),
        };
        let result = command
            .write_to(&mut connection.writer)
            .await
            .map(|()| String::new());
        self.finish(result)
    }

    pub async fn broadcast(&mut self, text: &str) -> String {
        let connection = match self.registered("Broadcast messaging failed") {
            Ok(connection) => connection,
            Err(status) => return status,
        };
        let sender = connection.handle.clone().unwrap_or_default();
        if notice::broadcast(&sender, text).len() > codec::MAX_STRING_LEN {
            return MESSAGE_TOO_LONG.to_string();
        }
        let command = Command::Broadcast {
            sender,
            text: text.to_string(),
        };
        let result = command
            .write_to(&mut connection.writer)
            .await
            .map(|()| String::new());
        self.finish(result)
    }

    fn registered(&mut self, action: &str) -> Result<&mut Connection, String> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| format!("Error: {action}. Please connect to the server first."))?;
        if connection.handle.is_none() {
            return Err(format!("Error: {action}. Register an alias first."));
        }
        Ok(connection)
    }

    fn registered_store(&mut self, action: &str) -> Result<FileStore, String> {
        let handle = self.registered(action)?.handle.clone().unwrap_or_default();
        Ok(self.local_store(&handle))
    }

    fn local_store(&self, handle: &str) -> FileStore {
        FileStore::new(self.files_root.join(handle))
    }

    fn finish(&mut self, result: Result<String, FrameError>) -> String {
        match result {
            Ok(status) => status,
            Err(err) => self.connection_lost(err),
        }
    }

    fn connection_lost(&mut self, err: FrameError) -> String {
        warn!(error = %err, "lost connection to server");
        self.terminate();
        CONNECTION_TERMINATED.to_string()
    }

    fn terminate(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.listener.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn connect_with_timeout(host: &str, port: u16) -> Result<TcpStream> {
    timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .with_context(|| format!("timed out connecting to {host}:{port}"))?
        .with_context(|| format!("failed to connect to {host}:{port}"))
}

async fn forward_notices(mut stream: TcpStream, notices: mpsc::UnboundedSender<String>) {
    loop {
        match codec::read_string(&mut stream).await {
            Ok(text) => {
                if notices.send(text).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "message channel closed");
                break;
            }
        }
    }
}

/// Terminal front end: reads `/command` lines from stdin and prints every
/// status and notice on stdout.
pub async fn run(args: ClientArgs) -> Result<()> {
    let (console, lines) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_lines(lines));

    let mut client = Client::new(&args.files_dir, args.message_port, console.clone());
    let mut stdin = BufReader::new(io::stdin());
    let mut input = String::new();

    say(&console, "Do /? to show all the available commands.");
    run_client_loop(&mut client, &console, &mut stdin, &mut input).await?;

    if client.is_joined() {
        say(&console, &client.leave().await);
    }
    drop(client);
    drop(console);
    printer.await.context("printer task failed")?;

    Ok(())
}

async fn run_client_loop(
    client: &mut Client,
    console: &mpsc::UnboundedSender<String>,
    stdin: &mut BufReader<io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(input) => {
                if bytes_read? == 0 {
                    break;
                }
                handle_line(client, console, input).await;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_line(client: &mut Client, console: &mpsc::UnboundedSender<String>, line: &str) {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return;
    }
    match line.parse::<Input>() {
        Ok(input) => say(console, &client.execute(input).await),
        Err(err) => say(console, &err.to_string()),
    }
}

fn say(console: &mpsc::UnboundedSender<String>, text: &str) {
    if text.is_empty() {
        return;
    }
    if console.send(text.to_string()).is_err() {
        debug!("console closed");
    }
}

async fn print_lines(mut lines: mpsc::UnboundedReceiver<String>) {
    let mut stdout = io::stdout();
    while let Some(text) = lines.recv().await {
        let mut block = text.into_bytes();
        block.push(b'\n');
        if stdout.write_all(&block).await.is_err() || stdout.flush().await.is_err() {
            break;
        }
    }
}
