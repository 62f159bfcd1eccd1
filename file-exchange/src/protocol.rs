//! Commands, reply tokens and server notices carried by the codec.
//!
//! Every command starts with its name as a string frame, followed by a fixed
//! list of string (and for `STORE`, length) fields. A `STORE` header is
//! followed by the raw payload, which is not part of [`Command`]: whoever
//! reads the header must consume the payload before reading the next command.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{self, FrameError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Register { handle: String },
    Dir,
    Store { filename: String, length: u64 },
    Get { filename: String },
    Message { receiver: String, sender: String, text: String },
    Broadcast { sender: String, text: String },
    Disconnect,
    /// A command name the server does not recognise; its fields, if any,
    /// are left on the stream.
    Unknown { name: String },
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::Register { .. } => "REGISTER",
            Command::Dir => "DIR",
            Command::Store { .. } => "STORE",
            Command::Get { .. } => "GET",
            Command::Message { .. } => "MESSAGE",
            Command::Broadcast { .. } => "BROADCAST",
            Command::Disconnect => "DISCONNECT",
            Command::Unknown { name } => name,
        }
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let name = codec::read_string(reader).await?;
        Self::read_fields(name, reader).await.map_err(|err| match err {
            FrameError::Closed => FrameError::Truncated,
            other => other,
        })
    }

    /// Reads the fields that follow `name`. The name frame has already been
    /// consumed, so an end of stream here cuts a command in half.
    async fn read_fields<R>(name: String, reader: &mut R) -> Result<Self, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let command = match name.as_str() {
            "REGISTER" => Command::Register {
                handle: codec::read_string(reader).await?,
            },
            "DIR" => Command::Dir,
            "STORE" => Command::Store {
                filename: codec::read_string(reader).await?,
                length: codec::read_length(reader).await?,
            },
            "GET" => Command::Get {
                filename: codec::read_string(reader).await?,
            },
            "MESSAGE" => Command::Message {
                receiver: codec::read_string(reader).await?,
                sender: codec::read_string(reader).await?,
                text: codec::read_string(reader).await?,
            },
            "BROADCAST" => Command::Broadcast {
                sender: codec::read_string(reader).await?,
                text: codec::read_string(reader).await?,
            },
            "DISCONNECT" => Command::Disconnect,
            _ => Command::Unknown { name },
        };
        Ok(command)
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), FrameError>
    where
        W: AsyncWrite + Unpin,
    {
        codec::write_string(writer, self.name()).await?;
        match self {
            Command::Register { handle } => codec::write_string(writer, handle).await,
            Command::Store { filename, length } => {
                codec::write_string(writer, filename).await?;
                codec::write_length(writer, *length).await
            }
            Command::Get { filename } => codec::write_string(writer, filename).await,
            Command::Message {
                receiver,
                sender,
                text,
            } => {
                codec::write_string(writer, receiver).await?;
                codec::write_string(writer, sender).await?;
                codec::write_string(writer, text).await
            }
            Command::Broadcast { sender, text } => {
                codec::write_string(writer, sender).await?;
                codec::write_string(writer, text).await
            }
            Command::Dir | Command::Disconnect | Command::Unknown { .. } => Ok(()),
        }
    }
}

/// Fixed tokens the server sends back on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    RegistrationDone,
    HandleExists,
    AlreadyRegistered,
    FileExists,
    FileNotInServer,
}

impl Reply {
    pub fn as_str(self) -> &'static str {
        match self {
            Reply::RegistrationDone => "REGISTRATION_DONE",
            Reply::HandleExists => "HANDLE_EXISTS",
            Reply::AlreadyRegistered => "ALREADY_REGISTERED",
            Reply::FileExists => "FILE_EXISTS",
            Reply::FileNotInServer => "FILE_NOT_IN_SERVER",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        [
            Reply::RegistrationDone,
            Reply::HandleExists,
            Reply::AlreadyRegistered,
            Reply::FileExists,
            Reply::FileNotInServer,
        ]
        .into_iter()
        .find(|reply| reply.as_str() == token)
    }

    pub async fn write_to<W>(self, writer: &mut W) -> Result<(), FrameError>
    where
        W: AsyncWrite + Unpin,
    {
        codec::write_string(writer, self.as_str()).await
    }
}

/// Text pushed to clients on their message channel.
pub mod notice {
    use chrono::{DateTime, Local};

    pub const MESSAGE_SENT: &str = "Message sent successfully!";
    pub const SELF_MESSAGE: &str = "Error: Unicast messaging failed. You cannot message yourself.";
    pub const UNKNOWN_ALIAS: &str = "Error: Unicast messaging failed. Specified alias or handle does not exist/is not registered in the server.";
    pub const SHUTTING_DOWN: &str = "Server is shutting down.";

    pub fn joined(alias: &str) -> String {
        format!("{alias} joined the server.")
    }

    pub fn departed(alias: &str) -> String {
        format!("{alias} disconnected from the server.")
    }

    pub fn uploaded(alias: &str, at: DateTime<Local>, filename: &str) -> String {
        format!("{alias}<{}>: Uploaded {filename}", at.format("%a %b %d %H:%M:%S %Z %Y"))
    }

    pub fn direct(sender: &str, text: &str) -> String {
        format!("Message from {sender}: {text}")
    }

    pub fn broadcast(sender: &str, text: &str) -> String {
        format!("Broadcast from {sender}: {text}")
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Local, TimeZone};

    use super::*;

    async fn roundtrip(command: Command) -> Command {
        let mut wire = Vec::new();
        command.write_to(&mut wire).await.expect("write command");
        Command::read_from(&mut wire.as_slice())
            .await
            .expect("read command")
    }

    #[tokio::test]
    async fn commands_keep_their_field_order() {
        let message = Command::Message {
            receiver: "bob".into(),
            sender: "alice".into(),
            text: "hi".into(),
        };
        let mut wire = Vec::new();
        message.write_to(&mut wire).await.expect("write");

        let mut reader = wire.as_slice();
        for expected in ["MESSAGE", "bob", "alice", "hi"] {
            assert_eq!(codec::read_string(&mut reader).await.expect("field"), expected);
        }
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn store_header_carries_length_field() {
        let store = Command::Store {
            filename: "a.bin".into(),
            length: 4097,
        };
        assert_eq!(roundtrip(store.clone()).await, store);
        assert_eq!(roundtrip(Command::Dir).await, Command::Dir);
        assert_eq!(roundtrip(Command::Disconnect).await, Command::Disconnect);
    }

    #[tokio::test]
    async fn unknown_names_are_surfaced() {
        let mut wire = Vec::new();
        codec::write_string(&mut wire, "PING").await.expect("write");
        let command = Command::read_from(&mut wire.as_slice()).await.expect("read");
        assert_eq!(command, Command::Unknown { name: "PING".into() });
    }

    #[tokio::test]
    async fn missing_fields_end_the_read() {
        let mut wire = Vec::new();
        codec::write_string(&mut wire, "REGISTER").await.expect("write");
        let result = Command::read_from(&mut wire.as_slice()).await;
        assert!(matches!(result, Err(FrameError::Truncated)));

        let mut wire = Vec::new();
        codec::write_string(&mut wire, "MESSAGE").await.expect("write");
        codec::write_string(&mut wire, "bob").await.expect("write");
        let result = Command::read_from(&mut wire.as_slice()).await;
        assert!(matches!(result, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn end_of_stream_before_a_command_is_a_clean_close() {
        let mut empty: &[u8] = &[];
        let result = Command::read_from(&mut empty).await;
        assert!(matches!(result, Err(FrameError::Closed)));
    }

    #[test]
    fn reply_tokens_parse_back() {
        assert_eq!(Reply::parse("HANDLE_EXISTS"), Some(Reply::HandleExists));
        assert_eq!(Reply::parse("FILE_EXISTS"), Some(Reply::FileExists));
        assert_eq!(Reply::parse("nope"), None);
    }

    #[test]
    fn notices_read_naturally() {
        assert_eq!(notice::joined("dana"), "dana joined the server.");
        assert_eq!(notice::direct("a", "yo"), "Message from a: yo");
        assert_eq!(notice::broadcast("b", "all"), "Broadcast from b: all");
        let at = Local::now();
        assert!(notice::uploaded("a", at, "x.txt").ends_with(">: Uploaded x.txt"));
    }

    #[test]
    fn upload_timestamp_pads_the_day_and_names_the_zone() {
        let at = Local
            .with_ymd_and_hms(2024, 3, 5, 9, 7, 2)
            .single()
            .expect("unambiguous local time");
        let text = notice::uploaded("a", at, "x.txt");
        let zone = at.format("%Z").to_string();
        assert_eq!(text, format!("a<Tue Mar 05 09:07:02 {zone} 2024>: Uploaded x.txt"));
    }
}
