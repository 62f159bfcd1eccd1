//! Parser for the `/command` lines typed into the client.
//!
//! A line either parses completely or is rejected; nothing is executed for a
//! line with the right command but the wrong parameters.

use std::str::FromStr;

use thiserror::Error;

use crate::codec::MAX_STRING_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Join { host: String, port: u16 },
    Leave,
    Register { handle: String },
    Dir,
    Store { filename: String },
    Get { filename: String },
    Msg { handle: String, text: String },
    Broadcast { text: String },
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("Command not found.")]
    UnknownCommand,
    #[error("Command parameters do not match or is not allowed.")]
    BadParameters,
}

/// Command names, longest first so that a name which is a prefix of another
/// never shadows it.
const COMMANDS: [&str; 9] = [
    "register", "store", "leave", "join", "dir", "get", "msg", "bc", "?",
];

impl FromStr for Input {
    type Err = InputError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let body = line.strip_prefix('/').ok_or(InputError::UnknownCommand)?;
        let name = COMMANDS
            .iter()
            .find(|name| body.starts_with(*name))
            .ok_or(InputError::UnknownCommand)?;

        let rest = &body[name.len()..];
        let params = if rest.is_empty() {
            None
        } else {
            Some(rest.strip_prefix(' ').ok_or(InputError::BadParameters)?)
        };

        parse_params(name, params).ok_or(InputError::BadParameters)
    }
}

fn parse_params(name: &str, params: Option<&str>) -> Option<Input> {
    match (name, params) {
        ("leave", None) => Some(Input::Leave),
        ("dir", None) => Some(Input::Dir),
        ("?", None) => Some(Input::Help),
        ("join", Some(params)) => {
            let (host, port) = params.split_once(' ')?;
            if !(host == "localhost" || is_dotted_quad(host)) || !is_digits(port, 1..=5) {
                return None;
            }
            Some(Input::Join {
                host: host.to_string(),
                port: port.parse().ok()?,
            })
        }
        ("register", Some(handle)) if is_word(handle) => Some(Input::Register {
            handle: handle.to_string(),
        }),
        ("store", Some(filename)) if is_text(filename) => Some(Input::Store {
            filename: filename.to_string(),
        }),
        ("get", Some(filename)) if is_text(filename) => Some(Input::Get {
            filename: filename.to_string(),
        }),
        ("msg", Some(params)) => {
            let (handle, text) = params.split_once(' ')?;
            (is_word(handle) && is_text(text)).then(|| Input::Msg {
                handle: handle.to_string(),
                text: text.to_string(),
            })
        }
        ("bc", Some(text)) if is_text(text) => Some(Input::Broadcast {
            text: text.to_string(),
        }),
        _ => None,
    }
}

fn is_word(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_text(value: &str) -> bool {
    !value.is_empty() && value.len() <= MAX_STRING_LEN && !value.contains(['\n', '\r'])
}

fn is_digits(value: &str, width: std::ops::RangeInclusive<usize>) -> bool {
    width.contains(&value.len()) && value.chars().all(|c| c.is_ascii_digit())
}

fn is_dotted_quad(value: &str) -> bool {
    let octets: Vec<&str> = value.split('.').collect();
    octets.len() == 4 && octets.iter().all(|octet| is_digits(octet, 1..=3))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<Input, InputError> {
        line.parse()
    }

    #[test]
    fn parses_every_command() {
        assert_eq!(
            parse("/join 127.0.0.1 4000"),
            Ok(Input::Join { host: "127.0.0.1".into(), port: 4000 })
        );
        assert_eq!(
            parse("/join localhost 12345"),
            Ok(Input::Join { host: "localhost".into(), port: 12345 })
        );
        assert_eq!(parse("/leave"), Ok(Input::Leave));
        assert_eq!(parse("/register alice_01"), Ok(Input::Register { handle: "alice_01".into() }));
        assert_eq!(parse("/dir"), Ok(Input::Dir));
        assert_eq!(parse("/store my file.txt"), Ok(Input::Store { filename: "my file.txt".into() }));
        assert_eq!(parse("/get a.bin"), Ok(Input::Get { filename: "a.bin".into() }));
        assert_eq!(
            parse("/msg bob hello there"),
            Ok(Input::Msg { handle: "bob".into(), text: "hello there".into() })
        );
        assert_eq!(parse("/bc hi all"), Ok(Input::Broadcast { text: "hi all".into() }));
        assert_eq!(parse("/?"), Ok(Input::Help));
    }

    #[test]
    fn unknown_commands() {
        for line in ["", "hello", "/", "/quit", "dir", " /dir"] {
            assert_eq!(parse(line), Err(InputError::UnknownCommand), "{line:?}");
        }
    }

    #[test]
    fn malformed_parameters() {
        for line in [
            "/join",
            "/join 127.0.0.1",
            "/join example.com 80",
            "/join 1.2.3 80",
            "/join 1234.0.0.1 80",
            "/join 127.0.0.1 123456",
            "/join 127.0.0.1 99999",
            "/leave now",
            "/dir x",
            "/dirx",
            "/register",
            "/register bad-handle",
            "/register two words",
            "/store",
            "/get",
            "/msg bob",
            "/msg bad-name hi",
            "/bc",
            "/?x",
        ] {
            assert_eq!(parse(line), Err(InputError::BadParameters), "{line:?}");
        }
    }

    #[test]
    fn text_must_fit_in_one_frame() {
        let longest = "x".repeat(MAX_STRING_LEN);
        assert!(parse(&format!("/bc {longest}")).is_ok());
        let too_long = "x".repeat(MAX_STRING_LEN + 1);
        assert_eq!(parse(&format!("/bc {too_long}")), Err(InputError::BadParameters));
        assert_eq!(parse(&format!("/msg bob {too_long}")), Err(InputError::BadParameters));
    }

    #[test]
    fn messages_keep_inner_spacing() {
        assert_eq!(
            parse("/msg bob  spaced  out"),
            Ok(Input::Msg { handle: "bob".into(), text: " spaced  out".into() })
        );
    }

    #[test]
    fn error_text_matches_client_output() {
        assert_eq!(InputError::UnknownCommand.to_string(), "Command not found.");
        assert_eq!(
            InputError::BadParameters.to_string(),
            "Command parameters do not match or is not allowed."
        );
    }
}
