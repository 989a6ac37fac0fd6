//! Line framing: `CMD\n` for bare commands, `CMD LEN |BODY\n` otherwise.
//! LEN is the byte length of BODY between the ` |` separator and the LF.

use std::fmt;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::GateError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: String,
    pub body: String,
}

impl Message {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            body: String::new(),
        }
    }

    pub fn with_body(command: &str, body: impl Into<String>) -> Self {
        Self {
            command: command.to_string(),
            body: body.into(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.body.is_empty() {
            write!(f, "{}", self.command)
        } else {
            write!(f, "{} {} |{}", self.command, self.body.len(), self.body)
        }
    }
}

/// Encodes one message and writes it as a single LF-terminated line.
/// Bodies containing LF are refused; there is no escape mechanism.
pub async fn write_message<W>(w: &mut W, msg: &Message) -> Result<(), GateError>
where
    W: AsyncWrite + Unpin,
{
    if msg.body.contains('\n') {
        return Err(GateError::MalformedFrame);
    }
    let line = format!("{}\n", msg);
    w.write_all(line.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

/// Reads exactly one LF-terminated line and decodes it.
pub async fn read_message<R>(r: &mut R) -> Result<Message, GateError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = r.read_line(&mut line).await?;
    if n == 0 {
        return Err(GateError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed",
        )));
    }

    // Strip only the terminator; body bytes are significant.
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }

    decode_line(&line)
}

fn decode_line(line: &str) -> Result<Message, GateError> {
    let (command, rest) = match line.split_once(' ') {
        None => return Ok(Message::new(line)),
        Some(parts) => parts,
    };

    let (len_str, body) = rest.split_once(" |").ok_or(GateError::MalformedFrame)?;
    let length: usize = len_str.parse().map_err(|_| GateError::MalformedFrame)?;
    if body.len() != length {
        return Err(GateError::MalformedFrame);
    }

    Ok(Message {
        command: command.to_string(),
        body: body.to_string(),
    })
}
