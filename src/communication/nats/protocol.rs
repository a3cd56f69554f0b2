/**
 * communication/nats/protocol.rs
 *
 * NATS client protocol framing (text commands, length prefixed payloads)
 */

use crate::communication::TransportError;

const CRLF: &[u8] = b"\r\n";

/// Largest payload a NATS server can be configured to deliver
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Operations sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Info(String),
    Msg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        payload: Vec<u8>,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Try to parse one operation from the front of `buf`.
///
/// Returns the operation and the number of bytes it occupied, or `None`
/// when more data is needed.
pub fn parse(buf: &[u8]) -> Result<Option<(ServerOp, usize)>, TransportError> {
    let Some(line_end) = find_crlf(buf) else {
        return Ok(None);
    };
    let line = std::str::from_utf8(&buf[..line_end])
        .map_err(|_| TransportError::Protocol("non UTF-8 control line".to_string()))?;
    let consumed = line_end + CRLF.len();

    let (op, args) = match line.find([' ', '\t']) {
        Some(idx) => (&line[..idx], line[idx + 1..].trim()),
        None => (line, ""),
    };

    let parsed = match op.to_ascii_uppercase().as_str() {
        "PING" => ServerOp::Ping,
        "PONG" => ServerOp::Pong,
        "+OK" => ServerOp::Ok,
        "-ERR" => ServerOp::Err(args.trim_matches('\'').to_string()),
        "INFO" => ServerOp::Info(args.to_string()),
        "MSG" => return parse_msg(buf, args, consumed),
        other => {
            return Err(TransportError::Protocol(format!(
                "unexpected operation '{}'",
                other
            )))
        }
    };
    Ok(Some((parsed, consumed)))
}

fn parse_msg(
    buf: &[u8],
    args: &str,
    header_len: usize,
) -> Result<Option<(ServerOp, usize)>, TransportError> {
    let fields: Vec<&str> = args.split_whitespace().collect();
    let (subject, sid, reply, size) = match fields.as_slice() {
        [subject, sid, size] => (*subject, *sid, None, *size),
        [subject, sid, reply, size] => (*subject, *sid, Some(*reply), *size),
        _ => return Err(TransportError::Protocol(format!("malformed MSG '{}'", args))),
    };
    let sid = sid
        .parse::<u64>()
        .map_err(|_| TransportError::Protocol(format!("invalid sid '{}'", sid)))?;
    let size = size
        .parse::<usize>()
        .map_err(|_| TransportError::Protocol(format!("invalid size '{}'", size)))?;

    if size > MAX_PAYLOAD {
        return Err(TransportError::Protocol(format!(
            "MSG payload of {} bytes exceeds {}",
            size, MAX_PAYLOAD
        )));
    }
    let total = header_len
        .checked_add(size)
        .and_then(|end| end.checked_add(CRLF.len()))
        .ok_or_else(|| TransportError::Protocol(format!("invalid size '{}'", size)))?;
    if buf.len() < total {
        return Ok(None);
    }
    if &buf[header_len + size..total] != CRLF {
        return Err(TransportError::Protocol("MSG payload not terminated".to_string()));
    }

    Ok(Some((
        ServerOp::Msg {
            subject: subject.to_string(),
            sid,
            reply: reply.map(str::to_string),
            payload: buf[header_len..header_len + size].to_vec(),
        },
        total,
    )))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF.len()).position(|w| w == CRLF)
}

pub fn connect_command(name: &str) -> Vec<u8> {
    let options = serde_json::json!({
        "verbose": false,
        "pedantic": false,
        "name": name,
        "lang": "rust",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": 1,
    });
    format!("CONNECT {}\r\n", options).into_bytes()
}

pub fn pub_command(subject: &str, reply: Option<&str>, payload: &[u8]) -> Vec<u8> {
    let mut bytes = match reply {
        Some(reply) => format!("PUB {} {} {}\r\n", subject, reply, payload.len()),
        None => format!("PUB {} {}\r\n", subject, payload.len()),
    }
    .into_bytes();
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(CRLF);
    bytes
}

pub fn sub_command(subject: &str, sid: u64) -> Vec<u8> {
    format!("SUB {} {}\r\n", subject, sid).into_bytes()
}

pub fn unsub_command(sid: u64) -> Vec<u8> {
    format!("UNSUB {}\r\n", sid).into_bytes()
}

pub const PING: &[u8] = b"PING\r\n";
pub const PONG: &[u8] = b"PONG\r\n";
