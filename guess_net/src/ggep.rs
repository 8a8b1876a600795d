//! Binary codec for the GUESS ping/query/pong wire format (see EXTERNAL
//! INTERFACES). Mirrors bip_utracker's `request.rs`: `nom` combinators for
//! parsing, `byteorder` for writing.

use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddrV4};

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use nom::{be_u16, be_u8, IResult};

/// Well known GGEP extension keys recognized by the query engine.
pub const KEY_SCP: &str = "SCP";
pub const KEY_GUE: &str = "GUE";
pub const KEY_QK: &str = "QK";
pub const KEY_IPP: &str = "IPP";
pub const KEY_IPV6: &str = "GTKG.IPV6";

/// One `key = value` GGEP extension block.
#[derive(Clone, PartialEq, Debug)]
pub struct Extension {
    pub key: String,
    pub value: Vec<u8>,
}

impl Extension {
    pub fn new<K: Into<String>>(key: K, value: Vec<u8>) -> Extension {
        Extension {
            key: key.into(),
            value,
        }
    }

    fn write_bytes<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let key_bytes = self.key.as_bytes();
        writer.write_u8(key_bytes.len() as u8)?;
        writer.write_all(key_bytes)?;
        writer.write_u16::<BigEndian>(self.value.len() as u16)?;
        writer.write_all(&self.value)?;
        Ok(())
    }
}

fn parse_extension(input: &[u8]) -> IResult<&[u8], Extension> {
    chain!(input,
        key_len: be_u8 ~
        key_bytes: take!(key_len as usize) ~
        value_len: be_u16 ~
        value_bytes: take!(value_len as usize),
        || {
            Extension::new(String::from_utf8_lossy(key_bytes).into_owned(), value_bytes.to_vec())
        }
    )
}

fn parse_extensions(input: &[u8]) -> IResult<&[u8], Vec<Extension>> {
    many0!(input, parse_extension)
}

fn write_extensions<W: Write>(mut writer: W, extensions: &[Extension]) -> io::Result<()> {
    for extension in extensions {
        extension.write_bytes(&mut writer)?;
    }
    Ok(())
}

/// Find the value of the first extension with the given key.
pub fn find<'a>(extensions: &'a [Extension], key: &str) -> Option<&'a [u8]> {
    extensions
        .iter()
        .find(|extension| extension.key == key)
        .map(|extension| extension.value.as_slice())
}

/// Decode a 6 byte `IPP` record list into socket addresses. Returns `None`
/// if the payload length is not a multiple of 6 (a protocol violation, per
/// ERROR HANDLING DESIGN: the extension is ignored, not fatal).
pub fn decode_ipp(value: &[u8]) -> Option<Vec<SocketAddrV4>> {
    if value.len() % 6 != 0 {
        return None;
    }

    Some(
        value
            .chunks(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = (chunk[4] as u16) | ((chunk[5] as u16) << 8);
                SocketAddrV4::new(ip, port)
            })
            .collect(),
    )
}

pub fn encode_ipp(hosts: &[SocketAddrV4]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(hosts.len() * 6);
    for host in hosts {
        bytes.extend_from_slice(&host.ip().octets());
        let port = host.port();
        bytes.push(port as u8);
        bytes.push((port >> 8) as u8);
    }
    bytes
}

/// A ping carrying GUESS extensions: query key requests, `SCP` pong-host
/// requests, and ultrapeer introductions.
#[derive(Clone, PartialEq, Debug)]
pub struct PingMessage {
    pub version: u8,
    pub extensions: Vec<Extension>,
}

impl PingMessage {
    pub fn write_bytes<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(self.version)?;
        write_extensions(writer.by_ref(), &self.extensions)
    }

    pub fn from_bytes(input: &[u8]) -> IResult<&[u8], PingMessage> {
        chain!(input,
            version: be_u8 ~
            extensions: parse_extensions,
            || PingMessage { version, extensions }
        )
    }
}

/// An outgoing query: LE port, BE ipv4, null terminated search text, then
/// extensions (typically `QK` and optionally `SCP`).
#[derive(Clone, PartialEq, Debug)]
pub struct QueryMessage {
    pub port: u16,
    pub ip: Ipv4Addr,
    pub text: String,
    pub extensions: Vec<Extension>,
}

impl QueryMessage {
    pub fn write_bytes<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u16::<LittleEndian>(self.port)?;
        writer.write_all(&self.ip.octets())?;
        writer.write_all(self.text.as_bytes())?;
        writer.write_u8(0)?;
        write_extensions(writer.by_ref(), &self.extensions)
    }

    pub fn from_bytes(input: &[u8]) -> IResult<&[u8], QueryMessage> {
        if input.len() < 6 {
            return IResult::Incomplete(nom::Needed::Size(6));
        }
        let port = (input[0] as u16) | ((input[1] as u16) << 8);
        let ip = Ipv4Addr::new(input[2], input[3], input[4], input[5]);

        let rest = &input[6..];
        let nul_pos = match rest.iter().position(|&b| b == 0) {
            Some(pos) => pos,
            None => return IResult::Incomplete(nom::Needed::Unknown),
        };
        let text = String::from_utf8_lossy(&rest[..nul_pos]).into_owned();
        let after_text = &rest[nul_pos + 1..];

        match parse_extensions(after_text) {
            IResult::Done(remaining, extensions) => IResult::Done(
                remaining,
                QueryMessage {
                    port,
                    ip,
                    text,
                    extensions,
                },
            ),
            IResult::Error(err) => IResult::Error(err),
            IResult::Incomplete(needed) => IResult::Incomplete(needed),
        }
    }
}

/// An acknowledgement pong: LE port, BE ipv4, then optional extensions.
#[derive(Clone, PartialEq, Debug)]
pub struct PongMessage {
    pub port: u16,
    pub ip: Ipv4Addr,
    pub extensions: Vec<Extension>,
}

impl PongMessage {
    pub fn write_bytes<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u16::<LittleEndian>(self.port)?;
        writer.write_all(&self.ip.octets())?;
        write_extensions(writer.by_ref(), &self.extensions)
    }

    pub fn from_bytes(input: &[u8]) -> IResult<&[u8], PongMessage> {
        if input.len() < 6 {
            return IResult::Incomplete(nom::Needed::Size(6));
        }
        let port = (input[0] as u16) | ((input[1] as u16) << 8);
        let ip = Ipv4Addr::new(input[2], input[3], input[4], input[5]);

        match parse_extensions(&input[6..]) {
            IResult::Done(remaining, extensions) => {
                IResult::Done(remaining, PongMessage { port, ip, extensions })
            }
            IResult::Error(err) => IResult::Error(err),
            IResult::Incomplete(needed) => IResult::Incomplete(needed),
        }
    }
}
