//! Connection-phase payloads: the server's v10 handshake, the client's 4.1
//! handshake response, and the auth-switch request.

use mywire_core::{Error, Result};

use super::capabilities;
use super::cursor::ByteCursor;
use super::writer::PacketWriter;

/// The only protocol version spoken by servers since MySQL 3.21.
pub const PROTOCOL_VERSION: u8 = 10;

/// Leading byte of an auth-switch request.
pub const AUTH_SWITCH_MARKER: u8 = 0xFE;
/// Leading byte of an auth-more-data packet.
pub const AUTH_MORE_DATA_MARKER: u8 = 0x01;

/// Initial handshake sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Scramble used to salt the password hash
    pub auth_seed: Vec<u8>,
    pub capabilities: u32,
    /// Server default collation
    pub charset: u8,
    pub status_flags: u16,
    /// Plugin the server expects; `mysql_native_password` for old servers
    pub auth_plugin: String,
}

impl HandshakePacket {
    /// Decode a handshake payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut cursor = ByteCursor::new(payload);

        let protocol_version = cursor.read_u8()?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(Error::decode(format!(
                "unsupported protocol version {}",
                protocol_version
            )));
        }

        let server_version = cursor.read_null_string();
        let connection_id = cursor.read_u32_le()?;
        let mut auth_seed = cursor.read_bytes(8)?.to_vec();
        cursor.skip(1)?;
        let caps_lower = cursor.read_u16_le()?;

        // Pre-4.1 servers may end the packet here.
        if cursor.is_empty() {
            return Ok(Self {
                protocol_version,
                server_version,
                connection_id,
                auth_seed,
                capabilities: u32::from(caps_lower),
                charset: 0,
                status_flags: 0,
                auth_plugin: crate::auth::plugins::MYSQL_NATIVE_PASSWORD.to_string(),
            });
        }

        let charset = cursor.read_u8()?;
        let status_flags = cursor.read_u16_le()?;
        let caps_upper = cursor.read_u16_le()?;
        let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

        let seed_len = usize::from(cursor.read_u8()?);
        cursor.skip(10)?;

        if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = seed_len.saturating_sub(8).max(13).min(cursor.remaining());
            let part2 = cursor.read_bytes(part2_len)?;
            let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
            auth_seed.extend_from_slice(part2);
        }

        let auth_plugin = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            cursor.read_null_string()
        } else {
            String::new()
        };
        let auth_plugin = if auth_plugin.is_empty() {
            crate::auth::plugins::MYSQL_NATIVE_PASSWORD.to_string()
        } else {
            auth_plugin
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_seed,
            capabilities,
            charset,
            status_flags,
            auth_plugin,
        })
    }
}

/// Client reply to the handshake (Protocol::HandshakeResponse41).
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    /// Negotiated client capabilities
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub collation: u8,
    pub username: &'a str,
    /// Scrambled password; empty when no password is set
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
}

impl HandshakeResponse<'_> {
    /// Encode the response payload.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Vec<u8> {
        let caps = self.capabilities;
        let mut writer = PacketWriter::new();
        writer.write_u32_le(caps);
        writer.write_u32_le(self.max_packet_size);
        writer.write_u8(self.collation);
        writer.write_zeros(23);
        writer.write_null_string(self.username);

        if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(self.auth_response);
        } else if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            // Native-password scrambles are 20 bytes.
            writer.write_u8(self.auth_response.len() as u8);
            writer.write_bytes(self.auth_response);
        } else {
            writer.write_bytes(self.auth_response);
            writer.write_u8(0);
        }

        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.database.unwrap_or(""));
        }

        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.auth_plugin);
        }

        writer.into_bytes()
    }
}

/// Server request to restart authentication with another plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub seed: Vec<u8>,
}

impl AuthSwitchRequest {
    /// Decode an auth-switch payload (including the leading 0xFE).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut cursor = ByteCursor::new(payload);
        let marker = cursor.read_u8()?;
        if marker != AUTH_SWITCH_MARKER {
            return Err(Error::decode(format!(
                "expected auth switch request, got leading byte 0x{:02X}",
                marker
            )));
        }
        let plugin = cursor.read_null_string();
        let seed = cursor.read_rest();
        let seed = seed.strip_suffix(&[0]).unwrap_or(seed);
        Ok(Self {
            plugin,
            seed: seed.to_vec(),
        })
    }
}
