//! Flat-buffer codec for the fixed 1036-byte NRPE v2 packet. Fields live at
//! explicit offsets, integers are big-endian, and the whole packet is
//! guarded by a CRC32-IEEE checksum computed with the crc field zeroed.

use crate::protocol::Response;

pub const PACKET_SIZE: usize = 1036;
pub const BUFFER_SIZE: usize = 1024;
pub const PACKET_VERSION: i16 = 2;
pub const QUERY_PACKET: i16 = 1;
pub const RESPONSE_PACKET: i16 = 2;

const VERSION_OFFSET: usize = 0;
const TYPE_OFFSET: usize = 2;
const CRC_OFFSET: usize = 4;
const RESULT_CODE_OFFSET: usize = 8;
const BUFFER_OFFSET: usize = 10;
// The last two bytes are C struct padding, always zero on encode.

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("expected a {PACKET_SIZE} byte packet, got {0} bytes")]
    BadPacketSize(usize),
    #[error("checksum mismatch: packet says {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("packet buffer holds no command")]
    EmptyBuffer,
}

/// CRC32-IEEE over the packet with the crc field zeroed out.
fn checksum(packet: &[u8]) -> u32 {
    let mut scratch = packet.to_vec();
    scratch[CRC_OFFSET..CRC_OFFSET + 4].fill(0);
    crc32fast::hash(&scratch)
}

fn write_header(packet: &mut [u8], packet_type: i16, result_code: i16) {
    packet[VERSION_OFFSET..VERSION_OFFSET + 2].copy_from_slice(&PACKET_VERSION.to_be_bytes());
    packet[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&packet_type.to_be_bytes());
    packet[RESULT_CODE_OFFSET..RESULT_CODE_OFFSET + 2].copy_from_slice(&result_code.to_be_bytes());
}

/// Copies `payload` into the buffer region, truncating at one byte short of
/// capacity so the C-string NUL terminator always survives.
fn write_buffer(packet: &mut [u8], payload: &[u8]) {
    let len = payload.len().min(BUFFER_SIZE - 1);
    packet[BUFFER_OFFSET..BUFFER_OFFSET + len].copy_from_slice(&payload[..len]);
}

fn seal(packet: &mut [u8]) {
    let crc = checksum(packet);
    packet[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());
}

/// Extracts the command name and ordered arguments from an inbound query.
/// The buffer is a NUL-terminated string split on `!`; the first token is
/// the command, the rest are arguments.
pub fn decode(packet: &[u8]) -> Result<(String, Vec<String>), PacketError> {
    if packet.len() != PACKET_SIZE {
        return Err(PacketError::BadPacketSize(packet.len()));
    }

    let expected = u32::from_be_bytes(
        packet[CRC_OFFSET..CRC_OFFSET + 4]
            .try_into()
            .unwrap_or([0; 4]),
    );
    let computed = checksum(packet);
    if expected != computed {
        return Err(PacketError::ChecksumMismatch { expected, computed });
    }

    let buffer = &packet[BUFFER_OFFSET..BUFFER_OFFSET + BUFFER_SIZE];
    let end = buffer.iter().position(|&b| b == 0).unwrap_or(BUFFER_SIZE);
    let text = String::from_utf8_lossy(&buffer[..end]);

    let mut tokens = text.split('!').map(str::to_string);
    match tokens.next().filter(|cmd| !cmd.is_empty()) {
        Some(command) => Ok((command, tokens.collect())),
        None => Err(PacketError::EmptyBuffer),
    }
}

/// Builds an outbound response packet. Stdout lines are newline-joined into
/// the buffer and silently truncated at 1023 bytes; the result code carries
/// the Nagios status.
pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_SIZE];
    write_header(&mut packet, RESPONSE_PACKET, i64::from(response.status) as i16);
    write_buffer(&mut packet, response.stdout.join("\n").as_bytes());
    seal(&mut packet);
    packet
}

/// Builds a query packet, joining command and arguments with `!`. Only
/// test clients send queries; the listener side just decodes them.
#[cfg(test)]
pub fn encode_query(command: &str, arguments: &[String]) -> Vec<u8> {
    let mut buffer = command.to_string();
    for argument in arguments {
        buffer.push('!');
        buffer.push_str(argument);
    }

    let mut packet = vec![0u8; PACKET_SIZE];
    write_header(&mut packet, QUERY_PACKET, 0);
    write_buffer(&mut packet, buffer.as_bytes());
    seal(&mut packet);
    packet
}
