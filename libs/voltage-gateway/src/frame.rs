//! Modbus RTU framing for the gateway tunnel
//!
//! Only "read holding registers" requests are built here. The gateway answers
//! with the register payload, so no response frame parsing is needed.

use tracing::debug;

/// Function code 0x03: read holding registers
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Length of a read request frame: slave + fc + addr(2) + count(2) + crc(2)
pub const READ_FRAME_LEN: usize = 8;

/// Calculate the Modbus CRC16 (poly 0xA001, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if (crc & 0x0001) != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Build an RTU read frame: slave, fc, address BE, count BE, CRC LE
pub fn build_read_frame(slave_id: u8, function: u8, address: u16, count: u16) -> [u8; READ_FRAME_LEN] {
    let mut frame = [0u8; READ_FRAME_LEN];
    frame[0] = slave_id;
    frame[1] = function;
    frame[2..4].copy_from_slice(&address.to_be_bytes());
    frame[4..6].copy_from_slice(&count.to_be_bytes());

    let crc = crc16(&frame[..6]);
    frame[6..8].copy_from_slice(&crc.to_le_bytes());

    debug!(
        "RTU frame: slave={}, FC={:02X}, addr={}, count={}, CRC={:04X}",
        slave_id, function, address, count, crc
    );
    frame
}
