//! Checksum computation for AUX bus frames
//!
//! The checksum byte is the two's complement of the 8-bit sum of every byte
//! between the start marker and the checksum itself (length, source,
//! destination, opcode, payload). Adding the checksum to that sum yields zero
//! modulo 256.

/// Compute the checksum over the checksummed region of a frame.
///
/// `data` must not include the leading start marker or the trailing checksum.
pub fn compute_checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Verify the checksum of a complete frame (start marker through checksum).
///
/// Returns `false` for anything too short to be a frame.
pub fn verify_checksum_bytes(frame: &[u8]) -> bool {
    if frame.len() < 6 {
        return false;
    }
    let data_end = frame.len() - 1;
    compute_checksum(&frame[1..data_end]) == frame[data_end]
}
