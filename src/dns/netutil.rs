//! helpers for the two byte length framing DNS uses over TCP

use std::io::{Read, Result, Write};

pub fn read_packet_length<R: Read>(stream: &mut R) -> Result<u16> {
    let mut len_buffer = [0; 2];
    stream.read_exact(&mut len_buffer)?;

    Ok(u16::from_be_bytes(len_buffer))
}

pub fn write_packet_length<W: Write>(stream: &mut W, len: usize) -> Result<()> {
    stream.write_all(&(len as u16).to_be_bytes())?;

    Ok(())
}
