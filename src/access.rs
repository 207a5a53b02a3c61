//! Access layer (C11): opcode framing on top of a reassembled upper transport PDU, and dispatch to
//! registered model handlers (§4.11).
//!
//! Model registration itself is out of core scope (§4.11); this module only owns the wire framing
//! and the size bounds a model handler can rely on.

use crate::bytes::{ByteReader, ByteWriter};
use crate::error::Error;

/// Maximum access payload (opcode excluded) on an unsegmented message.
pub const MAX_UNSEGMENTED_PARAMS: usize = 11;
/// Maximum access payload (opcode excluded) on a segmented message with a 32-bit TransMIC.
pub const MAX_SEGMENTED_PARAMS: usize = 380;
/// Maximum access payload (opcode excluded) on a segmented message with a 64-bit TransMIC.
pub const MAX_SEGMENTED_PARAMS_LARGE_MIC: usize = 376;

/// A decoded opcode: either a vendor-reserved single byte, a recognized double byte (16-bit
/// company ID implied), or a vendor triple byte (24-bit, company ID in the low two bytes).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Opcode {
    OneByte(u8),
    TwoByte(u8, u8),
    ThreeByte(u8, u8, u8),
}

impl Opcode {
    /// Number of bytes this opcode occupies on the wire.
    pub fn len(&self) -> usize {
        match self {
            Opcode::OneByte(_) => 1,
            Opcode::TwoByte(..) => 2,
            Opcode::ThreeByte(..) => 3,
        }
    }

    /// Writes this opcode's bytes to `out`.
    pub fn write(&self, out: &mut ByteWriter<'_>) -> Result<(), Error> {
        match *self {
            Opcode::OneByte(b0) => out.write_u8(b0),
            Opcode::TwoByte(b0, b1) => out.write_slice(&[b0, b1]),
            Opcode::ThreeByte(b0, b1, b2) => out.write_slice(&[b0, b1, b2]),
        }
    }
}

/// Parses the opcode at the front of an access payload, returning it along with the remaining
/// parameters (§4.11):
///
/// - top bit `0`: one byte, value `0x00..=0x7E` (`0x7F` is reserved and rejected).
/// - top two bits `10`: two bytes.
/// - top two bits `11`: three bytes.
pub fn parse_opcode<'a>(reader: &mut ByteReader<'a>) -> Result<Opcode, Error> {
    let b0 = reader.read_u8()?;
    if b0 & 0x80 == 0 {
        if b0 == 0x7F {
            return Err(Error::Inval);
        }
        Ok(Opcode::OneByte(b0))
    } else if b0 & 0x40 == 0 {
        let b1 = reader.read_u8()?;
        Ok(Opcode::TwoByte(b0, b1))
    } else {
        let b1 = reader.read_u8()?;
        let b2 = reader.read_u8()?;
        Ok(Opcode::ThreeByte(b0, b1, b2))
    }
}

/// A parsed access message: an opcode and its trailing parameters.
#[derive(Debug, Copy, Clone)]
pub struct AccessMessage<'a> {
    pub opcode: Opcode,
    pub params: &'a [u8],
}

/// Parses a full (decrypted, unwrapped) access message from `pdu`.
pub fn parse(pdu: &[u8]) -> Result<AccessMessage<'_>, Error> {
    let mut reader = ByteReader::new(pdu);
    let opcode = parse_opcode(&mut reader)?;
    let params = reader.read_rest();
    Ok(AccessMessage { opcode, params })
}

/// Checks `params.len()` against the size bound implied by whether the carrying message was
/// segmented and, if so, its `SZMIC` bit (§4.11).
pub fn check_param_bound(params_len: usize, segmented: bool, szmic: bool) -> Result<(), Error> {
    let max = if !segmented {
        MAX_UNSEGMENTED_PARAMS
    } else if szmic {
        MAX_SEGMENTED_PARAMS_LARGE_MIC
    } else {
        MAX_SEGMENTED_PARAMS
    };
    if params_len > max {
        Err(Error::Length)
    } else {
        Ok(())
    }
}

/// Serializes an access message (opcode ‖ params) into `out`, returning the byte count written.
pub fn write(opcode: Opcode, params: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    let mut writer = ByteWriter::new(out);
    opcode.write(&mut writer)?;
    writer.write_slice(params)?;
    Ok(out.len() - writer.space_left())
}

/// Dispatches a parsed access message to whichever of `handlers` claims its opcode.
///
/// A handler returns `Ok(true)` if it consumed the message, `Ok(false)` to let dispatch continue
/// trying other handlers, and `Err` to abort dispatch entirely. Returns `Error::NotFound` if no
/// handler claims the opcode.
pub fn dispatch<'a>(
    msg: &AccessMessage<'a>,
    handlers: &mut [&mut dyn FnMut(&AccessMessage<'a>) -> Result<bool, Error>],
) -> Result<(), Error> {
    for handler in handlers.iter_mut() {
        if handler(msg)? {
            return Ok(());
        }
    }
    Err(Error::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_byte_opcode() {
        let pdu = [0x02u8, 0xAA, 0xBB];
        let msg = parse(&pdu).unwrap();
        assert_eq!(msg.opcode, Opcode::OneByte(0x02));
        assert_eq!(msg.params, &[0xAA, 0xBB]);
    }

    #[test]
    fn reserved_one_byte_opcode_rejected() {
        let pdu = [0x7Fu8];
        assert_eq!(parse(&pdu).unwrap_err(), Error::Inval);
    }

    #[test]
    fn two_byte_opcode() {
        let pdu = [0x82u8, 0x01, 0xFF];
        let msg = parse(&pdu).unwrap();
        assert_eq!(msg.opcode, Opcode::TwoByte(0x82, 0x01));
        assert_eq!(msg.params, &[0xFF]);
    }

    #[test]
    fn three_byte_opcode() {
        let pdu = [0xC0u8, 0x01, 0x02, 0x03];
        let msg = parse(&pdu).unwrap();
        assert_eq!(msg.opcode, Opcode::ThreeByte(0xC0, 0x01, 0x02));
        assert_eq!(msg.params, &[0x03]);
    }

    #[test]
    fn round_trip_write_then_parse() {
        let mut buf = [0u8; 8];
        let n = write(Opcode::TwoByte(0x82, 0x04), &[0x01, 0x02], &mut buf).unwrap();
        let msg = parse(&buf[..n]).unwrap();
        assert_eq!(msg.opcode, Opcode::TwoByte(0x82, 0x04));
        assert_eq!(msg.params, &[0x01, 0x02]);
    }

    #[test]
    fn param_bounds() {
        assert!(check_param_bound(11, false, false).is_ok());
        assert!(check_param_bound(12, false, false).is_err());
        assert!(check_param_bound(380, true, false).is_ok());
        assert!(check_param_bound(381, true, false).is_err());
        assert!(check_param_bound(376, true, true).is_ok());
        assert!(check_param_bound(377, true, true).is_err());
    }

    #[test]
    fn dispatch_picks_first_matching_handler() {
        let pdu = [0x02u8, 0xAA];
        let msg = parse(&pdu).unwrap();
        let mut seen_first = false;
        let mut seen_second = false;
        let mut first = |_: &AccessMessage<'_>| -> Result<bool, Error> {
            seen_first = true;
            Ok(false)
        };
        let mut second = |_: &AccessMessage<'_>| -> Result<bool, Error> {
            seen_second = true;
            Ok(true)
        };
        dispatch(&msg, &mut [&mut first, &mut second]).unwrap();
        assert!(seen_first);
        assert!(seen_second);
    }

    #[test]
    fn dispatch_reports_not_found() {
        let pdu = [0x02u8];
        let msg = parse(&pdu).unwrap();
        let mut handler = |_: &AccessMessage<'_>| -> Result<bool, Error> { Ok(false) };
        assert_eq!(
            dispatch(&msg, &mut [&mut handler]).unwrap_err(),
            Error::NotFound
        );
    }
}
