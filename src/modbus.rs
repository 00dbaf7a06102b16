use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// The largest number of holding registers a single read request may ask for.
pub const MAX_READ_COUNT: u16 = 125;

/// The largest number of holding registers a single write request may carry.
pub const MAX_WRITE_COUNT: u16 = 123;

const FN_READ_HOLDINGS: u8 = 3;
const FN_WRITE_HOLDING: u8 = 6;
const FN_WRITE_HOLDINGS: u8 = 16;

/// Length of the MBAP header fields that precede the `length`-counted part of a frame.
const HEADER_LENGTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    GetHoldings { address: u16, count: u16 },
    SetHolding { address: u16, value: u16 },
    SetHoldings { address: u16, values: Vec<u16> },
}

impl Operation {
    pub fn function_code(&self) -> u8 {
        match self {
            Operation::GetHoldings { .. } => FN_READ_HOLDINGS,
            Operation::SetHolding { .. } => FN_WRITE_HOLDING,
            Operation::SetHoldings { .. } => FN_WRITE_HOLDINGS,
        }
    }

    pub fn address(&self) -> u16 {
        match *self {
            Operation::GetHoldings { address, .. }
            | Operation::SetHolding { address, .. }
            | Operation::SetHoldings { address, .. } => address,
        }
    }

    /// Length of the protocol data unit, excluding the unit identifier.
    fn pdu_length(&self) -> usize {
        match self {
            Operation::GetHoldings { .. } | Operation::SetHolding { .. } => 5,
            Operation::SetHoldings { values, .. } => 6 + 2 * values.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    Exception { function: u8, code: u8 },
    GetHoldings { values: Vec<u16> },
    SetHolding { address: u16, value: u16 },
    SetHoldings { address: u16, count: u16 },
}

#[derive(Debug, Default)]
pub struct ModbusTCPCodec {}

impl Encoder<Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = u16::try_from(1 + req.operation.pdu_length()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "request is too large")
        })?;
        dst.reserve(HEADER_LENGTH + usize::from(length));
        dst.extend(req.transaction_id.to_be_bytes());
        dst.extend([0, 0]);
        dst.extend(length.to_be_bytes());
        dst.extend([req.unit_id, req.operation.function_code()]);
        match &req.operation {
            Operation::GetHoldings { address, count } => {
                dst.extend(address.to_be_bytes());
                dst.extend(count.to_be_bytes());
            }
            Operation::SetHolding { address, value } => {
                dst.extend(address.to_be_bytes());
                dst.extend(value.to_be_bytes());
            }
            Operation::SetHoldings { address, values } => {
                // `pdu_length` bounds this via the `length` conversion above.
                let count = values.len() as u16;
                dst.extend(address.to_be_bytes());
                dst.extend(count.to_be_bytes());
                dst.extend([(2 * values.len()) as u8]);
                for value in values {
                    dst.extend(value.to_be_bytes());
                }
            }
        };
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let Some((header, remainder)) = src.split_first_chunk::<HEADER_LENGTH>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            let protocol = u16::from_be_bytes([header[2], header[3]]);
            let length = u16::from_be_bytes([header[4], header[5]]);
            if protocol != 0 || length < 2 {
                // Not a frame boundary. Resynchronize one byte at a time.
                src.advance(1);
                continue;
            }
            let Some((data, _)) = remainder.split_at_checked(length.into()) else {
                return Ok(None);
            };
            let frame_length = HEADER_LENGTH + usize::from(length);
            let [unit_id, function_code, payload @ ..] = data else {
                unreachable!("length was checked to be at least 2");
            };
            let (unit_id, function_code) = (*unit_id, *function_code);
            let kind = if function_code & 0x80 != 0 {
                let [code, ..] = payload else {
                    src.advance(frame_length);
                    return Err(malformed("exception response without a code"));
                };
                ResponseKind::Exception { function: function_code & 0x7F, code: *code }
            } else {
                match (function_code, payload) {
                    (FN_READ_HOLDINGS, [byte_count, values @ ..]) => {
                        if usize::from(*byte_count) != values.len() || values.len() % 2 != 0 {
                            src.advance(frame_length);
                            return Err(malformed("read response byte count mismatch"));
                        }
                        let values = values
                            .chunks_exact(2)
                            .map(|word| u16::from_be_bytes([word[0], word[1]]))
                            .collect();
                        ResponseKind::GetHoldings { values }
                    }
                    (FN_WRITE_HOLDING, [a0, a1, v0, v1]) => ResponseKind::SetHolding {
                        address: u16::from_be_bytes([*a0, *a1]),
                        value: u16::from_be_bytes([*v0, *v1]),
                    },
                    (FN_WRITE_HOLDINGS, [a0, a1, c0, c1]) => ResponseKind::SetHoldings {
                        address: u16::from_be_bytes([*a0, *a1]),
                        count: u16::from_be_bytes([*c0, *c1]),
                    },
                    _ => {
                        src.advance(frame_length);
                        return Err(malformed("unsupported or truncated response"));
                    }
                }
            };
            src.advance(frame_length);
            return Ok(Some(Response { unit_id, transaction_id, kind }));
        }
    }
}

fn malformed(message: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}
