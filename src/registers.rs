//! Decoding of fetched register words into typed values.
//!
//! Register blocks are fetched with a single (possibly chunked) read and then consumed front to
//! back with a [`RegisterCursor`]. Every consumer names the field being decoded, so that a
//! failure can point at the exact register that did not match expectations.

use std::net::Ipv4Addr;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("ran out of registers while decoding `{field}` at register {address}")]
    Underrun { field: &'static str, address: u16 },
    #[error("`{field}` at register {address} holds value {value} which is not recognized")]
    UnknownValue { field: &'static str, address: u16, value: u16 },
    #[error("`{field}` at register {address} has unrecognized bits set in {value:#06x}")]
    UnknownFlags { field: &'static str, address: u16, value: u16 },
    #[error("`{field}` at register {address} holds {value}, which is out of range")]
    OutOfRange { field: &'static str, address: u16, value: u16 },
    #[error("`{field}` at register {address} is not a valid date or time")]
    InvalidDateTime {
        field: &'static str,
        address: u16,
        #[source]
        source: jiff::Error,
    },
    #[error("`{field}` at register {address} reports {count} entries, at most {max} are expected")]
    CountOutOfRange { field: &'static str, address: u16, count: u16, max: u16 },
    #[error("{count} registers were left over after decoding `{field}` ending at register {address}")]
    TrailingRegisters { field: &'static str, address: u16, count: usize },
}

/// An enumeration stored in a single register.
pub trait RegisterEnum: Sized + Copy {
    fn from_register(value: u16) -> Option<Self>;
    fn to_register(self) -> u16;
}

macro_rules! register_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$variant_meta:meta])* $variant:ident = $value:literal),* $(,)?
        }
    ) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            serde::Serialize,
            strum::VariantNames,
            strum::VariantArray,
            strum::FromRepr,
            strum::IntoStaticStr,
            strum::EnumString,
            strum::Display,
        )]
        #[strum(serialize_all = "kebab-case")]
        #[serde(rename_all = "kebab-case")]
        #[repr(u16)]
        $(#[$meta])*
        $vis enum $name {
            $($(#[$variant_meta])* $variant = $value),*
        }

        impl $crate::registers::RegisterEnum for $name {
            fn from_register(value: u16) -> Option<Self> {
                Self::from_repr(value)
            }

            fn to_register(self) -> u16 {
                self as u16
            }
        }
    };
}

pub(crate) use register_enum;

pub fn join_u32(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

/// Split a value into `(high, low)` words.
pub fn split_u32(value: u32) -> (u16, u16) {
    ((value >> 16) as u16, value as u16)
}

/// Split a register into its `(high, low)` bytes.
pub fn unpack_u8_pair(register: u16) -> (u8, u8) {
    ((register >> 8) as u8, register as u8)
}

pub fn pack_u8_pair(high: u8, low: u8) -> u16 {
    (u16::from(high) << 8) | u16::from(low)
}

/// Decode an enumeration packed into part of a register.
pub fn decode_enum<E: RegisterEnum>(
    value: u16,
    field: &'static str,
    address: u16,
) -> Result<E, DecodeError> {
    E::from_register(value).ok_or(DecodeError::UnknownValue { field, address, value })
}

/// Narrow a register value to a smaller integer type without wrapping.
pub fn narrow<T: TryFrom<u16>>(
    value: impl Into<u16>,
    field: &'static str,
    address: u16,
) -> Result<T, DecodeError> {
    let value = value.into();
    T::try_from(value).map_err(|_| DecodeError::OutOfRange { field, address, value })
}

/// `None` when the raw value is the field's "not available" marker.
pub fn sentinel<T: PartialEq>(value: T, absent: T) -> Option<T> {
    (value != absent).then_some(value)
}

/// Scale a tenths-of-a-unit register value.
pub fn tenths(raw: impl Into<i32>) -> f32 {
    raw.into() as f32 / 10.0
}

/// Inverse of [`tenths`], rounding to the nearest representable register value.
pub fn to_tenths(value: f32) -> i32 {
    (value * 10.0).round() as i32
}

/// Assemble a date from its register parts, rejecting impossible ones.
pub fn date_from_parts(
    year: i16,
    month: u8,
    day: u8,
    field: &'static str,
    address: u16,
) -> Result<jiff::civil::Date, DecodeError> {
    let (month, day) = (narrow(month, field, address)?, narrow(day, field, address)?);
    jiff::civil::Date::new(year, month, day)
        .map_err(|source| DecodeError::InvalidDateTime { field, address, source })
}

/// Sequential single-pass reader over a block of register words.
///
/// Each consumer advances the cursor by the number of registers it declares and fails with
/// [`DecodeError::Underrun`] rather than making up values once the block is exhausted.
pub struct RegisterCursor<'a> {
    words: &'a [u16],
    base: u16,
    position: usize,
}

impl<'a> RegisterCursor<'a> {
    /// `words` must have been read starting at register `base`.
    pub fn new(base: u16, words: &'a [u16]) -> Self {
        Self { words, base, position: 0 }
    }

    /// Address of the register the next consumer will read.
    pub fn address(&self) -> u16 {
        self.base.wrapping_add(self.position as u16)
    }

    pub fn remaining(&self) -> usize {
        self.words.len() - self.position
    }

    fn take<const N: usize>(&mut self, field: &'static str) -> Result<[u16; N], DecodeError> {
        let address = self.address();
        let Some(words) = self.words[self.position..].first_chunk::<N>() else {
            return Err(DecodeError::Underrun { field, address });
        };
        self.position += N;
        Ok(*words)
    }

    pub fn u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        let [word] = self.take(field)?;
        Ok(word)
    }

    pub fn i16(&mut self, field: &'static str) -> Result<i16, DecodeError> {
        Ok(self.u16(field)? as i16)
    }

    /// Two registers, high word first.
    pub fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let [high, low] = self.take(field)?;
        Ok(join_u32(high, low))
    }

    /// One register split into its `(high, low)` bytes.
    pub fn u8_pair(&mut self, field: &'static str) -> Result<(u8, u8), DecodeError> {
        Ok(unpack_u8_pair(self.u16(field)?))
    }

    pub fn bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        Ok(self.u16(field)? != 0)
    }

    /// A signed tenths-of-a-unit value, such as a temperature.
    pub fn tenths_i16(&mut self, field: &'static str) -> Result<f32, DecodeError> {
        Ok(tenths(self.i16(field)?))
    }

    /// An unsigned tenths-of-a-unit value, such as an actuator level.
    pub fn tenths_u16(&mut self, field: &'static str) -> Result<f32, DecodeError> {
        Ok(tenths(self.u16(field)?))
    }

    pub fn skip(&mut self, count: usize, field: &'static str) -> Result<(), DecodeError> {
        if self.remaining() < count {
            return Err(DecodeError::Underrun { field, address: self.address() });
        }
        self.position += count;
        Ok(())
    }

    /// `registers` words of two characters each, high byte first, cut at the first NUL.
    pub fn string(&mut self, registers: usize, field: &'static str) -> Result<String, DecodeError> {
        if self.remaining() < registers {
            return Err(DecodeError::Underrun { field, address: self.address() });
        }
        let words = &self.words[self.position..][..registers];
        self.position += registers;
        let bytes = words
            .iter()
            .flat_map(|word| word.to_be_bytes())
            .take_while(|&byte| byte != 0)
            .collect::<Vec<_>>();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn ipv4(&mut self, field: &'static str) -> Result<Ipv4Addr, DecodeError> {
        Ok(Ipv4Addr::from(self.u32(field)?))
    }

    /// Hour and minute packed into one register, optionally followed by a seconds register.
    pub fn time(
        &mut self,
        read_seconds: bool,
        field: &'static str,
    ) -> Result<jiff::civil::Time, DecodeError> {
        let address = self.address();
        let (hour, minute) = self.u8_pair(field)?;
        let (hour, minute) = (narrow(hour, field, address)?, narrow(minute, field, address)?);
        let second = if read_seconds {
            let address = self.address();
            narrow(self.u16(field)?, field, address)?
        } else {
            0
        };
        jiff::civil::Time::new(hour, minute, second, 0).map_err(|source| {
            DecodeError::InvalidDateTime { field, address, source }
        })
    }

    /// Month and day packed into one register, followed by the year.
    pub fn date(&mut self, field: &'static str) -> Result<jiff::civil::Date, DecodeError> {
        let address = self.address();
        let (month, day) = self.u8_pair(field)?;
        let year_address = self.address();
        let year = narrow(self.u16(field)?, field, year_address)?;
        date_from_parts(year, month, day, field, address)
    }

    pub fn enumeration<E: RegisterEnum>(&mut self, field: &'static str) -> Result<E, DecodeError> {
        let address = self.address();
        decode_enum(self.u16(field)?, field, address)
    }

    /// Assert the whole block has been consumed.
    pub fn finish(self, field: &'static str) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            count => Err(DecodeError::TrailingRegisters { field, address: self.address(), count }),
        }
    }
}
