//! Text encodings accepted by [`Connection::write_text`](crate::Connection::write_text).

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Character encoding used to turn text into wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// UTF-8. Every Rust string is representable.
    #[default]
    Utf8,
    /// 7-bit US-ASCII, as required by plain IMAP command lines.
    Ascii,
    /// ISO-8859-1, one byte per code point up to U+00FF.
    Latin1,
}

impl Encoding {
    /// Encodes `text` into an owned byte buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] naming the first character the encoding
    /// cannot represent.
    pub fn encode(self, text: &str) -> Result<Bytes> {
        match self {
            Self::Utf8 => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Self::Ascii => match text.char_indices().find(|(_, c)| !c.is_ascii()) {
                Some((position, character)) => Err(self.unencodable(character, position)),
                None => Ok(Bytes::copy_from_slice(text.as_bytes())),
            },
            Self::Latin1 => {
                let mut out = BytesMut::with_capacity(text.len());
                for (position, character) in text.char_indices() {
                    let byte = u8::try_from(u32::from(character))
                        .map_err(|_| self.unencodable(character, position))?;
                    out.put_u8(byte);
                }
                Ok(out.freeze())
            }
        }
    }

    const fn unencodable(self, character: char, position: usize) -> Error {
        Error::Encoding {
            encoding: self,
            character,
            position,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Utf8 => "UTF-8",
            Self::Ascii => "US-ASCII",
            Self::Latin1 => "ISO-8859-1",
        })
    }
}
