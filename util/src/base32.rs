//! The store's base32 alphabet. Unlike RFC 4648, the alphabet omits
//! `e o t u` and the encoding packs nibbles big-endian, so strings read
//! "backwards" relative to the byte order.

use crate::*;
use once_cell::sync::Lazy;

pub static ALPHABET: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

static REVERSE: Lazy<[u8; 256]> = Lazy::new(|| {
  let mut table = [0xffu8; 256];
  for (value, ch) in ALPHABET.iter().enumerate() {
    table[*ch as usize] = value as u8;
  }
  table
});

pub fn is_base32(c: char) -> bool {
  c.is_ascii() && REVERSE[c as usize] != 0xff
}

pub fn encoded_len(bytes: usize) -> usize {
  if bytes == 0 {
    0
  } else {
    (bytes * 8 - 1) / 5 + 1
  }
}

pub fn decoded_len(chars: usize) -> usize {
  chars * 5 / 8
}

pub fn encode(input: &[u8]) -> String {
  let mut out = vec![0u8; encoded_len(input.len())];
  encode_into(input, &mut out);
  // the alphabet is pure ASCII
  unsafe { String::from_utf8_unchecked(out) }
}

pub fn encode_into(input: &[u8], output: &mut [u8]) {
  assert_eq!(output.len(), encoded_len(input.len()));

  let mut held: u16 = 0;
  let mut held_bits = 0usize;
  let mut pos = output.len();

  for byte in input {
    held |= (*byte as u16) << held_bits;
    held_bits += 8;
    while held_bits > 5 {
      pos -= 1;
      output[pos] = ALPHABET[(held & 0x1f) as usize];
      held >>= 5;
      held_bits -= 5;
    }
  }

  if held_bits > 0 {
    pos -= 1;
    output[pos] = ALPHABET[(held & 0x1f) as usize];
  }

  assert_eq!(pos, 0);
}

pub fn decode(input: &[u8]) -> Result<Vec<u8>> {
  let mut out = vec![0u8; decoded_len(input.len())];
  decode_into(input, &mut out)?;
  Ok(out)
}

pub fn decode_into(input: &[u8], output: &mut [u8]) -> Result<()> {
  let mut held: u16 = 0;
  let mut held_bits = 0usize;
  let mut pos = 0usize;

  for c in input.iter().rev() {
    let value = REVERSE[*c as usize];
    ensure!(value != 0xff, "invalid base32 character `{}'", *c as char);
    held |= (value as u16) << held_bits;
    held_bits += 5;
    if held_bits >= 8 {
      ensure!(pos < output.len(), "base32 input has invalid length");
      output[pos] = held as u8;
      pos += 1;
      held >>= 8;
      held_bits -= 8;
    }
  }

  // leftover bits must all be zero padding
  ensure!(
    held_bits == 0 || held == 0,
    "base32 input has invalid length"
  );

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn known_vectors() {
    assert_eq!(encode(&[]), "");

    let sha1 = hex::decode("0839703786356bca59b0f4a32987eb2e6de43ae8").unwrap();
    assert_eq!(encode(&sha1), "x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88");

    let sha256 =
      hex::decode("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad").unwrap();
    assert_eq!(
      encode(&sha256),
      "1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"
    );

    assert_eq!(
      hex::encode(decode(b"x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88").unwrap()),
      "0839703786356bca59b0f4a32987eb2e6de43ae8"
    );
  }

  #[test]
  fn rejects_garbage() {
    assert!(decode(b"xoxf8v9fxf3jk8zln1cwlsrmhqvp0f88").is_err());
    assert!(decode(b"2").is_err());
    assert!(decode(b"2gs").is_err());
    // high leftover bits that cannot come from a byte string
    assert!(decode(b"zz").is_err());
  }

  proptest! {
    #[test]
    fn roundtrip(bytes: Vec<u8>) {
      prop_assert_eq!(&decode(encode(&bytes).as_bytes()).unwrap(), &bytes);
    }
  }
}
