//! The wire codec (C1): `postcard` over `serde`.
//!
//! `postcard::from_bytes` already errors if the supplied slice has bytes left
//! over after decoding, which is exactly the "must consume exactly the
//! supplied bytes" contract this crate needs — no extra bookkeeping required.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    Ok(postcard::to_stdvec(value)?)
}

pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    Ok(postcard::from_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn round_trips() {
        let p = Point { x: 3, y: -7 };
        let bytes = serialize(&p).unwrap();
        let back: Point = deserialize(&bytes).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn rejects_trailing_bytes() {
        let p = Point { x: 1, y: 2 };
        let mut bytes = serialize(&p).unwrap();
        bytes.push(0xFF);
        let result: Result<Point, Error> = deserialize(&bytes);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_truncated_bytes() {
        let p = Point { x: 1, y: 2 };
        let bytes = serialize(&p).unwrap();
        let truncated = &bytes[..bytes.len() - 1];
        let result: Result<Point, Error> = deserialize(truncated);
        assert!(result.is_err());
    }
}
