//! Program images on disk: a contiguous sequence of 64-bit little-endian
//! words, loaded at a caller-chosen physical base.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("image length {0} is not a multiple of 8 bytes")]
    TruncatedWord(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Split an image into instruction words.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u64>, LoaderError> {
    if bytes.len() % 8 != 0 {
        return Err(LoaderError::TruncatedWord(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}

pub fn bytes_from_words(words: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 8);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

pub fn read_image<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, LoaderError> {
    let mut file = File::open(path)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    Ok(buffer)
}

pub fn read_words<P: AsRef<Path>>(path: P) -> Result<Vec<u64>, LoaderError> {
    words_from_bytes(&read_image(path)?)
}

pub fn write_words<P: AsRef<Path>>(path: P, words: &[u64]) -> Result<(), LoaderError> {
    let mut file = File::create(path)?;
    file.write_all(&bytes_from_words(words))?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_round_trip_little_endian() {
        let words = vec![0x0123_4567_89AB_CDEF, 0x16_u64 << 58];
        let bytes = bytes_from_words(&words);
        assert_eq!(&bytes[..8], &[0xEF, 0xCD, 0xAB, 0x89, 0x67, 0x45, 0x23, 0x01]);
        assert_eq!(words_from_bytes(&bytes).unwrap(), words);
    }

    #[test]
    fn ragged_images_are_rejected() {
        assert!(matches!(
            words_from_bytes(&[0; 12]),
            Err(LoaderError::TruncatedWord(12))
        ));
    }
}
