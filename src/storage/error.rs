use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("piece {piece} is {actual} bytes, expected {expected}")]
    LengthMismatch {
        piece: u32,
        expected: u32,
        actual: usize,
    },
}
