use super::*;
use crate::torrent::{InfoHash, TorrentDescriptor};
use tempfile::TempDir;

fn descriptor(total: u64, piece_length: u32) -> TorrentDescriptor {
    let count = total.div_ceil(piece_length as u64) as usize;
    TorrentDescriptor::new(
        InfoHash([0u8; 20]),
        total,
        piece_length,
        vec![[0u8; 20]; count],
        vec![],
    )
    .unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
}

#[test]
fn test_file_writer_preallocates() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("out.bin");
    let writer = FileWriter::create(&path, &descriptor(40000, 16384)).unwrap();

    assert_eq!(writer.path(), path.as_path());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 40000);
}

#[test]
fn test_file_writer_places_pieces_at_offsets() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nested/out.bin");
    let writer = FileWriter::create(&path, &descriptor(40000, 16384)).unwrap();

    // out of order on purpose
    let last = pattern(40000 - 2 * 16384, 3);
    let first = pattern(16384, 1);
    let middle = pattern(16384, 2);
    writer.write_piece(2, &last).unwrap();
    writer.write_piece(0, &first).unwrap();
    writer.write_piece(1, &middle).unwrap();

    let contents = std::fs::read(&path).unwrap();
    assert_eq!(&contents[..16384], first.as_slice());
    assert_eq!(&contents[16384..32768], middle.as_slice());
    assert_eq!(&contents[32768..], last.as_slice());
}

#[test]
fn test_file_writer_reads_blocks() {
    let temp = TempDir::new().unwrap();
    let writer =
        FileWriter::create(temp.path().join("out.bin"), &descriptor(32768, 16384)).unwrap();

    let piece = pattern(16384, 9);
    writer.write_piece(1, &piece).unwrap();

    let block = writer.read_block(1, 100, 50).unwrap().unwrap();
    assert_eq!(&block[..], &piece[100..150]);

    assert!(writer.read_block(1, 16000, 1000).unwrap().is_none());
    assert!(writer.read_block(5, 0, 10).unwrap().is_none());
}

#[test]
fn test_file_writer_open_keeps_contents() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("out.bin");
    let d = descriptor(32768, 16384);

    let piece = pattern(16384, 4);
    FileWriter::create(&path, &d).unwrap().write_piece(0, &piece).unwrap();

    let reopened = FileWriter::open(&path, &d).unwrap();
    let block = reopened.read_block(0, 0, 16384).unwrap().unwrap();
    assert_eq!(&block[..], piece.as_slice());
}

#[test]
fn test_writer_rejects_bad_pieces() {
    let temp = TempDir::new().unwrap();
    let writer =
        FileWriter::create(temp.path().join("out.bin"), &descriptor(40000, 16384)).unwrap();

    assert!(matches!(
        writer.write_piece(3, &[0u8; 16]),
        Err(StorageError::InvalidPieceIndex(3))
    ));
    assert!(matches!(
        writer.write_piece(2, &[0u8; 16384]),
        Err(StorageError::LengthMismatch {
            piece: 2,
            expected: 7232,
            actual: 16384
        })
    ));
}

#[test]
fn test_memory_writer_contents() {
    let d = descriptor(20, 8);
    let writer = MemoryWriter::new(&d);

    writer.write_piece(1, &pattern(8, 8)).unwrap();
    assert!(writer.contents().is_none());

    writer.write_piece(0, &pattern(8, 0)).unwrap();
    writer.write_piece(2, &pattern(4, 16)).unwrap();

    assert_eq!(writer.contents().unwrap(), pattern(20, 0));
    assert_eq!(writer.write_count(), 3);
    assert_eq!(&writer.read_block(2, 1, 2).unwrap().unwrap()[..], &[17, 18]);
}

#[test]
fn test_memory_writer_injected_failures() {
    let writer = MemoryWriter::new(&descriptor(8, 8));
    writer.fail_writes(2);

    assert!(matches!(writer.write_piece(0, &[0u8; 8]), Err(StorageError::Io(_))));
    assert!(matches!(writer.write_piece(0, &[0u8; 8]), Err(StorageError::Io(_))));
    assert!(writer.write_piece(0, &[0u8; 8]).is_ok());
    assert_eq!(writer.write_count(), 1);
}

#[test]
fn test_default_read_block_is_unsupported() {
    struct Sink;
    impl PieceWriter for Sink {
        fn write_piece(&self, _index: u32, _data: &[u8]) -> Result<(), StorageError> {
            Ok(())
        }
    }

    assert!(Sink.read_block(0, 0, 16).unwrap().is_none());
}
