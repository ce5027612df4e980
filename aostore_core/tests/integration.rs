/// Integration tests for the storage write and read sessions: blocks written
/// through `StorageWrite` land on disk in the append-only block format and
/// come back unchanged through `StorageRead`, including large content,
/// compression, padding and the ordering of physical writes and WAL records.
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aostore_codecs::BundledCodecs;
use aostore_core::codec::Codec;
use aostore_core::format::{decode_header, get_header_info, EXECUTOR_KIND_NONE, EXECUTOR_KIND_VAR_BLOCK};
use aostore_core::{
    BlockHeader, CodecProvider, CompressionKind, Error, ErrorClass, FormatVersion, HeaderKind, RecordingWal,
    RelFileNode, StorageAttributes, StorageRead, StorageWrite, WriteStats,
};

/// Generate `len` deterministic bytes using a simple LCG.
fn pseudo_random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = seed;
    (0..len)
        .map(|_| {
            rng = rng
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (rng >> 56) as u8
        })
        .collect()
}

/// Generate `len` highly compressible bytes (repeating pattern).
fn compressible_bytes(len: usize) -> Vec<u8> {
    let pattern = b"the quick brown fox jumps over the lazy dog. ";
    (0..len).map(|i| pattern[i % pattern.len()]).collect()
}

// ── helpers ───────────────────────────────────────────────────────────────

const NODE: RelFileNode = RelFileNode {
    tablespace: 1663,
    database: 5,
    relation: 16384,
};

fn small_blocks() -> StorageAttributes {
    StorageAttributes {
        block_size: 8192,
        ..StorageAttributes::default()
    }
}

fn open_writer(path: &Path, attrs: &StorageAttributes, eof: u64, eof_uncompressed: u64) -> StorageWrite {
    let mut w = StorageWrite::new(attrs.clone(), "t", "test", Some(&BundledCodecs)).unwrap();
    w.create_file(path, NODE, 0).unwrap();
    w.open_file(path, FormatVersion::LATEST, eof, eof_uncompressed, NODE, 0)
        .unwrap();
    w
}

/// One logical block: explicit first row number, content, row count.
type Block = (Option<i64>, Vec<u8>, u32);

fn write_blocks(path: &Path, attrs: &StorageAttributes, blocks: &[Block]) -> (u64, u64, WriteStats) {
    let mut w = open_writer(path, attrs, 0, 0);
    for (frn, content, rows) in blocks {
        if let Some(frn) = frn {
            w.set_first_row_num(*frn).unwrap();
        }
        w.content(content, EXECUTOR_KIND_VAR_BLOCK, *rows).unwrap();
    }
    let (eof, eof_uncompressed) = w.flush_and_close_file().unwrap();
    let stats = w.stats();
    w.finish_session();
    (eof, eof_uncompressed, stats)
}

/// Every block as `(first_row_num, content, row_count)`.
fn read_all(path: &Path, attrs: &StorageAttributes, eof: u64) -> Vec<(i64, Vec<u8>, u32)> {
    let mut r = StorageRead::new(attrs.clone(), "t", "test", Some(&BundledCodecs)).unwrap();
    r.open_file(path, FormatVersion::LATEST, eof).unwrap();
    let mut out = Vec::new();
    while r.read_next_block().unwrap() {
        let block = *r.current().unwrap();
        out.push((block.first_row_num, r.content().unwrap().to_vec(), block.row_count()));
    }
    r.finish_session();
    out
}

/// Kinds of the physical blocks in a file, fragments included.
fn physical_kinds(path: &Path, attrs: &StorageAttributes) -> Vec<HeaderKind> {
    let data = fs::read(path).unwrap();
    let mut kinds = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let bytes = &data[offset..];
        let (_, header_len) = get_header_info(bytes, attrs.checksum).unwrap();
        let info = decode_header(&bytes[..header_len], attrs.checksum, attrs.max_buffer_len(), FormatVersion::LATEST)
            .unwrap();
        kinds.push(info.kind);
        offset += info.overall_block_len;
    }
    kinds
}

fn segment_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("16384")
}

// ── tests ──────────────────────────────────────────────────────────────────

#[test]
fn test_roundtrip_across_settings() {
    let blocks: Vec<Block> = vec![
        (Some(1), compressible_bytes(3000), 30),
        (None, pseudo_random_bytes(1500, 7), 15),
        (Some(1000), compressible_bytes(8), 1),
        (None, pseudo_random_bytes(4000, 11), 40),
    ];
    let settings = [
        StorageAttributes::default(),
        StorageAttributes {
            checksum: false,
            ..StorageAttributes::default()
        },
        StorageAttributes::compressed(CompressionKind::Zstd, 1),
        StorageAttributes {
            checksum: false,
            ..StorageAttributes::compressed(CompressionKind::Lz4, 1)
        },
        StorageAttributes {
            verify_write: true,
            ..StorageAttributes::compressed(CompressionKind::Zlib, 6)
        },
    ];
    for attrs in &settings {
        let dir = tempfile::tempdir().unwrap();
        let path = segment_path(&dir);
        let (eof, _, stats) = write_blocks(&path, attrs, &blocks);
        assert_eq!(stats.blocks, 4);
        if attrs.compress.is_some() {
            assert!(stats.compressed_blocks >= 1, "compressible blocks should shrink with {:?}", attrs);
        }

        let back = read_all(&path, attrs, eof);
        assert_eq!(back.len(), blocks.len());
        let expected_frn = [1, 31, 1000, 1001];
        for ((frn, content, rows), (orig, want_frn)) in back.iter().zip(blocks.iter().zip(expected_frn)) {
            assert_eq!(content, &orig.1, "content differs with {:?}", attrs);
            assert_eq!(*rows, orig.2);
            assert_eq!(*frn, want_frn);
        }
    }
}

#[test]
fn test_flush_accounting() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = StorageAttributes::default();
    let blocks: Vec<Block> = [10usize, 100, 1000]
        .iter()
        .map(|&n| (None, pseudo_random_bytes(n, n as u64), 1))
        .collect();
    let (eof, eof_uncompressed, stats) = write_blocks(&path, &attrs, &blocks);

    // 16-byte SmallContent header with checksum, content padded to 8 bytes
    assert_eq!(eof, (16 + 16) + (16 + 104) + (16 + 1000));
    assert_eq!(eof_uncompressed, eof);
    assert_eq!(fs::metadata(&path).unwrap().len(), eof);
    assert_eq!(stats.bytes_written, eof);
    assert_eq!(stats.physical_writes, 1);

    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = StorageAttributes::compressed(CompressionKind::Zstd, 3);
    let blocks: Vec<Block> = [1000usize, 5000]
        .iter()
        .map(|&n| (None, compressible_bytes(n), 1))
        .collect();
    let (eof, eof_uncompressed, stats) = write_blocks(&path, &attrs, &blocks);
    assert_eq!(stats.compressed_blocks, 2);
    assert_eq!(eof_uncompressed, (16 + 1000) + (16 + 5000));
    assert!(eof < eof_uncompressed);
    assert_eq!(fs::metadata(&path).unwrap().len(), eof);
}

#[test]
fn test_large_content_is_fragmented() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = small_blocks();
    let fragment_capacity = 8192 - 16;
    let len = 3 * 8192 + 100;
    let value = pseudo_random_bytes(len, 42);

    let blocks: Vec<Block> = vec![
        (Some(1), compressible_bytes(64), 4),
        (Some(5), value.clone(), 1),
        (None, compressible_bytes(32), 2),
    ];
    let (eof, _, stats) = write_blocks(&path, &attrs, &blocks);
    let fragments = len.div_ceil(fragment_capacity);
    assert_eq!(stats.large_contents, 1);
    assert_eq!(stats.blocks as usize, 2 + 1 + fragments);

    let kinds = physical_kinds(&path, &attrs);
    assert_eq!(kinds.len(), 2 + 1 + fragments);
    assert_eq!(kinds[1], HeaderKind::LargeContent);
    assert!(kinds[2..2 + fragments].iter().all(|&k| k == HeaderKind::SmallContent));

    // fragments are folded into the large content block on read
    let back = read_all(&path, &attrs, eof);
    assert_eq!(back.len(), 3);
    assert_eq!(back[1], (5, value, 1));
    assert_eq!(back[2].0, 6);
}

#[test]
fn test_large_content_skipped_without_decoding() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = small_blocks();
    let blocks: Vec<Block> = vec![
        (Some(1), pseudo_random_bytes(20_000, 3), 1),
        (None, compressible_bytes(100), 9),
    ];
    let (eof, _, _) = write_blocks(&path, &attrs, &blocks);

    let mut r = StorageRead::new(attrs, "t", "test", None).unwrap();
    r.open_file(&path, FormatVersion::LATEST, eof).unwrap();
    assert!(r.read_next_block().unwrap());
    assert_eq!(r.current().unwrap().info.kind, HeaderKind::LargeContent);
    assert!(r.read_next_block().unwrap());
    let block = *r.current().unwrap();
    assert_eq!((block.first_row_num, block.row_count()), (2, 9));
    assert_eq!(r.content().unwrap(), &compressible_bytes(100)[..]);
    assert!(!r.read_next_block().unwrap());
}

/// Claims to compress but never saves a byte.
struct NoGain;

impl Codec for NoGain {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Zstd
    }

    fn compress(&mut self, src: &[u8], _dst: &mut [u8]) -> aostore_core::Result<Option<usize>> {
        Ok(Some(src.len()))
    }

    fn decompress(&mut self, _src: &[u8], _dst: &mut [u8]) -> aostore_core::Result<usize> {
        panic!("nothing was stored compressed");
    }
}

#[test]
fn test_compression_fallback_stores_raw() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = StorageAttributes::compressed(CompressionKind::Zstd, 1);
    let codec: Box<dyn Codec> = Box::new(NoGain);
    let mut w = StorageWrite::with_codecs(attrs.clone(), "t", "test", Some(codec), None).unwrap();
    w.create_file(&path, NODE, 0).unwrap();
    w.open_file(&path, FormatVersion::LATEST, 0, 0, NODE, 0).unwrap();
    let content = compressible_bytes(2000);
    w.content(&content, EXECUTOR_KIND_NONE, 3).unwrap();
    let (eof, eof_uncompressed) = w.flush_and_close_file().unwrap();
    assert_eq!(w.stats().compressed_blocks, 0);
    assert_eq!(eof, 16 + 2000);
    assert_eq!(eof_uncompressed, eof);

    let mut r = StorageRead::new(attrs, "t", "test", Some(&BundledCodecs)).unwrap();
    r.open_file(&path, FormatVersion::LATEST, eof).unwrap();
    assert!(r.read_next_block().unwrap());
    assert!(!r.current().unwrap().info.is_compressed());
    assert_eq!(r.content().unwrap(), &content[..]);
    assert_eq!(r.stats().blocks_decompressed, 0);
}

#[test]
fn test_open_truncates_uncommitted_tail() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = StorageAttributes::default();
    let first = compressible_bytes(200);
    let (eof, eof_uncompressed, _) = write_blocks(&path, &attrs, &[(Some(1), first.clone(), 2)]);

    // an aborted writer left bytes past the committed EOF
    let mut f = OpenOptions::new().append(true).open(&path).unwrap();
    f.write_all(&pseudo_random_bytes(777, 5)).unwrap();
    drop(f);

    let mut w = open_writer(&path, &attrs, eof, eof_uncompressed);
    assert_eq!(w.current_position(), eof);
    let second = compressible_bytes(40);
    w.content(&second, EXECUTOR_KIND_VAR_BLOCK, 1).unwrap();
    let (eof2, eof2_uncompressed) = w.flush_and_close_file().unwrap();
    assert_eq!(eof2, eof + 16 + 40);
    assert_eq!(eof2_uncompressed, eof_uncompressed + 16 + 40);
    assert_eq!(fs::metadata(&path).unwrap().len(), eof2);

    let back = read_all(&path, &attrs, eof2);
    assert_eq!(back, vec![(1, first, 2), (3, second, 1)]);
}

#[test]
fn test_open_rejects_short_file_and_old_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = StorageAttributes::default();
    let (eof, _, _) = write_blocks(&path, &attrs, &[(None, compressible_bytes(64), 1)]);

    let mut w = StorageWrite::new(attrs.clone(), "t", "test", None).unwrap();
    let err = w
        .open_file(&path, FormatVersion::LATEST, eof + 8, eof + 8, NODE, 0)
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Corruption);
    let err = w.open_file(&path, FormatVersion::Original, eof, eof, NODE, 0).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Contract);

    let mut r = StorageRead::new(attrs, "t", "test", None).unwrap();
    assert!(r.open_file(&path, FormatVersion::LATEST, eof + 8).is_err());
}

#[test]
fn test_reader_stops_at_logical_eof() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = StorageAttributes::default();
    let blocks: Vec<Block> = (0..5).map(|i| (None, compressible_bytes(100 + i), 1)).collect();
    let (_, _, _) = write_blocks(&path, &attrs, &blocks);
    let first_two = (16 + 104) + (16 + 104);

    let back = read_all(&path, &attrs, first_two);
    assert_eq!(back.len(), 2);
    assert_eq!(back[1].1, compressible_bytes(101));
}

#[test]
fn test_safe_write_padding_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = StorageAttributes {
        safe_fs_write_size: 4096,
        ..small_blocks()
    };
    let a = compressible_bytes(100);
    let (eof, eof_uncompressed, _) = write_blocks(&path, &attrs, &[(Some(1), a.clone(), 1)]);
    assert_eq!(eof, 4096);
    assert_eq!(eof_uncompressed, 4096);

    let b = pseudo_random_bytes(300, 9);
    let mut w = open_writer(&path, &attrs, eof, eof_uncompressed);
    w.content(&b, EXECUTOR_KIND_VAR_BLOCK, 1).unwrap();
    let (eof2, _) = w.flush_and_close_file().unwrap();
    assert_eq!(eof2, 8192);

    let back = read_all(&path, &attrs, eof2);
    assert_eq!(back, vec![(1, a, 1), (2, b, 1)]);
}

#[test]
fn test_small_content_row_limit() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = StorageAttributes::default();
    let mut w = open_writer(&path, &attrs, 0, 0);

    w.get_buffer(HeaderKind::SmallContent).unwrap()[..8].fill(1);
    let err = w.finish_buffer(8, EXECUTOR_KIND_NONE, 16_384).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Contract);
    w.cancel_last_buffer();

    w.get_buffer(HeaderKind::SmallContent).unwrap()[..8].fill(1);
    w.finish_buffer(8, EXECUTOR_KIND_NONE, 16_383).unwrap();
    w.get_buffer(HeaderKind::NonBulkDenseContent).unwrap()[..8].fill(2);
    w.finish_buffer(8, EXECUTOR_KIND_NONE, 16_384).unwrap();
    let (eof, _) = w.flush_and_close_file().unwrap();

    let back = read_all(&path, &attrs, eof);
    assert_eq!(back.iter().map(|b| b.2).collect::<Vec<_>>(), vec![16_383, 16_384]);
    assert_eq!(back[1].0, 16_384);
}

#[test]
fn test_buffer_protocol_misuse() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = StorageAttributes::default();
    let mut w = StorageWrite::new(attrs.clone(), "t", "test", None).unwrap();
    assert!(w.get_buffer(HeaderKind::SmallContent).is_err());

    w.create_file(&path, NODE, 0).unwrap();
    w.open_file(&path, FormatVersion::LATEST, 0, 0, NODE, 0).unwrap();
    assert!(w.finish_buffer(0, EXECUTOR_KIND_NONE, 0).is_err());
    assert!(w.get_buffer(HeaderKind::LargeContent).is_err());

    let capacity = w.content_capacity(HeaderKind::SmallContent);
    assert_eq!(capacity, attrs.block_size - 16);
    w.get_buffer(HeaderKind::SmallContent).unwrap();
    assert!(w.is_buffer_allocated());
    assert!(w.get_buffer(HeaderKind::SmallContent).is_err());
    assert!(w.set_first_row_num(5).is_err());
    assert!(w.flush_and_close_file().is_err());
    assert!(w.finish_buffer(capacity + 1, EXECUTOR_KIND_NONE, 1).is_err());

    w.cancel_last_buffer();
    assert!(!w.is_buffer_allocated());
    assert_eq!(w.flush_and_close_file().unwrap(), (0, 0));
}

#[test]
fn test_corrupted_content_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = StorageAttributes::default();
    let (eof, _, _) = write_blocks(
        &path,
        &attrs,
        &[(None, compressible_bytes(64), 1), (None, compressible_bytes(64), 1)],
    );

    let mut data = fs::read(&path).unwrap();
    // second block's content starts after 16 + 64 + 16 bytes
    data[16 + 64 + 16 + 3] ^= 0x40;
    fs::write(&path, &data).unwrap();

    let mut r = StorageRead::new(attrs, "t", "test", None).unwrap();
    r.open_file(&path, FormatVersion::LATEST, eof).unwrap();
    assert!(r.read_next_block().unwrap());
    r.content().unwrap();
    assert!(r.read_next_block().unwrap());
    let err = r.content().unwrap_err();
    assert_eq!(err.class(), ErrorClass::Corruption);
    match err {
        Error::Checksum { context, .. } => {
            assert_eq!(context.header_offset, 16 + 64);
            assert!(context.header.is_some());
        }
        other => panic!("expected a checksum error, got {other}"),
    }
}

#[test]
fn test_damaged_compressed_payload_is_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = StorageAttributes {
        checksum: false,
        ..StorageAttributes::compressed(CompressionKind::Zstd, 1)
    };
    let (eof, _, stats) = write_blocks(&path, &attrs, &[(None, compressible_bytes(4000), 1)]);
    assert_eq!(stats.compressed_blocks, 1);

    // 8-byte header, no checksums to catch the damage
    let mut data = fs::read(&path).unwrap();
    for b in &mut data[8..20] {
        *b ^= 0xff;
    }
    fs::write(&path, &data).unwrap();

    let mut r = StorageRead::new(attrs, "t", "test", Some(&BundledCodecs)).unwrap();
    r.open_file(&path, FormatVersion::LATEST, eof).unwrap();
    assert!(r.read_next_block().unwrap());
    let err = r.content().unwrap_err();
    assert_eq!(err.class(), ErrorClass::Corruption);
    match err {
        Error::Corruption { context, .. } => {
            assert_eq!(context.header_offset, 0);
            assert!(context.segment_file.ends_with("16384"));
            assert!(context.header.is_some());
        }
        other => panic!("expected a corruption error, got {other}"),
    }
}

/// Compresses for real but hands back altered bytes on decompression.
struct FlipsOnDecompress(Box<dyn Codec>);

impl Codec for FlipsOnDecompress {
    fn kind(&self) -> CompressionKind {
        self.0.kind()
    }

    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> aostore_core::Result<Option<usize>> {
        self.0.compress(src, dst)
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> aostore_core::Result<usize> {
        let n = self.0.decompress(src, dst)?;
        dst[n / 2] ^= 0x01;
        Ok(n)
    }
}

#[test]
fn test_verify_write_catches_mismatched_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = StorageAttributes {
        verify_write: true,
        ..StorageAttributes::compressed(CompressionKind::Zstd, 1)
    };
    let codec = BundledCodecs.create(CompressionKind::Zstd, 1).unwrap();
    let verify: Box<dyn Codec> = Box::new(FlipsOnDecompress(
        BundledCodecs.create(CompressionKind::Zstd, 1).unwrap(),
    ));
    let mut w = StorageWrite::with_codecs(attrs, "t", "test", Some(codec), Some(verify)).unwrap();
    w.create_file(&path, NODE, 0).unwrap();
    w.open_file(&path, FormatVersion::LATEST, 0, 0, NODE, 0).unwrap();

    let err = w
        .content(&compressible_bytes(4000), EXECUTOR_KIND_NONE, 1)
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Corruption);
    match err {
        Error::Corruption { context, .. } => {
            assert_eq!(context.header_offset, 0);
            assert!(context.header.is_some());
        }
        other => panic!("expected a corruption error, got {other}"),
    }

    // the failed block was released and never committed
    assert!(!w.is_buffer_allocated());
    assert_eq!(w.stats().blocks, 0);
    assert_eq!(w.flush_and_close_file().unwrap(), (0, 0));
    assert_eq!(fs::metadata(&path).unwrap().len(), 0);
}

/// Compresses for real but cannot decompress anything.
struct FailsOnDecompress(Box<dyn Codec>);

impl Codec for FailsOnDecompress {
    fn kind(&self) -> CompressionKind {
        self.0.kind()
    }

    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> aostore_core::Result<Option<usize>> {
        self.0.compress(src, dst)
    }

    fn decompress(&mut self, _src: &[u8], _dst: &mut [u8]) -> aostore_core::Result<usize> {
        Err(Error::compression("zstd", "unknown frame descriptor"))
    }
}

#[test]
fn test_verify_write_decode_failure_is_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = StorageAttributes {
        verify_write: true,
        ..StorageAttributes::compressed(CompressionKind::Zstd, 1)
    };
    let codec = BundledCodecs.create(CompressionKind::Zstd, 1).unwrap();
    let verify: Box<dyn Codec> = Box::new(FailsOnDecompress(
        BundledCodecs.create(CompressionKind::Zstd, 1).unwrap(),
    ));
    let mut w = StorageWrite::with_codecs(attrs, "t", "test", Some(codec), Some(verify)).unwrap();
    w.create_file(&path, NODE, 0).unwrap();
    w.open_file(&path, FormatVersion::LATEST, 0, 0, NODE, 0).unwrap();

    let err = w
        .content(&compressible_bytes(4000), EXECUTOR_KIND_NONE, 1)
        .unwrap_err();
    assert!(matches!(err, Error::Corruption { .. }), "got {err}");
    assert!(!w.is_buffer_allocated());

    // the session is usable again once the block is released
    w.content(&pseudo_random_bytes(300, 4), EXECUTOR_KIND_NONE, 1).unwrap();
    assert_eq!(w.stats().blocks, 1);
}

#[test]
fn test_original_format_uses_four_byte_alignment() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = StorageAttributes::default();
    let blocks: Vec<Block> = vec![
        (None, pseudo_random_bytes(5, 1), 1),
        (Some(100), pseudo_random_bytes(13, 2), 2),
        (None, compressible_bytes(1), 1),
        (None, pseudo_random_bytes(30, 3), 3),
    ];

    // writers only produce the latest version; lay the blocks out by hand
    let mut data = Vec::new();
    let mut offsets = Vec::new();
    for (frn, content, rows) in &blocks {
        let header = BlockHeader {
            kind: HeaderKind::SmallContent,
            executor_block_kind: EXECUTOR_KIND_VAR_BLOCK,
            row_count: *rows,
            first_row_num: *frn,
            uncompressed_len: content.len() as u32,
            compressed_len: 0,
        };
        let header_len = header.header_len(attrs.checksum);
        let mut buf = vec![0xaau8; header.overall_block_len(attrs.checksum, FormatVersion::Original)];
        buf[header_len..header_len + content.len()].copy_from_slice(content);
        let n = header
            .write_into(&mut buf, attrs.checksum, FormatVersion::Original)
            .unwrap();
        assert_eq!(n, buf.len());
        offsets.push(data.len() as u64);
        data.extend_from_slice(&buf[..n]);
    }
    assert_eq!(offsets, vec![0, 24, 64, 84]);
    assert!(offsets.iter().all(|o| o % 4 == 0));
    assert!(offsets.iter().any(|o| o % 8 != 0));
    fs::write(&path, &data).unwrap();

    let mut r = StorageRead::new(attrs, "t", "test", None).unwrap();
    r.open_file(&path, FormatVersion::Original, data.len() as u64).unwrap();
    let mut seen = Vec::new();
    let mut back = Vec::new();
    while r.read_next_block().unwrap() {
        let block = *r.current().unwrap();
        seen.push(block.header_offset);
        back.push((block.first_row_num, r.content().unwrap().to_vec(), block.row_count()));
    }
    r.finish_session();
    assert_eq!(seen, offsets);
    let expected: Vec<(i64, Vec<u8>, u32)> = blocks
        .iter()
        .zip([1, 100, 102, 103])
        .map(|((_, content, rows), first)| (first, content.clone(), *rows))
        .collect();
    assert_eq!(back, expected);
}

#[test]
fn test_wal_records_cover_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = small_blocks();
    let wal = Arc::new(RecordingWal::new());
    let mut w = StorageWrite::new(attrs.clone(), "t", "test", None)
        .unwrap()
        .with_wal(wal.clone());
    w.create_file(&path, NODE, 3).unwrap();
    w.open_file(&path, FormatVersion::LATEST, 0, 0, NODE, 3).unwrap();
    for i in 0..5 {
        w.content(&pseudo_random_bytes(7000, i), EXECUTOR_KIND_VAR_BLOCK, 1).unwrap();
    }
    let (eof, _) = w.flush_and_close_file().unwrap();

    let records = wal.records();
    assert!(records[0].data.is_empty());
    let mut logged = Vec::new();
    for rec in records.iter().skip(1) {
        assert_eq!(rec.node, NODE);
        assert_eq!(rec.segment_file_num, 3);
        assert_eq!(rec.offset, logged.len() as u64);
        logged.extend_from_slice(&rec.data);
    }
    assert_eq!(logged.len() as u64, eof);
    assert_eq!(logged, fs::read(&path).unwrap());
    assert_eq!(records.len() as u64 - 1, w.stats().physical_writes);
}

#[test]
fn test_temporary_relations_are_not_logged() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let wal = Arc::new(RecordingWal::new());
    let mut w = StorageWrite::new(StorageAttributes::default(), "t", "test", None)
        .unwrap()
        .with_wal(wal.clone())
        .temporary(true);
    w.create_file(&path, NODE, 0).unwrap();
    w.open_file(&path, FormatVersion::LATEST, 0, 0, NODE, 0).unwrap();
    w.content(&compressible_bytes(500), EXECUTOR_KIND_NONE, 1).unwrap();
    w.flush_and_close_file().unwrap();
    assert!(wal.is_empty());
}

#[test]
fn test_file_is_written_before_the_wal_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = segment_path(&dir);
    let attrs = small_blocks();
    let wal = Arc::new(RecordingWal::failing_after(1));
    let mut w = StorageWrite::new(attrs, "t", "test", None)
        .unwrap()
        .with_wal(wal.clone());
    w.create_file(&path, NODE, 0).unwrap();
    w.open_file(&path, FormatVersion::LATEST, 0, 0, NODE, 0).unwrap();

    // 8016-byte blocks; the third one crosses the 16 KiB large write
    let mut failure = None;
    for i in 0..3 {
        if let Err(e) = w.content(&pseudo_random_bytes(8000, i), EXECUTOR_KIND_NONE, 1) {
            failure = Some((i, e));
            break;
        }
    }
    let (i, err) = failure.expect("the WAL should refuse the first data record");
    assert_eq!(i, 2);
    assert!(matches!(err, Error::Wal(_)));
    assert_eq!(err.class(), ErrorClass::Io);

    // the bytes reached the file; the log only holds the creation record
    assert_eq!(fs::metadata(&path).unwrap().len(), 16 * 1024);
    let records = wal.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].data.is_empty());
}
