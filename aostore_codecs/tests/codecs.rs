//! Every bundled backend against the `Codec` contract.
use aostore_codecs::BundledCodecs;
use aostore_core::codec::{try_compress, CodecProvider, CompressionKind};

const KINDS: [CompressionKind; 3] = [CompressionKind::Zstd, CompressionKind::Zlib, CompressionKind::Lz4];

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

fn compressible_bytes(len: usize) -> Vec<u8> {
    let pattern = b"append-only blocks compress well when rows repeat. ";
    (0..len).map(|i| pattern[i % pattern.len()]).collect()
}

#[test]
fn roundtrip_every_kind() {
    let data = compressible_bytes(30_000);
    for kind in KINDS {
        let mut codec = BundledCodecs.create(kind, kind.default_level()).unwrap();
        assert_eq!(codec.kind(), kind);
        let mut compressed = vec![0u8; data.len()];
        let n = codec.compress(&data, &mut compressed).unwrap().expect("fits");
        assert!(n < data.len() / 4, "{} only reached {} bytes", kind, n);

        let mut out = vec![0u8; data.len()];
        let m = codec.decompress(&compressed[..n], &mut out).unwrap();
        assert_eq!(m, data.len());
        assert_eq!(out, data, "{} roundtrip", kind);
        codec.close();
    }
}

#[test]
fn context_is_reusable_across_blocks() {
    for kind in KINDS {
        let mut codec = BundledCodecs.create(kind, kind.default_level()).unwrap();
        for seed in 0..4u64 {
            let mut data = compressible_bytes(5000);
            data[..64].copy_from_slice(&pseudo_random_bytes(64, seed));
            let mut compressed = vec![0u8; data.len()];
            let n = codec.compress(&data, &mut compressed).unwrap().unwrap();
            let mut out = vec![0u8; data.len()];
            assert_eq!(codec.decompress(&compressed[..n], &mut out).unwrap(), data.len());
            assert_eq!(out, data);
        }
    }
}

#[test]
fn incompressible_input_is_stored_raw() {
    let data = pseudo_random_bytes(8000, 42);
    for kind in KINDS {
        let mut codec = BundledCodecs.create(kind, kind.default_level()).unwrap();
        let mut dst = vec![0u8; data.len()];
        assert_eq!(try_compress(codec.as_mut(), &data, &mut dst).unwrap(), None, "{}", kind);
    }
}

#[test]
fn output_too_small_is_not_an_error() {
    let data = compressible_bytes(10_000);
    for kind in KINDS {
        let mut codec = BundledCodecs.create(kind, kind.default_level()).unwrap();
        let mut dst = [0u8; 16];
        assert_eq!(codec.compress(&data, &mut dst).unwrap(), None, "{}", kind);
    }
}

#[test]
fn garbage_fails_to_decompress() {
    // neither a zstd magic number nor a valid zlib header
    let mut garbage = pseudo_random_bytes(512, 7);
    garbage[0] = 0;
    garbage[1] = 0;
    for kind in [CompressionKind::Zstd, CompressionKind::Zlib] {
        let mut codec = BundledCodecs.create(kind, kind.default_level()).unwrap();
        let mut out = vec![0u8; 4096];
        assert!(codec.decompress(&garbage, &mut out).is_err(), "{}", kind);
    }
}

#[test]
fn levels_are_checked() {
    assert!(BundledCodecs.create(CompressionKind::Zstd, 0).is_err());
    assert!(BundledCodecs.create(CompressionKind::Zstd, 20).is_err());
    assert!(BundledCodecs.create(CompressionKind::Zlib, 10).is_err());
    assert!(BundledCodecs.create(CompressionKind::Lz4, 2).is_err());
    assert!(BundledCodecs.create(CompressionKind::Zstd, 19).is_ok());
}
