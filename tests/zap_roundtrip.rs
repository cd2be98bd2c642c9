//! Split/join laws driven end to end through the chunk store: a file is
//! split and encrypted, its chunks stored by encrypted hash, fetched
//! back, and reassembled byte-for-byte.

use filezap::chunk_store::{ChunkStore, DEFAULT_QUOTA_BYTES};
use filezap::zap::{read_manifest, reassemble, split, write_manifest};

fn test_key() -> [u8; 32] {
    // 31 zero bytes then 0x01.
    let mut key = [0u8; 32];
    key[31] = 1;
    key
}

#[test]
fn two_kib_of_zeros_round_trips_through_the_store() {
    let data = vec![0u8; 2048];
    let (manifest, chunks) = split(&data, "zeros.bin", 1024, &test_key()).unwrap();

    assert_eq!(manifest.chunk_count, 2);
    assert_eq!(
        manifest.chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
        vec![0, 1]
    );
    assert!(manifest.chunks.iter().all(|c| c.size == 1024));

    let dir = tempfile::TempDir::new().unwrap();
    let store = ChunkStore::open(dir.path(), DEFAULT_QUOTA_BYTES).unwrap();
    for (meta, chunk) in manifest.chunks.iter().zip(&chunks) {
        store.store(&meta.encrypted_hash, chunk).unwrap();
    }
    assert_eq!(store.list().len(), 2);

    let fetched: Vec<Vec<u8>> = manifest
        .chunks
        .iter()
        .map(|meta| store.get(&meta.encrypted_hash).unwrap())
        .collect();
    let rebuilt = reassemble(&manifest, &fetched, &test_key()).unwrap();
    assert_eq!(rebuilt, data);
}

#[test]
fn manifest_survives_disk_round_trip_with_invariants() {
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
    let (manifest, _chunks) = split(&data, "big.bin", 4096, &test_key()).unwrap();

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("big.zap");
    write_manifest(&manifest, &path).unwrap();
    let reread = read_manifest(&path).unwrap();
    assert_eq!(reread, manifest);
    assert_eq!(reread.chunk_count as usize, reread.chunks.len());
    assert!(reread
        .chunks
        .iter()
        .all(|c| c.encrypted_hash.len() == 64 && c.hash.len() == 64));
}

#[test]
fn wrong_key_cannot_reassemble() {
    let data = vec![0xC3; 3000];
    let (manifest, chunks) = split(&data, "secret.bin", 1024, &test_key()).unwrap();
    let mut wrong = test_key();
    wrong[0] = 0xFF;
    assert!(reassemble(&manifest, &chunks, &wrong).is_err());
}
