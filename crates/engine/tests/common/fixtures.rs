//! Test payloads.

use bytes::Bytes;
use parcel_engine::InitRequest;

/// Deterministic pseudo-random bytes.
pub fn seeded_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

/// Split `data` into `chunk_size` pieces; the last one may be shorter.
pub fn split_into_chunks(data: &[u8], chunk_size: u64) -> Vec<Bytes> {
    if data.is_empty() {
        return vec![Bytes::new()];
    }
    data.chunks(chunk_size as usize)
        .map(Bytes::copy_from_slice)
        .collect()
}

/// An init request matching `data` split at `chunk_size`.
pub fn init_request(file_name: &str, data: &[u8], chunk_size: u64) -> InitRequest {
    InitRequest {
        file_name: file_name.to_string(),
        category: "其他".to_string(),
        chunk_count: split_into_chunks(data, chunk_size).len() as u32,
        chunk_size,
        total_size: data.len() as u64,
        content_hash: None,
        origin_ip: None,
    }
}
