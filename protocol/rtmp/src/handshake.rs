use {
    crate::errors::RtmpError,
    bytes::{BufMut, Bytes, BytesMut},
    hmac::{Hmac, Mac},
    netio::{cursor::ByteCursor, net::TNetIO},
    rand::Rng,
    sha2::Sha256,
};

pub const RTMP_VERSION: u8 = 3;
pub const HANDSHAKE_SIZE: usize = 1536;
const DIGEST_SIZE: usize = 32;

// "Genuine Adobe Flash Media Server 001" + filler
const FMS_KEY: [u8; 68] = [
    0x47, 0x65, 0x6e, 0x75, 0x69, 0x6e, 0x65, 0x20, 0x41, 0x64, 0x6f, 0x62, 0x65, 0x20, 0x46,
    0x6c, 0x61, 0x73, 0x68, 0x20, 0x4d, 0x65, 0x64, 0x69, 0x61, 0x20, 0x53, 0x65, 0x72, 0x76,
    0x65, 0x72, 0x20, 0x30, 0x30, 0x31, 0xf0, 0xee, 0xc2, 0x4a, 0x80, 0x68, 0xbe, 0xe8, 0x2e,
    0x00, 0xd0, 0xd1, 0x02, 0x9e, 0x7e, 0x57, 0x6e, 0xec, 0x5d, 0x2d, 0x29, 0x80, 0x6f, 0xab,
    0x93, 0xb8, 0xe6, 0x36, 0xcf, 0xeb, 0x31, 0xae,
];

// "Genuine Adobe Flash Player 001" + filler
const FP_KEY: [u8; 62] = [
    0x47, 0x65, 0x6E, 0x75, 0x69, 0x6E, 0x65, 0x20, 0x41, 0x64, 0x6F, 0x62, 0x65, 0x20, 0x46,
    0x6C, 0x61, 0x73, 0x68, 0x20, 0x50, 0x6C, 0x61, 0x79, 0x65, 0x72, 0x20, 0x30, 0x30, 0x31,
    0xF0, 0xEE, 0xC2, 0x4A, 0x80, 0x68, 0xBE, 0xE8, 0x2E, 0x00, 0xD0, 0xD1, 0x02, 0x9E, 0x7E,
    0x57, 0x6E, 0xEC, 0x5D, 0x2D, 0x29, 0x80, 0x6F, 0xAB, 0x93, 0xB8, 0xE6, 0x36, 0xCF, 0xEB,
    0x31, 0xAE,
];

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn digest_offset(packet: &[u8], base: usize) -> usize {
    let sum = packet[base] as usize
        + packet[base + 1] as usize
        + packet[base + 2] as usize
        + packet[base + 3] as usize;
    sum % 728 + base + 4
}

/// Locate and verify the client digest of a complex C1, returning its
/// offset. Schema 1 (offset field at 8) is tried before schema 0 (at 772).
fn find_client_digest(c1: &[u8]) -> Option<usize> {
    for base in [8usize, 772] {
        let offset = digest_offset(c1, base);
        if offset + DIGEST_SIZE > c1.len() {
            continue;
        }
        let mut joined = Vec::with_capacity(HANDSHAKE_SIZE - DIGEST_SIZE);
        joined.extend_from_slice(&c1[..offset]);
        joined.extend_from_slice(&c1[offset + DIGEST_SIZE..]);
        let expected = hmac_sha256(&FP_KEY[..30], &joined);
        if expected == c1[offset..offset + DIGEST_SIZE] {
            return Some(offset);
        }
    }
    None
}

async fn read_exact(
    io: &mut Box<dyn TNetIO + Send + Sync>,
    cursor: &mut ByteCursor,
    n: usize,
) -> Result<BytesMut, RtmpError> {
    while cursor.len() < n {
        let data = io.read().await?;
        cursor.feed(&data);
    }
    Ok(cursor.read_bytes(n).unwrap())
}

/// Server side of the C0C1C2/S0S1S2 exchange. The digest (complex)
/// variant is used when the client's C1 carries a valid one, the plain
/// variant otherwise.
pub async fn server_handshake(
    io: &mut Box<dyn TNetIO + Send + Sync>,
    cursor: &mut ByteCursor,
) -> Result<(), RtmpError> {
    let c0 = read_exact(io, cursor, 1).await?;
    if c0[0] != RTMP_VERSION {
        return Err(RtmpError::handshake(&format!(
            "unsupported rtmp version {}",
            c0[0]
        )));
    }

    let c1 = read_exact(io, cursor, HANDSHAKE_SIZE).await?;

    let client_version = u32::from_be_bytes([c1[4], c1[5], c1[6], c1[7]]);
    let client_digest_offset = if client_version != 0 {
        find_client_digest(&c1)
    } else {
        None
    };

    let mut out = BytesMut::with_capacity(1 + 2 * HANDSHAKE_SIZE);
    out.put_u8(RTMP_VERSION);

    match client_digest_offset {
        Some(offset) => {
            // S1 with a server digest at a schema-1 offset
            let mut s1 = random_block();
            s1[4] = 4;
            s1[5] = 5;
            s1[6] = 0;
            s1[7] = 1;
            let s1_offset = digest_offset(&s1, 8);
            let mut joined = Vec::with_capacity(HANDSHAKE_SIZE - DIGEST_SIZE);
            joined.extend_from_slice(&s1[..s1_offset]);
            joined.extend_from_slice(&s1[s1_offset + DIGEST_SIZE..]);
            let digest = hmac_sha256(&FMS_KEY[..36], &joined);
            s1[s1_offset..s1_offset + DIGEST_SIZE].copy_from_slice(&digest);
            out.extend_from_slice(&s1);

            // S2: random tail signed with the client digest
            let mut s2 = random_block();
            let key = hmac_sha256(&FMS_KEY, &c1[offset..offset + DIGEST_SIZE]);
            let signature = hmac_sha256(&key, &s2[..HANDSHAKE_SIZE - DIGEST_SIZE]);
            s2[HANDSHAKE_SIZE - DIGEST_SIZE..].copy_from_slice(&signature);
            out.extend_from_slice(&s2);
        }
        None => {
            let mut s1 = random_block();
            s1[0] = 0;
            s1[1] = 0;
            s1[2] = 0;
            s1[3] = 0;
            s1[4] = 0;
            s1[5] = 0;
            s1[6] = 0;
            s1[7] = 0;
            out.extend_from_slice(&s1);
            out.extend_from_slice(&c1); // S2 echoes C1
        }
    }

    io.write(Bytes::from(out.to_vec())).await?;

    // C2 is read and discarded
    let _c2 = read_exact(io, cursor, HANDSHAKE_SIZE).await?;
    Ok(())
}

/// Client side, plain variant: servers accept it regardless of their own
/// digest support.
pub async fn client_handshake(
    io: &mut Box<dyn TNetIO + Send + Sync>,
    cursor: &mut ByteCursor,
) -> Result<(), RtmpError> {
    let mut out = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
    out.put_u8(RTMP_VERSION);
    let mut c1 = random_block();
    for b in c1.iter_mut().take(8) {
        *b = 0;
    }
    out.extend_from_slice(&c1);
    io.write(Bytes::from(out.to_vec())).await?;

    let s0 = read_exact(io, cursor, 1).await?;
    if s0[0] != RTMP_VERSION {
        return Err(RtmpError::handshake(&format!(
            "unsupported rtmp version {}",
            s0[0]
        )));
    }
    let s1 = read_exact(io, cursor, HANDSHAKE_SIZE).await?;
    let _s2 = read_exact(io, cursor, HANDSHAKE_SIZE).await?;

    // C2 echoes S1
    io.write(Bytes::from(s1.to_vec())).await?;
    Ok(())
}

fn random_block() -> [u8; HANDSHAKE_SIZE] {
    let mut block = [0u8; HANDSHAKE_SIZE];
    rand::thread_rng().fill(&mut block[..]);
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_offsets_stay_in_bounds() {
        let mut block = [0xFFu8; HANDSHAKE_SIZE];
        // worst case: all offset bytes maxed
        let offset = digest_offset(&block, 8);
        assert!(offset + DIGEST_SIZE <= HANDSHAKE_SIZE);
        let offset = digest_offset(&block, 772);
        assert!(offset + DIGEST_SIZE <= HANDSHAKE_SIZE);
        block[8] = 0;
        assert!(digest_offset(&block, 8) >= 12);
    }

    #[test]
    fn client_digest_is_found_in_signed_c1() {
        let mut c1 = [0x42u8; HANDSHAKE_SIZE];
        c1[4] = 0x80; // nonzero version
        let offset = digest_offset(&c1, 8);
        let mut joined = Vec::new();
        joined.extend_from_slice(&c1[..offset]);
        joined.extend_from_slice(&c1[offset + DIGEST_SIZE..]);
        let digest = hmac_sha256(&FP_KEY[..30], &joined);
        c1[offset..offset + DIGEST_SIZE].copy_from_slice(&digest);

        assert_eq!(find_client_digest(&c1), Some(offset));
    }

    #[test]
    fn unsigned_c1_has_no_digest() {
        let c1 = [0x42u8; HANDSHAKE_SIZE];
        assert_eq!(find_client_digest(&c1), None);
    }
}
