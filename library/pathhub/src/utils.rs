use rand::Rng;

/// Opaque identity of one reader/publisher attachment.
pub type HandleId = u64;

pub fn new_handle_id() -> HandleId {
    rand::thread_rng().gen()
}

/// RTSP-style session identifier: nine decimal digits, no leading zero so
/// the textual form always has nine characters. Collisions are handled by
/// the caller regenerating.
pub fn new_session_id() -> String {
    let mut rng = rand::thread_rng();
    let n: u32 = rng.gen_range(100_000_000..1_000_000_000);
    n.to_string()
}

#[cfg(test)]
mod tests {
    use super::new_session_id;

    #[test]
    fn session_ids_have_nine_digits() {
        for _ in 0..100 {
            let id = new_session_id();
            assert_eq!(id.len(), 9);
            assert!(id.chars().all(|c| c.is_ascii_digit()));
            assert_ne!(id.chars().next().unwrap(), '0');
        }
    }
}
