use rand::Rng;

// Alphabet without look-alike characters (no 0/O, 1/l/I).
const UNMISTAKABLE_CHARS: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghijkmnopqrstuvwxyz";

const ID_LEN: usize = 17;

/// Random identifier used for subscription ids.
pub fn random_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| UNMISTAKABLE_CHARS[rng.gen_range(0..UNMISTAKABLE_CHARS.len())] as char)
        .collect()
}
