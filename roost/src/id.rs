use rand::Rng;

const ID_BYTES: usize = 32;
const SHORT_LEN: usize = 12;

/// Returns 64 random lowercase hex characters, the format the engine uses for its own build and
/// session ids.
pub fn random_id() -> String {
    let mut rng = rand::thread_rng();
    loop {
        let bytes: [u8; ID_BYTES] = rng.gen();
        let mut id = String::with_capacity(ID_BYTES * 2);
        for byte in bytes {
            id.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0'));
            id.push(char::from_digit(u32::from(byte & 0xf), 16).unwrap_or('0'));
        }

        // A short id that is all digits could be mistaken for a number by the engine.
        if id[..SHORT_LEN].parse::<u64>().is_ok() {
            continue;
        }

        return id;
    }
}
