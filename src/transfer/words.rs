//! Frozen word dictionary for transfer codes. Must be identical across every
//! instance of this crate that needs to interoperate on human-shared codes.

pub const DICTIONARY: &[&str] = &[
    "anchor", "badger", "canyon", "delta", "ember", "falcon", "glacier", "harbor",
    "indigo", "jasper", "kindle", "lumen", "meadow", "nectar", "onyx", "pebble",
    "quartz", "raven", "summit", "timber", "umbra", "velvet", "willow", "zephyr",
];

/// Uniform `"<num>-<word>-<word>"` transfer code, per the frozen dictionary.
/// Collisions are tolerated; the sender address disambiguates on receive.
pub fn generate_code() -> String {
    use rand::Rng;
    let mut rng = rand::rngs::OsRng;
    let num: u32 = rng.gen_range(0..100);
    let w1 = DICTIONARY[rng.gen_range(0..DICTIONARY.len())];
    let w2 = DICTIONARY[rng.gen_range(0..DICTIONARY.len())];
    format!("{num}-{w1}-{w2}")
}
