// Human-readable names for workers, random per creation.

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "ancient", "billowing", "bitter", "bold", "calm", "crimson", "damp", "dawn", "dry",
    "falling", "fragrant", "frosty", "hidden", "late", "lively", "misty", "muddy", "old",
    "patient", "quiet", "restless", "silent", "snowy", "wandering",
];

const NOUNS: &[&str] = &[
    "breeze", "brook", "cloud", "dew", "field", "firefly", "frog", "frost", "glade",
    "harbor", "haze", "leaf", "meadow", "moon", "pine", "rain", "resonance", "river",
    "shadow", "smoke", "sound", "star", "thunder", "wave",
];

/// Two words and a number, e.g. "misty-harbor-4821". Unique enough that two
/// workers alive at the same time will not share one.
pub fn haiku() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}-{}-{:04}",
        ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())],
        NOUNS[rng.gen_range(0..NOUNS.len())],
        rng.gen_range(0..10_000u32),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haiku_shape() {
        let name = haiku();
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(NOUNS.contains(&parts[1]));
        assert!(parts[2].parse::<u32>().is_ok());
    }
}
