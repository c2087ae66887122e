//! Random, human-friendly names for containers and throwaway credentials.
//!
//! Names are `{adjective}{noun}{4-hex}`; the hex suffix comes from a blake3
//! hash of the clock, the process id and a process-wide counter, so two calls
//! in the same nanosecond still differ.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const ADJECTIVES: &[&str] = &[
    "autumn", "hidden", "bitter", "misty", "silent", "empty", "dry", "dark", "summer", "icy",
    "quiet", "white", "cool", "spring", "winter", "patient", "twilight", "dawn", "crimson",
    "wispy", "weathered", "blue", "billowing", "broken", "cold", "damp", "falling", "frosty",
    "green", "long", "late", "bold", "little", "morning", "muddy", "old", "red", "rough",
    "still", "small", "sparkling", "shy", "wandering", "withered", "wild", "black", "young",
];

const NOUNS: &[&str] = &[
    "waterfall", "river", "breeze", "moon", "rain", "wind", "sea", "morning", "snow", "lake",
    "sunset", "pine", "shadow", "leaf", "dawn", "glitter", "forest", "hill", "cloud", "meadow",
    "sun", "glade", "bird", "brook", "butterfly", "bush", "dew", "dust", "field", "fire",
    "flower", "firefly", "feather", "grass", "haze", "mountain", "night", "pond", "darkness",
    "snowflake", "silence", "sound", "sky", "shape", "surf", "thunder", "violet", "water",
];

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn entropy() -> [u8; 32] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let input = format!("{nanos}:{}:{count}", std::process::id());
    *blake3::hash(input.as_bytes()).as_bytes()
}

/// Generate a random lowercase alphanumeric name.
pub fn name() -> String {
    let bytes = entropy();
    let adjective = ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()];
    let noun = NOUNS[bytes[1] as usize % NOUNS.len()];
    format!("{adjective}{noun}{:02x}{:02x}", bytes[2], bytes[3])
}
