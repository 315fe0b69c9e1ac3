//! Passphrase generation and strength checks for bundle encryption.

use rand::{rngs::OsRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

/// Words used by [`generate_passphrase`].
pub const WORDS: [&str; 64] = [
    "apple", "baker", "candy", "delta", "eagle", "frost", "green", "happy", "index", "joker",
    "karma", "lemon", "maple", "north", "ocean", "piano", "queen", "river", "solar", "tiger",
    "ultra", "vivid", "water", "xenon", "yacht", "zebra", "amber", "blaze", "coral", "dusk",
    "ember", "flame", "grove", "haven", "ivory", "jade", "kayak", "lunar", "marble", "nova",
    "opal", "prism", "quartz", "ridge", "storm", "tide", "unity", "valley", "wave", "axis",
    "bloom", "cloud", "drift", "echo", "fern", "glow", "haze", "iris", "jewel", "knot", "leaf",
    "mist", "nest", "orbit",
];

pub const DEFAULT_WORD_COUNT: usize = 4;

/// Minimum length of an acceptable passphrase, in characters.
pub const MIN_LENGTH: usize = 8;

/// `word-word-word-word`, drawn from the OS random number generator.
pub fn generate_passphrase(word_count: usize) -> String {
    let mut rng = OsRng;
    (0..word_count.max(1))
        .filter_map(|_| WORDS.choose(&mut rng).copied())
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Weak,
    Fair,
    Strong,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassphraseCheck {
    pub valid: bool,
    pub strength: Strength,
    /// Suggestions for a stronger passphrase
    pub feedback: Vec<String>,
}

const COMMON_WORDS: [&str; 3] = ["password", "qwerty", "admin"];

/// Score a passphrase by length, character classes and common patterns.
pub fn check_passphrase(passphrase: &str) -> PassphraseCheck {
    let mut feedback = Vec::new();
    let mut score: i32 = 0;

    let length = passphrase.chars().count();
    if length < MIN_LENGTH {
        feedback.push(format!("At least {MIN_LENGTH} characters"));
    } else if length >= 12 {
        score += 2;
    } else {
        score += 1;
    }

    let lower = passphrase.chars().any(|c| c.is_ascii_lowercase());
    let upper = passphrase.chars().any(|c| c.is_ascii_uppercase());
    let digit = passphrase.chars().any(|c| c.is_ascii_digit());
    let symbol = passphrase.chars().any(|c| !c.is_ascii_alphanumeric());
    score += [lower, upper, digit, symbol].iter().filter(|&&b| b).count() as i32;

    if !(lower && upper) {
        feedback.push("Mix of upper and lowercase letters".to_string());
    }
    if !digit {
        feedback.push("At least one number".to_string());
    }

    let folded = passphrase.to_ascii_lowercase();
    if passphrase.starts_with("123") || COMMON_WORDS.iter().any(|w| folded.contains(w)) {
        score -= 1;
        feedback.push("Avoid common patterns".to_string());
    }

    let strength = match score {
        s if s < 3 => Strength::Weak,
        s if s < 5 => Strength::Fair,
        _ => Strength::Strong,
    };

    PassphraseCheck {
        valid: length >= MIN_LENGTH && score >= 3,
        strength,
        feedback,
    }
}
