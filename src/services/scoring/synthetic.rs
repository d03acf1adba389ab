use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::config::SyntheticConfig;

/// Stable seed for a window key; the same key always yields the same synthetic values.
pub fn window_seed(entity: &str, interval_minutes: u32, window_start_ts: i64) -> u64 {
    let material = format!("{entity}|{interval_minutes}|{window_start_ts}");
    let digest = Sha256::digest(material.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// One plausible component value per name, drawn in the given order.
pub fn synthesize_components<'a>(
    seed: u64,
    names: impl IntoIterator<Item = &'a str>,
    config: &SyntheticConfig,
) -> Vec<(String, f64)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (low, high) = (config.min_component, config.max_component.max(config.min_component));
    names
        .into_iter()
        .map(|name| {
            let value = if high > low {
                rng.gen_range(low..=high)
            } else {
                low
            };
            (name.to_string(), value)
        })
        .collect()
}
