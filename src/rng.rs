// File: src/rng.rs
//
// Deterministic random number generation for dialogue scripts.
// The generator state must serialize to a portable textual form and
// restore to an identical sequence, so the VM uses a fully specified
// PCG generator rather than an implementation-defined default engine.

use crate::errors::DialogueError;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

#[derive(Debug, Clone)]
pub struct DialogueRng {
    inner: Pcg32,
}

impl DialogueRng {
    pub fn seeded(seed: u64) -> DialogueRng {
        DialogueRng { inner: Pcg32::seed_from_u64(seed) }
    }

    /// Uniform float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        self.inner.gen::<f32>()
    }

    /// Uniform integer in [lo, hi], inclusive on both ends.
    pub fn int_in_range(&mut self, lo: i64, hi: i64) -> i64 {
        self.inner.gen_range(lo..=hi)
    }

    /// Serialize the generator state to a lossless textual form.
    pub fn state_string(&self) -> Result<String, DialogueError> {
        Ok(serde_json::to_string(&self.inner)?)
    }

    /// Rebuild a generator from a state string produced by `state_string`.
    pub fn from_state_string(state: &str) -> Result<DialogueRng, DialogueError> {
        let inner: Pcg32 = serde_json::from_str(state)
            .map_err(|e| DialogueError::io(format!("bad generator state: {}", e)))?;
        Ok(DialogueRng { inner })
    }
}
