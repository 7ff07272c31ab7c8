use std::sync::{Arc, Mutex};

use crate::ml::NodeValue;

#[derive(Clone)]
pub enum RngStrategy {
    Default,

    Debug {
        seed: u32,
    },

    Cached(Arc<dyn RNG + Send + Sync>, Arc<RngStrategy>),
}

impl Default for RngStrategy {
    fn default() -> Self {
        Self::Default.upgrade()
    }
}

impl RNG for RngStrategy {
    fn rand(&self) -> NodeValue {
        match self {
            RngStrategy::Cached(instance, _) => instance.rand(),
            rng => rng.factory().rand(),
        }
    }
}

impl RngStrategy {
    pub fn testable(seed: u32) -> Self {
        RngStrategy::Debug { seed }.upgrade()
    }

    /// Binds the strategy to a live generator, so clones draw from one shared stream.
    pub fn upgrade(self) -> Self {
        match self {
            RngStrategy::Cached(instance, strategy) => RngStrategy::Cached(instance, strategy),
            rng => RngStrategy::Cached(rng.factory().into(), Arc::new(rng)),
        }
    }

    fn factory(&self) -> Box<dyn RNG + Send + Sync> {
        match self {
            RngStrategy::Default => Box::new(EntropyRng::new()),
            RngStrategy::Debug { seed } => Box::new(SeedableTestRng::new(*seed)),
            RngStrategy::Cached(_, inner) => inner.factory(),
        }
    }

    /// Returns `true` if the rng strategy is [`Cached`].
    ///
    /// [`Cached`]: RngStrategy::Cached
    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(..))
    }

    /// Returns `true` if the rng strategy is [`Debug`].
    ///
    /// [`Debug`]: RngStrategy::Debug
    #[must_use]
    pub fn is_debug(&self) -> bool {
        match self {
            Self::Debug { .. } => true,
            Self::Cached(_, inner) => inner.is_debug(),
            _ => false,
        }
    }
}

impl std::fmt::Debug for RngStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "Default"),
            Self::Debug { seed } => f.debug_struct("Debug").field("seed", seed).finish(),
            Self::Cached(_, inner) => f.debug_struct("Cached").field("inner", inner).finish(),
        }
    }
}

pub struct EntropyRng(Mutex<rand::rngs::StdRng>);

impl EntropyRng {
    pub fn new() -> Self {
        use rand::SeedableRng;
        Self(Mutex::new(rand::rngs::StdRng::from_entropy()))
    }
}

impl RNG for EntropyRng {
    fn rand(&self) -> NodeValue {
        use rand::Rng;
        let mut rng = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen()
    }
}

pub struct SeedableTestRng(Mutex<algo::mersenne_twister::MersenneTwister>);

impl SeedableTestRng {
    pub fn new(seed: u32) -> Self {
        Self(Mutex::new(
            algo::mersenne_twister::MersenneTwister::new(seed),
        ))
    }
}

impl RNG for SeedableTestRng {
    fn rand(&self) -> NodeValue {
        let rand = {
            let mut inner = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.rand().saturating_sub(1)
        };
        (rand as f64 * algo::mersenne_twister::F64_MULTIPLIER) as NodeValue
    }
}

pub trait RNG {
    /// Uniform sample in `[0, 1)`.
    fn rand(&self) -> NodeValue;

    fn rand_range(&self, min: usize, exclusive_max: usize) -> usize {
        (self.rand() * (exclusive_max - min) as NodeValue) as usize + min
    }

    /// Standard normal sample through the Box-Muller transform.
    fn rand_normal(&self, mu: NodeValue, sigma: NodeValue) -> NodeValue {
        let u1 = (1.0 - self.rand()).max(NodeValue::MIN_POSITIVE);
        let u2 = self.rand();
        let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI as NodeValue * u2).cos();
        mu + sigma * z0
    }
}

mod algo {
    pub mod mersenne_twister {
        pub const F64_MULTIPLIER: f64 = 1.0 / u32::MAX as f64;

        pub struct MersenneTwister {
            state: [u32; 624],
            index: usize,
        }

        impl MersenneTwister {
            pub fn new(seed: u32) -> Self {
                let mut mt = Self {
                    state: [0; 624],
                    index: 624,
                };
                mt.state[0] = seed;
                for i in 1..624 {
                    let prev = mt.state[i - 1];
                    mt.state[i] = 0x6c078965_u32
                        .wrapping_mul(prev ^ (prev >> 30))
                        .wrapping_add(i as u32);
                }
                mt
            }

            pub fn rand(&mut self) -> u32 {
                if self.index >= 624 {
                    self.twist();
                }
                let mut y = self.state[self.index];
                y ^= y >> 11;
                y ^= (y << 7) & 0x9d2c_5680;
                y ^= (y << 15) & 0xefc6_0000;
                y ^= y >> 18;
                self.index += 1;
                y
            }

            fn twist(&mut self) {
                const MATRIX_A: u32 = 0x9908_b0df;
                const UPPER_MASK: u32 = 0x8000_0000;
                const LOWER_MASK: u32 = 0x7fff_ffff;
                for i in 0..624 {
                    let x = (self.state[i] & UPPER_MASK) + (self.state[(i + 1) % 624] & LOWER_MASK);
                    let mut x_a = x >> 1;
                    if x % 2 != 0 {
                        x_a ^= MATRIX_A;
                    }
                    self.state[i] = self.state[(i + 397) % 624] ^ x_a;
                }
                self.index = 0;
            }
        }
    }
}
