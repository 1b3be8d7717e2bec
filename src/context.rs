//! Generic runtime context: device, threads, seed and the shared random generator.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::error::{LearnerError, Result};
use crate::logger::{TrainingLogger, Verbosity};
use crate::params::{ParamSet, bool_str, parse_bool, parse_value};

// =============================================================================
// Device
// =============================================================================

/// Device ordinal a learner runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceOrd {
    #[default]
    Cpu,
    Cuda(i32),
}

impl DeviceOrd {
    pub fn is_cuda(self) -> bool {
        matches!(self, DeviceOrd::Cuda(_))
    }
}

impl fmt::Display for DeviceOrd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceOrd::Cpu => write!(f, "cpu"),
            DeviceOrd::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

impl FromStr for DeviceOrd {
    type Err = LearnerError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (name, ordinal) = match s.split_once(':') {
            Some((name, ordinal)) => (name, Some(ordinal)),
            None => (s, None),
        };
        match (name, ordinal) {
            ("cpu", None) => Ok(DeviceOrd::Cpu),
            ("cuda" | "gpu", None) => Ok(DeviceOrd::Cuda(0)),
            ("cuda" | "gpu", Some(ordinal)) => match ordinal.parse::<i32>() {
                Ok(n) if n >= 0 => Ok(DeviceOrd::Cuda(n)),
                _ => Err(LearnerError::validation(format!("invalid device ordinal in `{s}`"))),
            },
            _ => Err(LearnerError::validation(format!(
                "invalid device `{s}`, expected one of cpu, cuda, cuda:<ordinal>, gpu, gpu:<ordinal>"
            ))),
        }
    }
}

// =============================================================================
// Shared Random Generator
// =============================================================================

/// Random generator shared by every sampler of one learner.
///
/// Cloning yields another handle to the same generator.
#[derive(Debug, Clone)]
pub struct GlobalRandom {
    inner: Arc<Mutex<Xoshiro256PlusPlus>>,
}

impl GlobalRandom {
    pub fn new(seed: i64) -> Self {
        Self { inner: Arc::new(Mutex::new(Xoshiro256PlusPlus::seed_from_u64(seed as u64))) }
    }

    /// Reset the generator state from `seed`.
    pub fn seed(&self, seed: i64) {
        self.with(|rng| *rng = Xoshiro256PlusPlus::seed_from_u64(seed as u64));
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Xoshiro256PlusPlus) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Draw a uniform value in `[0, 1)`.
    pub fn uniform_f32(&self) -> f32 {
        self.with(|rng| rng.r#gen::<f32>())
    }
}

impl Default for GlobalRandom {
    fn default() -> Self {
        Self::new(Context::DEFAULT_SEED)
    }
}

// =============================================================================
// Context
// =============================================================================

/// Generic parameters shared by every component of a learner.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    pub seed: i64,
    /// Reseed from `seed + iteration` at the start of every iteration.
    pub seed_per_iteration: bool,
    /// Worker threads; 0 means all available cores.
    pub nthread: usize,
    pub device: DeviceOrd,
    /// Report parameters no component consumed.
    pub validate_parameters: bool,
    pub verbosity: Verbosity,
}

impl Context {
    pub const DEFAULT_SEED: i64 = 0;

    pub fn threads(&self) -> usize {
        self.nthread
    }

    pub fn logger(&self) -> TrainingLogger {
        TrainingLogger::new(self.verbosity)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self {
            seed: Self::DEFAULT_SEED,
            seed_per_iteration: false,
            nthread: 0,
            device: DeviceOrd::Cpu,
            validate_parameters: false,
            verbosity: Verbosity::Warning,
        }
    }
}

impl ParamSet for Context {
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "seed" => self.seed = parse_value(key, value)?,
            "seed_per_iteration" => self.seed_per_iteration = parse_bool(key, value)?,
            "nthread" => {
                let n: i64 = parse_value(key, value)?;
                self.nthread = n.max(0) as usize;
            }
            "device" => self.device = value.parse()?,
            "validate_parameters" => self.validate_parameters = parse_bool(key, value)?,
            "verbosity" => self.verbosity = value.parse()?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("device".to_string(), self.device.to_string()),
            ("nthread".to_string(), self.nthread.to_string()),
            ("seed".to_string(), self.seed.to_string()),
            ("seed_per_iteration".to_string(), bool_str(self.seed_per_iteration)),
            ("validate_parameters".to_string(), bool_str(self.validate_parameters)),
            ("verbosity".to_string(), self.verbosity.to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn parse_devices() {
        assert_eq!("cpu".parse::<DeviceOrd>().unwrap(), DeviceOrd::Cpu);
        assert_eq!("cuda".parse::<DeviceOrd>().unwrap(), DeviceOrd::Cuda(0));
        assert_eq!("gpu:2".parse::<DeviceOrd>().unwrap(), DeviceOrd::Cuda(2));
        assert!("cuda:-1".parse::<DeviceOrd>().is_err());
        assert!("tpu".parse::<DeviceOrd>().is_err());
        assert_eq!(DeviceOrd::Cuda(1).to_string(), "cuda:1");
    }

    #[test]
    fn seed_accepts_full_i64_range() {
        let mut ctx = Context::default();
        let mut consumed = HashSet::new();
        let args = vec![("seed".to_string(), i64::MIN.to_string())];
        ctx.update(&args, &mut consumed).unwrap();
        assert_eq!(ctx.seed, i64::MIN);
        assert_eq!(ctx.to_args()["seed"], i64::MIN.to_string());
        assert!(consumed.contains("seed"));
    }

    #[test]
    fn negative_nthread_means_auto() {
        let mut ctx = Context::default();
        assert!(ctx.apply("nthread", "-1").unwrap());
        assert_eq!(ctx.threads(), 0);
        assert!(!ctx.apply("max_depth", "3").unwrap());
    }

    #[test]
    fn reseeding_restarts_the_sequence() {
        let rng = GlobalRandom::new(Context::DEFAULT_SEED);
        let first = rng.uniform_f32();
        let second = rng.uniform_f32();
        assert_ne!(first, second);

        rng.seed(Context::DEFAULT_SEED);
        assert_eq!(rng.uniform_f32(), first);

        let shared = rng.clone();
        shared.seed(Context::DEFAULT_SEED);
        assert_eq!(rng.uniform_f32(), first);
    }
}
