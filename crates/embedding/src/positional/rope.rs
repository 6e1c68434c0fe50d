//! Rotary positional embeddings for sequence-major attention tensors.
//!
//! Tensors are laid out `[batch, seq_len, heads, head_dim]`, the layout the
//! attention projections produce before any transpose. Rotation pairs
//! interleaved features `(2i, 2i + 1)` of the leading `rotate_dim` features;
//! the remaining tail is copied through untouched.
//!
//! Sine/cosine tables are shared through a small process-wide LRU keyed by
//! geometry and device so that every layer with the same head size reuses the
//! same tables.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use candle_core::{bail, DType, Device, DeviceLocation, Result, Tensor};
use serde::{Deserialize, Serialize};

const SIN_COS_CACHE_CAPACITY: usize = 16;

static SIN_COS_CACHE_HITS: AtomicUsize = AtomicUsize::new(0);
static SIN_COS_CACHE_MISSES: AtomicUsize = AtomicUsize::new(0);

/// Return the current `(hits, misses)` counters for the shared sin/cos cache.
pub fn sin_cos_cache_counters() -> (usize, usize) {
    (
        SIN_COS_CACHE_HITS.load(Ordering::Relaxed),
        SIN_COS_CACHE_MISSES.load(Ordering::Relaxed),
    )
}

struct SinCosCache {
    capacity: usize,
    order: Vec<String>,
    entries: HashMap<String, (Tensor, Tensor)>,
}

impl SinCosCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Vec::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key_owned = self.order.remove(pos);
            self.order.push(key_owned);
        }
    }

    fn get(&mut self, key: &str) -> Option<(Tensor, Tensor)> {
        let (sin, cos) = self.entries.get(key)?.clone();
        self.touch(key);
        Some((sin, cos))
    }

    fn insert(&mut self, key: String, value: (Tensor, Tensor)) {
        if self.entries.contains_key(&key) {
            self.entries.insert(key.clone(), value);
            self.touch(&key);
            return;
        }
        if self.entries.len() >= self.capacity && !self.order.is_empty() {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }
        self.order.push(key.clone());
        self.entries.insert(key, value);
    }
}

fn global_sin_cos_cache() -> &'static Mutex<SinCosCache> {
    static CACHE: OnceLock<Mutex<SinCosCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(SinCosCache::new(SIN_COS_CACHE_CAPACITY)))
}

/// Configuration for building rotary positional embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RopeConfig {
    /// Per-head dimensionality of the representations being rotated.
    pub head_dim: usize,
    /// Base angle θ controlling the frequency spectrum.
    #[serde(default = "default_theta")]
    pub rope_theta: f32,
    /// How many leading features to rotate; `None` rotates the full `head_dim`.
    #[serde(default)]
    pub rotate_dim: Option<usize>,
}

fn default_theta() -> f32 {
    10_000.0
}

impl RopeConfig {
    /// Full-width rotation with the conventional θ = 10k.
    pub fn new(head_dim: usize) -> Self {
        Self {
            head_dim,
            rope_theta: default_theta(),
            rotate_dim: None,
        }
    }

    /// Number of features that are actually rotated.
    pub fn effective_rotate_dim(&self) -> usize {
        self.rotate_dim.unwrap_or(self.head_dim)
    }

    /// Checks the geometry: non-zero head size, even rotate width within the head.
    pub fn validate(&self) -> Result<()> {
        if self.head_dim == 0 {
            bail!("head_dim must be non-zero");
        }
        let rotate_dim = self.effective_rotate_dim();
        if rotate_dim < 2 || rotate_dim > self.head_dim {
            bail!(
                "invalid rotate_dim {} for head_dim {}",
                rotate_dim,
                self.head_dim
            );
        }
        if rotate_dim % 2 != 0 {
            bail!("rotate_dim must be even, got {rotate_dim}");
        }
        if !(self.rope_theta > 0.0) {
            bail!("rope_theta must be positive, got {}", self.rope_theta);
        }
        Ok(())
    }

    /// Short description written into layer logs.
    pub fn fingerprint(&self) -> String {
        let rotate = self
            .rotate_dim
            .map(|d| d.to_string())
            .unwrap_or_else(|| "all".to_owned());
        format!(
            "head_dim={};theta={:.1};rot={}",
            self.head_dim, self.rope_theta, rotate
        )
    }
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Build a stable cache key derived from geometry and device inputs.
pub fn rope_cache_key(max_seq_len: usize, cfg: &RopeConfig, device: &Device) -> String {
    let device_id = match device.location() {
        DeviceLocation::Cpu => "cpu".to_owned(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda{gpu_id}"),
        DeviceLocation::Metal { gpu_id } => format!("metal{gpu_id}"),
    };
    format!(
        "seq={};rot={};theta={:.6};dev={}",
        max_seq_len,
        cfg.effective_rotate_dim(),
        cfg.rope_theta,
        device_id
    )
}

/// Retrieve (or lazily build) the per-device sine/cosine tables.
///
/// Tables are `f32` tensors shaped `[max_seq_len, rotate_dim / 2]`.
pub fn get_sin_cos(max_seq_len: usize, cfg: &RopeConfig, device: &Device) -> Result<(Tensor, Tensor)> {
    if max_seq_len == 0 {
        bail!("max_seq_len must be non-zero");
    }
    cfg.validate()?;

    let cache_key = rope_cache_key(max_seq_len, cfg, device);
    let cache = global_sin_cos_cache();
    {
        let mut guard = cache.lock().expect("sin/cos cache lock poisoned");
        if let Some(tables) = guard.get(&cache_key) {
            SIN_COS_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
            log::debug!("rope sin/cos cache hit: {}", cache_key);
            return Ok(tables);
        }
    }
    SIN_COS_CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
    log::debug!("rope sin/cos cache miss: {}", cache_key);

    let rotate_dim = cfg.effective_rotate_dim();
    let half_dim = rotate_dim / 2;
    let base = cfg.rope_theta as f64;
    let inv_freqs: Vec<f64> = (0..half_dim)
        .map(|idx| base.powf(-((2 * idx) as f64) / rotate_dim as f64))
        .collect();

    let mut sin_data = Vec::with_capacity(max_seq_len * half_dim);
    let mut cos_data = Vec::with_capacity(max_seq_len * half_dim);
    for pos in 0..max_seq_len {
        for &inv_freq in &inv_freqs {
            let angle = pos as f64 * inv_freq;
            sin_data.push(angle.sin() as f32);
            cos_data.push(angle.cos() as f32);
        }
    }
    let sin = Tensor::from_vec(sin_data, (max_seq_len, half_dim), device)?;
    let cos = Tensor::from_vec(cos_data, (max_seq_len, half_dim), device)?;

    let mut guard = cache.lock().expect("sin/cos cache lock poisoned");
    guard.insert(cache_key, (sin.clone(), cos.clone()));
    Ok((sin, cos))
}

/// Rotate a single `[batch, seq_len, heads, head_dim]` tensor whose first
/// token sits at absolute position `pos_start`.
///
/// `sin`/`cos` must cover at least `pos_start + seq_len` rows. The output keeps
/// the dtype of `tensor`; the rotation itself runs in `f32`.
pub fn apply_rope(
    tensor: &Tensor,
    pos_start: usize,
    cfg: &RopeConfig,
    sin: &Tensor,
    cos: &Tensor,
) -> Result<Tensor> {
    let (batch, seq_len, heads, head_dim) = tensor.dims4()?;
    let rotate_dim = cfg.effective_rotate_dim();
    if rotate_dim == 0 || rotate_dim > head_dim || rotate_dim % 2 != 0 {
        bail!(
            "invalid rotate_dim {} for head_dim {}",
            rotate_dim,
            head_dim
        );
    }
    let half_dim = rotate_dim / 2;

    let (rows, sin_dim) = sin.dims2()?;
    if rows < pos_start + seq_len || sin_dim != half_dim || cos.dims() != sin.dims() {
        bail!(
            "sin/cos tables {:?} do not cover positions {}..{} with {} frequencies",
            sin.dims(),
            pos_start,
            pos_start + seq_len,
            half_dim
        );
    }

    let shape = (batch, seq_len, heads, half_dim);
    let sin_b = sin
        .narrow(0, pos_start, seq_len)?
        .reshape((1, seq_len, 1, half_dim))?
        .broadcast_as(shape)?;
    let cos_b = cos
        .narrow(0, pos_start, seq_len)?
        .reshape((1, seq_len, 1, half_dim))?
        .broadcast_as(shape)?;

    let dtype = tensor.dtype();
    let pairs = tensor
        .narrow(3, 0, rotate_dim)?
        .to_dtype(DType::F32)?
        .reshape((batch, seq_len, heads, half_dim, 2))?;
    let even = pairs.narrow(4, 0, 1)?.squeeze(4)?;
    let odd = pairs.narrow(4, 1, 1)?.squeeze(4)?;

    let rotated_even = (even.mul(&cos_b)? - odd.mul(&sin_b)?)?;
    let rotated_odd = (odd.mul(&cos_b)? + even.mul(&sin_b)?)?;
    let rotated = Tensor::stack(&[&rotated_even, &rotated_odd], 4)?
        .reshape((batch, seq_len, heads, rotate_dim))?
        .to_dtype(dtype)?;

    if rotate_dim == head_dim {
        Ok(rotated)
    } else {
        let tail = tensor.narrow(3, rotate_dim, head_dim - rotate_dim)?;
        Tensor::cat(&[&rotated, &tail], 3)
    }
}

/// Rotary embedding helper validating its geometry once at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Rope {
    config: RopeConfig,
}

impl Rope {
    pub fn new(config: RopeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    /// Rotate query and key streams, each starting at its own absolute offset.
    ///
    /// The streams may have different sequence lengths (cross-attention) but
    /// must share `head_dim`.
    pub fn rotate_qk(
        &self,
        query: &Tensor,
        key: &Tensor,
        q_pos_offset: usize,
        k_pos_offset: usize,
    ) -> Result<(Tensor, Tensor)> {
        if !query.device().same_device(key.device()) {
            bail!("query and key must live on the same device");
        }
        let (_, q_len, _, q_dim) = query.dims4()?;
        let (_, k_len, _, k_dim) = key.dims4()?;
        if q_dim != self.config.head_dim || k_dim != self.config.head_dim {
            bail!(
                "rope configured for head_dim {} but got query {} / key {}",
                self.config.head_dim,
                q_dim,
                k_dim
            );
        }
        let needed = (q_pos_offset + q_len).max(k_pos_offset + k_len);
        let (sin, cos) = get_sin_cos(needed, &self.config, query.device())?;
        let q_rot = apply_rope(query, q_pos_offset, &self.config, &sin, &cos)?;
        let k_rot = apply_rope(key, k_pos_offset, &self.config, &sin, &cos)?;
        Ok((q_rot, k_rot))
    }
}
