//! Cache store and replacement policies
//!
//! The store keeps whole videos keyed by id and accounts for the space
//! they occupy. Replacement decisions are delegated to a [`CachePolicy`]:
//! admission, victim selection, and the bookkeeping updates on insert and
//! on every hit. Three policies ship with the simulator: FIFO, LRU, and an
//! unlimited store used as a correctness oracle.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::models::{Video, VideoId};

/// Replacement policy plug-in.
///
/// The store calls `admit` before caching, `select_evict` when it must free
/// space (the policy removes the id from its own structure and returns it),
/// `on_insert` after a successful insert and `on_serve` after a hit.
pub trait CachePolicy: Send {
    fn admit(&self, video: &Video) -> bool;

    fn select_evict(&mut self) -> Option<VideoId>;

    fn on_insert(&mut self, video: &Video);

    fn on_serve(&mut self, video: &Video);

    fn name(&self) -> &'static str;
}

/// Evicts the earliest-inserted video.
#[derive(Debug, Default)]
pub struct FifoPolicy {
    order: VecDeque<VideoId>,
}

impl CachePolicy for FifoPolicy {
    fn admit(&self, _video: &Video) -> bool {
        true
    }

    fn select_evict(&mut self) -> Option<VideoId> {
        self.order.pop_front()
    }

    fn on_insert(&mut self, video: &Video) {
        self.order.push_back(video.id.clone());
    }

    fn on_serve(&mut self, _video: &Video) {}

    fn name(&self) -> &'static str {
        "FIFO"
    }
}

/// Evicts the least recently used video; a hit moves the id to the back.
#[derive(Debug, Default)]
pub struct LruPolicy {
    order: VecDeque<VideoId>,
}

impl CachePolicy for LruPolicy {
    fn admit(&self, _video: &Video) -> bool {
        true
    }

    fn select_evict(&mut self) -> Option<VideoId> {
        self.order.pop_front()
    }

    fn on_insert(&mut self, video: &Video) {
        self.order.push_back(video.id.clone());
    }

    fn on_serve(&mut self, video: &Video) {
        self.order.retain(|id| id != &video.id);
        self.order.push_back(video.id.clone());
    }

    fn name(&self) -> &'static str {
        "LRU"
    }
}

/// Admits everything and never evicts. Only meaningful in a store without a
/// size limit.
#[derive(Debug, Default)]
pub struct UnlimitedPolicy;

impl CachePolicy for UnlimitedPolicy {
    fn admit(&self, _video: &Video) -> bool {
        true
    }

    fn select_evict(&mut self) -> Option<VideoId> {
        None
    }

    fn on_insert(&mut self, _video: &Video) {}

    fn on_serve(&mut self, _video: &Video) {}

    fn name(&self) -> &'static str {
        "Unlimited"
    }
}

/// Video store with space accounting.
///
/// Invariant: `current_kb` equals the summed size of the stored videos and
/// never exceeds `max_kb` (when a limit is set).
pub struct CacheStore {
    videos: HashMap<VideoId, Video>,
    current_kb: f64,
    max_kb: Option<f64>,
    policy: Box<dyn CachePolicy>,
}

impl CacheStore {
    pub fn new(policy: Box<dyn CachePolicy>, max_kb: Option<f64>) -> Self {
        CacheStore {
            videos: HashMap::new(),
            current_kb: 0.0,
            max_kb,
            policy,
        }
    }

    pub fn fifo(max_kb: f64) -> Self {
        Self::new(Box::<FifoPolicy>::default(), Some(max_kb))
    }

    pub fn lru(max_kb: f64) -> Self {
        Self::new(Box::<LruPolicy>::default(), Some(max_kb))
    }

    pub fn unlimited() -> Self {
        Self::new(Box::<UnlimitedPolicy>::default(), None)
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn contains(&self, id: &VideoId) -> bool {
        self.videos.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }

    pub fn current_kb(&self) -> f64 {
        self.current_kb
    }

    pub fn max_kb(&self) -> Option<f64> {
        self.max_kb
    }

    /// Look up a video for serving; a hit updates the policy structure.
    pub fn serve(&mut self, id: &VideoId) -> Option<Video> {
        let video = self.videos.get(id).cloned()?;
        self.policy.on_serve(&video);
        Some(video)
    }

    /// Would the store overflow if `extra_kb` were added right now?
    pub fn is_full(&self, extra_kb: f64) -> bool {
        match self.max_kb {
            Some(max) => self.current_kb + extra_kb >= max,
            None => false,
        }
    }

    /// May this video be cached at all: not already present, admitted by
    /// the policy, and smaller than the whole cache.
    pub fn should_admit(&self, video: &Video) -> bool {
        if self.contains(&video.id) || !self.policy.admit(video) {
            return false;
        }
        match self.max_kb {
            Some(max) => video.size_kb < max,
            None => true,
        }
    }

    /// Evict until `target_kb` more fits. The admission size check
    /// guarantees progress: at worst the store is emptied.
    pub fn make_space(&mut self, target_kb: f64) {
        while self.is_full(target_kb) {
            let Some(victim) = self.policy.select_evict() else {
                break;
            };
            match self.videos.remove(&victim) {
                Some(video) => {
                    self.current_kb -= video.size_kb;
                    debug!(video = %victim, freed_kb = video.size_kb, "evicted");
                }
                None => warn!(video = %victim, "policy evicted an id the store does not hold"),
            }
        }
    }

    /// Add to the store and update the policy. Callers run `should_admit`
    /// and `make_space` first.
    pub fn insert(&mut self, video: Video) {
        self.current_kb += video.size_kb;
        self.policy.on_insert(&video);
        self.videos.insert(video.id.clone(), video);
    }
}
