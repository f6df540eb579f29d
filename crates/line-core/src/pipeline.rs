//! Tag processing: raw register blocks in, per-device tag values out.
//!
//! The configured tag set lives behind an [`ArcSwap`]. Every `apply` works on
//! one loaded generation from start to finish, and `update_tags` replaces the
//! whole generation at once, so a reload is never observed half-done.

use crate::codec;
use crate::tags::{DeviceNo, TagDescriptor, TagId};
use crate::value::DecodedValue;
use arc_swap::ArcSwap;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Largest holding-register block a single Modbus read may request.
pub const MAX_BLOCK_WORDS: u16 = 125;
/// Unused registers tolerated between two tags before a new read starts.
const MAX_GAP_WORDS: u16 = 8;

pub type TagValues = BTreeMap<TagId, DecodedValue>;

/// Raw words read in one cycle, keyed by the block's start address.
pub type RawRegisters = BTreeMap<u16, Vec<u16>>;

/// One contiguous holding-register read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSpan {
    pub start: u16,
    pub count: u16,
}

/// Values produced by one poll cycle of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct TagSnapshot {
    pub device_no: DeviceNo,
    pub sequence: u64,
    pub values: TagValues,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("tag id {0} is configured more than once")]
    DuplicateTag(TagId),
    #[error("alarm number {0} is configured more than once")]
    DuplicateAlarm(u32),
    #[error("tag {tag_id} spans past the end of the register space")]
    AddressOverflow { tag_id: TagId },
    #[error("{0}")]
    Invalid(String),
}

/// One immutable generation of the tag configuration.
#[derive(Debug, Default)]
pub struct TagSet {
    generation: u64,
    by_id: HashMap<TagId, TagDescriptor>,
    by_device: HashMap<DeviceNo, BTreeMap<u16, Vec<TagDescriptor>>>,
}

impl TagSet {
    pub fn new(generation: u64, tags: Vec<TagDescriptor>) -> Result<Self, ConfigError> {
        let mut by_id = HashMap::with_capacity(tags.len());
        let mut by_device: HashMap<DeviceNo, BTreeMap<u16, Vec<TagDescriptor>>> = HashMap::new();
        for tag in tags {
            if u32::from(tag.address) + u32::from(tag.effective_length()) > 0x1_0000 {
                return Err(ConfigError::AddressOverflow { tag_id: tag.id });
            }
            if by_id.contains_key(&tag.id) {
                return Err(ConfigError::DuplicateTag(tag.id));
            }
            by_device
                .entry(tag.device_no)
                .or_default()
                .entry(tag.address)
                .or_default()
                .push(tag.clone());
            by_id.insert(tag.id, tag);
        }
        Ok(Self {
            generation,
            by_id,
            by_device,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn tag(&self, id: TagId) -> Option<&TagDescriptor> {
        self.by_id.get(&id)
    }

    pub fn device_tags(&self, device_no: DeviceNo) -> impl Iterator<Item = &TagDescriptor> {
        self.by_device
            .get(&device_no)
            .into_iter()
            .flat_map(|by_addr| by_addr.values().flatten())
    }

    /// Coalesced register reads covering every tag of `device_no`.
    pub fn read_plan(&self, device_no: DeviceNo) -> Vec<ReadSpan> {
        let Some(by_addr) = self.by_device.get(&device_no) else {
            return Vec::new();
        };
        let mut plan: Vec<ReadSpan> = Vec::new();
        for (&address, tags) in by_addr {
            let len = tags
                .iter()
                .map(|t| t.effective_length())
                .max()
                .unwrap_or(1)
                .min(MAX_BLOCK_WORDS);
            let end = u32::from(address) + u32::from(len);
            if let Some(last) = plan.last_mut() {
                let last_end = u32::from(last.start) + u32::from(last.count);
                let merged = end.max(last_end) - u32::from(last.start);
                if u32::from(address) <= last_end + u32::from(MAX_GAP_WORDS)
                    && merged <= u32::from(MAX_BLOCK_WORDS)
                {
                    last.count = merged as u16;
                    continue;
                }
            }
            plan.push(ReadSpan {
                start: address,
                count: len,
            });
        }
        plan
    }
}

/// Maps raw register blocks onto configured tags.
pub struct TagPipeline {
    tags: ArcSwap<TagSet>,
    next_generation: AtomicU64,
    decode_failures: AtomicU64,
}

impl TagPipeline {
    pub fn new(tags: Vec<TagDescriptor>) -> Result<Self, ConfigError> {
        let set = TagSet::new(1, tags)?;
        Ok(Self {
            tags: ArcSwap::from_pointee(set),
            next_generation: AtomicU64::new(2),
            decode_failures: AtomicU64::new(0),
        })
    }

    /// Replace the whole tag set. Returns the new generation number.
    pub fn update_tags(&self, tags: Vec<TagDescriptor>) -> Result<u64, ConfigError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let set = TagSet::new(generation, tags)?;
        debug!("tag set generation {} loaded with {} tags", generation, set.len());
        self.tags.store(Arc::new(set));
        Ok(generation)
    }

    pub fn current(&self) -> Arc<TagSet> {
        self.tags.load_full()
    }

    pub fn tag(&self, id: TagId) -> Option<TagDescriptor> {
        self.tags.load().tag(id).cloned()
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    /// Decode and scale every tag of `device_no` whose registers are in `raw`.
    ///
    /// Tags whose address is not covered are skipped; a tag that fails to
    /// decode is logged and skipped without affecting the rest.
    pub fn apply(&self, device_no: DeviceNo, raw: &RawRegisters) -> TagValues {
        let set = self.tags.load();
        let mut values = TagValues::new();
        for tag in set.device_tags(device_no) {
            let Some(words) = words_at(raw, tag.address, tag.effective_length()) else {
                continue;
            };
            match codec::decode_scaled(tag, words) {
                Ok(value) => {
                    values.insert(tag.id, value);
                }
                Err(err) => {
                    self.decode_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("device {device_no}: {err}");
                }
            }
        }
        values
    }
}

/// Words for `len` registers starting at `address`, clipped to what the
/// covering block actually holds.
fn words_at(raw: &RawRegisters, address: u16, len: u16) -> Option<&[u16]> {
    let (&start, words) = raw.range(..=address).next_back()?;
    let offset = usize::from(address - start);
    if offset >= words.len() {
        return None;
    }
    let end = (offset + usize::from(len)).min(words.len());
    Some(&words[offset..end])
}
