//! Descriptor data maintenance hub.
//!
//! Buffers and textures can be reallocated while descriptor sets keep
//! pointing at them. Every descriptor write that depends on a resource is
//! registered here, and any change of the resource's native state must be
//! pushed through [`DescriptorHub::update`] before the old handle goes away.

use crate::descriptors::{DescriptorInfo, DescriptorSetId, SharedDescriptorSet};
use ash::vk;
use hashbrown::HashMap;
use std::sync::Arc;

/// Identity of a resource that descriptors can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    BufferView(u64),
    TextureView(u64),
    Sampler(u64),
}

/// A resource whose current native state can be written into a descriptor.
pub trait DescriptorSource {
    /// Stable identity, unchanged across reallocations.
    fn key(&self) -> ResourceKey;

    /// Write the current native state into `info`.
    fn write(&self, info: &mut DescriptorInfo);
}

/// A window into a buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferViewSource {
    pub id: u64,
    pub buffer: vk::Buffer,
    /// Offset of the buffer inside its native allocation.
    pub base_offset: u64,
    /// Offset of the view inside the buffer.
    pub offset: u64,
    pub range: u64,
}

impl DescriptorSource for BufferViewSource {
    fn key(&self) -> ResourceKey {
        ResourceKey::BufferView(self.id)
    }

    fn write(&self, info: &mut DescriptorInfo) {
        info.buffer = vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset: self.base_offset + self.offset,
            range: self.range,
        };
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TextureViewSource {
    pub id: u64,
    pub image_view: vk::ImageView,
    pub layout: vk::ImageLayout,
}

impl DescriptorSource for TextureViewSource {
    fn key(&self) -> ResourceKey {
        ResourceKey::TextureView(self.id)
    }

    fn write(&self, info: &mut DescriptorInfo) {
        // SAFETY: the union is always fully initialized.
        let mut image = unsafe { info.image };
        image.image_view = self.image_view;
        image.image_layout = self.layout;
        info.image = image;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerSource {
    pub id: u64,
    pub sampler: vk::Sampler,
}

impl DescriptorSource for SamplerSource {
    fn key(&self) -> ResourceKey {
        ResourceKey::Sampler(self.id)
    }

    fn write(&self, info: &mut DescriptorInfo) {
        // SAFETY: the union is always fully initialized.
        let mut image = unsafe { info.image };
        image.sampler = self.sampler;
        info.image = image;
    }
}

/// One descriptor write: a slot in a descriptor set's info array.
#[derive(Clone)]
pub struct DescriptorRecord {
    set: SharedDescriptorSet,
    set_id: DescriptorSetId,
    index: usize,
}

impl DescriptorRecord {
    pub fn new(set: &SharedDescriptorSet, index: usize) -> Self {
        let set_id = set.lock().id();
        Self {
            set: set.clone(),
            set_id,
            index,
        }
    }

    pub fn set_id(&self) -> DescriptorSetId {
        self.set_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn same_as(&self, other: &Self) -> bool {
        self.index == other.index && Arc::ptr_eq(&self.set, &other.set)
    }

    fn refresh(&self, source: &(impl DescriptorSource + ?Sized)) {
        let mut set = self.set.lock();
        match set.info_mut(self.index) {
            Some(info) => source.write(info),
            None => tracing::warn!(
                index = self.index,
                "descriptor record points past the end of its set"
            ),
        }
    }
}

/// Tracks which descriptor writes reference which resource.
#[derive(Default)]
pub struct DescriptorHub {
    records: HashMap<ResourceKey, Vec<DescriptorRecord>>,
}

impl DescriptorHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `record` as depending on `source`.
    pub fn connect<S: DescriptorSource + ?Sized>(&mut self, source: &S, record: DescriptorRecord) {
        let records = self.records.entry(source.key()).or_default();
        if !records.iter().any(|r| r.same_as(&record)) {
            records.push(record);
        }
    }

    /// Rewrite the dependents of `source` from its current state.
    ///
    /// With `record` set, only that record is refreshed (and only if it is
    /// registered). Unknown resources are ignored.
    pub fn update<S: DescriptorSource + ?Sized>(
        &self,
        source: &S,
        record: Option<&DescriptorRecord>,
    ) {
        let Some(records) = self.records.get(&source.key()) else {
            return;
        };

        match record {
            None => records.iter().for_each(|r| r.refresh(source)),
            Some(record) => {
                if let Some(r) = records.iter().find(|r| r.same_as(record)) {
                    r.refresh(source);
                }
            }
        }
    }

    /// Drop one dependency of `source`, or all of them when `record` is `None`.
    pub fn disengage<S: DescriptorSource + ?Sized>(
        &mut self,
        source: &S,
        record: Option<&DescriptorRecord>,
    ) {
        let key = source.key();
        match record {
            None => {
                self.records.remove(&key);
            }
            Some(record) => {
                if let Some(records) = self.records.get_mut(&key) {
                    if let Some(pos) = records.iter().position(|r| r.same_as(record)) {
                        records.swap_remove(pos);
                    }
                    if records.is_empty() {
                        self.records.remove(&key);
                    }
                }
            }
        }
    }

    /// Drop every record that belongs to descriptor set `set`.
    pub fn disengage_set(&mut self, set: DescriptorSetId) {
        self.records.retain(|_, records| {
            records.retain(|r| r.set_id != set);
            !records.is_empty()
        });
    }

    /// Distinct descriptor sets with at least one record depending on `key`.
    pub fn sets_of(&self, key: ResourceKey) -> Vec<SharedDescriptorSet> {
        let mut sets: Vec<SharedDescriptorSet> = Vec::new();
        for record in self.records.get(&key).into_iter().flatten() {
            if !sets.iter().any(|set| Arc::ptr_eq(set, &record.set)) {
                sets.push(record.set.clone());
            }
        }
        sets
    }

    /// Number of records depending on `key`.
    pub fn record_count(&self, key: ResourceKey) -> usize {
        self.records.get(&key).map_or(0, Vec::len)
    }
}
