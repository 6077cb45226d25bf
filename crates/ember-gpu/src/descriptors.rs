//! Descriptor set management.
//!
//! [`DescriptorSetPool`] hands out sets of one layout from a growing list of
//! fixed-size native pools. [`GpuDescriptorSet`] is the per-resource record:
//! one native set per back-buffer slot plus the write data shared by all of
//! them.

use crate::device::DeviceContext;
use crate::error::{GpuError, Result};
use ash::vk;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    /// Add a combined image sampler binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    /// Bindings added so far.
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'a>] {
        &self.bindings
    }

    /// Write entries matching the bindings, one per descriptor.
    pub fn writes(&self) -> Vec<DescriptorWrite> {
        self.bindings
            .iter()
            .flat_map(|b| {
                (0..b.descriptor_count).map(move |element| DescriptorWrite {
                    binding: b.binding,
                    array_element: element,
                    descriptor_type: b.descriptor_type,
                })
            })
            .collect()
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(&self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        let layout = device.create_descriptor_set_layout(&layout_info, None)?;
        Ok(layout)
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Storage for one descriptor, laid out so an update template can read an
/// array of these directly.
#[repr(C)]
#[derive(Clone, Copy)]
pub union DescriptorInfo {
    pub image: vk::DescriptorImageInfo,
    pub buffer: vk::DescriptorBufferInfo,
    pub texel_buffer_view: vk::BufferView,
}

impl DescriptorInfo {
    /// Info for a uniform or storage buffer binding.
    pub fn from_buffer(info: vk::DescriptorBufferInfo) -> Self {
        let mut this = Self::default();
        this.buffer = info;
        this
    }

    /// Info for a sampler, sampled image or storage image binding.
    pub fn from_image(info: vk::DescriptorImageInfo) -> Self {
        let mut this = Self::default();
        this.image = info;
        this
    }

    /// Info for a texel buffer binding.
    pub fn from_texel_buffer_view(view: vk::BufferView) -> Self {
        let mut this = Self::default();
        this.texel_buffer_view = view;
        this
    }
}

impl Default for DescriptorInfo {
    fn default() -> Self {
        // SAFETY: every variant is plain handles and integers, for which
        // all-zero is a valid (null) value.
        unsafe { std::mem::zeroed() }
    }
}

impl fmt::Debug for DescriptorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: the union is always fully initialized (see `Default`).
        let buffer = unsafe { self.buffer };
        f.debug_struct("DescriptorInfo")
            .field("raw", &(buffer.buffer, buffer.offset, buffer.range))
            .finish()
    }
}

/// Which member of [`DescriptorInfo`] a descriptor type uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorInfoKind {
    Buffer,
    Image,
    TexelBuffer,
}

impl DescriptorInfoKind {
    pub fn of(descriptor_type: vk::DescriptorType) -> Self {
        match descriptor_type {
            vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::STORAGE_BUFFER
            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => Self::Buffer,
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER
            | vk::DescriptorType::STORAGE_TEXEL_BUFFER => Self::TexelBuffer,
            _ => Self::Image,
        }
    }
}

/// Destination of one descriptor inside a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: vk::DescriptorType,
}

/// Process-unique identity of a [`GpuDescriptorSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorSetId(u64);

impl DescriptorSetId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A descriptor set replicated once per back-buffer slot.
pub struct GpuDescriptorSet {
    id: DescriptorSetId,
    layout: vk::DescriptorSetLayout,
    sets: Vec<vk::DescriptorSet>,
    writes: Vec<DescriptorWrite>,
    infos: Vec<DescriptorInfo>,
    update_template: Option<vk::DescriptorUpdateTemplate>,
}

/// A descriptor set shared between its owner and the descriptor hubs.
pub type SharedDescriptorSet = Arc<Mutex<GpuDescriptorSet>>;

impl GpuDescriptorSet {
    /// Create a record over `sets` (one per back-buffer slot).
    pub fn new(
        layout: vk::DescriptorSetLayout,
        sets: Vec<vk::DescriptorSet>,
        writes: Vec<DescriptorWrite>,
    ) -> Self {
        let infos = vec![DescriptorInfo::default(); writes.len()];
        Self {
            id: DescriptorSetId::next(),
            layout,
            sets,
            writes,
            infos,
            update_template: None,
        }
    }

    /// Wrap into a [`SharedDescriptorSet`].
    pub fn into_shared(self) -> SharedDescriptorSet {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> DescriptorSetId {
        self.id
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Native set used while `slot` is the current back buffer.
    pub fn set(&self, slot: u32) -> Option<vk::DescriptorSet> {
        self.sets.get(slot as usize).copied()
    }

    /// Native sets, indexed by back-buffer slot.
    pub fn sets(&self) -> &[vk::DescriptorSet] {
        &self.sets
    }

    pub fn writes(&self) -> &[DescriptorWrite] {
        &self.writes
    }

    pub fn infos(&self) -> &[DescriptorInfo] {
        &self.infos
    }

    /// Mutable access to the info of write `index`.
    pub fn info_mut(&mut self, index: usize) -> Option<&mut DescriptorInfo> {
        self.infos.get_mut(index)
    }

    /// Use `template` for updates when the device supports it.
    pub fn set_update_template(&mut self, template: Option<vk::DescriptorUpdateTemplate>) {
        self.update_template = template;
    }

    /// Push the current infos into the native set of `slot`.
    pub(crate) fn apply(&self, device: &DeviceContext, slot: u32) {
        let Some(set) = self.set(slot) else {
            tracing::warn!(slot, "descriptor set has no replica for slot");
            return;
        };

        if let Some(template) = self.update_template {
            if device.capabilities().supports_descriptor_update_template {
                device
                    .raw()
                    .update_descriptor_set_with_template(set, template, &self.infos);
                return;
            }
        }

        if self.writes.is_empty() {
            return;
        }

        let writes: Vec<vk::WriteDescriptorSet<'_>> = self
            .writes
            .iter()
            .zip(&self.infos)
            .map(|(write, info)| {
                let entry = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.descriptor_type);
                // SAFETY: the union is always fully initialized; the member is
                // chosen by descriptor type.
                unsafe {
                    match DescriptorInfoKind::of(write.descriptor_type) {
                        DescriptorInfoKind::Buffer => {
                            entry.buffer_info(std::slice::from_ref(&info.buffer))
                        }
                        DescriptorInfoKind::Image => {
                            entry.image_info(std::slice::from_ref(&info.image))
                        }
                        DescriptorInfoKind::TexelBuffer => entry
                            .texel_buffer_view(std::slice::from_ref(&info.texel_buffer_view)),
                    }
                }
            })
            .collect();

        device.raw().update_descriptor_sets(&writes);
    }
}

struct BackingPool {
    pool: vk::DescriptorPool,
    active: HashSet<vk::DescriptorSet>,
    free: Vec<vk::DescriptorSet>,
}

/// Unlimited descriptor set pool for one layout, based on multiple fixed-size
/// native descriptor pools.
///
/// Sets are never freed individually; [`yield_set`](Self::yield_set) only marks
/// them reusable. Native pools are destroyed when this pool is dropped.
pub struct DescriptorSetPool {
    device: Arc<DeviceContext>,
    pools: Vec<BackingPool>,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    max_sets_per_pool: u32,
}

impl DescriptorSetPool {
    /// Create an unlinked pool.
    pub fn new(device: Arc<DeviceContext>) -> Self {
        Self {
            device,
            pools: Vec::new(),
            pool_sizes: Vec::new(),
            set_layouts: Vec::new(),
            max_sets_per_pool: 0,
        }
    }

    /// Configure the pool for `layout`.
    ///
    /// Each backing pool holds `max_sets_per_pool` sets, so it reserves
    /// `descriptor_count * max_sets_per_pool` descriptors per binding.
    pub fn link(
        &mut self,
        max_sets_per_pool: u32,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
        layout: vk::DescriptorSetLayout,
    ) {
        let max_sets_per_pool = max_sets_per_pool.max(1);
        self.max_sets_per_pool = max_sets_per_pool;
        self.set_layouts = vec![layout; max_sets_per_pool as usize];

        let mut type_counts: HashMap<vk::DescriptorType, u32> = HashMap::new();
        for binding in bindings {
            *type_counts.entry(binding.descriptor_type).or_default() +=
                binding.descriptor_count.max(1) * max_sets_per_pool;
        }

        self.pool_sizes = type_counts
            .into_iter()
            .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count,
            })
            .collect();
    }

    pub fn is_linked(&self) -> bool {
        self.max_sets_per_pool > 0
    }

    /// Get a free set, growing by one backing pool when all are exhausted.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn request(&mut self) -> Result<vk::DescriptorSet> {
        if !self.is_linked() {
            return Err(GpuError::InvalidState(
                "descriptor set pool used before link".to_string(),
            ));
        }

        let index = match self.pools.iter().position(|p| !p.free.is_empty()) {
            Some(index) => index,
            None => self.grow()?,
        };

        let pool = &mut self.pools[index];
        let set = pool
            .free
            .pop()
            .ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)?;
        pool.active.insert(set);
        Ok(set)
    }

    fn grow(&mut self) -> Result<usize> {
        let raw = self.device.raw();
        let pool = raw.create_descriptor_pool(self.max_sets_per_pool, &self.pool_sizes)?;

        let mut free = match raw.allocate_descriptor_sets(pool, &self.set_layouts) {
            Ok(sets) => sets,
            Err(e) => {
                raw.destroy_descriptor_pool(pool);
                return Err(e);
            }
        };
        // Hand out in allocation order
        free.reverse();

        self.pools.push(BackingPool {
            pool,
            active: HashSet::new(),
            free,
        });
        tracing::debug!(
            backing_pools = self.pools.len(),
            sets_per_pool = self.max_sets_per_pool,
            "descriptor set pool grew"
        );

        Ok(self.pools.len() - 1)
    }

    /// Mark `set` reusable.
    pub fn yield_set(&mut self, set: vk::DescriptorSet) {
        for pool in &mut self.pools {
            if pool.active.remove(&set) {
                pool.free.push(set);
                return;
            }
        }
        tracing::warn!(?set, "yielded descriptor set does not belong to this pool");
    }

    /// Index of the backing pool that owns an active `set`.
    #[cfg(test)]
    fn owner_of(&self, set: vk::DescriptorSet) -> Option<usize> {
        self.pools.iter().position(|p| p.active.contains(&set))
    }

    pub fn backing_pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn active_count(&self) -> usize {
        self.pools.iter().map(|p| p.active.len()).sum()
    }

    pub fn free_count(&self) -> usize {
        self.pools.iter().map(|p| p.free.len()).sum()
    }
}

impl Drop for DescriptorSetPool {
    fn drop(&mut self) {
        let leaked = self.active_count();
        for pool in self.pools.drain(..) {
            self.device.raw().destroy_descriptor_pool(pool.pool);
        }
        if leaked > 0 {
            tracing::warn!("Leaked {leaked} descriptor sets.");
        }
    }
}
