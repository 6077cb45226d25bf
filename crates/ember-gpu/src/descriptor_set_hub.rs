//! Deferred descriptor set updates.
//!
//! A descriptor set may still be bound by work in flight for another slot, so
//! its writes are applied to the current slot right away and replayed for the
//! other slots once each of them becomes current again.

use crate::descriptors::{DescriptorSetId, SharedDescriptorSet};
use crate::device::DeviceContext;
use hashbrown::HashMap;
use std::sync::Arc;

/// Keeps every back-buffer replica of a descriptor set up to date.
///
/// Writes land in the current slot at once and in the other slots when they
/// become current.
pub struct DescriptorSetHub {
    device: Arc<DeviceContext>,
    pending: Vec<HashMap<DescriptorSetId, SharedDescriptorSet>>,
}

impl DescriptorSetHub {
    /// Create a hub with one pending map per back-buffer slot.
    pub fn new(device: Arc<DeviceContext>) -> Self {
        let slots = device.back_buffer_count() as usize;
        Self {
            device,
            pending: (0..slots).map(|_| HashMap::new()).collect(),
        }
    }

    /// Apply the writes of `set` to the current slot and schedule them for
    /// every other slot.
    pub fn record(&mut self, set: &SharedDescriptorSet) {
        let current = self.device.back_buffer_index();
        let id = {
            let set = set.lock();
            set.apply(&self.device, current);
            set.id()
        };

        for (slot, pending) in self.pending.iter_mut().enumerate() {
            if slot as u32 == current {
                // Already up to date
                pending.remove(&id);
            } else {
                pending.insert(id, set.clone());
            }
        }
    }

    /// Apply the pending writes of the current slot.
    ///
    /// Must run before submitting work that binds the current slot's sets.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn flush(&mut self) {
        let current = self.device.back_buffer_index();
        let Some(pending) = self.pending.get_mut(current as usize) else {
            return;
        };

        for set in pending.values() {
            set.lock().apply(&self.device, current);
        }
        pending.clear();
    }

    /// Drop a retired set from every slot.
    pub fn forget(&mut self, id: DescriptorSetId) {
        for pending in &mut self.pending {
            pending.remove(&id);
        }
    }

    /// Sets waiting to be applied to `slot`.
    pub fn pending_count(&self, slot: u32) -> usize {
        self.pending.get(slot as usize).map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{DescriptorWrite, GpuDescriptorSet};
    use crate::mock::MockDevice;
    use ash::vk::{self, Handle};

    fn replicated_set(slots: u64) -> SharedDescriptorSet {
        GpuDescriptorSet::new(
            vk::DescriptorSetLayout::from_raw(1),
            (0..slots)
                .map(|slot| vk::DescriptorSet::from_raw(100 + slot))
                .collect(),
            vec![DescriptorWrite {
                binding: 0,
                array_element: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            }],
        )
        .into_shared()
    }

    #[test]
    fn record_applies_now_and_defers_other_slots() {
        let (mock, device) = MockDevice::pair(3);
        let mut hub = DescriptorSetHub::new(device.clone());
        let set = replicated_set(3);

        hub.record(&set);

        assert_eq!(mock.state().written_sets, vec![vk::DescriptorSet::from_raw(100)]);
        assert_eq!(hub.pending_count(0), 0);
        assert_eq!(hub.pending_count(1), 1);
        assert_eq!(hub.pending_count(2), 1);
    }

    #[test]
    fn flush_applies_each_slot_once_when_it_comes_around() {
        let (mock, device) = MockDevice::pair(3);
        let mut hub = DescriptorSetHub::new(device.clone());
        let set = replicated_set(3);
        hub.record(&set);

        device.advance_back_buffer();
        hub.flush();
        hub.flush();
        device.advance_back_buffer();
        hub.flush();
        device.advance_back_buffer();
        hub.flush();

        let expected: Vec<_> = (100..103).map(vk::DescriptorSet::from_raw).collect();
        assert_eq!(mock.state().written_sets, expected);
        assert!((0..3).all(|slot| hub.pending_count(slot) == 0));
    }

    #[test]
    fn recording_twice_keeps_one_pending_entry() {
        let device = MockDevice::context(2);
        let mut hub = DescriptorSetHub::new(device);
        let set = replicated_set(2);

        hub.record(&set);
        hub.record(&set);

        assert_eq!(hub.pending_count(1), 1);
    }

    #[test]
    fn forget_drops_retired_set() {
        let (mock, device) = MockDevice::pair(2);
        let mut hub = DescriptorSetHub::new(device.clone());
        let set = replicated_set(2);
        hub.record(&set);

        let id = set.lock().id();
        hub.forget(id);
        device.advance_back_buffer();
        hub.flush();

        assert_eq!(mock.state().written_sets.len(), 1);
    }
}
