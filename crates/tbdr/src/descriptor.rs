//! Bound descriptor state as far as the recorder needs it: where each set lives, and the
//! uniform buffers whose contents get pushed into the constant file.

/// Maximum descriptor sets per bind point.
pub const MAX_SETS: usize = 4;

/// Uniform buffer referenced by a descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UboDescriptor {
    pub iova: u64,
    /// Bytes; reads past the end return zero.
    pub size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSet {
    /// GPU address of the set's descriptor memory.
    pub iova: u64,
    /// Uniform buffer descriptors, indexed by block.
    pub ubos: Vec<UboDescriptor>,
}

/// Which descriptor a constant upload reads its buffer address from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UboSource {
    Set(u32),
    /// Dynamic uniform buffers, bound alongside the sets.
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UboBinding {
    pub source: UboSource,
    pub block: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorState {
    pub sets: [Option<DescriptorSet>; MAX_SETS],
    pub dynamic_ubos: Vec<UboDescriptor>,
}

impl DescriptorState {
    pub fn ubo(&self, binding: UboBinding) -> Option<UboDescriptor> {
        let list = match binding.source {
            UboSource::Set(set) => &self.sets.get(set as usize)?.as_ref()?.ubos,
            UboSource::Dynamic => &self.dynamic_ubos,
        };
        list.get(binding.block as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ubo_lookup_misses_unbound_sets() {
        let mut state = DescriptorState::default();
        state.sets[1] = Some(DescriptorSet {
            iova: 0x1000,
            ubos: vec![UboDescriptor { iova: 0x2000, size: 64 }],
        });
        state.dynamic_ubos.push(UboDescriptor { iova: 0x3000, size: 16 });

        let get = |source, block| state.ubo(UboBinding { source, block });
        assert_eq!(get(UboSource::Set(1), 0).map(|u| u.iova), Some(0x2000));
        assert_eq!(get(UboSource::Set(0), 0), None);
        assert_eq!(get(UboSource::Set(9), 0), None);
        assert_eq!(get(UboSource::Dynamic, 0).map(|u| u.size), Some(16));
        assert_eq!(get(UboSource::Dynamic, 1), None);
    }
}
