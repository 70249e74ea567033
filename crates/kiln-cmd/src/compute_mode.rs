//! # Compute Mode
//!
//! Tracks the compute-mode properties a command list requires and emits
//! STATE_COMPUTE_MODE only when a tracked property differs from what was
//! last emitted.
//!
//! ```text
//!   required ──► diff vs last emitted ──► dirty ∩ supported
//!                                            │
//!                          empty ◄───────────┴──────────► emit
//!                        (nothing)              [PIPE_CONTROL]
//!                                               STATE_COMPUTE_MODE
//!                                               [MI_LOAD_REGISTER_IMM]
//! ```

use alloc::vec::Vec;

use kiln_core::{HardwareCapabilities, ThreadArbitrationPolicy};

use crate::commands::{
    header, opcode, register, scm_property, MiLoadRegisterImm, PipeControl, PipeControlFlags,
    ScmProperty,
};
use crate::stream::{GraphicsCommandStream, StreamDirty};

// =============================================================================
// PROPERTIES
// =============================================================================

/// Compute-mode properties a dispatch needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeModeProperties {
    /// Coherency with the host is required
    pub coherency_required: bool,
    /// Kernel uses the large GRF
    pub large_grf: bool,
    /// EU thread arbitration
    pub thread_arbitration: ThreadArbitrationPolicy,
}

impl ComputeModeProperties {
    /// Properties with everything at the defaults
    pub const fn new(thread_arbitration: ThreadArbitrationPolicy) -> Self {
        Self {
            coherency_required: false,
            large_grf: false,
            thread_arbitration,
        }
    }
}

bitflags::bitflags! {
    /// Compute-mode properties that changed since the last emission
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ComputeModeDirty: u32 {
        /// Coherency changed
        const COHERENCY = 1 << 0;
        /// GRF size changed
        const LARGE_GRF = 1 << 1;
        /// Thread arbitration changed
        const THREAD_ARBITRATION = 1 << 2;
    }
}

impl ComputeModeDirty {
    /// Properties this hardware can program at all
    pub fn supported(caps: &HardwareCapabilities) -> Self {
        let mut mask = Self::empty();
        mask.set(Self::COHERENCY, caps.scm.coherency_required);
        mask.set(Self::LARGE_GRF, caps.scm.large_grf_mode);
        mask.set(
            Self::THREAD_ARBITRATION,
            caps.scm.thread_arbitration_policy || caps.thread_arbitration_via_register,
        );
        mask
    }

    /// Properties carried inside STATE_COMPUTE_MODE
    pub fn in_state_compute_mode(self, caps: &HardwareCapabilities) -> Self {
        let mut mask = Self::empty();
        mask.set(Self::COHERENCY, caps.scm.coherency_required);
        mask.set(Self::LARGE_GRF, caps.scm.large_grf_mode);
        mask.set(Self::THREAD_ARBITRATION, caps.scm.thread_arbitration_policy);
        self & mask
    }
}

// =============================================================================
// STATE
// =============================================================================

/// Compute-mode tracking of one command list
#[derive(Debug, Clone)]
pub struct ComputeModeState {
    required: ComputeModeProperties,
    last_emitted: Option<ComputeModeProperties>,
    emissions: u64,
}

impl ComputeModeState {
    /// Fresh state; the first dispatch emits every supported property
    pub const fn new(defaults: ComputeModeProperties) -> Self {
        Self {
            required: defaults,
            last_emitted: None,
            emissions: 0,
        }
    }

    /// Get required properties
    #[inline]
    pub fn required(&self) -> ComputeModeProperties {
        self.required
    }

    /// Get last emitted properties
    #[inline]
    pub fn last_emitted(&self) -> Option<ComputeModeProperties> {
        self.last_emitted
    }

    /// Number of emissions
    #[inline]
    pub fn emissions(&self) -> u64 {
        self.emissions
    }

    /// Record what the next dispatch needs
    pub fn require(&mut self, properties: ComputeModeProperties) {
        self.required = properties;
    }

    /// Supported properties that differ from the last emission
    pub fn dirty(&self, caps: &HardwareCapabilities) -> ComputeModeDirty {
        let supported = ComputeModeDirty::supported(caps);
        let Some(last) = self.last_emitted else {
            return supported;
        };

        let mut dirty = ComputeModeDirty::empty();
        dirty.set(
            ComputeModeDirty::COHERENCY,
            last.coherency_required != self.required.coherency_required,
        );
        dirty.set(ComputeModeDirty::LARGE_GRF, last.large_grf != self.required.large_grf);
        dirty.set(
            ComputeModeDirty::THREAD_ARBITRATION,
            last.thread_arbitration != self.required.thread_arbitration,
        );
        dirty & supported
    }

    /// Record that the required properties are now programmed
    pub fn mark_emitted(&mut self) {
        self.last_emitted = Some(self.required);
        self.emissions += 1;
    }

    /// Forget the last emission
    pub fn invalidate(&mut self) {
        self.last_emitted = None;
    }

    /// Return to a fresh state with new defaults
    pub fn reset(&mut self, defaults: ComputeModeProperties) {
        *self = Self::new(defaults);
    }
}

// =============================================================================
// ENCODING
// =============================================================================

/// Exact byte size of the compute-mode programming for `dirty`
pub fn compute_mode_size(dirty: ComputeModeDirty, caps: &HardwareCapabilities) -> usize {
    let dirty = dirty & ComputeModeDirty::supported(caps);
    let mut size = 0;

    if dirty.contains(ComputeModeDirty::LARGE_GRF) && caps.pipe_control_before_grf_change {
        size += core::mem::size_of::<PipeControl>();
    }

    let scm = dirty.in_state_compute_mode(caps);
    if !scm.is_empty() {
        size += 4 * (1 + scm.bits().count_ones() as usize);
    }

    if dirty.contains(ComputeModeDirty::THREAD_ARBITRATION)
        && caps.thread_arbitration_via_register
        && !caps.scm.thread_arbitration_policy
    {
        size += core::mem::size_of::<MiLoadRegisterImm>();
    }

    size
}

/// Emit compute-mode programming if anything is dirty; returns bytes written
pub fn program_compute_mode(
    stream: &mut GraphicsCommandStream,
    state: &mut ComputeModeState,
    caps: &HardwareCapabilities,
) -> usize {
    if stream.is_dirty(StreamDirty::COMPUTE_MODE) {
        state.invalidate();
    }

    let dirty = state.dirty(caps);
    if dirty.is_empty() {
        stream.clear_dirty(StreamDirty::COMPUTE_MODE);
        return 0;
    }

    let start = stream.used();
    let required = state.required();

    if dirty.contains(ComputeModeDirty::LARGE_GRF) && caps.pipe_control_before_grf_change {
        stream.emit(&PipeControl::new(
            PipeControlFlags::CS_STALL | PipeControlFlags::HDC_PIPELINE_FLUSH,
        ));
    }

    let scm = dirty.in_state_compute_mode(caps);
    if !scm.is_empty() {
        let count = scm.bits().count_ones() as usize;
        let mut dwords = Vec::with_capacity(1 + count);
        dwords.push(header(opcode::STATE_COMPUTE_MODE, 1 + count));
        if scm.contains(ComputeModeDirty::COHERENCY) {
            // Property value is "force non-coherent"
            dwords.push(scm_property(
                ScmProperty::Coherency,
                u32::from(!required.coherency_required),
            ));
        }
        if scm.contains(ComputeModeDirty::LARGE_GRF) {
            dwords.push(scm_property(ScmProperty::LargeGrf, u32::from(required.large_grf)));
        }
        if scm.contains(ComputeModeDirty::THREAD_ARBITRATION) {
            dwords.push(scm_property(
                ScmProperty::ThreadArbitration,
                required.thread_arbitration as u32,
            ));
        }
        stream.emit_dwords(&dwords);
    }

    if dirty.contains(ComputeModeDirty::THREAD_ARBITRATION)
        && caps.thread_arbitration_via_register
        && !caps.scm.thread_arbitration_policy
    {
        stream.emit(&MiLoadRegisterImm::new(
            register::THREAD_ARBITRATION,
            required.thread_arbitration as u32,
        ));
    }

    state.mark_emitted();
    stream.clear_dirty(StreamDirty::COMPUTE_MODE);

    let written = stream.used() - start;
    log::debug!("compute mode programmed: {:?} ({} bytes)", dirty, written);
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamTarget;
    use kiln_core::hw::revision;
    use kiln_core::{ByteSize, DeviceBitfield, EngineGroupType, GfxCoreFamily};

    fn stream() -> GraphicsCommandStream {
        GraphicsCommandStream::new(
            StreamTarget {
                root_device_index: 0,
                device_bitfield: DeviceBitfield::new(1),
                engine: EngineGroupType::Compute,
            },
            ByteSize::KIB_4,
        )
    }

    fn defaults() -> ComputeModeProperties {
        ComputeModeProperties::new(ThreadArbitrationPolicy::AgeBased)
    }

    #[test]
    fn test_first_dispatch_emits_every_supported_property() {
        let caps = HardwareCapabilities::for_family(GfxCoreFamily::XeHpg, revision::A0);
        let mut state = ComputeModeState::new(defaults());
        let mut stream = stream();

        let dirty = state.dirty(&caps);
        assert_eq!(dirty, ComputeModeDirty::all());
        let written = program_compute_mode(&mut stream, &mut state, &caps);
        assert_eq!(written, compute_mode_size(dirty, &caps));
        assert_eq!(written, 16);

        // Nothing changed
        assert_eq!(program_compute_mode(&mut stream, &mut state, &caps), 0);
        assert_eq!(state.emissions(), 1);
    }

    #[test]
    fn test_size_follows_dirty_bits() {
        let caps = HardwareCapabilities::for_family(GfxCoreFamily::XeHpg, revision::A0);
        let mut state = ComputeModeState::new(defaults());
        let mut stream = stream();
        program_compute_mode(&mut stream, &mut state, &caps);

        state.require(ComputeModeProperties {
            large_grf: true,
            ..defaults()
        });
        let dirty = state.dirty(&caps);
        assert_eq!(dirty, ComputeModeDirty::LARGE_GRF);

        let before = stream.used();
        let written = program_compute_mode(&mut stream, &mut state, &caps);
        assert_eq!(written, 8);
        assert_eq!(written, compute_mode_size(dirty, &caps));

        let scm = stream
            .reader()
            .find(|p| p.offset == before)
            .unwrap();
        assert_eq!(scm.opcode, opcode::STATE_COMPUTE_MODE);
        assert_eq!(scm.len_dwords(), 2);
        assert_eq!(scm.dword(1), Some(scm_property(ScmProperty::LargeGrf, 1)));
    }

    #[test]
    fn test_unsupported_properties_never_dirty() {
        // Gen9 programs only coherency in SCM and arbitration by register
        let caps = HardwareCapabilities::for_family(GfxCoreFamily::Gen9, revision::A0);
        let mut state = ComputeModeState::new(defaults());
        let mut stream = stream();
        program_compute_mode(&mut stream, &mut state, &caps);

        state.require(ComputeModeProperties {
            large_grf: true,
            ..defaults()
        });
        assert!(state.dirty(&caps).is_empty());
        assert_eq!(program_compute_mode(&mut stream, &mut state, &caps), 0);
    }

    #[test]
    fn test_register_programmed_arbitration() {
        let caps = HardwareCapabilities::for_family(GfxCoreFamily::Gen12Lp, revision::A0);
        let mut state = ComputeModeState::new(defaults());
        let mut stream = stream();

        let dirty = state.dirty(&caps);
        let written = program_compute_mode(&mut stream, &mut state, &caps);
        // SCM header + coherency, then LRI
        assert_eq!(written, 8 + 12);
        assert_eq!(written, compute_mode_size(dirty, &caps));

        let opcodes: Vec<_> = stream.reader().map(|p| p.opcode).collect();
        assert_eq!(
            opcodes,
            [opcode::STATE_COMPUTE_MODE, opcode::MI_LOAD_REGISTER_IMM]
        );
    }

    #[test]
    fn test_grf_change_needs_pipe_control_on_gen11() {
        let caps = HardwareCapabilities::for_family(GfxCoreFamily::Gen11, revision::A0);
        let mut state = ComputeModeState::new(defaults());
        let mut stream = stream();
        program_compute_mode(&mut stream, &mut state, &caps);

        state.require(ComputeModeProperties {
            large_grf: true,
            ..defaults()
        });
        let dirty = state.dirty(&caps);
        let before = stream.used();
        let written = program_compute_mode(&mut stream, &mut state, &caps);
        assert_eq!(written, 24 + 8);
        assert_eq!(written, compute_mode_size(dirty, &caps));

        let first = stream.reader().find(|p| p.offset == before).unwrap();
        assert_eq!(first.opcode, opcode::PIPE_CONTROL);
    }

    #[test]
    fn test_stream_reset_forces_full_emission() {
        let caps = HardwareCapabilities::for_family(GfxCoreFamily::XeHpc, revision::B);
        let mut state = ComputeModeState::new(defaults());
        let mut stream = stream();
        program_compute_mode(&mut stream, &mut state, &caps);
        assert_eq!(program_compute_mode(&mut stream, &mut state, &caps), 0);

        stream.reset();
        let written = program_compute_mode(&mut stream, &mut state, &caps);
        assert_eq!(written, compute_mode_size(ComputeModeDirty::supported(&caps), &caps));
        assert!(written > 0);
    }
}
