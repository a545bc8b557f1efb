//! Options which change the behavior of the memory subsystem.

use crate::memory::{Endian, MAX_ALLOC_DEFAULT};
use crate::Error;
use serde::{Deserialize, Serialize};

/// The memory dispatch strategy the executor installs.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum MmuKind {
    /// Resolve, decompose, and fork, with no separate concrete fast path.
    Generic,
    /// A concrete fast path, falling back to `Generic`.
    Dual,
    /// A concrete fast path, falling back to the software helpers.
    Sym,
    /// The soft-concrete MMU, with its own TLB fast path, falling back to the
    /// software helpers.
    SoftConcrete,
}

/// The address assignment policy the executor installs.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum MemoryManagerKind {
    Heap,
    Deterministic,
}

/// Various options that can be passed to the executor.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Options {
    mmu: MmuKind,
    memory_manager: MemoryManagerKind,
    max_resolutions: usize,
    max_sym_array_size: u64,
    simplify_sym_indices: bool,
    contiguous_offset_resolution: bool,
    use_tlb: bool,
    helper_suffix: String,
    max_alloc: u64,
    min_address: u64,
    max_address: u64,
    anon_address: u64,
    endian: Endian,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            mmu: MmuKind::Dual,
            memory_manager: MemoryManagerKind::Heap,
            max_resolutions: 0,
            max_sym_array_size: 0,
            simplify_sym_indices: false,
            contiguous_offset_resolution: false,
            use_tlb: true,
            helper_suffix: "uniqptr".to_string(),
            max_alloc: MAX_ALLOC_DEFAULT,
            min_address: 0xa000000,
            max_address: 1 << 40,
            anon_address: 1 << 41,
            endian: Endian::Little,
        }
    }
}

impl Options {
    /// Create a new set of Options with the default settings.
    pub fn new() -> Options {
        Options::default()
    }

    /// Read Options from JSON. Fields which are absent keep their defaults.
    pub fn from_json(json: &str) -> Result<Options, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn mmu(&self) -> MmuKind {
        self.mmu
    }

    pub fn set_mmu(&mut self, mmu: MmuKind) {
        self.mmu = mmu;
    }

    pub fn memory_manager(&self) -> MemoryManagerKind {
        self.memory_manager
    }

    pub fn set_memory_manager(&mut self, memory_manager: MemoryManagerKind) {
        self.memory_manager = memory_manager;
    }

    /// The most objects a single symbolic address resolves to before the
    /// resolution is reported incomplete. Zero means no limit.
    pub fn max_resolutions(&self) -> usize {
        self.max_resolutions
    }

    pub fn set_max_resolutions(&mut self, max_resolutions: usize) {
        self.max_resolutions = max_resolutions;
    }

    /// Symbolic addresses into objects at least this large are concretized
    /// rather than accessed symbolically. Zero disables concretization.
    pub fn max_sym_array_size(&self) -> u64 {
        self.max_sym_array_size
    }

    pub fn set_max_sym_array_size(&mut self, max_sym_array_size: u64) {
        self.max_sym_array_size = max_sym_array_size;
    }

    /// Whether to substitute values fixed by path constraints into memory
    /// operations before dispatch.
    pub fn simplify_sym_indices(&self) -> bool {
        self.simplify_sym_indices
    }

    pub fn set_simplify_sym_indices(&mut self, simplify_sym_indices: bool) {
        self.simplify_sym_indices = simplify_sym_indices;
    }

    /// Whether `base + offset` addresses resolve by scanning the neighbours
    /// of the object containing `base`.
    pub fn contiguous_offset_resolution(&self) -> bool {
        self.contiguous_offset_resolution
    }

    pub fn set_contiguous_offset_resolution(&mut self, contiguous_offset_resolution: bool) {
        self.contiguous_offset_resolution = contiguous_offset_resolution;
    }

    pub fn use_tlb(&self) -> bool {
        self.use_tlb
    }

    pub fn set_use_tlb(&mut self, use_tlb: bool) {
        self.use_tlb = use_tlb;
    }

    /// The suffix of the software MMU helper names, as in
    /// `mmu_load_32_<suffix>`.
    pub fn helper_suffix(&self) -> &str {
        &self.helper_suffix
    }

    pub fn set_helper_suffix<S: Into<String>>(&mut self, helper_suffix: S) {
        self.helper_suffix = helper_suffix.into();
    }

    /// The largest allocation, in bytes, memory managers will attempt.
    pub fn max_alloc(&self) -> u64 {
        self.max_alloc
    }

    pub fn set_max_alloc(&mut self, max_alloc: u64) {
        self.max_alloc = max_alloc;
    }

    /// The lowest address handed to allocations made by a state.
    pub fn min_address(&self) -> u64 {
        self.min_address
    }

    /// The first address past the window for allocations made by a state.
    pub fn max_address(&self) -> u64 {
        self.max_address
    }

    /// The first address of the window for anonymous allocations.
    pub fn anon_address(&self) -> u64 {
        self.anon_address
    }

    pub fn set_address_window(&mut self, min_address: u64, max_address: u64, anon_address: u64) {
        self.min_address = min_address;
        self.max_address = max_address;
        self.anon_address = anon_address;
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }
}

/// Used to build options.
///
/// ```
/// use symmu::executor::{MmuKind, OptionsBuilder};
/// let options = OptionsBuilder::default()
///     .mmu(MmuKind::Generic)
///     .max_resolutions(4)
///     .build();
/// assert_eq!(options.max_resolutions(), 4);
/// ```
#[derive(Clone, Debug, Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Create a new `OptionsBuilder` with the default settings.
    pub fn new() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    pub fn build(self) -> Options {
        self.options
    }

    pub fn mmu(mut self, mmu: MmuKind) -> Self {
        self.options.mmu = mmu;
        self
    }

    pub fn memory_manager(mut self, memory_manager: MemoryManagerKind) -> Self {
        self.options.memory_manager = memory_manager;
        self
    }

    pub fn max_resolutions(mut self, max_resolutions: usize) -> Self {
        self.options.max_resolutions = max_resolutions;
        self
    }

    pub fn max_sym_array_size(mut self, max_sym_array_size: u64) -> Self {
        self.options.max_sym_array_size = max_sym_array_size;
        self
    }

    pub fn simplify_sym_indices(mut self, simplify_sym_indices: bool) -> Self {
        self.options.simplify_sym_indices = simplify_sym_indices;
        self
    }

    pub fn contiguous_offset_resolution(mut self, contiguous_offset_resolution: bool) -> Self {
        self.options.contiguous_offset_resolution = contiguous_offset_resolution;
        self
    }

    pub fn use_tlb(mut self, use_tlb: bool) -> Self {
        self.options.use_tlb = use_tlb;
        self
    }

    pub fn helper_suffix<S: Into<String>>(mut self, helper_suffix: S) -> Self {
        self.options.helper_suffix = helper_suffix.into();
        self
    }

    pub fn max_alloc(mut self, max_alloc: u64) -> Self {
        self.options.max_alloc = max_alloc;
        self
    }

    pub fn address_window(mut self, min_address: u64, max_address: u64, anon_address: u64) -> Self {
        self.options
            .set_address_window(min_address, max_address, anon_address);
        self
    }

    pub fn endian(mut self, endian: Endian) -> Self {
        self.options.endian = endian;
        self
    }
}
