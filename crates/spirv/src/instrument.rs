// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Instrument
//!
//! Every risky memory access gets a bouncer.
//!
//! For each guarded instruction the pass emits a call to one of three imported check routines and
//! then moves the instruction into a conditional block:
//!
//! ```text
//! %ok = OpFunctionCall %bool %gpuav_check_* %site ...
//!       OpSelectionMerge %merge None
//!       OpBranchConditional %ok %valid %invalid
//! %valid   = OpLabel     ; original instruction, result renamed
//! %invalid = OpLabel     ; null result, or a sentinel pointer
//! %merge   = OpLabel
//! %result  = OpPhi %ty %renamed %valid %fallback %invalid
//! ```
//!
//! The original result id is re-defined by the `OpPhi`, so no other instruction changes.  The
//! routines themselves live in a separately compiled library that is linked in through
//! `LinkageAttributes Import`.  They write the feedback record, the shader only asks.
//!
//! Offsets and sizes reach the routines as u64.  Offset arithmetic saturates at `u64::MAX`
//! instead of wrapping, so an index too large to describe still fails its bound check.
//!
//! A pointer loaded on the invalid path is replaced by an address inside the sentinel window.
//! Checks on later hops of a pointer chain see the sentinel and fail quietly, so one bad root only
//! produces one record.

use std::collections::HashMap;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::info::{MatrixLayout, ModuleInfo, Type, strided};
use crate::layout::LayoutMetadata;
use crate::module::{Id, Instruction, Module, encode_string};
use crate::op::{self, capability, decoration, storage};
use crate::prelude::*;
use crate::site::{AccessKind, AtomicTarget, CheckKind, CheckSite, SourceLocation, SourceLocationId};

/// `bool gpuav_check_descriptor(u32 site, u32 set, u32 binding, u32 index, u64 offset, u64 size)`
pub const CHECK_DESCRIPTOR: &str = "gpuav_check_descriptor";
/// `bool gpuav_check_texel(u32 site, u32 set, u32 binding, u32 index, u64 texel)`
pub const CHECK_TEXEL: &str = "gpuav_check_texel";
/// `bool gpuav_check_address(u32 site, u64 address, u64 size, u32 alignment)`
pub const CHECK_ADDRESS: &str = "gpuav_check_address";

pub const DEFAULT_SENTINEL: u64 = 0xFFFF_0000_0000_0000;
/// Size of the address window reserved for redirected pointers.
pub const SENTINEL_SPAN: u64 = 1 << 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstrumentOptions {
    pub descriptor_checks: bool,
    pub address_checks: bool,
    pub texel_checks: bool,
    pub sentinel_address: u64,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            descriptor_checks: true,
            address_checks: true,
            texel_checks: true,
            sentinel_address: DEFAULT_SENTINEL,
        }
    }
}

#[derive(Clone, Debug)]
pub struct InstrumentedShader {
    pub module: Module,
    /// Ascending by id.
    pub sites: Vec<CheckSite>,
    pub source_locations: Vec<SourceLocation>,
    /// Hash of the module before instrumentation.
    pub original_hash: u64,
}

impl InstrumentedShader {
    pub fn words(&self) -> Result<Vec<u32>, SpirvError> {
        self.module.assemble()
    }

    pub fn site(&self, id: u32) -> Option<&CheckSite> {
        self.sites
            .binary_search_by_key(&id, |s| s.id)
            .ok()
            .map(|i| &self.sites[i])
    }

    pub fn source_location(&self, id: SourceLocationId) -> Option<&SourceLocation> {
        self.source_locations.get(id as usize)
    }
}

pub struct Instrumentor {
    options: InstrumentOptions,
}

impl Instrumentor {
    pub fn new(options: InstrumentOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &InstrumentOptions {
        &self.options
    }

    /// Rewrite `module`, numbering check sites from `first_site_id`.
    pub fn instrument(
        &self,
        module: &Module,
        layout: &LayoutMetadata,
        first_site_id: u32,
    ) -> Result<InstrumentedShader, SpirvError> {
        let original_hash = module.hash();
        let info = ModuleInfo::analyze(module);
        let tracking = Tracking::build(&info, &module.instructions);

        for (var, variable) in &info.variables {
            if let Some((set, binding)) = info.descriptor_binding(*var) {
                if is_descriptor_storage(variable.storage) && layout.get(set, binding).is_none() {
                    warn!(set, binding, "descriptor missing from layout, accesses are not checked");
                }
            }
        }

        let split = module
            .instructions
            .iter()
            .position(|i| i.opcode == op::FUNCTION)
            .unwrap_or(module.instructions.len());
        let (globals, body) = module.instructions.split_at(split);
        let functions = split_functions(body)?;

        let mut pass = Pass {
            options: &self.options,
            layout,
            info: &info,
            tracking: &tracking,
            next_id: module.header.bound,
            next_site: first_site_id,
            sites: Vec::new(),
            locations: Vec::new(),
            location_ids: HashMap::new(),
            new_types: Vec::new(),
            new_constants: Vec::new(),
            imports: Vec::new(),
            decorations: Vec::new(),
            uint_types: HashMap::new(),
            bool_type: None,
            u32_constants: HashMap::new(),
            u64_constants: HashMap::new(),
            nulls: HashMap::new(),
            check_fns: [None; 3],
            ids_exhausted: false,
            sites_exhausted: false,
        };

        let mut rewritten = Vec::with_capacity(body.len());
        for function in functions {
            rewritten.extend(pass.rewrite_function(function));
        }
        if pass.ids_exhausted {
            return Err(SpirvError::IdsExhausted);
        }
        if pass.sites_exhausted {
            return Err(SpirvError::SiteIdsExhausted {
                first: first_site_id,
            });
        }

        if pass.sites.is_empty() {
            trace!("no risky accesses, module left untouched");
            return Ok(InstrumentedShader {
                module: module.clone(),
                sites: Vec::new(),
                source_locations: Vec::new(),
                original_hash,
            });
        }

        let mut instructions = Vec::with_capacity(module.instructions.len() + rewritten.len());
        if !info.capabilities.contains(&capability::LINKAGE) {
            instructions.push(Instruction::new(op::CAPABILITY, vec![capability::LINKAGE]));
        }
        if pass.uint_types.contains_key(&64) && !info.capabilities.contains(&capability::INT64) {
            instructions.push(Instruction::new(op::CAPABILITY, vec![capability::INT64]));
        }
        let annotations = annotation_index(globals);
        instructions.extend_from_slice(&globals[..annotations]);
        instructions.append(&mut pass.decorations);
        instructions.extend_from_slice(&globals[annotations..]);
        instructions.append(&mut pass.new_types);
        instructions.append(&mut pass.new_constants);
        instructions.append(&mut pass.imports);
        instructions.extend(rewritten);

        let mut header = module.header;
        header.bound = pass.next_id;

        debug!(
            sites = pass.sites.len(),
            bound = header.bound,
            "instrumented shader module"
        );

        Ok(InstrumentedShader {
            module: Module {
                header,
                instructions,
            },
            sites: pass.sites,
            source_locations: pass.locations,
            original_hash,
        })
    }
}

fn is_buffer_storage(class: u32) -> bool {
    matches!(class, storage::UNIFORM | storage::STORAGE_BUFFER)
}

fn is_descriptor_storage(class: u32) -> bool {
    is_buffer_storage(class) || class == storage::UNIFORM_CONSTANT
}

fn is_annotation(opcode: u16) -> bool {
    matches!(
        opcode,
        op::DECORATE
            | op::MEMBER_DECORATE
            | op::DECORATION_GROUP
            | op::GROUP_DECORATE
            | op::GROUP_MEMBER_DECORATE
            | op::DECORATE_ID
            | op::DECORATE_STRING
            | op::MEMBER_DECORATE_STRING
    )
}

fn is_preamble(opcode: u16) -> bool {
    matches!(
        opcode,
        op::CAPABILITY
            | op::EXTENSION
            | op::EXT_INST_IMPORT
            | op::MEMORY_MODEL
            | op::ENTRY_POINT
            | op::EXECUTION_MODE
            | op::EXECUTION_MODE_ID
            | op::STRING
            | op::SOURCE
            | op::SOURCE_CONTINUED
            | op::SOURCE_EXTENSION
            | op::NAME
            | op::MEMBER_NAME
            | op::MODULE_PROCESSED
    )
}

/// Where new decorations go: after the last one, or where the annotation section would start.
fn annotation_index(globals: &[Instruction]) -> usize {
    if let Some(last) = globals.iter().rposition(|i| is_annotation(i.opcode)) {
        return last + 1;
    }
    globals
        .iter()
        .position(|i| !is_preamble(i.opcode))
        .unwrap_or(globals.len())
}

/// Memory-operand alignment at `mask_index`, or 1 when none is declared.
fn alignment(operands: &[u32], mask_index: usize) -> u32 {
    match operands.get(mask_index) {
        Some(mask) if mask & op::MEMORY_ACCESS_ALIGNED != 0 => {
            operands.get(mask_index + 1).copied().unwrap_or(1)
        }
        _ => 1,
    }
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[derive(Clone, Debug)]
enum Term {
    Const(u64),
    Scaled { index: Id, stride: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Root {
    Descriptor {
        set: u32,
        binding: u32,
        storage: u32,
        variable: Id,
    },
    Physical,
}

/// A pointer we can explain: where it is rooted and how far into the resource it points.
#[derive(Clone, Debug)]
struct Chain {
    root: Root,
    descriptor_index: Option<Id>,
    terms: Vec<Term>,
    /// False when some index could not be turned into a byte offset.
    exact: bool,
    /// Bytes the pointee spans under its matrix layout, when known.
    footprint: Option<u64>,
    /// Layout of matrices below the last struct member the chain stepped into.
    matrix: Option<MatrixLayout>,
    /// Set while pointing at a column of a row-major matrix, whose components lie a row apart.
    component_stride: Option<u64>,
}

impl Chain {
    fn new(root: Root) -> Self {
        Self {
            root,
            descriptor_index: None,
            terms: Vec::new(),
            exact: true,
            footprint: None,
            matrix: None,
            component_stride: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ImageSource {
    set: u32,
    binding: u32,
    index: Option<Id>,
    texel: bool,
}

#[derive(Clone, Copy, Debug)]
struct TexelPointer {
    source: ImageSource,
    coordinate: Id,
}

#[derive(Default)]
struct Tracking {
    chains: HashMap<Id, Chain>,
    images: HashMap<Id, ImageSource>,
    texel_pointers: HashMap<Id, TexelPointer>,
}

impl Tracking {
    /// Definitions precede uses in layout order, so one forward walk sees every base first.
    fn build(info: &ModuleInfo, instructions: &[Instruction]) -> Self {
        let mut tracking = Tracking::default();
        for inst in instructions {
            let w = &inst.operands;
            match inst.opcode {
                op::ACCESS_CHAIN
                | op::IN_BOUNDS_ACCESS_CHAIN
                | op::PTR_ACCESS_CHAIN
                | op::IN_BOUNDS_PTR_ACCESS_CHAIN
                    if w.len() >= 3 =>
                {
                    if let Some(chain) = tracking.chain(info, inst) {
                        tracking.chains.insert(w[1], chain);
                    }
                }
                op::LOAD if w.len() >= 3 => {
                    let image_like = matches!(
                        info.ty(w[0]),
                        Some(Type::Image { .. } | Type::SampledImage { .. })
                    );
                    if image_like {
                        if let Some(source) = tracking.image_source(info, w[2]) {
                            tracking.images.insert(w[1], source);
                        }
                    }
                }
                op::SAMPLED_IMAGE | op::IMAGE if w.len() >= 3 => {
                    if let Some(source) = tracking.images.get(&w[2]).copied() {
                        tracking.images.insert(w[1], source);
                    }
                }
                op::IMAGE_TEXEL_POINTER if w.len() >= 4 => {
                    if let Some(source) = tracking.image_source(info, w[2]) {
                        tracking.texel_pointers.insert(
                            w[1],
                            TexelPointer {
                                source,
                                coordinate: w[3],
                            },
                        );
                    }
                }
                _ => {}
            }
        }
        tracking
    }

    /// Descriptor behind a pointer to an image variable, or to an element of an image array.
    fn image_source(&self, info: &ModuleInfo, pointer: Id) -> Option<ImageSource> {
        let (set, binding, variable, index) = match self.chains.get(&pointer) {
            Some(Chain {
                root:
                    Root::Descriptor {
                        set,
                        binding,
                        variable,
                        ..
                    },
                descriptor_index,
                ..
            }) => (*set, *binding, *variable, *descriptor_index),
            Some(_) => return None,
            None => {
                let (set, binding) = info.descriptor_binding(pointer)?;
                (set, binding, pointer, None)
            }
        };
        let var = info.variables.get(&variable)?;
        let (_, mut element) = info.pointee(var.pointer_type)?;
        if let Some(Type::Array { element: e, .. } | Type::RuntimeArray { element: e }) =
            info.ty(element)
        {
            element = *e;
        }
        Some(ImageSource {
            set,
            binding,
            index,
            texel: info.is_texel_buffer(element),
        })
    }

    fn chain(&self, info: &ModuleInfo, inst: &Instruction) -> Option<Chain> {
        let w = &inst.operands;
        let base = w[2];
        let mut indices = w[3..].iter().copied();

        let (mut chain, mut current, at_root) = if let Some(base_chain) = self.chains.get(&base) {
            let (_, pointee) = info.pointee(info.value_type(base)?)?;
            (base_chain.clone(), pointee, false)
        } else if let Some((set, binding)) = info.descriptor_binding(base) {
            let var = info.variables.get(&base)?;
            let (class, pointee) = info.pointee(var.pointer_type)?;
            let chain = Chain::new(Root::Descriptor {
                set,
                binding,
                storage: class,
                variable: base,
            });
            (chain, pointee, true)
        } else {
            let (class, pointee) = info.pointee(info.value_type(base)?)?;
            if class != storage::PHYSICAL_STORAGE_BUFFER {
                return None;
            }
            (Chain::new(Root::Physical), pointee, false)
        };

        if chain.root == Root::Physical {
            // The device computes physical addresses itself.  Nothing to track.
            return Some(chain);
        }

        if matches!(inst.opcode, op::PTR_ACCESS_CHAIN | op::IN_BOUNDS_PTR_ACCESS_CHAIN) {
            indices.next();
            chain.exact = false;
        }

        // An arrayed descriptor variable spends its first index choosing the descriptor.
        if at_root {
            if let Some(Type::Array { element, .. } | Type::RuntimeArray { element }) =
                info.ty(current)
            {
                let element = *element;
                if let Some(index) = indices.next() {
                    chain.descriptor_index = Some(index);
                    current = element;
                }
            }
        }

        for index in indices {
            let (next, stride) = match info.ty(current) {
                Some(Type::Struct { members }) => {
                    let member = info.constant(index).and_then(|m| u32::try_from(m).ok());
                    let Some((member, next)) =
                        member.and_then(|m| members.get(m as usize).map(|n| (m, *n)))
                    else {
                        chain.exact = false;
                        break;
                    };
                    match info.member_offset(current, member) {
                        Some(offset) => chain.terms.push(Term::Const(offset as u64)),
                        None => chain.exact = false,
                    }
                    chain.matrix = info.matrix_layout(current, member);
                    chain.component_stride = None;
                    current = next;
                    continue;
                }
                Some(Type::Matrix { column, .. }) => {
                    let column = *column;
                    let stride = match chain.matrix.take() {
                        // Consecutive columns sit one component apart, their components a row apart.
                        Some(MatrixLayout {
                            stride,
                            row_major: true,
                        }) => {
                            chain.component_stride = Some(u64::from(stride));
                            info.element_stride(column)
                        }
                        Some(MatrixLayout { stride, .. }) => Some(u64::from(stride)),
                        None => info.element_stride(current),
                    };
                    (column, stride)
                }
                Some(Type::Vector { component, .. }) => {
                    let stride = chain
                        .component_stride
                        .take()
                        .or_else(|| info.element_stride(current));
                    (*component, stride)
                }
                Some(Type::Array { element, .. } | Type::RuntimeArray { element }) => {
                    (*element, info.element_stride(current))
                }
                _ => {
                    chain.exact = false;
                    break;
                }
            };
            let Some(stride) = stride else {
                chain.exact = false;
                break;
            };
            chain.terms.push(match info.constant(index) {
                Some(c) => Term::Const(c.saturating_mul(stride)),
                None => Term::Scaled { index, stride },
            });
            current = next;
        }

        chain.footprint = match (info.ty(current), chain.component_stride) {
            (Some(Type::Vector { component, count }), Some(stride)) => info
                .size_of(*component)
                .map(|size| strided(u64::from(*count), stride, size)),
            _ => info.footprint(current, chain.matrix),
        };
        Some(chain)
    }
}

#[derive(Clone, Debug)]
enum Call {
    Descriptor {
        set: u32,
        binding: u32,
        index: Option<Id>,
        terms: Vec<Term>,
        size: u64,
    },
    Texel {
        set: u32,
        binding: u32,
        index: Option<Id>,
        coordinate: Id,
    },
    Address {
        pointer: Id,
        size: u64,
        alignment: u32,
    },
}

struct Pending {
    kind: CheckKind,
    call: Call,
}

/// Copies check both ends, everything else checks one.
type Checks = SmallVec<Pending, 2>;

#[derive(Clone, Copy)]
enum CheckFn {
    Descriptor = 0,
    Texel = 1,
    Address = 2,
}

struct Block {
    label: Id,
    body: Vec<Instruction>,
    skip: bool,
}

struct Function {
    header: Vec<Instruction>,
    blocks: Vec<Block>,
    end: Instruction,
}

fn split_functions(instructions: &[Instruction]) -> Result<Vec<Function>, SpirvError> {
    let mut functions = Vec::new();
    let mut iter = instructions.iter().cloned();
    while let Some(first) = iter.next() {
        if first.opcode != op::FUNCTION {
            if matches!(first.opcode, op::LINE | op::NO_LINE) {
                continue;
            }
            return Err(SpirvError::MalformedFunction(
                "instruction outside of a function",
            ));
        }
        let mut header = vec![first];
        let mut blocks: Vec<Block> = Vec::new();
        let end = loop {
            let Some(inst) = iter.next() else {
                return Err(SpirvError::MalformedFunction("missing OpFunctionEnd"));
            };
            match inst.opcode {
                op::FUNCTION_END => break inst,
                op::LABEL => blocks.push(Block {
                    label: inst
                        .operands
                        .first()
                        .copied()
                        .ok_or(SpirvError::MalformedFunction("label without id"))?,
                    body: Vec::new(),
                    skip: false,
                }),
                _ => match blocks.last_mut() {
                    Some(block) => block.body.push(inst),
                    None => header.push(inst),
                },
            }
        };
        functions.push(Function {
            header,
            blocks,
            end,
        });
    }
    Ok(functions)
}

struct Pass<'a> {
    options: &'a InstrumentOptions,
    layout: &'a LayoutMetadata,
    info: &'a ModuleInfo,
    tracking: &'a Tracking,
    next_id: Id,
    next_site: u32,
    sites: Vec<CheckSite>,
    locations: Vec<SourceLocation>,
    location_ids: HashMap<(Id, u32, u32), SourceLocationId>,
    new_types: Vec<Instruction>,
    new_constants: Vec<Instruction>,
    imports: Vec<Instruction>,
    decorations: Vec<Instruction>,
    uint_types: HashMap<u32, Id>,
    bool_type: Option<Id>,
    u32_constants: HashMap<u32, Id>,
    u64_constants: HashMap<u64, Id>,
    nulls: HashMap<Id, Id>,
    check_fns: [Option<Id>; 3],
    ids_exhausted: bool,
    sites_exhausted: bool,
}

impl Pass<'_> {
    fn fresh(&mut self) -> Id {
        let id = self.next_id;
        match self.next_id.checked_add(1) {
            Some(next) => self.next_id = next,
            None => self.ids_exhausted = true,
        }
        id
    }

    fn take_site_id(&mut self) -> u32 {
        let id = self.next_site;
        match self.next_site.checked_add(1) {
            Some(next) => self.next_site = next,
            None => self.sites_exhausted = true,
        }
        id
    }

    // Classification.  Pure, so it can be asked twice.

    fn classify(&self, inst: &Instruction) -> Checks {
        let w = &inst.operands;
        let mut pending = Checks::new();
        match inst.opcode {
            op::LOAD if w.len() >= 3 => {
                let footprint = self.laid_out(w[2]).or_else(|| self.info.size_of(w[0]));
                self.memory_access(&mut pending, w[2], AccessKind::Load, footprint, alignment(w, 3));
            }
            op::STORE if w.len() >= 2 => {
                let footprint = self.laid_out(w[0]).or_else(|| {
                    self.info
                        .value_type(w[1])
                        .and_then(|t| self.info.size_of(t))
                });
                self.memory_access(&mut pending, w[0], AccessKind::Store, footprint, alignment(w, 2));
            }
            op::COPY_MEMORY | op::COPY_MEMORY_SIZED if w.len() >= 2 => {
                let sized = inst.opcode == op::COPY_MEMORY_SIZED;
                let explicit = if sized {
                    w.get(2).and_then(|&size| self.info.constant(size))
                } else {
                    None
                };
                let align = alignment(w, if sized { 3 } else { 2 });
                for (pointer, access) in [(w[1], AccessKind::CopySource), (w[0], AccessKind::CopyTarget)] {
                    let footprint = explicit
                        .or_else(|| self.laid_out(pointer))
                        .or_else(|| self.pointee_size(pointer));
                    self.memory_access(&mut pending, pointer, access, footprint, align);
                }
            }
            op::IMAGE_FETCH | op::IMAGE_READ if w.len() >= 4 => {
                self.image_access(&mut pending, w[2], Some(w[3]), AccessKind::Read);
            }
            op::IMAGE_WRITE if w.len() >= 2 => {
                self.image_access(&mut pending, w[0], Some(w[1]), AccessKind::Write);
            }
            opcode if op::is_image_sample(opcode) && w.len() >= 3 => {
                self.image_access(&mut pending, w[2], None, AccessKind::Sample);
            }
            opcode => {
                if let Some(&pointer) = op::atomic_pointer_operand(opcode).and_then(|i| w.get(i)) {
                    self.atomic_access(&mut pending, pointer);
                }
            }
        }
        pending
    }

    /// Footprint of what `pointer` points at under the layout of the chain that produced it.
    fn laid_out(&self, pointer: Id) -> Option<u64> {
        self.tracking.chains.get(&pointer).and_then(|c| c.footprint)
    }

    fn pointee_size(&self, pointer: Id) -> Option<u64> {
        let (_, pointee) = self.info.pointee(self.info.value_type(pointer)?)?;
        self.info.size_of(pointee)
    }

    /// Explain a pointer operand, if it reaches a descriptor or physical memory.
    fn target(&self, pointer: Id) -> Option<Chain> {
        if let Some(chain) = self.tracking.chains.get(&pointer) {
            return Some(chain.clone());
        }
        if let Some((set, binding)) = self.info.descriptor_binding(pointer) {
            let var = self.info.variables.get(&pointer)?;
            return Some(Chain::new(Root::Descriptor {
                set,
                binding,
                storage: var.storage,
                variable: pointer,
            }));
        }
        let (class, _) = self.info.pointee(self.info.value_type(pointer)?)?;
        (class == storage::PHYSICAL_STORAGE_BUFFER).then(|| Chain::new(Root::Physical))
    }

    fn memory_access(
        &self,
        pending: &mut Checks,
        pointer: Id,
        access: AccessKind,
        footprint: Option<u64>,
        alignment: u32,
    ) {
        let Some(chain) = self.target(pointer) else {
            return;
        };
        match chain.root {
            Root::Descriptor {
                set,
                binding,
                storage: class,
                ..
            } => {
                if !self.options.descriptor_checks
                    || !is_buffer_storage(class)
                    || self.layout.get(set, binding).is_none()
                {
                    return;
                }
                let (Some(footprint), true) = (footprint, chain.exact) else {
                    trace!(set, binding, "access offset not computable, skipped");
                    return;
                };
                pending.push(Pending {
                    kind: CheckKind::DescriptorIndexedAccess {
                        set,
                        binding,
                        access,
                        footprint,
                    },
                    call: Call::Descriptor {
                        set,
                        binding,
                        index: chain.descriptor_index,
                        terms: chain.terms,
                        size: footprint,
                    },
                });
            }
            Root::Physical => {
                let (true, Some(footprint)) = (self.options.address_checks, footprint) else {
                    return;
                };
                pending.push(Pending {
                    kind: CheckKind::RawPointerDereference {
                        access,
                        footprint,
                        alignment,
                    },
                    call: Call::Address {
                        pointer,
                        size: footprint,
                        alignment,
                    },
                });
            }
        }
    }

    fn image_access(
        &self,
        pending: &mut Checks,
        image: Id,
        coordinate: Option<Id>,
        access: AccessKind,
    ) {
        let Some(source) = self.tracking.images.get(&image).copied() else {
            return;
        };
        if self.layout.get(source.set, source.binding).is_none() {
            return;
        }
        match coordinate {
            Some(coordinate) if source.texel && self.options.texel_checks => {
                pending.push(Pending {
                    kind: CheckKind::TexelBufferOp {
                        set: source.set,
                        binding: source.binding,
                        access,
                    },
                    call: Call::Texel {
                        set: source.set,
                        binding: source.binding,
                        index: source.index,
                        coordinate,
                    },
                });
            }
            _ if self.options.descriptor_checks => {
                pending.push(Pending {
                    kind: CheckKind::DescriptorIndexedAccess {
                        set: source.set,
                        binding: source.binding,
                        access,
                        footprint: 0,
                    },
                    call: Call::Descriptor {
                        set: source.set,
                        binding: source.binding,
                        index: source.index,
                        terms: Vec::new(),
                        size: 0,
                    },
                });
            }
            _ => {}
        }
    }

    fn atomic_access(&self, pending: &mut Checks, pointer: Id) {
        let width = clamp_u32(self.pointee_size(pointer).unwrap_or(4));

        if let Some(texel) = self.tracking.texel_pointers.get(&pointer).copied() {
            let ImageSource {
                set,
                binding,
                index,
                texel: is_texel,
            } = texel.source;
            if self.layout.get(set, binding).is_none() {
                return;
            }
            if is_texel && self.options.texel_checks {
                pending.push(Pending {
                    kind: CheckKind::AtomicOp {
                        target: AtomicTarget::Texel { set, binding },
                        width,
                    },
                    call: Call::Texel {
                        set,
                        binding,
                        index,
                        coordinate: texel.coordinate,
                    },
                });
            } else if self.options.descriptor_checks {
                pending.push(Pending {
                    kind: CheckKind::AtomicOp {
                        target: AtomicTarget::Descriptor { set, binding },
                        width,
                    },
                    call: Call::Descriptor {
                        set,
                        binding,
                        index,
                        terms: Vec::new(),
                        size: 0,
                    },
                });
            }
            return;
        }

        let Some(chain) = self.target(pointer) else {
            return;
        };
        match chain.root {
            Root::Descriptor {
                set,
                binding,
                storage: class,
                ..
            } if is_buffer_storage(class)
                && chain.exact
                && self.options.descriptor_checks
                && self.layout.get(set, binding).is_some() =>
            {
                pending.push(Pending {
                    kind: CheckKind::AtomicOp {
                        target: AtomicTarget::Descriptor { set, binding },
                        width,
                    },
                    call: Call::Descriptor {
                        set,
                        binding,
                        index: chain.descriptor_index,
                        terms: chain.terms,
                        size: width as u64,
                    },
                });
            }
            Root::Physical if self.options.address_checks => {
                pending.push(Pending {
                    kind: CheckKind::AtomicOp {
                        target: AtomicTarget::Address { alignment: width },
                        width,
                    },
                    call: Call::Address {
                        pointer,
                        size: width as u64,
                        alignment: width,
                    },
                });
            }
            _ => {}
        }
    }

    // Global declarations, created on first use.

    fn bool_type(&mut self) -> Id {
        if let Some(id) = self.bool_type {
            return id;
        }
        let id = match self.info.find_type(|t| *t == Type::Bool) {
            Some(id) => id,
            None => {
                let id = self.fresh();
                self.new_types
                    .push(Instruction::new(op::TYPE_BOOL, vec![id]));
                id
            }
        };
        self.bool_type = Some(id);
        id
    }

    fn uint_type(&mut self, width: u32) -> Id {
        if let Some(&id) = self.uint_types.get(&width) {
            return id;
        }
        let id = match self.info.find_int(width, false) {
            Some(id) => id,
            None => {
                let id = self.fresh();
                self.new_types
                    .push(Instruction::new(op::TYPE_INT, vec![id, width, 0]));
                id
            }
        };
        self.uint_types.insert(width, id);
        id
    }

    fn const_u32(&mut self, value: u32) -> Id {
        if let Some(&id) = self.u32_constants.get(&value) {
            return id;
        }
        let ty = self.uint_type(32);
        let id = self.fresh();
        self.new_constants
            .push(Instruction::new(op::CONSTANT, vec![ty, id, value]));
        self.u32_constants.insert(value, id);
        id
    }

    fn const_u64(&mut self, value: u64) -> Id {
        if let Some(&id) = self.u64_constants.get(&value) {
            return id;
        }
        let ty = self.uint_type(64);
        let id = self.fresh();
        self.new_constants.push(Instruction::new(
            op::CONSTANT,
            vec![ty, id, value as u32, (value >> 32) as u32],
        ));
        self.u64_constants.insert(value, id);
        id
    }

    fn null_of(&mut self, ty: Id) -> Id {
        if let Some(&id) = self.nulls.get(&ty) {
            return id;
        }
        let id = self.fresh();
        self.new_constants
            .push(Instruction::new(op::CONSTANT_NULL, vec![ty, id]));
        self.nulls.insert(ty, id);
        id
    }

    fn check_fn(&mut self, which: CheckFn) -> Id {
        if let Some(id) = self.check_fns[which as usize] {
            return id;
        }
        let ret = self.bool_type();
        let u32_ty = self.uint_type(32);
        let u64_ty = self.uint_type(64);
        let (name, params) = match which {
            CheckFn::Descriptor => (
                CHECK_DESCRIPTOR,
                vec![u32_ty, u32_ty, u32_ty, u32_ty, u64_ty, u64_ty],
            ),
            CheckFn::Texel => (CHECK_TEXEL, vec![u32_ty, u32_ty, u32_ty, u32_ty, u64_ty]),
            CheckFn::Address => (CHECK_ADDRESS, vec![u32_ty, u64_ty, u64_ty, u32_ty]),
        };

        let signature = Type::Function {
            ret,
            params: params.clone(),
        };
        let fn_ty = match self.info.find_type(|t| *t == signature) {
            Some(id) => id,
            None => {
                let id = self.fresh();
                let mut operands = vec![id, ret];
                operands.extend_from_slice(&params);
                self.new_types
                    .push(Instruction::new(op::TYPE_FUNCTION, operands));
                id
            }
        };

        let function = self.fresh();
        self.imports
            .push(Instruction::new(op::FUNCTION, vec![ret, function, 0, fn_ty]));
        for param in params {
            let id = self.fresh();
            self.imports
                .push(Instruction::new(op::FUNCTION_PARAMETER, vec![param, id]));
        }
        self.imports
            .push(Instruction::new(op::FUNCTION_END, Vec::new()));

        let mut linkage = vec![function, decoration::LINKAGE_ATTRIBUTES];
        linkage.extend(encode_string(name));
        linkage.push(op::LINKAGE_IMPORT);
        self.decorations
            .push(Instruction::new(op::DECORATE, linkage));

        self.check_fns[which as usize] = Some(function);
        function
    }

    // Emission into the current block.

    fn emit(&mut self, out: &mut Vec<Instruction>, opcode: u16, ty: Id, operands: &[Id]) -> Id {
        let id = self.fresh();
        let mut words = vec![ty, id];
        words.extend_from_slice(operands);
        out.push(Instruction::new(opcode, words));
        id
    }

    fn int_type_of(&self, value: Id) -> Option<(u32, bool)> {
        match self.info.ty(self.info.value_type(value)?)? {
            Type::Int { width, signed } => Some((*width, *signed)),
            _ => None,
        }
    }

    /// `value` widened to u64.  Signed values sign extend, so a negative index saturates.
    fn as_u64(&mut self, out: &mut Vec<Instruction>, value: Id) -> Id {
        let Some((width, signed)) = self.int_type_of(value) else {
            return value;
        };
        let u64_ty = self.uint_type(64);
        match (width, signed) {
            (64, false) => value,
            (64, true) => self.emit(out, op::BITCAST, u64_ty, &[value]),
            (_, true) => self.emit(out, op::S_CONVERT, u64_ty, &[value]),
            (_, false) => self.emit(out, op::U_CONVERT, u64_ty, &[value]),
        }
    }

    /// `value` as a u32 descriptor index.  Wider values saturate at `u32::MAX` instead of losing
    /// their high bits.
    fn as_index(&mut self, out: &mut Vec<Instruction>, value: Id) -> Id {
        let Some((width, signed)) = self.int_type_of(value) else {
            return value;
        };
        let u32_ty = self.uint_type(32);
        match (width, signed) {
            (32, false) => value,
            (32, true) => self.emit(out, op::BITCAST, u32_ty, &[value]),
            (w, true) if w < 32 => self.emit(out, op::S_CONVERT, u32_ty, &[value]),
            (w, false) if w < 32 => self.emit(out, op::U_CONVERT, u32_ty, &[value]),
            _ => {
                let wide = self.as_u64(out, value);
                let bool_ty = self.bool_type();
                let limit = self.const_u64(u64::from(u32::MAX));
                let over = self.emit(out, op::U_GREATER_THAN, bool_ty, &[wide, limit]);
                let low = self.emit(out, op::U_CONVERT, u32_ty, &[wide]);
                let max = self.const_u32(u32::MAX);
                self.emit(out, op::SELECT, u32_ty, &[over, max, low])
            }
        }
    }

    /// Byte offset of a chain: `constant + index * stride + ...`, saturating at `u64::MAX`.
    fn emit_offset(&mut self, out: &mut Vec<Instruction>, terms: &[Term]) -> Id {
        let constant = terms
            .iter()
            .filter_map(|t| match t {
                Term::Const(c) => Some(*c),
                Term::Scaled { .. } => None,
            })
            .fold(0u64, u64::saturating_add);
        let mut acc = self.const_u64(constant);
        for term in terms {
            let Term::Scaled { index, stride } = *term else {
                continue;
            };
            if stride == 0 {
                continue;
            }
            let u64_ty = self.uint_type(64);
            let bool_ty = self.bool_type();
            let max = self.const_u64(u64::MAX);
            let index = self.as_u64(out, index);
            let product = if stride == 1 {
                index
            } else {
                let factor = self.const_u64(stride);
                let scaled = self.emit(out, op::I_MUL, u64_ty, &[index, factor]);
                let limit = self.const_u64(u64::MAX / stride);
                let over = self.emit(out, op::U_GREATER_THAN, bool_ty, &[index, limit]);
                self.emit(out, op::SELECT, u64_ty, &[over, max, scaled])
            };
            let sum = self.emit(out, op::I_ADD, u64_ty, &[acc, product]);
            let wrapped = self.emit(out, op::U_LESS_THAN, bool_ty, &[sum, acc]);
            acc = self.emit(out, op::SELECT, u64_ty, &[wrapped, max, sum]);
        }
        acc
    }

    fn emit_call(&mut self, out: &mut Vec<Instruction>, site: u32, call: Call) -> Id {
        let (function, args) = match call {
            Call::Descriptor {
                set,
                binding,
                index,
                terms,
                size,
            } => {
                let function = self.check_fn(CheckFn::Descriptor);
                let index = match index {
                    Some(index) => self.as_index(out, index),
                    None => self.const_u32(0),
                };
                let offset = self.emit_offset(out, &terms);
                let args = vec![
                    self.const_u32(site),
                    self.const_u32(set),
                    self.const_u32(binding),
                    index,
                    offset,
                    self.const_u64(size),
                ];
                (function, args)
            }
            Call::Texel {
                set,
                binding,
                index,
                coordinate,
            } => {
                let function = self.check_fn(CheckFn::Texel);
                let index = match index {
                    Some(index) => self.as_index(out, index),
                    None => self.const_u32(0),
                };
                let coordinate = self.as_u64(out, coordinate);
                let args = vec![
                    self.const_u32(site),
                    self.const_u32(set),
                    self.const_u32(binding),
                    index,
                    coordinate,
                ];
                (function, args)
            }
            Call::Address {
                pointer,
                size,
                alignment,
            } => {
                let function = self.check_fn(CheckFn::Address);
                let u64_ty = self.uint_type(64);
                let address = self.fresh();
                out.push(Instruction::new(
                    op::CONVERT_PTR_TO_U,
                    vec![u64_ty, address, pointer],
                ));
                let args = vec![
                    self.const_u32(site),
                    address,
                    self.const_u64(size),
                    self.const_u32(alignment),
                ];
                (function, args)
            }
        };

        let bool_ty = self.bool_type();
        let result = self.fresh();
        let mut operands = vec![bool_ty, result, function];
        operands.extend(args);
        out.push(Instruction::new(op::FUNCTION_CALL, operands));
        result
    }

    fn location_id(&mut self, file: Id, line: u32, column: u32) -> SourceLocationId {
        if let Some(&id) = self.location_ids.get(&(file, line, column)) {
            return id;
        }
        let id = self.locations.len() as SourceLocationId;
        self.locations.push(SourceLocation {
            file: self
                .info
                .strings
                .get(&file)
                .cloned()
                .unwrap_or_else(|| "<unknown>".to_owned()),
            line,
            column,
        });
        self.location_ids.insert((file, line, column), id);
        id
    }

    // Control flow.

    fn rewrite_function(&mut self, function: Function) -> Vec<Instruction> {
        let mut out = function.header;
        let mut exits: HashMap<Id, Id> = HashMap::new();

        for block in function.blocks {
            let (blocks, moved) = self.normalize_loop_header(block);
            if let Some((header, body)) = moved {
                exits.insert(header, body);
            }
            for block in blocks {
                self.rewrite_block(block, &mut out, &mut exits);
            }
        }
        out.push(function.end);

        // Successors still name the block that used to hold the terminator.
        for inst in out.iter_mut().filter(|i| i.opcode == op::PHI) {
            for parent in inst.operands.iter_mut().skip(3).step_by(2) {
                let mut label = *parent;
                while let Some(&next) = exits.get(&label) {
                    label = next;
                }
                *parent = label;
            }
        }
        out
    }

    /// A loop header must keep its `OpLoopMerge` right before its terminator, so splitting it in
    /// the middle is not an option.  Instead its checked body moves into a fresh block that the
    /// header branches to unconditionally.
    fn normalize_loop_header(&mut self, mut block: Block) -> (Vec<Block>, Option<(Id, Id)>) {
        let Some(merge_at) = block.body.iter().position(|i| i.opcode == op::LOOP_MERGE) else {
            return (vec![block], None);
        };
        if block.body.iter().all(|i| self.classify(i).is_empty()) {
            return (vec![block], None);
        }

        let loop_merge = block.body[merge_at].clone();
        let exits = [loop_merge.operand(0), loop_merge.operand(1)];
        let movable = match block.body.last() {
            Some(t) if t.opcode == op::BRANCH => true,
            Some(t) if t.opcode == op::BRANCH_CONDITIONAL => {
                exits.contains(&t.operand(1)) || exits.contains(&t.operand(2))
            }
            _ => false,
        };
        if !movable {
            warn!(
                label = block.label,
                "loop header branches inward on both sides, its accesses are not checked"
            );
            block.skip = true;
            return (vec![block], None);
        }

        let lead = block
            .body
            .iter()
            .take_while(|i| matches!(i.opcode, op::PHI | op::LINE | op::NO_LINE))
            .count();
        let body_label = self.fresh();
        let mut header_body = block.body[..lead].to_vec();
        header_body.push(loop_merge);
        header_body.push(Instruction::new(op::BRANCH, vec![body_label]));
        let rest = block
            .body
            .into_iter()
            .enumerate()
            .skip(lead)
            .filter(|(i, _)| *i != merge_at)
            .map(|(_, inst)| inst)
            .collect();

        let header = block.label;
        (
            vec![
                Block {
                    label: header,
                    body: header_body,
                    skip: false,
                },
                Block {
                    label: body_label,
                    body: rest,
                    skip: false,
                },
            ],
            Some((header, body_label)),
        )
    }

    fn rewrite_block(
        &mut self,
        block: Block,
        out: &mut Vec<Instruction>,
        exits: &mut HashMap<Id, Id>,
    ) {
        out.push(Instruction::new(op::LABEL, vec![block.label]));
        let mut current = block.label;
        let mut line = None;

        for inst in block.body {
            match inst.opcode {
                op::LINE if inst.operands.len() >= 3 => {
                    line = Some((inst.operands[0], inst.operands[1], inst.operands[2]));
                }
                op::NO_LINE => line = None,
                _ => {}
            }

            let pending = if block.skip {
                Checks::new()
            } else {
                self.classify(&inst)
            };
            if pending.is_empty() {
                out.push(inst);
                continue;
            }

            let location = line.map(|(file, l, c)| self.location_id(file, l, c));
            let mut verdicts: SmallVec<Id, 2> = SmallVec::new();
            for Pending { kind, call } in pending {
                let id = self.take_site_id();
                self.sites.push(CheckSite {
                    id,
                    kind,
                    opcode: inst.opcode,
                    source_location: location,
                });
                verdicts.push(self.emit_call(out, id, call));
            }

            let mut ok = verdicts[0];
            for &verdict in &verdicts[1..] {
                let bool_ty = self.bool_type();
                let both = self.fresh();
                out.push(Instruction::new(op::LOGICAL_AND, vec![bool_ty, both, ok, verdict]));
                ok = both;
            }

            current = self.guard(out, inst, ok);
        }

        if current != block.label {
            exits.insert(block.label, current);
        }
    }

    /// Move `inst` under `ok`.  Returns the label of the block that continues afterward.
    fn guard(&mut self, out: &mut Vec<Instruction>, inst: Instruction, ok: Id) -> Id {
        let valid = self.fresh();
        let invalid = self.fresh();
        let merge = self.fresh();

        out.push(Instruction::new(op::SELECTION_MERGE, vec![merge, 0]));
        out.push(Instruction::new(op::BRANCH_CONDITIONAL, vec![ok, valid, invalid]));

        out.push(Instruction::new(op::LABEL, vec![valid]));
        let result = inst.result_type().zip(inst.result_id());
        let mut moved = inst;
        let renamed = match result {
            Some(_) => {
                let id = self.fresh();
                moved.set_result_id(id);
                Some(id)
            }
            None => None,
        };
        out.push(moved);
        out.push(Instruction::new(op::BRANCH, vec![merge]));

        out.push(Instruction::new(op::LABEL, vec![invalid]));
        let fallback = result.map(|(ty, _)| self.fallback(out, ty));
        out.push(Instruction::new(op::BRANCH, vec![merge]));

        out.push(Instruction::new(op::LABEL, vec![merge]));
        if let (Some((ty, id)), Some(renamed), Some(fallback)) = (result, renamed, fallback) {
            out.push(Instruction::new(
                op::PHI,
                vec![ty, id, renamed, valid, fallback, invalid],
            ));
        }
        merge
    }

    fn fallback(&mut self, out: &mut Vec<Instruction>, ty: Id) -> Id {
        match self.info.pointee(ty) {
            Some((storage::PHYSICAL_STORAGE_BUFFER, _)) => {
                let sentinel = self.const_u64(self.options.sentinel_address);
                let id = self.fresh();
                out.push(Instruction::new(op::CONVERT_U_TO_PTR, vec![ty, id, sentinel]));
                id
            }
            _ => self.null_of(ty),
        }
    }
}
