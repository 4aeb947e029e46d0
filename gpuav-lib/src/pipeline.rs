// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Pipelines
//!
//! Shaders are instrumented when a pipeline is created, against the descriptor layout the pipeline
//! declares.  Identical `(module, layout)` pairs are instrumented once and every pipeline built
//! from them shares the result, check sites included.
//!
//! Check site ids are unique across the whole device.  Each instrumented shader takes a contiguous
//! block, so resolving an id is a range lookup followed by a binary search.
//!
//! Destroying the last pipeline built from a shader retires it.  Feedback from submissions made
//! before the destroy may still name its sites, so the shader is dropped only once all of them have
//! completed.  Its site ids are never handed out again.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ash::vk;
use gpuav_spirv::{
    BindingShape, CheckSite, InstrumentOptions, InstrumentedShader, Instrumentor, LayoutMetadata,
    Module, SourceLocation, SpirvError,
};
use gpuav_vulkan::descriptors::DescriptorSetLayout;
use tracing::{debug, trace};

use crate::registry::SubmissionIndex;

#[derive(Clone, Debug, Default)]
pub struct PipelineLayout {
    /// Indexed by set number.
    pub sets: Vec<Arc<DescriptorSetLayout>>,
}

impl PipelineLayout {
    pub fn new(sets: Vec<Arc<DescriptorSetLayout>>) -> Self {
        Self { sets }
    }

    /// What the instrumentor needs to know about every `(set, binding)`.
    pub fn metadata(&self) -> LayoutMetadata {
        self.sets
            .iter()
            .enumerate()
            .flat_map(|(set, layout)| {
                layout.bindings().iter().map(move |b| {
                    let shape = BindingShape {
                        count: b.count,
                        texel_buffer: b.class.is_texel_buffer(),
                    };
                    ((set as u32, b.binding), shape)
                })
            })
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct InstrumentedPipeline {
    pub handle: vk::Pipeline,
    pub shader: Arc<InstrumentedShader>,
    pub layout: Arc<PipelineLayout>,
    key: ShaderKey,
}

/// Module hash and layout fingerprint.
type ShaderKey = (u64, u64);

/// Check site id to the shader that owns it.
#[derive(Debug, Default)]
pub struct CheckSiteTable {
    shaders: BTreeMap<u32, Arc<InstrumentedShader>>,
}

impl CheckSiteTable {
    fn insert(&mut self, shader: &Arc<InstrumentedShader>) {
        if let Some(first) = shader.sites.first() {
            self.shaders.insert(first.id, shader.clone());
        }
    }

    fn remove(&mut self, shader: &InstrumentedShader) {
        if let Some(first) = shader.sites.first() {
            self.shaders.remove(&first.id);
        }
    }

    pub fn resolve(&self, id: u32) -> Option<(&CheckSite, Option<&SourceLocation>)> {
        let (_, shader) = self.shaders.range(..=id).next_back()?;
        let site = shader.site(id)?;
        let location = site
            .source_location
            .and_then(|location| shader.source_location(location));
        Some((site, location))
    }

    pub fn len(&self) -> usize {
        self.shaders.values().map(|s| s.sites.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }
}

pub struct PipelineCache {
    instrumentor: Instrumentor,
    shaders: HashMap<ShaderKey, Arc<InstrumentedShader>>,
    pipelines: HashMap<vk::Pipeline, InstrumentedPipeline>,
    /// Shaders no pipeline uses, and the last submission that might have run them.
    retired: HashMap<ShaderKey, SubmissionIndex>,
    sites: CheckSiteTable,
    next_site: u32,
}

impl PipelineCache {
    pub fn new(options: InstrumentOptions) -> Self {
        Self {
            instrumentor: Instrumentor::new(options),
            shaders: HashMap::new(),
            pipelines: HashMap::new(),
            retired: HashMap::new(),
            sites: CheckSiteTable::default(),
            // Zero stays free so a record nobody filled in cannot resolve.
            next_site: 1,
        }
    }

    /// Instrument `words` for `layout`, or reuse an earlier identical result.
    pub fn instrument(
        &mut self,
        words: &[u32],
        layout: &PipelineLayout,
    ) -> Result<Arc<InstrumentedShader>, SpirvError> {
        self.instrument_keyed(words, layout).map(|(_, shader)| shader)
    }

    fn instrument_keyed(
        &mut self,
        words: &[u32],
        layout: &PipelineLayout,
    ) -> Result<(ShaderKey, Arc<InstrumentedShader>), SpirvError> {
        let module = Module::parse(words)?;
        let metadata = layout.metadata();
        let key = (module.hash(), metadata.fingerprint());
        if let Some(shader) = self.shaders.get(&key) {
            debug!(hash = key.0, "reusing instrumented shader");
            self.retired.remove(&key);
            return Ok((key, shader.clone()));
        }

        let first = self.next_site;
        let shader = Arc::new(self.instrumentor.instrument(&module, &metadata, first)?);
        self.next_site = u32::try_from(shader.sites.len())
            .ok()
            .and_then(|n| first.checked_add(n))
            .ok_or(SpirvError::SiteIdsExhausted { first })?;
        self.sites.insert(&shader);
        self.shaders.insert(key, shader.clone());
        debug!(
            hash = key.0,
            sites = shader.sites.len(),
            "instrumented shader"
        );
        Ok((key, shader))
    }

    pub fn create_pipeline(
        &mut self,
        handle: vk::Pipeline,
        words: &[u32],
        layout: Arc<PipelineLayout>,
    ) -> Result<&InstrumentedPipeline, SpirvError> {
        let (key, shader) = self.instrument_keyed(words, &layout)?;
        let pipeline = InstrumentedPipeline {
            handle,
            shader,
            layout,
            key,
        };
        Ok(self.pipelines.entry(handle).insert_entry(pipeline).into_mut())
    }

    pub fn pipeline(&self, handle: vk::Pipeline) -> Option<&InstrumentedPipeline> {
        self.pipelines.get(&handle)
    }

    /// Forget the pipeline.  `last_submitted` is the newest submission that may have run it, which
    /// keeps its shader resolvable until that submission completes.
    pub fn destroy_pipeline(
        &mut self,
        handle: vk::Pipeline,
        last_submitted: SubmissionIndex,
    ) -> Option<InstrumentedPipeline> {
        let pipeline = self.pipelines.remove(&handle)?;
        if !self.pipelines.values().any(|p| p.key == pipeline.key) {
            self.retired.insert(pipeline.key, last_submitted);
        }
        Some(pipeline)
    }

    /// Drop retired shaders no submission up to `completed` can name anymore.  Returns how many
    /// went.
    pub fn collect_garbage(&mut self, completed: SubmissionIndex) -> usize {
        let due: Vec<ShaderKey> = self
            .retired
            .iter()
            .filter(|&(_, &after)| after <= completed)
            .map(|(key, _)| *key)
            .collect();
        for key in &due {
            self.retired.remove(key);
            if let Some(shader) = self.shaders.remove(key) {
                self.sites.remove(&shader);
                trace!(hash = key.0, sites = shader.sites.len(), "dropped retired shader");
            }
        }
        due.len()
    }

    pub fn sites(&self) -> &CheckSiteTable {
        &self.sites
    }
}
