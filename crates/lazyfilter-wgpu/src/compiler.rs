//! Graph to plan compilation
//!
//! Compilation runs in three phases. Scheduling validates the graph and computes
//! regions without touching the device, so every graph error is reported before any
//! GPU work. Pipelines are then resolved through the [`PipelineCache`], and finally
//! textures are acquired from the [`TexturePool`].

use crate::backend::{Backend, TextureKey};
use crate::error::RenderError;
use crate::filters::{FilterCatalog, FilterDefinition, ResolvedParams};
use crate::format::{ImageBuffer, PixelFormat};
use crate::graph::{FilterGraph, GraphNode, NodeId};
use crate::pipeline_cache::PipelineCache;
use crate::plan::{COMPUTE_WORKGROUP_SIZE, CompiledPlan, DispatchHeader, DispatchStep, MAX_FILTER_INPUTS, SourceUpload};
use crate::region::Region;
use crate::shader_registry::ShaderRegistry;
use crate::texture_pool::{PooledTexture, TexturePool};
use std::collections::HashMap;

/// A node reachable from the output, with its resolved bindings
#[derive(Debug)]
enum ScheduledKind<'g> {
    Upload(&'g ImageBuffer),
    Dispatch {
        definition: FilterDefinition,
        params: ResolvedParams,
        inputs: Vec<NodeId>,
    },
}

#[derive(Debug)]
struct ScheduledNode<'g> {
    id: NodeId,
    kind: ScheduledKind<'g>,
    extent: Region,
    region: Region,
}

/// Lifetime of one node's output texture, in schedule positions
#[derive(Debug, Clone, Copy)]
struct TextureLifetime {
    key: TextureKey,
    created_at: usize,
    last_used_at: usize,
    reusable: bool,
}

/// Maps each lifetime to a texture slot, reusing a slot whose previous occupant's
/// lifetime ended strictly before the new one begins
///
/// Returns the slot keys and the slot assigned to each lifetime.
fn assign_texture_slots(lifetimes: &[TextureLifetime]) -> (Vec<TextureKey>, Vec<usize>) {
    let mut slots: Vec<TextureLifetime> = Vec::new();
    let mut assignments = Vec::with_capacity(lifetimes.len());

    for lifetime in lifetimes {
        let reuse = lifetime.reusable.then(|| {
            slots
                .iter()
                .position(|existing| existing.reusable && existing.key == lifetime.key && existing.last_used_at < lifetime.created_at)
        });

        let slot = match reuse.flatten() {
            Some(slot) => {
                slots[slot] = *lifetime;
                slot
            }
            None => {
                slots.push(*lifetime);
                slots.len() - 1
            }
        };
        assignments.push(slot);
    }

    (slots.iter().map(|s| s.key).collect(), assignments)
}

/// Compiles filter graphs into executable plans
#[derive(Debug)]
pub struct GraphCompiler<'a, B: Backend> {
    backend: &'a B,
    catalog: &'a FilterCatalog,
    shaders: &'a ShaderRegistry,
    pipelines: &'a PipelineCache<B>,
    textures: &'a TexturePool<B>,
}

impl<'a, B: Backend> GraphCompiler<'a, B> {
    pub fn new(backend: &'a B, catalog: &'a FilterCatalog, shaders: &'a ShaderRegistry, pipelines: &'a PipelineCache<B>, textures: &'a TexturePool<B>) -> Self {
        Self {
            backend,
            catalog,
            shaders,
            pipelines,
            textures,
        }
    }

    /// Compiles `graph` for the requested region
    ///
    /// [`Region::INFINITE`] requests the output's whole extent. Steps are emitted by
    /// topological depth, ties broken by depth-first discovery order.
    pub async fn compile(&self, graph: &FilterGraph, region: Region) -> Result<CompiledPlan<B>, RenderError> {
        let schedule = self.schedule(graph, region)?;

        let mut pipelines = HashMap::new();
        for node in &schedule {
            if let ScheduledKind::Dispatch { definition, params, .. } = &node.kind {
                let constants = definition.pipeline_constants(params);
                let pipeline = self.pipelines.get_pipeline(self.backend, self.shaders, definition, &constants).await?;
                pipelines.insert(node.id, pipeline);
            }
        }

        // Lifetimes, in schedule positions.
        let position = schedule.iter().enumerate().map(|(i, n)| (n.id, i)).collect::<HashMap<_, _>>();
        let mut last_used = schedule.iter().map(|n| n.id).zip(std::iter::repeat(0)).collect::<HashMap<_, _>>();
        for (i, node) in schedule.iter().enumerate() {
            if let ScheduledKind::Dispatch { inputs, .. } = &node.kind {
                for input in inputs {
                    last_used.insert(*input, i);
                }
            }
        }
        let output_id = schedule.last().map(|n| n.id).ok_or_else(|| RenderError::InvalidGraph("graph has no output".to_string()))?;
        last_used.insert(output_id, usize::MAX);

        let lifetimes = schedule
            .iter()
            .enumerate()
            .map(|(i, node)| TextureLifetime {
                key: TextureKey::new(node.region.width, node.region.height, PixelFormat::WORKING),
                created_at: i,
                last_used_at: last_used[&node.id],
                reusable: matches!(node.kind, ScheduledKind::Dispatch { .. }),
            })
            .collect::<Vec<_>>();
        let (slot_keys, assignments) = assign_texture_slots(&lifetimes);
        let slot_of = |id: NodeId| assignments[position[&id]];

        let textures = self.acquire_textures(&slot_keys)?;

        let mut uploads = Vec::new();
        let mut steps = Vec::new();
        for node in &schedule {
            match &node.kind {
                ScheduledKind::Upload(image) => uploads.push(SourceUpload {
                    node: node.id,
                    texture: slot_of(node.id),
                    region: node.region,
                    pixels: image.to_working(node.region),
                }),
                ScheduledKind::Dispatch { definition, params, inputs } => {
                    let input_regions = inputs.iter().map(|input| schedule[position[input]].region).collect::<Vec<_>>();
                    steps.push(DispatchStep {
                        node: node.id,
                        filter: definition.id,
                        pipeline: pipelines[&node.id].clone(),
                        inputs: inputs.iter().map(|input| slot_of(*input)).collect(),
                        output: slot_of(node.id),
                        region: node.region,
                        header: DispatchHeader::new(node.region, &input_regions),
                        params: definition.uniform_data(params),
                        workgroups: (node.region.width.div_ceil(COMPUTE_WORKGROUP_SIZE), node.region.height.div_ceil(COMPUTE_WORKGROUP_SIZE)),
                    });
                }
            }
        }

        let output = slot_of(output_id);
        let region = schedule[position[&output_id]].region;
        tracing::debug!(steps = steps.len(), uploads = uploads.len(), textures = textures.len(), %region, "compiled plan");

        Ok(CompiledPlan {
            uploads,
            steps,
            textures,
            output,
            region,
        })
    }

    fn acquire_textures(&self, keys: &[TextureKey]) -> Result<Vec<PooledTexture<B::Texture>>, RenderError> {
        let mut acquired = Vec::with_capacity(keys.len());
        for key in keys {
            match self.textures.acquire(self.backend, *key) {
                Ok(texture) => acquired.push(texture),
                Err(e) => {
                    for texture in acquired {
                        self.textures.release(self.backend, texture);
                    }
                    return Err(e);
                }
            }
        }
        Ok(acquired)
    }

    /// Orders, validates and sizes every node reachable from the output
    fn schedule<'g>(&self, graph: &'g FilterGraph, request: Region) -> Result<Vec<ScheduledNode<'g>>, RenderError> {
        let output = graph.output().ok_or_else(|| RenderError::InvalidGraph("graph has no output".to_string()))?;
        let mut nodes = self.topological_order(graph, output)?;

        // Extents flow forward from the sources.
        let mut extents: HashMap<NodeId, Region> = HashMap::new();
        for node in nodes.iter_mut() {
            node.extent = match &node.kind {
                ScheduledKind::Upload(image) => image.extent(),
                ScheduledKind::Dispatch { definition, params, inputs } => {
                    let input_extents = inputs.iter().map(|input| extents[input]).collect::<Vec<_>>();
                    definition.extent(params, &input_extents)
                }
            };
            extents.insert(node.id, node.extent);
        }

        let output_extent = extents[&output];
        let request = if request.is_infinite() {
            if output_extent.is_infinite() {
                return Err(RenderError::UnsupportedRegion("an infinite region was requested from an image with infinite extent".to_string()));
            }
            output_extent
        } else {
            request
        };
        if request.is_empty() {
            return Err(RenderError::UnsupportedRegion(format!("requested region {request} is empty")));
        }

        // Regions of interest flow backward from the output; shared inputs get the union.
        let mut regions: HashMap<NodeId, Region> = HashMap::from([(output, request)]);
        for node in nodes.iter_mut().rev() {
            node.region = regions.get(&node.id).copied().unwrap_or(request);
            if let ScheduledKind::Dispatch { definition, params, inputs } = &node.kind {
                let needed = definition.input_region(params, node.region);
                for input in inputs {
                    let region = regions.get(input).map_or(needed, |r| r.union(&needed));
                    regions.insert(*input, region);
                }
            }
        }

        let max = self.backend.max_texture_dimension();
        if let Some(node) = nodes.iter().find(|n| n.region.width > max || n.region.height > max) {
            return Err(RenderError::UnsupportedRegion(format!("node {} needs region {} which exceeds the maximum texture dimension {max}", node.id, node.region)));
        }

        Ok(nodes)
    }

    /// Depth-first traversal from the output
    ///
    /// Nodes are sorted by longest distance from a source, ties broken by the order
    /// the traversal first reached them.
    fn topological_order<'g>(&self, graph: &'g FilterGraph, output: NodeId) -> Result<Vec<ScheduledNode<'g>>, RenderError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<NodeId, Mark> = HashMap::new();
        let mut discovered: HashMap<NodeId, usize> = HashMap::new();
        let mut depths: HashMap<NodeId, usize> = HashMap::new();
        let mut finished = Vec::new();
        // (node, bound inputs, next input to visit)
        let mut stack: Vec<(NodeId, ScheduledKind<'g>, usize)> = Vec::new();

        let mut enter = |id: NodeId, marks: &mut HashMap<NodeId, Mark>| -> Result<ScheduledKind<'g>, RenderError> {
            let node = graph.node(id).ok_or_else(|| RenderError::InvalidGraph(format!("reference to missing node {id}")))?;
            marks.insert(id, Mark::Visiting);
            let index = discovered.len();
            discovered.insert(id, index);
            self.bind(id, node)
        };

        let kind = enter(output, &mut marks)?;
        stack.push((output, kind, 0));

        while let Some((id, kind, next)) = stack.last_mut() {
            let inputs: &[NodeId] = match kind {
                ScheduledKind::Dispatch { inputs, .. } => inputs.as_slice(),
                ScheduledKind::Upload(_) => &[],
            };
            if let Some(&input) = inputs.get(*next) {
                *next += 1;
                match marks.get(&input) {
                    Some(Mark::Visiting) => {
                        return Err(RenderError::InvalidGraph(format!("cycle through node {input} (reached from {id})")));
                    }
                    Some(Mark::Done) => {}
                    None => {
                        let kind = enter(input, &mut marks)?;
                        stack.push((input, kind, 0));
                    }
                }
                continue;
            }

            let Some((id, kind, _)) = stack.pop() else { break };
            let depth = match &kind {
                ScheduledKind::Dispatch { inputs, .. } => inputs.iter().map(|i| depths[i] + 1).max().unwrap_or(0),
                ScheduledKind::Upload(_) => 0,
            };
            depths.insert(id, depth);
            marks.insert(id, Mark::Done);
            finished.push(ScheduledNode {
                id,
                kind,
                extent: Region::INFINITE,
                region: Region::INFINITE,
            });
        }

        finished.sort_by_key(|n| (depths[&n.id], discovered[&n.id]));
        Ok(finished)
    }

    /// Resolves a node's filter, parameters and input slots
    fn bind<'g>(&self, id: NodeId, node: &'g GraphNode) -> Result<ScheduledKind<'g>, RenderError> {
        let filter_node = match node {
            GraphNode::Image(image) => {
                if image.data.len() != image.expected_len() {
                    return Err(RenderError::InvalidGraph(format!(
                        "image node {id} is {}x{} {:?} and needs {} bytes, but holds {}",
                        image.width,
                        image.height,
                        image.format,
                        image.expected_len(),
                        image.data.len()
                    )));
                }
                return Ok(ScheduledKind::Upload(image));
            }
            GraphNode::Filter(filter_node) => filter_node,
        };
        let definition = self.catalog.get(filter_node.filter()).ok_or_else(|| RenderError::UnknownFilter(filter_node.filter().to_string()))?;
        if definition.inputs.len() > MAX_FILTER_INPUTS {
            return Err(RenderError::InvalidGraph(format!("filter '{}' declares more than {MAX_FILTER_INPUTS} inputs", definition.id)));
        }
        let params = definition.resolve_params(filter_node)?;
        let inputs = definition
            .inputs
            .iter()
            .enumerate()
            .map(|(index, name)| {
                filter_node.input_for_slot(index, name).ok_or_else(|| RenderError::MissingRequiredInput {
                    node: id,
                    filter: definition.id.to_string(),
                    input: name.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ScheduledKind::Dispatch { definition, params, inputs })
    }
}
