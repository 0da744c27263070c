//! Immutable filter graphs
//!
//! A [`FilterGraph`] is a persistent value: every builder method returns a new graph
//! and leaves the receiver untouched. Nodes live in an append-only arena addressed by
//! [`NodeId`]. The arena is split into chunks that double in size; a slot is written
//! once and never changes, so graphs derived from one another share their chunks and
//! appending to the newest graph is constant time.
//!
//! Construction is pure data assembly and never fails. Filter identifiers, parameter
//! keys, input slots and acyclicity are all checked by the compiler.

use crate::format::ImageBuffer;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

/// Handle of a node within a graph's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Creates a handle from a raw arena index
    ///
    /// Handles are not checked against any graph; a handle that does not resolve is
    /// reported as an invalid graph at compile time.
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A parameter value attached to a filter node
#[derive(Debug, Clone, Copy)]
pub enum ParamValue {
    Scalar(f32),
    Vector2([f32; 2]),
    Vector4([f32; 4]),
    /// Straight (non-premultiplied) RGBA
    Color([f32; 4]),
    /// The output of another node, bound to the input slot of the same name
    Image(NodeId),
}

impl ParamValue {
    pub fn color(r: f32, g: f32, b: f32, a: f32) -> Self {
        ParamValue::Color([r, g, b, a])
    }

    /// Float components of a non-image value
    pub fn components(&self) -> Option<&[f32]> {
        match self {
            ParamValue::Scalar(v) => Some(std::slice::from_ref(v)),
            ParamValue::Vector2(v) => Some(v),
            ParamValue::Vector4(v) | ParamValue::Color(v) => Some(v),
            ParamValue::Image(_) => None,
        }
    }

    /// Short name of the value's kind, for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            ParamValue::Scalar(_) => "scalar",
            ParamValue::Vector2(_) => "vector2",
            ParamValue::Vector4(_) => "vector4",
            ParamValue::Color(_) => "color",
            ParamValue::Image(_) => "image",
        }
    }

    fn discriminant(&self) -> u8 {
        match self {
            ParamValue::Scalar(_) => 0,
            ParamValue::Vector2(_) => 1,
            ParamValue::Vector4(_) => 2,
            ParamValue::Color(_) => 3,
            ParamValue::Image(_) => 4,
        }
    }
}

// Floats compare by bit pattern so that equal values always hash equally.
impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParamValue::Image(a), ParamValue::Image(b)) => a == b,
            _ => {
                self.discriminant() == other.discriminant()
                    && self
                        .components()
                        .zip(other.components())
                        .is_some_and(|(a, b)| a.iter().map(|v| v.to_bits()).eq(b.iter().map(|v| v.to_bits())))
            }
        }
    }
}

impl Eq for ParamValue {}

impl Hash for ParamValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.discriminant().hash(state);
        match self {
            ParamValue::Image(id) => id.hash(state),
            _ => {
                for v in self.components().unwrap_or_default() {
                    v.to_bits().hash(state);
                }
            }
        }
    }
}

impl From<f32> for ParamValue {
    fn from(value: f32) -> Self {
        ParamValue::Scalar(value)
    }
}

impl From<[f32; 2]> for ParamValue {
    fn from(value: [f32; 2]) -> Self {
        ParamValue::Vector2(value)
    }
}

impl From<[f32; 4]> for ParamValue {
    fn from(value: [f32; 4]) -> Self {
        ParamValue::Vector4(value)
    }
}

impl From<NodeId> for ParamValue {
    fn from(value: NodeId) -> Self {
        ParamValue::Image(value)
    }
}

/// A filter application: identifier, parameters and input references
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterNode {
    filter: String,
    params: BTreeMap<String, ParamValue>,
    inputs: Vec<NodeId>,
}

impl FilterNode {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            params: BTreeMap::new(),
            inputs: Vec::new(),
        }
    }

    /// Appends a positional input
    pub fn with_input(mut self, input: NodeId) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Resolves the node feeding input slot `index` named `name`
    ///
    /// An image-valued parameter with the slot's name takes precedence over the
    /// positional input at the same index.
    pub fn input_for_slot(&self, index: usize, name: &str) -> Option<NodeId> {
        match self.params.get(name) {
            Some(ParamValue::Image(id)) => Some(*id),
            _ => self.inputs.get(index).copied(),
        }
    }

    /// Every node referenced by this node, positional inputs first
    pub fn references(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.inputs.iter().copied().chain(self.params.values().filter_map(|v| match v {
            ParamValue::Image(id) => Some(*id),
            _ => None,
        }))
    }
}

/// A node in the graph arena
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GraphNode {
    /// Raw pixels supplied by the caller
    Image(ImageBuffer),
    /// A filter or generator
    Filter(FilterNode),
}

impl GraphNode {
    /// Nodes this node reads from
    pub fn references(&self) -> Box<dyn Iterator<Item = NodeId> + '_> {
        match self {
            GraphNode::Image(_) => Box::new(std::iter::empty()),
            GraphNode::Filter(node) => Box::new(node.references()),
        }
    }

    /// Whether this node terminates the graph
    pub fn is_source(&self) -> bool {
        self.references().next().is_none()
    }
}

/// Nodes in the first arena chunk; chunk `k` holds `FIRST_CHUNK << k`
const FIRST_CHUNK: usize = 16;

type Chunk = Arc<[OnceLock<Arc<GraphNode>>]>;

/// Chunk and offset of an arena index
fn locate(index: usize) -> (usize, usize) {
    let scaled = index / FIRST_CHUNK + 1;
    let chunk = (usize::BITS - 1 - scaled.leading_zeros()) as usize;
    (chunk, index - FIRST_CHUNK * ((1 << chunk) - 1))
}

fn new_chunk(chunk: usize) -> Chunk {
    (0..FIRST_CHUNK << chunk).map(|_| OnceLock::new()).collect()
}

/// A lazily evaluated image description
#[derive(Clone)]
pub struct FilterGraph {
    chunks: Arc<[Chunk]>,
    len: usize,
    output: Option<NodeId>,
}

impl FilterGraph {
    /// A graph with no nodes and no output
    pub fn empty() -> Self {
        Self {
            chunks: Arc::from(Vec::new()),
            len: 0,
            output: None,
        }
    }

    /// A graph whose output is a caller-supplied image
    pub fn image(image: ImageBuffer) -> Self {
        Self::empty().appending_node(GraphNode::Image(image))
    }

    /// A graph whose output is an input-less generator filter
    pub fn generator(filter: impl Into<String>, params: impl IntoIterator<Item = (&'static str, ParamValue)>) -> Self {
        let node = params.into_iter().fold(FilterNode::new(filter), |node, (key, value)| node.with_param(key, value));
        Self::empty().appending_node(GraphNode::Filter(node))
    }

    /// A graph whose output is an infinite plane of one straight RGBA color
    pub fn color(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self::generator("constant_color", [("color", ParamValue::color(r, g, b, a))])
    }

    /// Returns a new graph with `node` appended and designated as the output
    ///
    /// The node's inputs are used exactly as given.
    pub fn appending_node(&self, node: GraphNode) -> FilterGraph {
        self.appending(Arc::new(node))
    }

    fn appending(&self, node: Arc<GraphNode>) -> FilterGraph {
        let index = self.len;
        let (chunk, offset) = locate(index);

        let chunks = match self.chunks.get(chunk) {
            Some(shared) => match shared[offset].set(node) {
                Ok(()) => self.chunks.clone(),
                // Another graph derived from this one already took the slot; copy the chunk's prefix.
                Err(node) => {
                    let copy = new_chunk(chunk);
                    for (slot, existing) in copy.iter().zip(&shared[..offset]) {
                        if let Some(existing) = existing.get() {
                            let _ = slot.set(existing.clone());
                        }
                    }
                    let _ = copy[offset].set(node);
                    let mut chunks = self.chunks[..chunk].to_vec();
                    chunks.push(copy);
                    Arc::from(chunks)
                }
            },
            None => {
                let fresh = new_chunk(chunk);
                let _ = fresh[offset].set(node);
                let mut chunks = self.chunks.to_vec();
                chunks.push(fresh);
                Arc::from(chunks)
            }
        };

        FilterGraph {
            chunks,
            len: index + 1,
            output: Some(NodeId(index as u32)),
        }
    }

    fn arc_node(&self, index: usize) -> Option<&Arc<GraphNode>> {
        if index >= self.len {
            return None;
        }
        let (chunk, offset) = locate(index);
        self.chunks.get(chunk)?.get(offset)?.get()
    }

    fn nodes(&self) -> impl Iterator<Item = &Arc<GraphNode>> + '_ {
        (0..self.len).filter_map(|index| self.arc_node(index))
    }

    /// Returns a new graph applying `filter` to this graph's output
    ///
    /// The current output becomes the new node's first positional input. Applying a
    /// filter to an empty graph yields a node without inputs.
    pub fn applying_filter(&self, filter: impl Into<String>, params: impl IntoIterator<Item = (&'static str, ParamValue)>) -> FilterGraph {
        let node = params.into_iter().fold(FilterNode::new(filter), |node, (key, value)| node.with_param(key, value));
        let node = match self.output {
            Some(output) => node.with_input(output),
            None => node,
        };
        self.appending_node(GraphNode::Filter(node))
    }

    /// Returns a new graph applying a two-input filter to this graph and `other`
    ///
    /// `other`'s nodes are appended with remapped handles; this graph's output feeds
    /// the first input slot and `other`'s output the second.
    pub fn combining(&self, other: &FilterGraph, filter: impl Into<String>, params: impl IntoIterator<Item = (&'static str, ParamValue)>) -> FilterGraph {
        let offset = self.len as u32;
        let remap = |id: NodeId| NodeId(id.0 + offset);

        let mut merged = self.clone();
        for node in other.nodes() {
            let node = match node.as_ref() {
                GraphNode::Image(_) => node.clone(),
                GraphNode::Filter(f) => Arc::new(GraphNode::Filter(FilterNode {
                    filter: f.filter.clone(),
                    params: f
                        .params
                        .iter()
                        .map(|(k, v)| {
                            let v = match v {
                                ParamValue::Image(id) => ParamValue::Image(remap(*id)),
                                other => *other,
                            };
                            (k.clone(), v)
                        })
                        .collect(),
                    inputs: f.inputs.iter().copied().map(remap).collect(),
                })),
            };
            merged = merged.appending(node);
        }

        let mut node = params.into_iter().fold(FilterNode::new(filter), |node, (key, value)| node.with_param(key, value));
        if let Some(output) = self.output {
            node = node.with_input(output);
        }
        if let Some(output) = other.output {
            node = node.with_input(remap(output));
        }

        merged.appending_node(GraphNode::Filter(node))
    }

    /// Composites this graph over `background` with source-over blending
    pub fn composited_over(&self, background: &FilterGraph) -> FilterGraph {
        self.combining(background, "source_over", [])
    }

    /// Returns the same arena rooted at a different node
    pub fn rooted_at(&self, output: NodeId) -> FilterGraph {
        FilterGraph {
            chunks: self.chunks.clone(),
            len: self.len,
            output: Some(output),
        }
    }

    pub fn output(&self) -> Option<NodeId> {
        self.output
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.arc_node(id.index()).map(|n| n.as_ref())
    }

    /// Number of nodes in the arena, including nodes unreachable from the output
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lazily enumerates the leaves reachable from the output
    ///
    /// Leaves are image nodes and filter nodes without references (generators). The
    /// sequence is finite even for cyclic graphs, and can be restarted by calling
    /// this again or cloning the iterator.
    pub fn source_nodes(&self) -> SourceNodes<'_> {
        SourceNodes {
            graph: self,
            stack: self.output.into_iter().collect(),
            visited: HashSet::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn shares_node_with(&self, other: &FilterGraph, id: NodeId) -> bool {
        match (self.arc_node(id.index()), other.arc_node(id.index())) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Default for FilterGraph {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for FilterGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterGraph")
            .field("output", &self.output)
            .field("nodes", &self.nodes().enumerate().map(|(i, n)| (NodeId(i as u32), n.as_ref())).collect::<Vec<_>>())
            .finish()
    }
}

/// Iterator over the leaves of a graph, see [`FilterGraph::source_nodes`]
#[derive(Clone)]
pub struct SourceNodes<'a> {
    graph: &'a FilterGraph,
    stack: Vec<NodeId>,
    visited: HashSet<NodeId>,
}

impl<'a> Iterator for SourceNodes<'a> {
    type Item = (NodeId, &'a GraphNode);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            if !self.visited.insert(id) {
                continue;
            }
            // Dangling references are skipped here and reported by the compiler.
            let Some(node) = self.graph.node(id) else {
                continue;
            };
            if node.is_source() {
                return Some((id, node));
            }
            let mut refs = node.references().collect::<Vec<_>>();
            refs.reverse();
            self.stack.extend(refs);
        }
        None
    }
}

/// Structural comparison of two graphs, tolerant of cycles
struct StructuralEq<'a> {
    left: &'a FilterGraph,
    right: &'a FilterGraph,
    assumed: HashSet<(NodeId, NodeId)>,
}

impl StructuralEq<'_> {
    fn nodes_equal(&mut self, a: NodeId, b: NodeId) -> bool {
        if !self.assumed.insert((a, b)) {
            return true;
        }
        match (self.left.node(a), self.right.node(b)) {
            (None, None) => true,
            (Some(GraphNode::Image(x)), Some(GraphNode::Image(y))) => x == y,
            (Some(GraphNode::Filter(x)), Some(GraphNode::Filter(y))) => {
                if x.filter != y.filter || x.inputs.len() != y.inputs.len() || !x.params.keys().eq(y.params.keys()) {
                    return false;
                }
                for (vx, vy) in x.params.values().zip(y.params.values()) {
                    let equal = match (vx, vy) {
                        (ParamValue::Image(ia), ParamValue::Image(ib)) => self.nodes_equal(*ia, *ib),
                        _ => vx == vy,
                    };
                    if !equal {
                        return false;
                    }
                }
                x.inputs.iter().zip(&y.inputs).all(|(ia, ib)| self.nodes_equal(*ia, *ib))
            }
            _ => false,
        }
    }
}

impl PartialEq for FilterGraph {
    fn eq(&self, other: &Self) -> bool {
        match (self.output, other.output) {
            (None, None) => true,
            (Some(a), Some(b)) => StructuralEq {
                left: self,
                right: other,
                assumed: HashSet::new(),
            }
            .nodes_equal(a, b),
            _ => false,
        }
    }
}

impl Eq for FilterGraph {}

/// Structural hash of the subgraph reachable from `id`
fn structural_hash(graph: &FilterGraph, id: NodeId, memo: &mut HashMap<NodeId, u64>, on_stack: &mut HashSet<NodeId>) -> u64 {
    if let Some(hash) = memo.get(&id) {
        return *hash;
    }
    let mut hasher = DefaultHasher::new();
    if !on_stack.insert(id) {
        // Back edge of a cycle.
        u64::MAX.hash(&mut hasher);
        return hasher.finish();
    }
    match graph.node(id) {
        None => 0u8.hash(&mut hasher),
        Some(GraphNode::Image(image)) => {
            1u8.hash(&mut hasher);
            image.hash(&mut hasher);
        }
        Some(GraphNode::Filter(node)) => {
            2u8.hash(&mut hasher);
            node.filter.hash(&mut hasher);
            for (key, value) in &node.params {
                key.hash(&mut hasher);
                match value {
                    ParamValue::Image(input) => structural_hash(graph, *input, memo, on_stack).hash(&mut hasher),
                    other => other.hash(&mut hasher),
                }
            }
            node.inputs.len().hash(&mut hasher);
            for input in &node.inputs {
                structural_hash(graph, *input, memo, on_stack).hash(&mut hasher);
            }
        }
    }
    on_stack.remove(&id);
    let hash = hasher.finish();
    memo.insert(id, hash);
    hash
}

impl Hash for FilterGraph {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.output {
            None => 0u64.hash(state),
            Some(output) => structural_hash(self, output, &mut HashMap::new(), &mut HashSet::new()).hash(state),
        }
    }
}
