//! Tree document model
//!
//! The tree is stored as a JSON mapping inside the YAML envelope (JSON flow
//! syntax is valid YAML). It holds user metadata and one node per array:
//!
//! ```text
//! {"asdf_library": {...}, "meta": {...}, "arrays": [
//!     {"source": 0, "datatype": "uint8", "shape": [1024]},
//!     {"source": -1, "datatype": "uint8", "shape": ["*"]},
//!     {"source": "main0000.asdf", "datatype": "uint8", "shape": [16]},
//!     {"data": [1, 2, 3], "datatype": "uint8", "shape": [3]}
//! ]}
//! ```
//!
//! Opening happens in two phases. [`parse_tree`] turns every array node into
//! an [`ArrayShell`] holding a deferred finalizer; once the blocks have been
//! discovered, each shell is finalized against a [`BlockBinder`], which maps
//! sources to block ids and assigns storage without the cross-block checks
//! (the file on disk already satisfies them).

use crate::core::block::ArrayStorage;
use crate::core::error::{AsdfError, Result};
use crate::core::format::{unwrap_tree, wrap_tree};
use crate::core::manager::{BlockId, BlockManager, Source, SourceMap};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Element type of every array node
pub const DATATYPE: &str = "uint8";

type Finalizer = Box<dyn FnOnce(&mut BlockBinder<'_>) -> Result<BlockId> + Send>;

/// Array node waiting for its block
pub struct ArrayShell {
    finalize: Finalizer,
}

impl ArrayShell {
    fn new(finalize: impl FnOnce(&mut BlockBinder<'_>) -> Result<BlockId> + Send + 'static) -> Self {
        ArrayShell {
            finalize: Box::new(finalize),
        }
    }

    pub fn finalize(self, binder: &mut BlockBinder<'_>) -> Result<BlockId> {
        (self.finalize)(binder)
    }
}

/// Tree contents before binding
#[derive(Default)]
pub struct ParsedTree {
    pub meta: Value,
    pub shells: Vec<ArrayShell>,
}

/// Resolves array sources to blocks of a freshly opened document
pub struct BlockBinder<'a> {
    manager: &'a mut BlockManager,
    internal: Vec<BlockId>,
    external: HashMap<String, BlockId>,
}

impl<'a> BlockBinder<'a> {
    pub fn new(manager: &'a mut BlockManager) -> Self {
        let internal = manager.internal_ids();
        BlockBinder {
            manager,
            internal,
            external: HashMap::new(),
        }
    }

    fn internal(&mut self, index: usize) -> Result<BlockId> {
        self.internal.get(index).copied().ok_or_else(|| {
            AsdfError::Format(format!(
                "array refers to block {} but the file has {} blocks",
                index,
                self.internal.len()
            ))
        })
    }

    fn streamed(&mut self) -> Result<BlockId> {
        self.manager
            .streamed_id()
            .ok_or_else(|| AsdfError::Format("array refers to a missing streamed block".to_string()))
    }

    fn external(&mut self, uri: &str) -> BlockId {
        if let Some(&id) = self.external.get(uri) {
            return id;
        }
        let id = self.manager.add_external(uri);
        self.external.insert(uri.to_string(), id);
        id
    }

    fn inline(&mut self, data: Vec<u8>) -> BlockId {
        let id = self.manager.add_block(data);
        self.manager.set_storage_unchecked(id, ArrayStorage::Inline);
        id
    }
}

/// Parse the tree bytes (envelope included)
pub fn parse_tree(bytes: &[u8]) -> Result<ParsedTree> {
    let body = unwrap_tree(bytes)?;
    if body.is_empty() || body == "null" {
        return Ok(ParsedTree::default());
    }
    let root: Value = serde_json::from_str(body)?;
    let Value::Object(mut root) = root else {
        return Err(AsdfError::Format("tree root is not a mapping".to_string()));
    };
    let meta = root.remove("meta").unwrap_or(Value::Null);
    let shells = match root.remove("arrays") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(nodes)) => nodes
            .iter()
            .enumerate()
            .map(|(i, node)| parse_node(i, node))
            .collect::<Result<_>>()?,
        Some(_) => return Err(AsdfError::Format("tree 'arrays' is not a list".to_string())),
    };
    Ok(ParsedTree { meta, shells })
}

fn parse_node(position: usize, node: &Value) -> Result<ArrayShell> {
    let node = node
        .as_object()
        .ok_or_else(|| AsdfError::Format(format!("array {} is not a mapping", position)))?;
    match node.get("datatype").and_then(Value::as_str) {
        None | Some(DATATYPE) => {}
        Some(other) => {
            return Err(AsdfError::Format(format!(
                "array {} has unsupported datatype {:?}",
                position, other
            )))
        }
    }

    if let Some(data) = node.get("data") {
        let data = parse_inline(position, data)?;
        return Ok(ArrayShell::new(move |binder| Ok(binder.inline(data))));
    }

    match node.get("source") {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(-1) => Ok(ArrayShell::new(|binder| binder.streamed())),
            Some(index) if index >= 0 => {
                let index = index as usize;
                Ok(ArrayShell::new(move |binder| binder.internal(index)))
            }
            _ => Err(AsdfError::Format(format!(
                "array {} has invalid source {}",
                position, n
            ))),
        },
        Some(Value::String(uri)) => {
            let uri = uri.clone();
            Ok(ArrayShell::new(move |binder| Ok(binder.external(&uri))))
        }
        _ => Err(AsdfError::Format(format!(
            "array {} has neither source nor data",
            position
        ))),
    }
}

fn parse_inline(position: usize, data: &Value) -> Result<Vec<u8>> {
    let items = data
        .as_array()
        .ok_or_else(|| AsdfError::Format(format!("array {} inline data is not a list", position)))?;
    items
        .iter()
        .map(|v| {
            v.as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| {
                    AsdfError::Format(format!("array {} has non-uint8 value {}", position, v))
                })
        })
        .collect()
}

/// Render the tree for one write
///
/// `arrays` lists the block of every live array in order; `lengths` gives
/// the payload size used for `shape` where it is known.
pub fn render_tree(
    meta: &Value,
    arrays: &[BlockId],
    lengths: &HashMap<BlockId, u64>,
    sources: &SourceMap,
) -> Result<Vec<u8>> {
    let nodes = arrays
        .iter()
        .map(|id| render_node(*id, lengths, sources))
        .collect::<Result<Vec<_>>>()?;

    let mut root = Map::new();
    root.insert(
        "asdf_library".to_string(),
        json!({"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")}),
    );
    if !meta.is_null() {
        root.insert("meta".to_string(), meta.clone());
    }
    root.insert("arrays".to_string(), Value::Array(nodes));
    Ok(wrap_tree(&serde_json::to_string(&Value::Object(root))?))
}

fn render_node(id: BlockId, lengths: &HashMap<BlockId, u64>, sources: &SourceMap) -> Result<Value> {
    let source = sources.get(&id).ok_or_else(|| {
        AsdfError::Format(format!("block {} was not planned for this write", id.index()))
    })?;
    let mut node = Map::new();
    match source {
        Source::Internal(index) => {
            node.insert("source".to_string(), json!(index));
        }
        Source::Streamed => {
            node.insert("source".to_string(), json!(-1));
        }
        Source::External(uri) => {
            node.insert("source".to_string(), json!(uri));
        }
        Source::Inline(data) => {
            node.insert("data".to_string(), json!(data.to_vec()?));
        }
    }
    node.insert("datatype".to_string(), json!(DATATYPE));
    let shape = match source {
        Source::Streamed => Some(json!(["*"])),
        Source::Inline(data) => Some(json!([data.len()])),
        _ => lengths.get(&id).map(|len| json!([len])),
    };
    if let Some(shape) = shape {
        node.insert("shape".to_string(), shape);
    }
    Ok(Value::Object(node))
}
