//! Compiled boolean tree handed to the executor, plus its explain output.

use std::hash::Hasher;

use xxhash_rust::xxh64::Xxh64;

use crate::query::ast::Selection;
use crate::query::slice::SliceNode;
use crate::query::sort::SortPredicate;

/// Node of the compiled query tree.
#[derive(Clone, Debug, PartialEq)]
pub enum IrNode {
    /// Both subtrees hold.
    And(Box<IrNode>, Box<IrNode>),
    /// Either subtree holds.
    Or(Box<IrNode>, Box<IrNode>),
    /// Everything in `keep` that `subtract` does not produce. `keep` is the
    /// unbounded id scan; it is only consulted when the node runs on its own.
    Not {
        /// Ids to exclude.
        subtract: Box<IrNode>,
        /// Universe the exclusion applies to.
        keep: SliceNode,
    },
    /// Conjunction of range scans.
    Slice(SliceNode),
    /// Geo radius query.
    Within {
        /// Geo-indexed property.
        property: String,
        /// Radius in metres.
        distance: f64,
        /// Latitude of the centre.
        lat: f64,
        /// Longitude of the centre.
        lon: f64,
    },
}

impl IrNode {
    /// Intersection of two subtrees.
    pub fn and(left: IrNode, right: IrNode) -> Self {
        IrNode::And(Box::new(left), Box::new(right))
    }

    /// Union of two subtrees.
    pub fn or(left: IrNode, right: IrNode) -> Self {
        IrNode::Or(Box::new(left), Box::new(right))
    }

    /// Exclusion against the full id scan.
    pub fn not(subtract: IrNode) -> Self {
        IrNode::Not {
            subtract: Box::new(subtract),
            keep: SliceNode::full_scan(),
        }
    }

    /// The slice node, when this is a plain range scan.
    pub fn as_slice(&self) -> Option<&SliceNode> {
        match self {
            IrNode::Slice(node) => Some(node),
            _ => None,
        }
    }

    fn op_name(&self) -> &'static str {
        match self {
            IrNode::And(..) => "And",
            IrNode::Or(..) => "Or",
            IrNode::Not { .. } => "Not",
            IrNode::Slice(_) => "Slice",
            IrNode::Within { .. } => "Within",
        }
    }

    /// Builds the explain tree for this subtree.
    pub fn explain(&self) -> ExplainNode {
        let mut node = ExplainNode::new(self.op_name());
        match self {
            IrNode::And(l, r) | IrNode::Or(l, r) => {
                node.inputs = vec![l.explain(), r.explain()];
            }
            IrNode::Not { subtract, keep } => {
                node.props.push(ExplainProp::literal("keep", keep.to_string()));
                node.inputs = vec![subtract.explain()];
            }
            IrNode::Slice(slices) => {
                for slice in slices.slices() {
                    node.props
                        .push(ExplainProp::literal(slice.property.clone(), slice.to_string()));
                }
            }
            IrNode::Within {
                property,
                distance,
                lat,
                lon,
            } => {
                node.props.push(ExplainProp::plain("property", property.clone()));
                node.props
                    .push(ExplainProp::literal("distance", distance.to_string()));
                node.props
                    .push(ExplainProp::literal("center", format!("{lat}, {lon}")));
            }
        }
        node
    }
}

/// One line of `explain` output: an IR node and its rendered parameters.
#[derive(Clone, Debug)]
pub struct ExplainNode {
    /// Operator name.
    pub op: String,
    /// Rendered parameters in declaration order.
    pub props: Vec<ExplainProp>,
    /// Children in evaluation order.
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Node with no parameters or children.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// `Sort` node over `input`, one `by` parameter per term.
    pub fn sorted(terms: &[SortPredicate], input: ExplainNode) -> Self {
        let mut node = ExplainNode::new("Sort");
        for term in terms {
            node.props.push(ExplainProp::plain("by", term.to_string()));
        }
        node.inputs.push(input);
        node
    }

    /// Renders the tree one operator per line, children indented.
    pub fn render(&self, redact: bool) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0, redact);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize, redact: bool) {
        for _ in 0..depth {
            out.push_str("  ");
        }
        out.push_str(&self.op);
        for prop in &self.props {
            let value = if redact && prop.redactable {
                "?"
            } else {
                prop.value.as_str()
            };
            out.push(' ');
            out.push_str(&prop.key);
            out.push('=');
            out.push_str(value);
        }
        out.push('\n');
        for input in &self.inputs {
            input.render_into(out, depth + 1, redact);
        }
    }

    /// Nested JSON form of the tree, literals included.
    pub fn to_json(&self) -> serde_json::Value {
        let props: serde_json::Map<String, serde_json::Value> = self
            .props
            .iter()
            .map(|p| (p.key.clone(), serde_json::Value::String(p.value.clone())))
            .collect();
        serde_json::json!({
            "op": self.op,
            "props": props,
            "inputs": self.inputs.iter().map(ExplainNode::to_json).collect::<Vec<_>>(),
        })
    }
}

/// `key=value` pair on an [`ExplainNode`].
#[derive(Clone, Debug)]
pub struct ExplainProp {
    /// Parameter name.
    pub key: String,
    /// Rendered value.
    pub value: String,
    /// Set for query literals, which `render(true)` hides.
    pub redactable: bool,
}

impl ExplainProp {
    fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }
}

/// Deterministic hash of a compiled tree, its ordering and its projection.
pub fn plan_hash(root: &IrNode, sort: &[SortPredicate], projection: &Selection) -> u64 {
    let mut hasher = Xxh64::new(0);
    hash_explain_node(&root.explain(), &mut hasher);
    hasher.write_u64(sort.len() as u64);
    for term in sort {
        hasher.write(term.property.as_bytes());
        hasher.write_u8(u8::from(term.order.is_descending()));
    }
    match projection {
        Selection::All => hasher.write_u8(0),
        Selection::Fields(fields) => {
            hasher.write_u8(1);
            hasher.write_u64(fields.len() as u64);
            for field in fields {
                hasher.write(field.as_bytes());
                hasher.write_u8(0xff);
            }
        }
    }
    hasher.finish()
}

fn hash_explain_node(node: &ExplainNode, hasher: &mut Xxh64) {
    hasher.write(node.op.as_bytes());
    for prop in &node.props {
        hasher.write(prop.key.as_bytes());
        hasher.write(prop.value.as_bytes());
    }
    hasher.write_u64(node.inputs.len() as u64);
    for child in &node.inputs {
        hash_explain_node(child, hasher);
    }
}
