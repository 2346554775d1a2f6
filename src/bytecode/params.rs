//! Calling-convention metadata for a scope's parameter list.
//!
//! [`plan`] resolves every parameter to its local slot and collects the
//! default-value initializers that the lowering compiles into the scope's
//! preamble. Slots are positions in the scope's local table.

use serde::{Deserialize, Serialize};

use crate::bytecode::compile_error::InternalError;
use crate::bytecode::iseq::IseqKind;
use crate::lang::node::{KeywordParam, Node, NodeKind, Params};
use crate::lang::value::Value;

/// Name of the hidden local holding the "keyword was passed" bitmap.
pub const KW_BITS_LOCAL: &str = "#kwbits";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParamFlags {
    pub has_lead: bool,
    pub has_opt: bool,
    pub has_post: bool,
    pub has_rest: bool,
    pub has_kw: bool,
    pub has_kwrest: bool,
    pub has_block: bool,
    /// `{|a| }`: a block with a single lead parameter auto-splats.
    pub ambiguous_param0: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KeywordLayout {
    /// Declared keywords.
    pub num: u32,
    pub required_num: u32,
    /// Slot of the hidden bitmap local.
    pub bits_start: u32,
    /// Slot of `**rest`, if any.
    pub rest_start: Option<u32>,
    /// Keyword names, required ones first in declaration order.
    pub table: Vec<String>,
    /// One entry per optional keyword. `None` marks a default that is
    /// computed by the preamble.
    pub default_values: Vec<Option<Value>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParamLayout {
    pub lead_num: u32,
    pub opt_num: u32,
    /// Entry positions for 0..=opt_num supplied optionals.
    pub opt_table: Vec<u32>,
    pub post_start: u32,
    pub post_num: u32,
    pub rest_start: Option<u32>,
    pub keyword: Option<KeywordLayout>,
    pub block_start: Option<u32>,
    pub size: u32,
    pub flags: ParamFlags,
    /// Only lead parameters: the interpreter may take the fast call path.
    pub simple: bool,
}

/// Default-value initializer the lowering compiles into the preamble.
#[derive(Debug, Clone, Copy)]
pub struct OptDefault<'n> {
    pub slot: usize,
    pub value: &'n Node,
}

/// Keyword default too complex to be stored as a literal.
#[derive(Debug, Clone, Copy)]
pub struct KwDefault<'n> {
    /// Position in the keyword table, tested with `checkkeyword`.
    pub index: usize,
    pub slot: usize,
    pub value: &'n Node,
}

#[derive(Debug, Clone)]
pub struct ParamPlan<'n> {
    pub layout: ParamLayout,
    pub opt_defaults: Vec<OptDefault<'n>>,
    pub kw_defaults: Vec<KwDefault<'n>>,
}

fn slot_of(locals: &[String], name: &str) -> Result<usize, InternalError> {
    locals
        .iter()
        .position(|l| l == name)
        .ok_or_else(|| InternalError::UnknownLocal(name.to_string()))
}

/// Literal keyword defaults are stored in the layout instead of compiled.
fn static_default(node: &Node) -> Option<Value> {
    match &node.kind {
        NodeKind::Lit(v) => Some(v.clone()),
        NodeKind::Nil => Some(Value::Nil),
        NodeKind::True => Some(Value::True),
        NodeKind::False => Some(Value::False),
        _ => None,
    }
}

/// Lay out `params` over `locals`.
///
/// Appends the hidden keyword-bitmap local when keywords are declared.
pub fn plan<'n>(
    params: &'n Params,
    locals: &mut Vec<String>,
    kind: IseqKind,
) -> Result<ParamPlan<'n>, InternalError> {
    let mut layout = ParamLayout {
        lead_num: params.lead.len() as u32,
        ..ParamLayout::default()
    };
    layout.flags.has_lead = !params.lead.is_empty();
    for name in &params.lead {
        slot_of(locals, name)?;
    }

    let mut opt_defaults = Vec::new();
    for (name, value) in &params.opt {
        opt_defaults.push(OptDefault {
            slot: slot_of(locals, name)?,
            value,
        });
    }
    if !params.opt.is_empty() {
        layout.flags.has_opt = true;
        layout.opt_num = params.opt.len() as u32;
    }

    if let Some(rest) = &params.rest {
        layout.rest_start = Some(slot_of(locals, rest)? as u32);
        layout.flags.has_rest = true;
    }

    if let Some(first) = params.post.first() {
        layout.post_start = slot_of(locals, first)? as u32;
        layout.post_num = params.post.len() as u32;
        layout.flags.has_post = true;
    } else if let Some(rest_start) = layout.rest_start {
        layout.post_start = rest_start + 1;
    }

    let mut kw_defaults = Vec::new();
    if !params.keywords.is_empty() {
        if !locals.iter().any(|l| l == KW_BITS_LOCAL) {
            locals.push(KW_BITS_LOCAL.to_string());
        }
        let mut kw = KeywordLayout {
            num: params.keywords.len() as u32,
            bits_start: slot_of(locals, KW_BITS_LOCAL)? as u32,
            ..KeywordLayout::default()
        };

        let (required, optional): (Vec<&'n KeywordParam>, Vec<&'n KeywordParam>) =
            params.keywords.iter().partition(|k| k.default.is_none());
        kw.required_num = required.len() as u32;

        for (index, param) in required.into_iter().chain(optional).enumerate() {
            let slot = slot_of(locals, &param.name)?;
            kw.table.push(param.name.clone());
            if let Some(default) = &param.default {
                match static_default(default) {
                    Some(v) => kw.default_values.push(Some(v)),
                    None => {
                        kw.default_values.push(None);
                        kw_defaults.push(KwDefault {
                            index,
                            slot,
                            value: default,
                        });
                    }
                }
            }
        }

        if let Some(kwrest) = &params.kwrest {
            kw.rest_start = Some(slot_of(locals, kwrest)? as u32);
            layout.flags.has_kwrest = true;
        }
        layout.flags.has_kw = true;
        layout.keyword = Some(kw);
    } else if let Some(kwrest) = &params.kwrest {
        layout.keyword = Some(KeywordLayout {
            rest_start: Some(slot_of(locals, kwrest)? as u32),
            ..KeywordLayout::default()
        });
        layout.flags.has_kwrest = true;
    }

    if let Some(block) = &params.block {
        layout.block_start = Some(slot_of(locals, block)? as u32);
        layout.flags.has_block = true;
    }

    layout.size = param_size(&layout);

    let f = layout.flags;
    layout.simple =
        !(f.has_opt || f.has_rest || f.has_post || f.has_kw || f.has_kwrest || f.has_block);

    if kind == IseqKind::Block
        && !(f.has_opt || f.has_post || f.has_rest || f.has_kw || f.has_kwrest)
        && layout.lead_num == 1
        && !params.trailing_comma
    {
        layout.flags.ambiguous_param0 = true;
    }

    Ok(ParamPlan {
        layout,
        opt_defaults,
        kw_defaults,
    })
}

/// Frame slots taken by parameters: up to the last populated group.
fn param_size(layout: &ParamLayout) -> u32 {
    let f = layout.flags;
    let kw = layout.keyword.as_ref();
    if let (true, Some(block)) = (f.has_block, layout.block_start) {
        block + 1
    } else if let (true, Some(rest)) = (f.has_kwrest, kw.and_then(|k| k.rest_start)) {
        rest + 1
    } else if let (true, Some(k)) = (f.has_kw, kw) {
        k.bits_start + 1
    } else if f.has_post {
        layout.post_start + layout.post_num
    } else if let (true, Some(rest)) = (f.has_rest, layout.rest_start) {
        rest + 1
    } else if f.has_opt {
        layout.lead_num + layout.opt_num
    } else {
        layout.lead_num
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::build::*;

    fn locals(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_lead_only_is_simple() {
        let params = Params {
            lead: vec!["a".into(), "b".into()],
            ..Params::default()
        };
        let mut table = locals(&["a", "b", "tmp"]);
        let plan = plan(&params, &mut table, IseqKind::Method).unwrap();

        assert_eq!(plan.layout.lead_num, 2);
        assert_eq!(plan.layout.size, 2);
        assert!(plan.layout.simple);
        assert!(plan.layout.flags.has_lead);
        assert!(!plan.layout.flags.ambiguous_param0);
    }

    #[test]
    fn test_opt_and_rest() {
        let params = Params {
            lead: vec!["a".into()],
            opt: vec![("b".into(), int(1))],
            rest: Some("r".into()),
            ..Params::default()
        };
        let mut table = locals(&["a", "b", "r"]);
        let plan = plan(&params, &mut table, IseqKind::Method).unwrap();

        assert_eq!(plan.layout.opt_num, 1);
        assert_eq!(plan.layout.rest_start, Some(2));
        assert_eq!(plan.layout.post_start, 3);
        assert_eq!(plan.layout.size, 3);
        assert!(!plan.layout.simple);
        assert_eq!(plan.opt_defaults.len(), 1);
        assert_eq!(plan.opt_defaults[0].slot, 1);
    }

    #[test]
    fn test_post_params() {
        let params = Params {
            lead: vec!["a".into()],
            rest: Some("r".into()),
            post: vec!["z".into()],
            ..Params::default()
        };
        let mut table = locals(&["a", "r", "z"]);
        let plan = plan(&params, &mut table, IseqKind::Method).unwrap();

        assert_eq!(plan.layout.post_start, 2);
        assert_eq!(plan.layout.post_num, 1);
        assert_eq!(plan.layout.size, 3);
    }

    #[test]
    fn test_keywords_append_bits_local() {
        let params = Params {
            keywords: vec![
                KeywordParam {
                    name: "k".into(),
                    default: Some(int(1)),
                },
                KeywordParam {
                    name: "req".into(),
                    default: None,
                },
                KeywordParam {
                    name: "c".into(),
                    default: Some(fcall("compute", vec![])),
                },
            ],
            ..Params::default()
        };
        let mut table = locals(&["k", "req", "c"]);
        let plan = plan(&params, &mut table, IseqKind::Method).unwrap();

        assert_eq!(table.last().map(String::as_str), Some(KW_BITS_LOCAL));
        let kw = plan.layout.keyword.as_ref().unwrap();
        assert_eq!(kw.num, 3);
        assert_eq!(kw.required_num, 1);
        assert_eq!(kw.bits_start, 3);
        assert_eq!(kw.table, vec!["req", "k", "c"]);
        assert_eq!(kw.default_values, vec![Some(Value::Integer(1)), None]);
        assert_eq!(plan.kw_defaults.len(), 1);
        assert_eq!(plan.kw_defaults[0].index, 2);
        assert_eq!(plan.kw_defaults[0].slot, 2);
        assert_eq!(plan.layout.size, 4);
    }

    #[test]
    fn test_block_param_sets_size() {
        let params = Params {
            lead: vec!["a".into()],
            block: Some("blk".into()),
            ..Params::default()
        };
        let mut table = locals(&["a", "x", "blk"]);
        let plan = plan(&params, &mut table, IseqKind::Method).unwrap();

        assert_eq!(plan.layout.block_start, Some(2));
        assert_eq!(plan.layout.size, 3);
        assert!(!plan.layout.simple);
    }

    #[test]
    fn test_ambiguous_param0() {
        let single = Params {
            lead: vec!["x".into()],
            ..Params::default()
        };
        let mut table = locals(&["x"]);
        let p = plan(&single, &mut table, IseqKind::Block).unwrap();
        assert!(p.layout.flags.ambiguous_param0);

        let comma = Params {
            trailing_comma: true,
            ..single.clone()
        };
        let p = plan(&comma, &mut table, IseqKind::Block).unwrap();
        assert!(!p.layout.flags.ambiguous_param0);

        let p = plan(&single, &mut table, IseqKind::Method).unwrap();
        assert!(!p.layout.flags.ambiguous_param0);
    }

    #[test]
    fn test_missing_local_is_internal_error() {
        let params = Params {
            lead: vec!["ghost".into()],
            ..Params::default()
        };
        let mut table = locals(&["a"]);
        assert!(matches!(
            plan(&params, &mut table, IseqKind::Method),
            Err(InternalError::UnknownLocal(name)) if name == "ghost"
        ));
    }
}
